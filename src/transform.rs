//! Forward and inverse mapping between world points and image pixels.

use nalgebra::{Matrix3, Point2, Point3, Vector2, Vector3};

use crate::{CameraIntrinsics, CoordinateFrameAdjustment, ImageSize, Pose};

/// A calibrated camera: pose, intrinsics and user frame together.
///
/// World points are in the user frame described by the
/// [`CoordinateFrameAdjustment`], in cm. Pixels are in border-free pixel
/// space. Construction caches the rotation matrices derived from the pose's
/// rotation vector.
///
/// For any pixel `px` and height `h` whose back-projection lies in front of
/// the camera, `image_point(&world_point(&px, h))` returns `px` and the
/// returned world point has z equal to `h`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldImageCorrespondence {
    pose: Pose,
    intrinsics: CameraIntrinsics,
    adjustment: CoordinateFrameAdjustment,
    cache: Cache,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cache {
    rot: Matrix3<f64>,
    rot_t: Matrix3<f64>,
    cam_translation: Vector3<f64>,
}

impl WorldImageCorrespondence {
    /// Create a new mapping.
    pub fn new(
        pose: Pose,
        intrinsics: CameraIntrinsics,
        adjustment: CoordinateFrameAdjustment,
    ) -> Self {
        let rot = pose.rotation_matrix();
        let cache = Cache {
            rot,
            rot_t: rot.transpose(),
            cam_translation: rot * pose.translation,
        };
        Self {
            pose,
            intrinsics,
            adjustment,
            cache,
        }
    }

    /// The pose.
    #[inline]
    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    /// The intrinsic parameters.
    #[inline]
    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    /// The user frame adjustment.
    #[inline]
    pub fn adjustment(&self) -> &CoordinateFrameAdjustment {
        &self.adjustment
    }

    /// Project a user-frame world point to a pixel.
    ///
    /// Returns `(0, 0)` when the point lies in the camera's focal plane.
    pub fn image_point(&self, world: &Point3<f64>) -> Point2<f64> {
        let calibrated = self.adjustment.to_calibrated_frame(world);
        let camera = self.cache.rot * calibrated.coords + self.cache.cam_translation;
        self.intrinsics.project(&camera)
    }

    /// Back-project a pixel onto the horizontal plane at `height`.
    ///
    /// `height` is a user-frame z coordinate. If the viewing ray is parallel
    /// to the plane, the result is not finite.
    pub fn world_point(&self, pixel: &Point2<f64>, height: f64) -> Point3<f64> {
        let ray = self.intrinsics.ray(pixel);
        let world_ray = self.cache.rot_t * ray;
        let height = self.adjustment.height_to_calibrated(height);

        let depth = (height + self.pose.translation.z) / world_ray.z;
        let camera = ray * depth;
        let calibrated = self.cache.rot_t * (camera - self.cache.cam_translation);
        self.adjustment.to_user_frame(&Point3::from(calibrated))
    }

    /// Return `true` if a pixel cannot be shown in an image of size `image`.
    ///
    /// See [`CameraIntrinsics::is_outside_image`].
    #[inline]
    pub fn is_outside_image(&self, pixel: &Point2<f64>, image: &ImageSize) -> bool {
        self.intrinsics.is_outside_image(pixel, image)
    }

    /// Return `true` if a world point projects outside an image of size
    /// `image`.
    pub fn is_world_point_outside_image(&self, world: &Point3<f64>, image: &ImageSize) -> bool {
        self.is_outside_image(&self.image_point(world), image)
    }

    /// Ground resolution at a pixel, in cm per pixel along x and y.
    ///
    /// Measured on the plane at `height` between the back-projections of
    /// points half a pixel to either side.
    pub fn cm_per_pixel(&self, pixel: &Point2<f64>, height: f64) -> Vector2<f64> {
        let dx = Vector2::new(0.5, 0.0);
        let dy = Vector2::new(0.0, 0.5);
        let across = self.world_point(&(*pixel + dx), height) - self.world_point(&(*pixel - dx), height);
        let along = self.world_point(&(*pixel + dy), height) - self.world_point(&(*pixel - dy), height);
        Vector2::new(across.norm(), along.norm())
    }

    /// Angle in degrees between the ground plane and the line of sight to
    /// the back-projection of `pixel` at `height`.
    ///
    /// This is 90 for a point directly below the camera.
    pub fn angle_to_ground(&self, pixel: &Point2<f64>, height: f64) -> f64 {
        let camera = self.adjustment.to_user_frame(&self.pose.camera_center());
        let sight = camera - self.world_point(pixel, height);
        (sight.z / sight.norm()).asin().to_degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn looking_down() -> WorldImageCorrespondence {
        let pose = Pose::from_camera_transform(
            Vector3::new(std::f64::consts::PI, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 500.0),
        );
        let intrinsics = CameraIntrinsics::new(800.0, 800.0, 320.0, 320.0);
        WorldImageCorrespondence::new(pose, intrinsics, CoordinateFrameAdjustment::default())
    }

    fn oblique(adjustment: CoordinateFrameAdjustment) -> WorldImageCorrespondence {
        let pose = Pose::from_camera_transform(
            Vector3::new(2.6, 0.15, -0.2),
            Vector3::new(-30.0, 60.0, 650.0),
        );
        let intrinsics = CameraIntrinsics::new(1100.0, 1080.0, 660.0, 500.0).with_border(20.0);
        WorldImageCorrespondence::new(pose, intrinsics, adjustment)
    }

    #[test]
    fn forward_looking_down() {
        let map = looking_down();
        assert_relative_eq!(
            map.image_point(&Point3::new(0.0, 0.0, 0.0)),
            Point2::new(320.0, 320.0),
            epsilon = 1e-9
        );
        // 50 cm at 500 cm distance is 80 px; y flips when looking down.
        assert_relative_eq!(
            map.image_point(&Point3::new(50.0, 50.0, 0.0)),
            Point2::new(400.0, 240.0),
            epsilon = 1e-9
        );
    }

    #[test]
    fn focal_plane_sentinel() {
        let map = looking_down();
        assert_eq!(map.image_point(&Point3::new(10.0, 10.0, 500.0)), Point2::origin());
    }

    #[test]
    fn inverse_hits_requested_height() {
        let map = oblique(CoordinateFrameAdjustment::default());
        for &height in &[0.0, 90.0, 180.0] {
            let world = map.world_point(&Point2::new(400.0, 300.0), height);
            assert_relative_eq!(world.z, height, epsilon = 1e-6);
            assert_relative_eq!(
                map.image_point(&world),
                Point2::new(400.0, 300.0),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn roundtrip_with_adjustment() {
        let adjustment = CoordinateFrameAdjustment {
            swap_x: true,
            swap_y: true,
            swap_z: false,
            offset: Vector3::new(120.0, -40.0, 15.0),
            ..Default::default()
        };
        let map = oblique(adjustment);
        for &(x, y, z) in &[(0.0, 0.0, 0.0), (35.0, -80.0, 170.0), (-60.0, 25.0, 95.0)] {
            let world = Point3::new(x, y, z);
            let pixel = map.image_point(&world);
            let back = map.world_point(&pixel, z);
            assert_relative_eq!(back, world, epsilon = 1e-6, max_relative = 1e-6);
        }
    }

    #[test]
    fn resolution_and_angle_below_camera() {
        let map = looking_down();
        let centre = Point2::new(320.0, 320.0);
        // 500 cm / 800 px
        assert_relative_eq!(map.cm_per_pixel(&centre, 0.0), Vector2::new(0.625, 0.625), epsilon = 1e-9);
        assert_relative_eq!(map.cm_per_pixel(&centre, 100.0), Vector2::new(0.5, 0.5), epsilon = 1e-9);
        assert_relative_eq!(map.angle_to_ground(&centre, 0.0), 90.0, epsilon = 1e-9);
        // 500 px off-centre at 800 px focal length: tan = 800 / 500
        let angle = map.angle_to_ground(&Point2::new(820.0, 320.0), 0.0);
        assert_relative_eq!(angle, (800.0f64 / 500.0).atan().to_degrees(), epsilon = 1e-9);
    }

    #[test]
    fn world_point_outside() {
        let map = looking_down();
        let image = ImageSize {
            width: 640,
            height: 640,
        };
        assert!(!map.is_world_point_outside_image(&Point3::new(0.0, 0.0, 0.0), &image));
        assert!(map.is_world_point_outside_image(&Point3::new(1000.0, 0.0, 0.0), &image));
    }
}
