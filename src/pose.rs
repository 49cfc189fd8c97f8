//! The extrinsic pose of the camera.

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::{Matrix3, Point3, Rotation3, UnitQuaternion, Vector3};

/// Rigid pose of the camera relative to the calibrated world frame.
///
/// The rotation is stored as a Rodrigues vector (axis times angle in
/// radians). The translation is stored in world coordinates: a world point
/// `p` is mapped to camera coordinates as `R * (p + translation)`, so the
/// camera centre sits at `-translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Pose {
    /// Rodrigues rotation vector mapping world directions to camera
    /// directions.
    pub rotation_vector: Vector3<f64>,
    /// Translation in world coordinates (cm).
    pub translation: Vector3<f64>,
}

impl Pose {
    /// Create a pose from a rotation vector and a world-frame translation.
    #[inline]
    pub fn new(rotation_vector: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation_vector,
            translation,
        }
    }

    /// Create a pose from the camera-frame transform of a PnP solve.
    ///
    /// `tvec` is the position of the world origin in camera coordinates,
    /// i.e. `camera = R * world + tvec`.
    pub fn from_camera_transform(rotation_vector: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        let rotation = Rotation3::new(rotation_vector);
        Self::new(rotation_vector, rotation.inverse() * tvec)
    }

    /// The rotation as an element of SO(3).
    #[inline]
    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::new(self.rotation_vector)
    }

    /// The 3x3 rotation matrix.
    #[inline]
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation().into_inner()
    }

    /// The translation in camera coordinates (`R * translation`).
    pub fn camera_translation(&self) -> Vector3<f64> {
        self.rotation() * self.translation
    }

    /// The camera centre in world coordinates.
    #[inline]
    pub fn camera_center(&self) -> Point3<f64> {
        Point3::from(-self.translation)
    }

    /// Height of the camera above the calibrated world origin.
    #[inline]
    pub fn camera_height(&self) -> f64 {
        self.translation.z.abs()
    }

    /// Map a world point to camera coordinates.
    pub fn world_to_camera(&self, world: &Point3<f64>) -> Point3<f64> {
        self.rotation() * (*world + self.translation)
    }

    /// Map a camera-frame point to world coordinates.
    pub fn camera_to_world(&self, camera: &Point3<f64>) -> Point3<f64> {
        self.rotation().inverse() * *camera - self.translation
    }

    /// Rotate a camera-frame direction into the world frame.
    pub fn cam_to_world_rotation(&self, direction: &Vector3<f64>) -> Vector3<f64> {
        self.rotation().inverse() * direction
    }

    /// Convert to `cam_geom` extrinsic parameters.
    pub fn to_extrinsics(&self) -> cam_geom::ExtrinsicParameters<f64> {
        let rotation = UnitQuaternion::from_scaled_axis(self.rotation_vector);
        cam_geom::ExtrinsicParameters::from_rotation_and_camcenter(rotation, self.camera_center())
    }
}
