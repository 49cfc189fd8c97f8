//! Extrinsic camera calibration and world/image coordinate mapping
//!
//! # About
//!
//! This crate estimates where a calibrated camera sits in the world and maps
//! points between world coordinates (centimetres) and image pixels. It was
//! written for pedestrian tracking, where a camera looks down on a scene and
//! every detection in the image has to be placed on the floor (or at head
//! height) in real-world coordinates.
//!
//! In greater detail:
//!
//! - A [`PointCorrespondences`](correspondences::PointCorrespondences) store
//!   holds 3D reference points and their 2D pixel observations. It reads and
//!   writes the line-oriented `.3dc` format.
//! - An iterative Perspective-n-Point solver ([`pnp::solve_pnp`]) recovers the
//!   camera pose from at least four correspondences. Coplanar points are
//!   initialised from a homography, general point sets from a linear DLT,
//!   and both are refined by Levenberg-Marquardt.
//! - The pose is a plain value type, [`Pose`], holding a Rodrigues rotation
//!   vector and a translation. It is never hidden state: the forward
//!   (world → pixel) and inverse (pixel + height → world) maps live on
//!   [`WorldImageCorrespondence`], which is built from a pose, the camera
//!   intrinsics and a [`CoordinateFrameAdjustment`].
//! - After every solve, [`ReprojectionError`] statistics are computed and a
//!   pose whose mean point-height error exceeds a threshold is rejected.
//! - The [`CameraIntrinsics`] type implements
//!   [the `IntrinsicParameters` trait from the `cam-geom`
//!   crate](https://docs.rs/cam-geom/latest/cam_geom/trait.IntrinsicParameters.html)
//!   and [`Pose::to_extrinsics`] builds a `cam_geom::ExtrinsicParameters`, so
//!   a calibration result can be used as a
//!   [`cam_geom::Camera`](https://docs.rs/cam-geom/latest/cam_geom/struct.Camera.html).
//!
//! # Example - calibrate from synthetic correspondences and map points.
//!
//! ```
//! use camera_extrinsics::{
//!     CameraIntrinsics, CoordinateFrameAdjustment, ExtrCalibration, Pose,
//!     WorldImageCorrespondence,
//! };
//! use nalgebra::{Point3, Vector3};
//!
//! let intrinsics = CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0);
//! let adjustment = CoordinateFrameAdjustment::default();
//!
//! // A camera 5 m above the floor looking straight down.
//! let truth = Pose::from_camera_transform(
//!     Vector3::new(std::f64::consts::PI, 0.0, 0.0),
//!     Vector3::new(0.0, 0.0, 500.0),
//! );
//! let truth_map = WorldImageCorrespondence::new(truth, intrinsics, adjustment);
//!
//! let world = vec![
//!     Point3::new(-100.0, -100.0, 0.0),
//!     Point3::new(100.0, -100.0, 0.0),
//!     Point3::new(100.0, 100.0, 0.0),
//!     Point3::new(-100.0, 100.0, 0.0),
//!     Point3::new(0.0, 50.0, 0.0),
//! ];
//! let image = world.iter().map(|p| truth_map.image_point(p)).collect();
//!
//! let mut calib = ExtrCalibration::default();
//! calib.correspondences_mut().set_points_3d(world);
//! calib.correspondences_mut().set_points_2d(image);
//!
//! let pose = calib.calibrate(&intrinsics, &adjustment).unwrap();
//! assert!(calib.is_calibrated());
//! assert!((pose.camera_height() - 500.0).abs() < 1e-6);
//!
//! // Back-project the image centre onto the floor.
//! let map = calib.world_image(&intrinsics, &adjustment).unwrap();
//! let floor = map.world_point(&nalgebra::Point2::new(320.0, 240.0), 0.0);
//! assert!(floor.coords.xy().norm() < 1e-6);
//! ```
//!
//! # testing
//!
//! Run unit tests with:
//!
//! ```text
//! cargo test
//! cargo test --no-default-features
//! ```
//!
//! Reading a [`settings::CameraSetup`] from YAML requires the
//! `serde-serialize` feature (enabled by default).

#![deny(rust_2018_idioms, unsafe_code, missing_docs)]

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::{
    allocator::Allocator,
    base::storage::{Owned, Storage},
    DefaultAllocator, Dim, Matrix3, OMatrix, Point2, Vector2, Vector3, U1, U2, U3,
};

use cam_geom::{
    coordinate_system::CameraFrame, ray_bundle_types::SharedOriginRayBundle, Bundle,
    IntrinsicParameters, Pixels, Points, RayBundle,
};

pub mod calibration;
pub mod correspondences;
pub mod frame;
pub mod marker_files;
pub mod pnp;
pub mod pose;
pub mod project_file_support;
pub mod reprojection;
pub mod settings;
pub mod transform;

pub use calibration::ExtrCalibration;
pub use correspondences::{LoadOutcome, MismatchPolicy, PointCorrespondences};
pub use frame::CoordinateFrameAdjustment;
pub use pose::Pose;
pub use reprojection::{ErrorStats, ReprojectionError};
pub use settings::CalibrationSettings;
pub use transform::WorldImageCorrespondence;

#[cfg(feature = "serde-serialize")]
pub use settings::{from_yaml, CameraSetup};

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Fewer correspondences than a pose solve needs.
    #[error(
        "not enough points given: {found} (minimum 4 (coplanar) or 6 (not coplanar) needed)"
    )]
    NotEnoughPoints {
        /// number of points found
        found: usize,
    },
    /// The 3D and 2D point counts of one input disagree.
    #[error("number of 3D ({points_3d}) and 2D ({points_2d}) points disagree")]
    CountMismatch {
        /// number of 3D points
        points_3d: usize,
        /// number of 2D points
        points_2d: usize,
    },
    /// Loaded 3D points disagree with the stored 2D points and the mismatch
    /// policy said to abort.
    #[error(
        "number of 3D points ({points_3d}) disagrees with number of stored 2D points ({points_2d})"
    )]
    StoredPointsMismatch {
        /// number of loaded 3D points
        points_3d: usize,
        /// number of stored 2D points
        points_2d: usize,
    },
    /// The store does not hold a usable set of correspondences.
    #[error(
        "invalid point correspondences for camera calibration (2D points: {points_2d}, 3D points: {points_3d})"
    )]
    InvalidCorrespondences {
        /// number of 3D points
        points_3d: usize,
        /// number of 2D points
        points_2d: usize,
    },
    /// unsupported file extension
    #[error("unsupported file extension (supported: .3dc, .txt)")]
    UnsupportedExtension,
    /// no correspondence file has been set
    #[error("no correspondence file set")]
    NoFile,
    /// The point configuration does not determine a pose.
    #[error("degenerate point configuration")]
    DegenerateConfiguration,
    /// singular value decomposition failed
    #[error("singular value decomposition failed")]
    SvdFailed,
    /// The solved pose reproduces the correspondences too poorly.
    #[error("extrinsic calibration rejected: average reprojection error {average} exceeds {threshold}")]
    CalibrationRejected {
        /// mean point-height reprojection error
        average: f64,
        /// acceptance threshold
        threshold: f64,
    },
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// error parsing or writing XML
    #[error("XML error: {0}")]
    Xml(String),
    /// error parsing YAML
    #[error("error parsing YAML")]
    YamlParseError,
}

#[cfg(feature = "serde-serialize")]
impl std::convert::From<serde_yaml::Error> for Error {
    #[inline]
    fn from(_orig: serde_yaml::Error) -> Self {
        Error::YamlParseError
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Linear pinhole intrinsics as seen from border-free pixel space.
///
/// The focal lengths and principal point come from a prior intrinsic
/// calibration and are owned elsewhere; this crate only reads them. Lens
/// distortion has already been removed by the image pipeline, which pads
/// the undistorted image with `border_size` pixels on every side. Points in
/// this crate are expressed without that border, so every projection uses
/// the principal point shifted by `-border_size`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    /// Horizontal focal length in pixels.
    pub fx: f64,
    /// Vertical focal length in pixels.
    pub fy: f64,
    /// Horizontal principal point in pixels (image with border).
    pub cx: f64,
    /// Vertical principal point in pixels (image with border).
    pub cy: f64,
    /// Padding added symmetrically around the image, in pixels.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub border_size: f64,
}

impl CameraIntrinsics {
    /// Construct intrinsics without an image border.
    #[inline]
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            border_size: 0.0,
        }
    }

    /// Return a copy using the given image border size.
    #[inline]
    pub fn with_border(self, border_size: f64) -> Self {
        Self {
            border_size,
            ..self
        }
    }

    /// The principal point in border-free pixel space.
    #[inline]
    pub fn principal_point(&self) -> Vector2<f64> {
        Vector2::new(self.cx - self.border_size, self.cy - self.border_size)
    }

    /// The camera matrix `K` with the border-corrected principal point.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        let pp = self.principal_point();
        Matrix3::new(self.fx, 0.0, pp.x, 0.0, self.fy, pp.y, 0.0, 0.0, 1.0)
    }

    /// Project a point in camera coordinates to a pixel.
    ///
    /// A point with zero depth lies in the focal plane and cannot be
    /// projected. For it, `(0, 0)` is returned instead of infinities.
    pub fn project(&self, camera: &Vector3<f64>) -> Point2<f64> {
        if camera.z == 0.0 {
            return Point2::origin();
        }
        let pp = self.principal_point();
        Point2::new(
            self.fx * camera.x / camera.z + pp.x,
            self.fy * camera.y / camera.z + pp.y,
        )
    }

    /// Back-project a pixel to the camera-frame ray with unit depth.
    pub fn ray(&self, pixel: &Point2<f64>) -> Vector3<f64> {
        let pp = self.principal_point();
        Vector3::new(
            (pixel.x - pp.x) / self.fx,
            (pixel.y - pp.y) / self.fy,
            1.0,
        )
    }

    /// Return `true` if a pixel cannot be shown in the bordered image.
    ///
    /// A pixel is outside when either coordinate is not finite or when it
    /// leaves `[-border, width - border) x [-border, height - border)`.
    /// `image` is the size of the image including its border.
    pub fn is_outside_image(&self, pixel: &Point2<f64>, image: &ImageSize) -> bool {
        if !pixel.x.is_finite() || !pixel.y.is_finite() {
            return true;
        }
        let b = self.border_size;
        pixel.x < -b
            || pixel.x >= image.width as f64 - b
            || pixel.y < -b
            || pixel.y >= image.height as f64 - b
    }
}

/// Size of the (bordered) image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ImageSize {
    /// The width of the image (in pixels).
    pub width: usize,
    /// The height of the image (in pixels).
    pub height: usize,
}

impl IntrinsicParameters<f64> for CameraIntrinsics {
    type BundleType = SharedOriginRayBundle<f64>;

    fn pixel_to_camera<IN, NPTS>(
        &self,
        pixels: &Pixels<f64, NPTS, IN>,
    ) -> RayBundle<CameraFrame, Self::BundleType, f64, NPTS, Owned<f64, NPTS, U3>>
    where
        Self::BundleType: Bundle<f64>,
        IN: Storage<f64, NPTS, U2>,
        NPTS: Dim,
        DefaultAllocator: Allocator<NPTS, U2>,
        DefaultAllocator: Allocator<NPTS, U3>,
        DefaultAllocator: Allocator<U1, U2>,
    {
        let mut result = RayBundle::new_shared_zero_origin(OMatrix::zeros_generic(
            NPTS::from_usize(pixels.data.nrows()),
            U3::from_usize(3),
        ));

        for i in 0..pixels.data.nrows() {
            let ray = self.ray(&Point2::new(pixels.data[(i, 0)], pixels.data[(i, 1)]));
            result.data[(i, 0)] = ray.x;
            result.data[(i, 1)] = ray.y;
            result.data[(i, 2)] = ray.z;
        }
        result
    }

    fn camera_to_pixel<IN, NPTS>(
        &self,
        camera: &Points<CameraFrame, f64, NPTS, IN>,
    ) -> Pixels<f64, NPTS, Owned<f64, NPTS, U2>>
    where
        IN: Storage<f64, NPTS, U3>,
        NPTS: Dim,
        DefaultAllocator: Allocator<NPTS, U2>,
    {
        let mut result = Pixels::new(OMatrix::zeros_generic(
            NPTS::from_usize(camera.data.nrows()),
            U2::from_usize(2),
        ));

        for i in 0..camera.data.nrows() {
            let pixel = self.project(&Vector3::new(
                camera.data[(i, 0)],
                camera.data[(i, 1)],
                camera.data[(i, 2)],
            ));
            result.data[(i, 0)] = pixel.x;
            result.data[(i, 1)] = pixel.y;
        }
        result
    }
}
