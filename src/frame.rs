//! Adjustment between the calibrated world frame and the user frame.

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use nalgebra::{Point3, Vector3};

/// Height in cm assumed for a tracked point when its true height is unknown.
pub const DEFAULT_HEIGHT: f64 = 180.0;

/// User-chosen change of the world coordinate system.
///
/// The pose is always solved in the frame of the calibration points. Users
/// may then flip individual axes and move the origin, and the transforms of
/// [`WorldImageCorrespondence`](crate::WorldImageCorrespondence) accept and
/// return points in that adjusted (user) frame:
///
/// ```text
/// calibrated = swap(user) + offset
/// user       = swap(calibrated - offset)
/// ```
///
/// where `swap` negates each axis whose flag is set.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(default))]
pub struct CoordinateFrameAdjustment {
    /// Negate the x axis.
    pub swap_x: bool,
    /// Negate the y axis.
    pub swap_y: bool,
    /// Negate the z axis.
    pub swap_z: bool,
    /// Position of the user origin in calibrated coordinates (cm).
    pub offset: Vector3<f64>,
    /// Reference height (cm) for the default-height reprojection error.
    pub default_height: f64,
}

impl Default for CoordinateFrameAdjustment {
    fn default() -> Self {
        Self {
            swap_x: false,
            swap_y: false,
            swap_z: false,
            offset: Vector3::zeros(),
            default_height: DEFAULT_HEIGHT,
        }
    }
}

impl CoordinateFrameAdjustment {
    /// Per-axis factor, `-1` for swapped axes and `1` otherwise.
    pub fn signs(&self) -> Vector3<f64> {
        let sign = |swap: bool| if swap { -1.0 } else { 1.0 };
        Vector3::new(sign(self.swap_x), sign(self.swap_y), sign(self.swap_z))
    }

    /// Map a user-frame point into the calibrated frame.
    pub fn to_calibrated_frame(&self, user: &Point3<f64>) -> Point3<f64> {
        Point3::from(user.coords.component_mul(&self.signs()) + self.offset)
    }

    /// Map a calibrated-frame point into the user frame.
    pub fn to_user_frame(&self, calibrated: &Point3<f64>) -> Point3<f64> {
        Point3::from((calibrated.coords - self.offset).component_mul(&self.signs()))
    }

    /// Map a user-frame height into the calibrated frame.
    #[inline]
    pub fn height_to_calibrated(&self, height: f64) -> f64 {
        self.signs().z * height + self.offset.z
    }
}
