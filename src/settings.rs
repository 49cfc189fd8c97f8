//! Calibration settings and camera setup files.

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

use crate::pnp::PnpOptions;

/// Largest accepted mean point-height reprojection error.
pub const MAX_AVERAGE_ERROR: f64 = 20.0;

/// Tunables of [`ExtrCalibration`](crate::ExtrCalibration).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(default))]
pub struct CalibrationSettings {
    /// A solved pose is rejected if its mean point-height reprojection
    /// error exceeds this value.
    pub max_average_error: f64,
    /// Options of the pose solver.
    pub solver: PnpOptions,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            max_average_error: MAX_AVERAGE_ERROR,
            solver: PnpOptions::default(),
        }
    }
}

#[cfg(feature = "serde-serialize")]
pub use setup::{from_yaml, CameraSetup};

#[cfg(feature = "serde-serialize")]
mod setup {
    use serde::{Deserialize, Serialize};

    use super::CalibrationSettings;
    use crate::{CameraIntrinsics, CoordinateFrameAdjustment, ImageSize, Result};

    /// Everything needed to calibrate one camera.
    ///
    /// Only `intrinsics` is required; the other sections fall back to their
    /// defaults.
    ///
    /// ```yaml
    /// intrinsics: {fx: 1000.0, fy: 1000.0, cx: 660.0, cy: 500.0, border_size: 20.0}
    /// image_size: {width: 1320, height: 1000}
    /// adjustment:
    ///   swap_y: true
    ///   offset: [0.0, 0.0, 0.0]
    ///   default_height: 175.0
    /// calibration:
    ///   max_average_error: 10.0
    /// ```
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CameraSetup {
        /// Intrinsic parameters.
        pub intrinsics: CameraIntrinsics,
        /// Image size including the border.
        #[serde(default)]
        pub image_size: Option<ImageSize>,
        /// User frame.
        #[serde(default)]
        pub adjustment: CoordinateFrameAdjustment,
        /// Calibration settings.
        #[serde(default)]
        pub calibration: CalibrationSettings,
    }

    /// Read a [`CameraSetup`] from a YAML file.
    pub fn from_yaml<Rd: std::io::Read>(reader: Rd) -> Result<CameraSetup> {
        let setup: CameraSetup = serde_yaml::from_reader(reader)?;
        Ok(setup)
    }

}
