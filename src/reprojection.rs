//! Quality of an extrinsic calibration measured by reprojection.

use log::info;
use nalgebra::{Point2, Point3};

use crate::WorldImageCorrespondence;

/// Summary statistics of one family of reprojection errors.
///
/// A field of `-1` marks a value that has not been computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorStats {
    /// Mean error.
    pub average: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    /// Population variance.
    pub variance: f64,
    /// Largest error.
    pub max: f64,
}

impl Default for ErrorStats {
    fn default() -> Self {
        Self::UNSET
    }
}

impl ErrorStats {
    /// Statistics that have not been computed.
    pub const UNSET: Self = Self {
        average: -1.0,
        std_dev: -1.0,
        variance: -1.0,
        max: -1.0,
    };

    /// Compute statistics over `samples`, or `None` if there are none.
    ///
    /// The first pass collects the mean and the maximum, the second the
    /// variance around that mean.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;

        let mut sum = 0.0;
        let mut max = -1.0_f64;
        for &val in samples {
            sum += val;
            if val > max {
                max = val;
            }
        }
        let average = sum / n;

        let variance = samples
            .iter()
            .map(|val| (val - average).powi(2))
            .sum::<f64>()
            / n;

        Some(Self {
            average,
            std_dev: variance.sqrt(),
            variance,
            max,
        })
    }

    /// Statistics from persisted values, where the variance is derived from
    /// the standard deviation.
    pub fn from_persisted(average: f64, std_dev: f64, max: f64) -> Self {
        Self {
            average,
            std_dev,
            variance: variance_from_std_dev(std_dev),
            max,
        }
    }

    fn values(&self) -> [f64; 4] {
        [self.average, self.std_dev, self.variance, self.max]
    }
}

pub(crate) fn variance_from_std_dev(std_dev: f64) -> f64 {
    if std_dev < 0.0 {
        -1.0
    } else {
        std_dev.powi(2)
    }
}

/// Reprojection errors of a calibration on its own correspondences.
///
/// Three families are recorded:
///
/// - `point_height`: distance (cm) in the ground plane between a 3D point
///   and the back-projection of its pixel at the point's own height,
/// - `default_height`: distance (cm) between the back-projections, at a
///   fixed reference height, of the observed pixel and of the projected 3D
///   point,
/// - `pixel`: distance (px) between the observed pixel and the projected 3D
///   point.
///
/// A record is valid when every value is finite and non-negative. The
/// default record is unset and invalid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReprojectionError {
    point_height: ErrorStats,
    default_height: ErrorStats,
    pixel: ErrorStats,
    used_default_height: f64,
    valid: bool,
}

impl Default for ReprojectionError {
    fn default() -> Self {
        Self {
            point_height: ErrorStats::UNSET,
            default_height: ErrorStats::UNSET,
            pixel: ErrorStats::UNSET,
            used_default_height: -1.0,
            valid: false,
        }
    }
}

impl ReprojectionError {
    /// Create a record from its statistics; validity is derived.
    pub fn new(
        point_height: ErrorStats,
        default_height: ErrorStats,
        pixel: ErrorStats,
        used_default_height: f64,
    ) -> Self {
        let mut err = Self {
            point_height,
            default_height,
            pixel,
            used_default_height,
            valid: false,
        };
        err.revalidate();
        err
    }

    /// Compute the record for calibration points under `mapping`.
    ///
    /// `points_3d` are in the calibrated frame; they are moved into the
    /// mapping's user frame before comparison. Returns `None` if there are
    /// no points or the two sequences differ in length.
    pub fn compute(
        points_3d: &[Point3<f64>],
        points_2d: &[Point2<f64>],
        mapping: &WorldImageCorrespondence,
    ) -> Option<Self> {
        let n = points_2d.len();
        if n == 0 || n != points_3d.len() {
            return None;
        }

        let adjustment = mapping.adjustment();
        let default_height = adjustment.default_height;

        let mut point_height = Vec::with_capacity(n);
        let mut at_default_height = Vec::with_capacity(n);
        let mut pixel = Vec::with_capacity(n);
        for (p3d, p2d) in points_3d.iter().zip(points_2d) {
            let p3d = adjustment.to_user_frame(p3d);
            let projected = mapping.image_point(&p3d);

            let back = mapping.world_point(p2d, p3d.z);
            let observed_default = mapping.world_point(p2d, default_height);
            let projected_default = mapping.world_point(&projected, default_height);

            point_height.push((p3d.xy() - back.xy()).norm());
            at_default_height.push((projected_default.xy() - observed_default.xy()).norm());
            pixel.push((projected - *p2d).norm());
        }

        let point_height = ErrorStats::from_samples(&point_height)?;
        let at_default_height = ErrorStats::from_samples(&at_default_height)?;
        let pixel = ErrorStats::from_samples(&pixel)?;

        info!(
            "Reprojection error (pointHeight) average: {}cm (standard deviation: {}, variance: {}, max error: {}cm)",
            point_height.average, point_height.std_dev, point_height.variance, point_height.max
        );
        info!(
            "Reprojection error (defaultHeight={}) average: {}cm (standard deviation: {}, variance: {}, max error: {}cm)",
            default_height,
            at_default_height.average,
            at_default_height.std_dev,
            at_default_height.variance,
            at_default_height.max
        );
        info!(
            "Reprojection error (Pixel) average: {}px (standard deviation: {}, variance: {}, max error: {}px)",
            pixel.average, pixel.std_dev, pixel.variance, pixel.max
        );

        Some(Self::new(point_height, at_default_height, pixel, default_height))
    }

    /// Errors using each point's own height (cm).
    #[inline]
    pub fn point_height(&self) -> &ErrorStats {
        &self.point_height
    }

    /// Errors using the reference height (cm).
    #[inline]
    pub fn default_height(&self) -> &ErrorStats {
        &self.default_height
    }

    /// Errors in the image plane (px).
    #[inline]
    pub fn pixel(&self) -> &ErrorStats {
        &self.pixel
    }

    /// The reference height used for [`Self::default_height`].
    #[inline]
    pub fn used_default_height(&self) -> f64 {
        self.used_default_height
    }

    /// `true` if every value is finite and non-negative.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn point_height_mut(&mut self) -> &mut ErrorStats {
        &mut self.point_height
    }

    pub(crate) fn default_height_mut(&mut self) -> &mut ErrorStats {
        &mut self.default_height
    }

    pub(crate) fn pixel_mut(&mut self) -> &mut ErrorStats {
        &mut self.pixel
    }

    pub(crate) fn set_used_default_height(&mut self, height: f64) {
        self.used_default_height = height;
    }

    pub(crate) fn revalidate(&mut self) {
        self.valid = self
            .point_height
            .values()
            .iter()
            .chain(self.default_height.values().iter())
            .chain(self.pixel.values().iter())
            .chain(std::iter::once(&self.used_default_height))
            .all(|v| v.is_finite() && *v >= 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CameraIntrinsics, CoordinateFrameAdjustment, Pose};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn mapping(adjustment: CoordinateFrameAdjustment) -> WorldImageCorrespondence {
        let pose = Pose::from_camera_transform(
            Vector3::new(2.7, 0.1, -0.05),
            Vector3::new(-20.0, 35.0, 600.0),
        );
        WorldImageCorrespondence::new(
            pose,
            CameraIntrinsics::new(1000.0, 1000.0, 640.0, 480.0),
            adjustment,
        )
    }

    fn grid() -> Vec<Point3<f64>> {
        (0..3)
            .flat_map(|i| (0..3).map(move |j| Point3::new(i as f64 * 50.0, j as f64 * 50.0, 0.0)))
            .collect()
    }

    #[test]
    fn stats_two_pass() {
        let stats = ErrorStats::from_samples(&[1.0, 2.0, 3.0, 6.0]).unwrap();
        assert_relative_eq!(stats.average, 3.0);
        assert_relative_eq!(stats.variance, 3.5);
        assert_relative_eq!(stats.std_dev, 3.5f64.sqrt());
        assert_relative_eq!(stats.max, 6.0);
        assert!(ErrorStats::from_samples(&[]).is_none());
    }

    #[test]
    fn default_is_invalid() {
        let err = ReprojectionError::default();
        assert!(!err.is_valid());
        assert_eq!(*err.pixel(), ErrorStats::UNSET);
        assert_eq!(err.used_default_height(), -1.0);
    }

    #[test]
    fn validity_rejects_negative_and_nan() {
        let ok = ErrorStats::from_samples(&[0.5, 1.5]).unwrap();
        assert!(ReprojectionError::new(ok, ok, ok, 180.0).is_valid());

        let negative = ErrorStats { max: -0.1, ..ok };
        assert!(!ReprojectionError::new(ok, negative, ok, 180.0).is_valid());

        let nan = ErrorStats { average: f64::NAN, ..ok };
        assert!(!ReprojectionError::new(ok, ok, nan, 180.0).is_valid());

        assert!(!ReprojectionError::new(ok, ok, ok, -1.0).is_valid());
    }

    #[test]
    fn persisted_variance() {
        assert_eq!(ErrorStats::from_persisted(1.0, 0.5, 2.0).variance, 0.25);
        assert_eq!(ErrorStats::from_persisted(1.0, -1.0, 2.0).variance, -1.0);
    }

    #[test]
    fn exact_correspondences_have_zero_error() {
        let map = mapping(CoordinateFrameAdjustment::default());
        let points_3d = grid();
        let points_2d: Vec<_> = points_3d.iter().map(|p| map.image_point(p)).collect();

        let err = ReprojectionError::compute(&points_3d, &points_2d, &map).unwrap();
        assert!(err.is_valid());
        assert!(err.point_height().average < 1e-6);
        assert!(err.default_height().max < 1e-6);
        assert!(err.pixel().max < 1e-6);
        assert_eq!(err.used_default_height(), 180.0);
    }

    #[test]
    fn adjustment_does_not_change_errors() {
        let adjusted = CoordinateFrameAdjustment {
            swap_x: true,
            swap_y: false,
            swap_z: false,
            offset: Vector3::new(40.0, -10.0, 0.0),
            default_height: 150.0,
        };
        let plain = mapping(CoordinateFrameAdjustment {
            default_height: 150.0,
            ..Default::default()
        });
        let points_3d = grid();
        let mut points_2d: Vec<_> = points_3d.iter().map(|p| plain.image_point(p)).collect();
        points_2d[4].x += 3.0;
        points_2d[7].y -= 2.0;

        let a = ReprojectionError::compute(&points_3d, &points_2d, &plain).unwrap();
        let b = ReprojectionError::compute(&points_3d, &points_2d, &mapping(adjusted)).unwrap();
        assert_relative_eq!(a.pixel().average, b.pixel().average, epsilon = 1e-9);
        assert_relative_eq!(a.point_height().max, b.point_height().max, epsilon = 1e-6);
        assert_relative_eq!(a.default_height().average, b.default_height().average, epsilon = 1e-6);
        assert!(a.pixel().max > 2.9);
    }

    #[test]
    fn mismatched_input() {
        let map = mapping(CoordinateFrameAdjustment::default());
        let points_3d = grid();
        assert!(ReprojectionError::compute(&points_3d, &[], &map).is_none());
        assert!(ReprojectionError::compute(&points_3d[..2], &[Point2::origin(); 3], &map).is_none());
    }
}
