//! The extrinsic calibration engine.

use std::path::Path;

use log::{info, warn};
use nalgebra::Point2;

use crate::correspondences::{LoadOutcome, MismatchPolicy, PointCorrespondences};
use crate::{
    pnp, project_file_support, CalibrationSettings, CameraIntrinsics, CoordinateFrameAdjustment,
    Error, Pose, ReprojectionError, Result, WorldImageCorrespondence,
};

/// Extrinsic calibration of one camera.
///
/// Owns the point correspondences, the accepted pose and the reprojection
/// error record of the last solve. The engine is calibrated only while it
/// holds an accepted pose. A solve whose mean point-height error exceeds
/// [`CalibrationSettings::max_average_error`] is rejected and clears the
/// pose.
///
/// Intrinsics and the user frame are owned by the caller and passed to
/// every operation that needs them.
#[derive(Debug, Clone, Default)]
pub struct ExtrCalibration {
    correspondences: PointCorrespondences,
    pose: Option<Pose>,
    reprojection_error: ReprojectionError,
    settings: CalibrationSettings,
}

impl ExtrCalibration {
    /// Create an engine with the given settings.
    pub fn new(settings: CalibrationSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    /// The settings.
    #[inline]
    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    /// The correspondences.
    #[inline]
    pub fn correspondences(&self) -> &PointCorrespondences {
        &self.correspondences
    }

    /// Mutable access to the correspondences.
    ///
    /// Changing points does not invalidate the current pose; call
    /// [`Self::calibrate`] to solve again.
    #[inline]
    pub fn correspondences_mut(&mut self) -> &mut PointCorrespondences {
        &mut self.correspondences
    }

    /// The accepted pose, if any.
    #[inline]
    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    /// `true` while an accepted pose is held.
    #[inline]
    pub fn is_calibrated(&self) -> bool {
        self.pose.is_some()
    }

    /// Adopt a pose from elsewhere, e.g. a project file.
    ///
    /// The reprojection error record is reset; see
    /// [`Self::refresh_reprojection_error`].
    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = Some(pose);
        self.reprojection_error = ReprojectionError::default();
    }

    /// Drop the pose and the error record.
    pub fn reset(&mut self) {
        self.pose = None;
        self.reprojection_error = ReprojectionError::default();
    }

    /// The error record of the last solve.
    #[inline]
    pub fn reprojection_error(&self) -> &ReprojectionError {
        &self.reprojection_error
    }

    /// The forward and inverse transforms of the accepted pose.
    pub fn world_image(
        &self,
        intrinsics: &CameraIntrinsics,
        adjustment: &CoordinateFrameAdjustment,
    ) -> Option<WorldImageCorrespondence> {
        self.pose
            .map(|pose| WorldImageCorrespondence::new(pose, *intrinsics, *adjustment))
    }

    /// Solve the pose from the stored correspondences.
    ///
    /// With an invalid set of correspondences nothing is changed. If the
    /// solver fails or the result is rejected, the pose and the error record
    /// are reset.
    pub fn calibrate(
        &mut self,
        intrinsics: &CameraIntrinsics,
        adjustment: &CoordinateFrameAdjustment,
    ) -> Result<Pose> {
        if let Err(e) = self.correspondences.check_complete() {
            warn!("Invalid point correspondences for camera calibration: {e}");
            return Err(e);
        }
        let points_3d = self.correspondences.points_3d();
        let points_2d = self.correspondences.points_2d();

        let solution = match pnp::solve_pnp(points_3d, points_2d, intrinsics, &self.settings.solver) {
            Ok(solution) => solution,
            Err(e) => {
                warn!("Extrinsic calibration not possible! Please select other 2D/3D points! ({e})");
                self.reset();
                return Err(e);
            }
        };
        let pose = Pose::from_camera_transform(solution.rotation_vector, solution.translation);

        let rot = pose.rotation_matrix();
        info!("-.- ESTIMATED ROTATION -.-");
        for r in 0..3 {
            info!("{}, {}, {}", rot[(r, 0)], rot[(r, 1)], rot[(r, 2)]);
        }
        let t = solution.translation;
        info!("-.- ESTIMATED TRANSLATION -.-");
        info!("{}, {}, {}", t.x, t.y, t.z);
        let t = pose.translation;
        info!("-.- Translation vector -.-");
        info!("{}, {}, {}", t.x, t.y, t.z);
        let r = pose.rotation_vector;
        info!("-.- Rotation vector -.-");
        info!("{}, {}, {}", r.x, r.y, r.z);

        let mapping = WorldImageCorrespondence::new(pose, *intrinsics, *adjustment);
        let average = ReprojectionError::compute(points_3d, points_2d, &mapping)
            .map(|err| (err.point_height().average, err));

        let threshold = self.settings.max_average_error;
        match average {
            Some((average, err)) if average <= threshold => {
                self.pose = Some(pose);
                self.reprojection_error = err;
                info!("End of extern calibration!");
                Ok(pose)
            }
            other => {
                let average = other.map_or(f64::NAN, |(average, _)| average);
                warn!(
                    "Extrinsic calibration rejected: average reprojection error {average} exceeds {threshold}. Please select other 2D/3D points!"
                );
                self.reset();
                Err(Error::CalibrationRejected { average, threshold })
            }
        }
    }

    /// Load correspondences from a file and solve if they are complete.
    ///
    /// Returns the new pose, or `None` if the file did not lead to a solve
    /// (no 2D data, or the previous points were kept).
    pub fn load_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        policy: MismatchPolicy,
        intrinsics: &CameraIntrinsics,
        adjustment: &CoordinateFrameAdjustment,
    ) -> Result<Option<Pose>> {
        match self.correspondences.load(path, policy)? {
            LoadOutcome::KeptPrevious => Ok(None),
            LoadOutcome::Loaded { .. } => {
                if self.correspondences.check_complete().is_ok() {
                    self.calibrate(intrinsics, adjustment).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Use tracked marker positions as 2D points and solve.
    pub fn fetch_2d_points(
        &mut self,
        points: Vec<Point2<f64>>,
        intrinsics: &CameraIntrinsics,
        adjustment: &CoordinateFrameAdjustment,
    ) -> Result<Pose> {
        self.correspondences.fetch_from_tracked_2d(points)?;
        self.calibrate(intrinsics, adjustment)
    }

    /// Recompute the error record if it is invalid and a pose is held.
    pub fn refresh_reprojection_error(
        &mut self,
        intrinsics: &CameraIntrinsics,
        adjustment: &CoordinateFrameAdjustment,
    ) -> &ReprojectionError {
        if !self.reprojection_error.is_valid() {
            if let Some(mapping) = self.world_image(intrinsics, adjustment) {
                self.reprojection_error = ReprojectionError::compute(
                    self.correspondences.points_3d(),
                    self.correspondences.points_2d(),
                    &mapping,
                )
                .unwrap_or_default();
            }
        }
        &self.reprojection_error
    }

    /// Write the error record as the project file fragment.
    pub fn to_xml(&self) -> Result<String> {
        project_file_support::to_xml(&self.reprojection_error)
    }

    /// Read the error record from the project file fragment.
    pub fn read_xml(&mut self, xml: &str) -> Result<()> {
        project_file_support::read_xml(xml, &mut self.reprojection_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector2, Vector3};

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(800.0, 800.0, 320.0, 320.0)
    }

    fn truth() -> WorldImageCorrespondence {
        let pose = Pose::from_camera_transform(
            Vector3::new(std::f64::consts::PI, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 500.0),
        );
        WorldImageCorrespondence::new(pose, intrinsics(), CoordinateFrameAdjustment::default())
    }

    fn square() -> Vec<Point3<f64>> {
        vec![
            Point3::new(-50.0, -50.0, 0.0),
            Point3::new(50.0, -50.0, 0.0),
            Point3::new(50.0, 50.0, 0.0),
            Point3::new(-50.0, 50.0, 0.0),
        ]
    }

    fn calibrated() -> ExtrCalibration {
        let map = truth();
        let mut calib = ExtrCalibration::default();
        let world = square();
        let image = world.iter().map(|p| map.image_point(p)).collect();
        calib.correspondences_mut().set_points_3d(world);
        calib.correspondences_mut().set_points_2d(image);
        calib
            .calibrate(&intrinsics(), &CoordinateFrameAdjustment::default())
            .unwrap();
        calib
    }

    #[test]
    fn square_from_above() {
        let calib = calibrated();
        assert!(calib.is_calibrated());
        let pose = calib.pose().unwrap();
        assert_relative_eq!(
            pose.rotation_matrix(),
            truth().pose().rotation_matrix(),
            epsilon = 1e-3
        );
        assert_relative_eq!(pose.translation, truth().pose().translation, epsilon = 1e-3);
        assert_relative_eq!(pose.camera_height(), 500.0, epsilon = 1e-3);

        let map = calib
            .world_image(&intrinsics(), &CoordinateFrameAdjustment::default())
            .unwrap();
        let held_out = Point3::new(20.0, -35.0, 0.0);
        let error = (map.image_point(&held_out) - truth().image_point(&held_out)).norm();
        assert!(error < 1.0);
        assert!(calib.reprojection_error().is_valid());
    }

    #[test]
    fn too_few_points_keep_previous_pose() {
        let mut calib = calibrated();
        let before = *calib.pose().unwrap();
        let record = *calib.reprojection_error();

        calib.correspondences_mut().set_points_3d(square()[..3].to_vec());
        calib
            .correspondences_mut()
            .set_points_2d(vec![Point2::new(0.0, 0.0); 3]);
        let result = calib.calibrate(&intrinsics(), &CoordinateFrameAdjustment::default());
        assert!(matches!(result, Err(Error::NotEnoughPoints { found: 3 })));
        assert_eq!(calib.pose(), Some(&before));
        assert_eq!(*calib.reprojection_error(), record);

        calib
            .correspondences_mut()
            .set_points_2d(vec![Point2::new(0.0, 0.0); 4]);
        let result = calib.calibrate(&intrinsics(), &CoordinateFrameAdjustment::default());
        assert!(matches!(result, Err(Error::InvalidCorrespondences { .. })));
        assert!(calib.is_calibrated());
    }

    #[test]
    fn non_coplanar_below_six_keeps_previous_pose() {
        let mut calib = calibrated();
        let before = *calib.pose().unwrap();
        let record = *calib.reprojection_error();

        let map = truth();
        let mut world = square();
        world.push(Point3::new(0.0, 0.0, 100.0));
        let image = world.iter().map(|p| map.image_point(p)).collect();
        calib.correspondences_mut().set_points_3d(world);
        calib.correspondences_mut().set_points_2d(image);

        let result = calib.calibrate(&intrinsics(), &CoordinateFrameAdjustment::default());
        assert!(matches!(result, Err(Error::NotEnoughPoints { found: 5 })));
        assert_eq!(calib.pose(), Some(&before));
        assert_eq!(*calib.reprojection_error(), record);
    }

    #[test]
    fn default_threshold_rejects_displaced_pixels() {
        let mut calib = calibrated();
        let map = truth();
        let world: Vec<_> = [-100.0, 0.0, 100.0]
            .iter()
            .flat_map(|&y| [-100.0, 0.0, 100.0].map(|x| Point3::new(x, y, 0.0)))
            .collect();
        let displacement = [
            (250.0, 0.0),
            (0.0, -300.0),
            (-200.0, 250.0),
            (300.0, 300.0),
            (-250.0, -200.0),
            (0.0, 250.0),
            (200.0, -300.0),
            (-300.0, 0.0),
            (250.0, 200.0),
        ];
        let image = world
            .iter()
            .zip(displacement)
            .map(|(p, (dx, dy))| map.image_point(p) + Vector2::new(dx, dy))
            .collect();
        calib.correspondences_mut().set_points_3d(world);
        calib.correspondences_mut().set_points_2d(image);

        let result = calib.calibrate(&intrinsics(), &CoordinateFrameAdjustment::default());
        match result {
            Err(Error::CalibrationRejected { average, threshold }) => {
                assert_eq!(threshold, crate::settings::MAX_AVERAGE_ERROR);
                assert!(average > threshold || average.is_nan());
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(!calib.is_calibrated());
        assert!(!calib.reprojection_error().is_valid());
    }

    #[test]
    fn threshold_rejects_and_resets() {
        let mut calib = calibrated();
        // shift one observation so the solved pose cannot fit exactly
        let mut image: Vec<_> = calib.correspondences().points_2d().to_vec();
        image[0].x += 15.0;
        calib.correspondences_mut().set_points_2d(image);

        let mut strict = ExtrCalibration::new(CalibrationSettings {
            max_average_error: 0.0,
            ..Default::default()
        });
        *strict.correspondences_mut() = calib.correspondences().clone();
        strict.set_pose(*calib.pose().unwrap());

        let result = strict.calibrate(&intrinsics(), &CoordinateFrameAdjustment::default());
        assert!(matches!(result, Err(Error::CalibrationRejected { .. })));
        assert!(!strict.is_calibrated());
        assert!(!strict.reprojection_error().is_valid());

        // the default threshold accepts the same data
        calib
            .calibrate(&intrinsics(), &CoordinateFrameAdjustment::default())
            .unwrap();
        assert!(calib.reprojection_error().point_height().average > 0.0);
        assert!(calib.reprojection_error().point_height().average <= 20.0);
    }

    #[test]
    fn refresh_after_set_pose() {
        let calib = calibrated();
        let mut restored = ExtrCalibration::default();
        *restored.correspondences_mut() = calib.correspondences().clone();
        restored.set_pose(*calib.pose().unwrap());
        assert!(!restored.reprojection_error().is_valid());

        let err = *restored.refresh_reprojection_error(&intrinsics(), &CoordinateFrameAdjustment::default());
        assert!(err.is_valid());
        assert!(err.pixel().max < 1e-6);
    }

    #[test]
    fn xml_roundtrip_through_engine() {
        let calib = calibrated();
        let xml = calib.to_xml().unwrap();
        let mut other = ExtrCalibration::default();
        other.read_xml(&xml).unwrap();
        assert_eq!(other.reprojection_error(), calib.reprojection_error());
    }

    #[test]
    fn fetch_2d_points_solves() {
        let map = truth();
        let mut calib = ExtrCalibration::default();
        calib.correspondences_mut().set_points_3d(square());
        let image = square().iter().map(|p| map.image_point(p)).collect();
        let pose = calib
            .fetch_2d_points(image, &intrinsics(), &CoordinateFrameAdjustment::default())
            .unwrap();
        assert_relative_eq!(pose.camera_height(), 500.0, epsilon = 1e-3);

        let wrong = vec![Point2::new(1.0, 1.0); 5];
        assert!(calib
            .fetch_2d_points(wrong, &intrinsics(), &CoordinateFrameAdjustment::default())
            .is_err());
        assert!(calib.is_calibrated());
    }
}
