//! Persist reprojection errors as a fragment of the project XML file.
//!
//! The fragment looks like:
//!
//! ```xml
//! <EXTR_CALIBRATION>
//!   <REPROJECTION_ERROR AVG_PH="0.8" SD_PH="0.3" MAX_PH="1.4" AVG_DH="0.9" SD_DH="0.4"
//!     MAX_DH="1.6" AVG_PX="1.1" SD_PX="0.5" MAX_PX="2" USED_HEIGHT="180"/>
//! </EXTR_CALIBRATION>
//! ```
//!
//! Variances are not stored; they are recomputed from the standard
//! deviations when reading.

use serde::{Deserialize, Serialize};

use crate::reprojection::{variance_from_std_dev, ErrorStats};
use crate::{Error, ReprojectionError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "EXTR_CALIBRATION")]
struct ExtrCalibrationElement {
    #[serde(
        rename = "REPROJECTION_ERROR",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    reprojection_error: Option<ReprojectionErrorAttributes>,
}

/// Attributes of the `REPROJECTION_ERROR` element.
///
/// Every attribute is optional when reading.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionErrorAttributes {
    /// point height average
    #[serde(rename = "@AVG_PH", default, skip_serializing_if = "Option::is_none")]
    pub avg_ph: Option<f64>,
    /// point height standard deviation
    #[serde(rename = "@SD_PH", default, skip_serializing_if = "Option::is_none")]
    pub sd_ph: Option<f64>,
    /// point height maximum
    #[serde(rename = "@MAX_PH", default, skip_serializing_if = "Option::is_none")]
    pub max_ph: Option<f64>,
    /// default height average
    #[serde(rename = "@AVG_DH", default, skip_serializing_if = "Option::is_none")]
    pub avg_dh: Option<f64>,
    /// default height standard deviation
    #[serde(rename = "@SD_DH", default, skip_serializing_if = "Option::is_none")]
    pub sd_dh: Option<f64>,
    /// default height maximum
    #[serde(rename = "@MAX_DH", default, skip_serializing_if = "Option::is_none")]
    pub max_dh: Option<f64>,
    /// pixel average
    #[serde(rename = "@AVG_PX", default, skip_serializing_if = "Option::is_none")]
    pub avg_px: Option<f64>,
    /// pixel standard deviation
    #[serde(rename = "@SD_PX", default, skip_serializing_if = "Option::is_none")]
    pub sd_px: Option<f64>,
    /// pixel maximum
    #[serde(rename = "@MAX_PX", default, skip_serializing_if = "Option::is_none")]
    pub max_px: Option<f64>,
    /// reference height of the default height errors
    #[serde(rename = "@USED_HEIGHT", default, skip_serializing_if = "Option::is_none")]
    pub used_height: Option<f64>,
}

impl From<&ReprojectionError> for ReprojectionErrorAttributes {
    fn from(err: &ReprojectionError) -> Self {
        let ph = err.point_height();
        let dh = err.default_height();
        let px = err.pixel();
        Self {
            avg_ph: Some(ph.average),
            sd_ph: Some(ph.std_dev),
            max_ph: Some(ph.max),
            avg_dh: Some(dh.average),
            sd_dh: Some(dh.std_dev),
            max_dh: Some(dh.max),
            avg_px: Some(px.average),
            sd_px: Some(px.std_dev),
            max_px: Some(px.max),
            used_height: Some(err.used_default_height()),
        }
    }
}

fn apply_stats(stats: &mut ErrorStats, average: Option<f64>, std_dev: Option<f64>, max: Option<f64>) {
    if let Some(average) = average {
        stats.average = average;
    }
    if let Some(std_dev) = std_dev {
        stats.std_dev = std_dev;
        stats.variance = variance_from_std_dev(std_dev);
    }
    if let Some(max) = max {
        stats.max = max;
    }
}

impl ReprojectionError {
    /// Overwrite the fields present in `attrs` and recompute validity.
    pub fn apply_attributes(&mut self, attrs: &ReprojectionErrorAttributes) {
        apply_stats(self.point_height_mut(), attrs.avg_ph, attrs.sd_ph, attrs.max_ph);
        apply_stats(self.default_height_mut(), attrs.avg_dh, attrs.sd_dh, attrs.max_dh);
        apply_stats(self.pixel_mut(), attrs.avg_px, attrs.sd_px, attrs.max_px);
        if let Some(height) = attrs.used_height {
            self.set_used_default_height(height);
        }
        self.revalidate();
    }
}

/// Write `err` as an `EXTR_CALIBRATION` element.
pub fn to_xml(err: &ReprojectionError) -> Result<String> {
    let element = ExtrCalibrationElement {
        reprojection_error: Some(err.into()),
    };
    quick_xml::se::to_string(&element).map_err(|e| Error::Xml(e.to_string()))
}

/// Read an `EXTR_CALIBRATION` element into `err`.
///
/// Attributes missing from the element leave the corresponding fields of
/// `err` unchanged. Without a `REPROJECTION_ERROR` child nothing changes.
pub fn read_xml(xml: &str, err: &mut ReprojectionError) -> Result<()> {
    let element: ExtrCalibrationElement =
        quick_xml::de::from_str(xml).map_err(|e| Error::Xml(e.to_string()))?;
    if let Some(attrs) = element.reprojection_error {
        err.apply_attributes(&attrs);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReprojectionError {
        ReprojectionError::new(
            ErrorStats::from_persisted(0.75, 0.25, 1.5),
            ErrorStats::from_persisted(1.25, 0.5, 2.5),
            ErrorStats::from_persisted(1.5, 0.125, 3.0),
            180.0,
        )
    }

    #[test]
    fn roundtrip_xml() {
        let err = sample();
        let xml = to_xml(&err).unwrap();
        assert!(xml.starts_with("<EXTR_CALIBRATION>"));
        assert!(xml.contains("<REPROJECTION_ERROR"));
        assert!(xml.contains("USED_HEIGHT="));

        let mut read = ReprojectionError::default();
        read_xml(&xml, &mut read).unwrap();
        assert_eq!(read, err);
        assert!(read.is_valid());
        assert_eq!(read.default_height().variance, 0.25);
    }

    #[test]
    fn missing_attributes_keep_fields() {
        let xml = r#"<EXTR_CALIBRATION><REPROJECTION_ERROR AVG_PH="0.5" SD_PX="2"/></EXTR_CALIBRATION>"#;
        let mut err = ReprojectionError::default();
        read_xml(xml, &mut err).unwrap();
        assert_eq!(err.point_height().average, 0.5);
        assert_eq!(err.point_height().std_dev, -1.0);
        assert_eq!(err.pixel().std_dev, 2.0);
        assert_eq!(err.pixel().variance, 4.0);
        assert_eq!(err.used_default_height(), -1.0);
        assert!(!err.is_valid());
    }

    #[test]
    fn negative_std_dev_marks_variance_unset() {
        let xml = r#"<EXTR_CALIBRATION><REPROJECTION_ERROR SD_DH="-1"/></EXTR_CALIBRATION>"#;
        let mut err = sample();
        read_xml(xml, &mut err).unwrap();
        assert_eq!(err.default_height().variance, -1.0);
        assert!(!err.is_valid());
    }

    #[test]
    fn without_child_nothing_changes() {
        let mut err = sample();
        read_xml("<EXTR_CALIBRATION/>", &mut err).unwrap();
        assert_eq!(err, sample());
    }

    #[test]
    fn malformed_attribute_is_error() {
        let xml = r#"<EXTR_CALIBRATION><REPROJECTION_ERROR AVG_PH="abc"/></EXTR_CALIBRATION>"#;
        let mut err = ReprojectionError::default();
        assert!(matches!(read_xml(xml, &mut err), Err(Error::Xml(_))));
    }
}
