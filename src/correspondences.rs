//! Store of 3D/2D point correspondences and its text file format.
//!
//! A correspondence file holds one point per line, either `x y z` or
//! `x y z px py`, separated by whitespace. Lines starting with `#`, `;;`,
//! `//` or `!` are comments. A line with a single number (the point count
//! written by [`PointCorrespondences::save`]) is ignored.

use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nalgebra::{Point2, Point3};

use crate::pnp::{self, MIN_POINTS_PLANAR};
use crate::{Error, Result};

const COMMENT_PREFIXES: [&str; 4] = ["#", ";;", "//", "!"];

/// What to do when loaded 3D points disagree with the stored 2D points.
///
/// Applies only to files without 2D data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Keep the store as it was and report [`LoadOutcome::KeptPrevious`].
    KeepOld,
    /// Drop the stored 2D points; they have to be fetched again.
    #[default]
    Discard,
    /// Fail with [`Error::StoredPointsMismatch`].
    Abort,
}

/// Result of a successful [`PointCorrespondences::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The file contents replaced the stored points.
    Loaded {
        /// number of 3D points read
        points_3d: usize,
        /// number of 2D points read
        points_2d: usize,
        /// previously stored 2D points were dropped
        discarded_2d: bool,
    },
    /// The file disagreed with the stored 2D points; nothing was changed.
    KeptPrevious,
}

/// Points read from correspondence text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCorrespondences {
    /// 3D points of all accepted lines.
    pub points_3d: Vec<Point3<f64>>,
    /// 2D points of accepted five-value lines.
    pub points_2d: Vec<Point2<f64>>,
    /// Some line carried 3D data.
    pub has_3d: bool,
    /// Some line carried 2D data.
    pub has_2d: bool,
}

/// Parse correspondence text.
///
/// Malformed lines are logged and skipped.
pub fn parse(text: &str) -> ParsedCorrespondences {
    let mut parsed = ParsedCorrespondences::default();

    for (idx, line) in text.lines().enumerate() {
        let line_number = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || COMMENT_PREFIXES.iter().any(|c| line.starts_with(c)) {
            continue;
        }

        let values: Option<Vec<f64>> = trimmed
            .split_whitespace()
            .map(|v| v.parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect();
        let Some(values) = values else {
            warn!("Something wrong in line {line_number} ({line})! Ignored. (not a number)");
            continue;
        };

        match values[..] {
            [_] => info!("Optional number of points in line {line_number} ignored."),
            [x, y, z] => {
                parsed.points_3d.push(Point3::new(x, y, z));
                parsed.has_3d = true;
            }
            [x, y, z, px, py] => {
                parsed.points_3d.push(Point3::new(x, y, z));
                parsed.points_2d.push(Point2::new(px, py));
                parsed.has_3d = true;
                parsed.has_2d = true;
            }
            _ => warn!(
                "Something wrong in line {line_number} ({line})! Ignored. (counter={})",
                values.len()
            ),
        }
    }
    parsed
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("3dc") || ext.eq_ignore_ascii_case("txt"))
        .unwrap_or(false)
}

/// Paired 3D world points (cm) and 2D image points (px).
///
/// Entries at the same index belong together. The sequences may be set
/// independently, e.g. while 2D points are being picked in the image, so
/// they are only checked when used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCorrespondences {
    points_3d: Vec<Point3<f64>>,
    points_2d: Vec<Point2<f64>>,
    file: Option<PathBuf>,
}

impl PointCorrespondences {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from complete correspondences.
    pub fn from_points(points_3d: Vec<Point3<f64>>, points_2d: Vec<Point2<f64>>) -> Result<Self> {
        let store = Self {
            points_3d,
            points_2d,
            file: None,
        };
        store.check_complete()?;
        Ok(store)
    }

    /// The 3D points.
    #[inline]
    pub fn points_3d(&self) -> &[Point3<f64>] {
        &self.points_3d
    }

    /// The 2D points.
    #[inline]
    pub fn points_2d(&self) -> &[Point2<f64>] {
        &self.points_2d
    }

    /// Replace the 3D points.
    pub fn set_points_3d(&mut self, points: Vec<Point3<f64>>) {
        self.points_3d = points;
    }

    /// Replace the 2D points.
    pub fn set_points_2d(&mut self, points: Vec<Point2<f64>>) {
        self.points_2d = points;
    }

    /// The file the points were loaded from.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Remember `path` as the file for [`Self::save`].
    pub fn set_file<P: Into<PathBuf>>(&mut self, path: P) {
        self.file = Some(path.into());
    }

    /// Number of complete correspondences, zero if incomplete.
    pub fn len(&self) -> usize {
        if self.check_complete().is_ok() {
            self.points_3d.len()
        } else {
            0
        }
    }

    /// `true` if there are no complete correspondences.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that both sequences have the same length and enough points to
    /// solve: four for coplanar 3D points, six otherwise.
    pub fn check_complete(&self) -> Result<()> {
        let n3 = self.points_3d.len();
        let n2 = self.points_2d.len();
        if n3 == 0 || n2 == 0 || n3 != n2 {
            return Err(Error::InvalidCorrespondences {
                points_3d: n3,
                points_2d: n2,
            });
        }
        if n3 < pnp::min_points(&self.points_3d) {
            return Err(Error::NotEnoughPoints { found: n3 });
        }
        Ok(())
    }

    /// Load correspondences from a `.3dc` or `.txt` file.
    ///
    /// On success the file is remembered. Sequences missing from the file
    /// keep their stored values, subject to `policy`.
    pub fn load<P: AsRef<Path>>(&mut self, path: P, policy: MismatchPolicy) -> Result<LoadOutcome> {
        let path = path.as_ref();
        if !has_supported_extension(path) {
            warn!("Unsupported file extension (supported: .3dc, .txt): {}", path.display());
            return Err(Error::UnsupportedExtension);
        }
        let text = std::fs::read_to_string(path)?;
        info!("Reading 3D calibration data from {} ...", path.display());

        let outcome = self.load_parsed(parse(&text), policy)?;
        if matches!(outcome, LoadOutcome::Loaded { .. }) {
            self.file = Some(path.to_path_buf());
        }
        Ok(outcome)
    }

    /// Apply parsed file contents to the store.
    ///
    /// Performs the same validation as [`Self::load`] without touching the
    /// file system.
    pub fn load_parsed(
        &mut self,
        parsed: ParsedCorrespondences,
        policy: MismatchPolicy,
    ) -> Result<LoadOutcome> {
        let n3 = parsed.points_3d.len();
        let n2 = parsed.points_2d.len();

        if n3 < pnp::min_points(&parsed.points_3d) {
            return Err(Error::NotEnoughPoints { found: n3 });
        }
        if parsed.has_2d && n2 != n3 {
            return Err(Error::CountMismatch {
                points_3d: n3,
                points_2d: n2,
            });
        }

        let mut discarded_2d = false;
        if !parsed.has_2d && !self.points_2d.is_empty() && self.points_2d.len() != n3 {
            let stored = self.points_2d.len();
            match policy {
                MismatchPolicy::KeepOld => {
                    warn!(
                        "Number of 3D points ({n3}) disagree with number of stored 2D points ({stored})! Keeping previous points."
                    );
                    return Ok(LoadOutcome::KeptPrevious);
                }
                MismatchPolicy::Discard => {
                    warn!(
                        "Number of 3D points ({n3}) disagree with number of stored 2D points ({stored})! The 2D points will be deleted."
                    );
                    self.points_2d.clear();
                    discarded_2d = true;
                }
                MismatchPolicy::Abort => {
                    return Err(Error::StoredPointsMismatch {
                        points_3d: n3,
                        points_2d: stored,
                    });
                }
            }
        }

        if parsed.has_3d {
            self.points_3d = parsed.points_3d;
        }
        if parsed.has_2d {
            self.points_2d = parsed.points_2d;
        }
        Ok(LoadOutcome::Loaded {
            points_3d: n3,
            points_2d: n2,
            discarded_2d,
        })
    }

    /// Replace the 2D points with positions of tracked markers.
    ///
    /// `points` must match the stored 3D points one to one. On failure the
    /// store is unchanged.
    pub fn fetch_from_tracked_2d(&mut self, points: Vec<Point2<f64>>) -> Result<()> {
        let n = points.len();
        if n < MIN_POINTS_PLANAR {
            return Err(Error::NotEnoughPoints { found: n });
        }
        if n != self.points_3d.len() {
            return Err(Error::CountMismatch {
                points_3d: self.points_3d.len(),
                points_2d: n,
            });
        }
        self.points_2d = points;
        Ok(())
    }

    /// Write the correspondences in the file format.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        self.check_writable()?;
        writeln!(writer, "{}", self.points_3d.len())?;
        for (p3, p2) in self.points_3d.iter().zip(&self.points_2d) {
            writeln!(writer, "{} {} {} {} {}", p3.x, p3.y, p3.z, p2.x, p2.y)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Save to the remembered file.
    pub fn save(&self) -> Result<()> {
        let path = self.file.as_deref().ok_or(Error::NoFile)?;
        self.write_file(path)
    }

    /// Save to `path` and remember it.
    pub fn save_to<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.write_file(path)?;
        self.file = Some(path.to_path_buf());
        Ok(())
    }

    fn write_file(&self, path: &Path) -> Result<()> {
        debug!("Saving calibration points to {}:\n{}", path.display(), self.listing());
        // Check before creating the file so a failed save does not truncate it.
        self.check_writable()?;
        let file = std::fs::File::create(path)?;
        self.write_to(std::io::BufWriter::new(file))
    }

    fn check_writable(&self) -> Result<()> {
        let n = self.points_3d.len();
        if n == 0 || n != self.points_2d.len() {
            return Err(Error::InvalidCorrespondences {
                points_3d: n,
                points_2d: self.points_2d.len(),
            });
        }
        Ok(())
    }

    /// Human readable listing, one `[i]: x y z px py` line per pair.
    ///
    /// Indices start at 1. Pairs beyond the shorter sequence are omitted.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (i, (p3, p2)) in self.points_3d.iter().zip(&self.points_2d).enumerate() {
            let _ = writeln!(
                out,
                "[{}]: {:.1} {:.1} {:.1} {:.3} {:.3}",
                i + 1,
                p3.x,
                p3.y,
                p3.z,
                p2.x,
                p2.y
            );
        }
        out
    }
}
