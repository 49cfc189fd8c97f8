//! Readers for per-marker height files and person-to-marker files.
//!
//! Both are plain text files with two whitespace separated values per line.
//! Lines starting with `#` are comments and blank lines are skipped. The
//! first comment of a height file may declare the unit of the heights as
//! `z/cm` (default) or `z/m`; heights are always returned in cm.

use std::collections::HashMap;
use std::path::Path;

/// Errors reading a marker file.
///
/// The `Display` text is meant to be shown to the user as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MarkerFileError {
    /// The path is empty.
    #[error("No file provided.")]
    NoFile,
    /// The path does not end in `.txt`.
    #[error("Cannot load {0} maybe because of wrong file extension. Needs to be .txt.")]
    WrongExtension(String),
    /// The file could not be read.
    #[error("Could not open {0}")]
    CouldNotOpen(String),
    /// A marker id in a height file is not an integer.
    #[error("Marker needs to be an integer value, but is {0}")]
    MarkerNotInteger(String),
    /// A height is not a positive number.
    #[error("Height needs to be a positive numerical value, but is {0}")]
    InvalidHeight(String),
    /// A marker id occurs twice in a height file.
    #[error("Duplicate entry for markerID = {0}.")]
    DuplicateMarker(i32),
    /// A height file line does not have two values.
    #[error("Line should contain exactly 2 values: id height. But it contains {0} entries.")]
    HeightLineLength(usize),
    /// A person id is not an integer.
    #[error("PersonID needs to be an integer value, but is {0}")]
    PersonNotInteger(String),
    /// A marker id in a marker file is not an integer.
    #[error("MarkerID needs to be an integer value, but is {0}")]
    MarkerIdNotInteger(String),
    /// A person id occurs twice.
    #[error("Duplicate entry for personID = {0}.")]
    DuplicatePerson(i32),
    /// A marker file line does not have two values.
    #[error(
        "Line should contain exactly 2 values: personID markerID. But it contains {0} entries."
    )]
    MarkerLineLength(usize),
}

fn read_txt(path: &Path) -> Result<String, MarkerFileError> {
    if path.as_os_str().is_empty() {
        return Err(MarkerFileError::NoFile);
    }
    let name = path.display().to_string();
    if !name.ends_with(".txt") {
        return Err(MarkerFileError::WrongExtension(name));
    }
    std::fs::read_to_string(path).map_err(|_| MarkerFileError::CouldNotOpen(name))
}

/// Read marker heights (cm) keyed by marker id.
pub fn read_height_file<P: AsRef<Path>>(path: P) -> Result<HashMap<i32, f32>, MarkerFileError> {
    parse_heights(&read_txt(path.as_ref())?)
}

/// Parse the contents of a height file.
pub fn parse_heights(text: &str) -> Result<HashMap<i32, f32>, MarkerFileError> {
    let mut heights = HashMap::new();
    let mut read_header = false;
    let mut to_cm = 1.0_f32;

    for line in text.lines() {
        if line.starts_with('#') {
            if !read_header {
                if line.contains("z/cm") {
                    to_cm = 1.0;
                } else if line.contains("z/m") {
                    to_cm = 100.0;
                }
                read_header = true;
            }
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields[..] {
            [] => continue,
            [marker, height] => {
                let marker: i32 = marker
                    .parse()
                    .map_err(|_| MarkerFileError::MarkerNotInteger(marker.to_string()))?;
                let value = height
                    .parse::<f32>()
                    .ok()
                    .map(|h| h * to_cm)
                    .filter(|h| h.is_finite() && *h > 0.0)
                    .ok_or_else(|| MarkerFileError::InvalidHeight(height.to_string()))?;
                if heights.insert(marker, value).is_some() {
                    return Err(MarkerFileError::DuplicateMarker(marker));
                }
            }
            _ => return Err(MarkerFileError::HeightLineLength(fields.len())),
        }
    }
    Ok(heights)
}

/// Read marker ids keyed by person id.
pub fn read_marker_id_file<P: AsRef<Path>>(
    path: P,
) -> Result<HashMap<i32, i32>, MarkerFileError> {
    parse_marker_ids(&read_txt(path.as_ref())?)
}

/// Parse the contents of a marker id file.
pub fn parse_marker_ids(text: &str) -> Result<HashMap<i32, i32>, MarkerFileError> {
    let mut marker_ids = HashMap::new();

    for line in text.lines() {
        if line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields[..] {
            [] => continue,
            [person, marker] => {
                let person: i32 = person
                    .parse()
                    .map_err(|_| MarkerFileError::PersonNotInteger(person.to_string()))?;
                let marker: i32 = marker
                    .parse()
                    .map_err(|_| MarkerFileError::MarkerIdNotInteger(marker.to_string()))?;
                if marker_ids.insert(person, marker).is_some() {
                    return Err(MarkerFileError::DuplicatePerson(person));
                }
            }
            _ => return Err(MarkerFileError::MarkerLineLength(fields.len())),
        }
    }
    Ok(marker_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn height_error(body: &str) -> String {
        parse_heights(&format!("# id z/cm\n{body}"))
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn path_errors() {
        assert_eq!(read_height_file("").unwrap_err().to_string(), "No file provided.");
        assert_eq!(
            read_height_file("wrong.extension").unwrap_err().to_string(),
            "Cannot load wrong.extension maybe because of wrong file extension. Needs to be .txt."
        );
        assert_eq!(
            read_marker_id_file("not_exisiting_file.txt")
                .unwrap_err()
                .to_string(),
            "Could not open not_exisiting_file.txt"
        );
    }

    #[test]
    fn height_line_errors() {
        assert_eq!(height_error("987 184\n987 184\n"), "Duplicate entry for markerID = 987.");
        assert_eq!(
            height_error("234.234 184\n"),
            "Marker needs to be an integer value, but is 234.234"
        );
        assert_eq!(
            height_error("WRONG 184\n"),
            "Marker needs to be an integer value, but is WRONG"
        );
        assert_eq!(
            height_error("123 WRONG\n"),
            "Height needs to be a positive numerical value, but is WRONG"
        );
        assert_eq!(
            height_error("123 0\n"),
            "Height needs to be a positive numerical value, but is 0"
        );
        assert_eq!(
            height_error("987 184 123 WRONG\n"),
            "Line should contain exactly 2 values: id height. But it contains 4 entries."
        );
        assert_eq!(
            height_error("987\n"),
            "Line should contain exactly 2 values: id height. But it contains 1 entries."
        );
    }

    #[test]
    fn heights_in_metres() {
        let heights = parse_heights("# id z/m\n987 1.84\n\n988 1.79\n# z/cm is ignored\n").unwrap();
        assert_eq!(heights.len(), 2);
        assert_relative_eq!(heights[&987], 184.0, epsilon = 1e-3);
        assert_relative_eq!(heights[&988], 179.0, epsilon = 1e-3);
    }

    #[test]
    fn heights_default_to_cm() {
        let heights = parse_heights("987 184\n988 179.5\n").unwrap();
        assert_eq!(heights[&988], 179.5);
        assert!(parse_heights("").unwrap().is_empty());
    }

    #[test]
    fn marker_ids() {
        let ids = parse_marker_ids("# personID markerID\n1 987\n2 988\n").unwrap();
        assert_eq!(ids[&1], 987);
        assert_eq!(ids[&2], 988);

        let err = |body: &str| parse_marker_ids(body).unwrap_err().to_string();
        assert_eq!(err("1 987\n1 988\n"), "Duplicate entry for personID = 1.");
        assert_eq!(err("1.5 987\n"), "PersonID needs to be an integer value, but is 1.5");
        assert_eq!(err("1 abc\n"), "MarkerID needs to be an integer value, but is abc");
        assert_eq!(
            err("1 2 3\n"),
            "Line should contain exactly 2 values: personID markerID. But it contains 3 entries."
        );
    }
}
