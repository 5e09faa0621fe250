// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, invalid_argument_error, not_found_error};

/// A target looked up by name: J2000 position in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NamedTarget {
    pub dec_rad: f64,
    pub ra_rad: f64,
}

/// Simple one-record-per-line catalog: `name dec_rad ra_rad`, '#' comments.
pub struct Catalog {
    entries: Vec<(String, NamedTarget)>,
}

impl Catalog {
    pub fn parse(text: &str) -> Result<Catalog, CanonicalError> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(invalid_argument_error(
                    format!("catalog line {}: expected 3 fields", lineno + 1)
                        .as_str()));
            }
            let dec_rad: f64 = fields[1].parse().map_err(
                |_| invalid_argument_error(
                    format!("catalog line {}: bad dec", lineno + 1).as_str()))?;
            let ra_rad: f64 = fields[2].parse().map_err(
                |_| invalid_argument_error(
                    format!("catalog line {}: bad ra", lineno + 1).as_str()))?;
            entries.push((fields[0].to_lowercase(),
                          NamedTarget { dec_rad, ra_rad }));
        }
        Ok(Catalog { entries })
    }

    pub fn load(path: &Path) -> Result<Catalog, CanonicalError> {
        let text = std::fs::read_to_string(path).map_err(
            |e| invalid_argument_error(
                format!("cannot read catalog {:?}: {}", path, e).as_str()))?;
        Catalog::parse(&text)
    }

    /// NIGHTWATCH_CATALOG, or ~/.nightwatch/named_stars.
    pub fn default_path() -> PathBuf {
        std::env::var("NIGHTWATCH_CATALOG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                Path::new(&home).join(".nightwatch/named_stars")
            })
    }

    pub fn lookup(&self, name: &str) -> Result<NamedTarget, CanonicalError> {
        let lowered = name.to_lowercase();
        self.entries.iter()
            .find(|(n, _)| *n == lowered)
            .map(|(_, target)| *target)
            .ok_or_else(|| not_found_error(
                format!("don't know of object named {}", name).as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let catalog = Catalog::parse(
            "# variable stars\n\
             ss-cyg 0.7615 5.7295\n\
             rw-tri 0.4882 0.6875\n").unwrap();
        let target = catalog.lookup("SS-Cyg").unwrap();
        assert_eq!(target.dec_rad, 0.7615);
        assert_eq!(target.ra_rad, 5.7295);
        assert!(catalog.lookup("nope").is_err());
    }

    #[test]
    fn test_bad_lines_rejected() {
        assert!(Catalog::parse("ss-cyg 0.76").is_err());
        assert!(Catalog::parse("ss-cyg abc 1.0").is_err());
    }

}  // mod tests.
