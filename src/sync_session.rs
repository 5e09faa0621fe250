// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::Write;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use log::info;

use crate::mount::{Mount, format_dec, format_ra};

/// One pointing-model measurement: where the mount said it was aimed
/// versus where plate solving proved it was aimed, at a given sidereal
/// moment and pier side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    pub jd: f64,
    pub raw_dec_rad: f64,
    pub raw_ha_rad: f64,
    pub true_dec_rad: f64,
    pub true_ha_rad: f64,
    pub west_of_pier: bool,
}

/// Sync points accumulated over one observing session, persisted as one
/// text record per line so a crashed session can be replayed into the
/// mount's pointing-model facility.
pub struct SyncSession {
    path: PathBuf,
    points: Vec<SyncPoint>,
}

impl SyncSession {
    /// Opens (or creates) the session file, loading any existing points.
    pub fn open(path: &Path) -> Result<SyncSession, CanonicalError> {
        let mut points = Vec::new();
        if let Ok(text) = std::fs::read_to_string(path) {
            for (lineno, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                points.push(Self::parse_line(line).map_err(|e| {
                    invalid_argument_error(
                        format!("{} line {}: {}", path.display(),
                                lineno + 1, e.message).as_str())
                })?);
            }
        }
        Ok(SyncSession { path: path.to_path_buf(), points })
    }

    fn parse_line(line: &str) -> Result<SyncPoint, CanonicalError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(invalid_argument_error("expected 6 fields"));
        }
        let number = |s: &str| -> Result<f64, CanonicalError> {
            s.parse().map_err(|_| invalid_argument_error(
                format!("bad number: {}", s).as_str()))
        };
        Ok(SyncPoint {
            jd: number(fields[0])?,
            raw_dec_rad: number(fields[1])?,
            raw_ha_rad: number(fields[2])?,
            true_dec_rad: number(fields[3])?,
            true_ha_rad: number(fields[4])?,
            west_of_pier: fields[5] == "W",
        })
    }

    /// Appends a point to memory and to the session file.
    pub fn add(&mut self, point: SyncPoint) -> Result<(), CanonicalError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| failed_precondition_error(
                format!("cannot open {}: {}", self.path.display(), e).as_str()))?;
        writeln!(file, "{:.8} {:.9} {:.9} {:.9} {:.9} {}",
                 point.jd, point.raw_dec_rad, point.raw_ha_rad,
                 point.true_dec_rad, point.true_ha_rad,
                 if point.west_of_pier { "W" } else { "E" })
            .map_err(|e| failed_precondition_error(
                format!("cannot append to {}: {}", self.path.display(), e)
                    .as_str()))?;
        self.points.push(point);
        Ok(())
    }

    pub fn points(&self) -> &[SyncPoint] {
        &self.points
    }

    /// Formats one point for the mount's alignment-point-add operation:
    /// "MRA,MDEC,side,PRA,PDEC,SLST".
    pub fn format_alignment_point(point: &SyncPoint, lst_rad: f64) -> String {
        let raw_ra = lst_rad - point.raw_ha_rad;
        let true_ra = lst_rad - point.true_ha_rad;
        format!("{},{},{},{},{},{}",
                format_ra(raw_ra),
                format_dec(point.raw_dec_rad),
                if point.west_of_pier { "W" } else { "E" },
                format_ra(true_ra),
                format_dec(point.true_dec_rad),
                format_ra(lst_rad))
    }

    /// Pushes every stored point into the mount's pointing model.
    pub fn push_to_mount(&self, mount: &mut dyn Mount)
                         -> Result<usize, CanonicalError> {
        let lst = mount.local_sidereal_time()?;
        for point in &self.points {
            mount.add_alignment_point(&Self::format_alignment_point(point, lst))?;
        }
        info!("Loaded {} alignment points into mount", self.points.len());
        Ok(self.points.len())
    }
}

// mod tests.
