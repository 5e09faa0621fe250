// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::process::Command;

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{info, warn};

/// A successful plate solution: the image center and the image-blur metric
/// reported by the matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveResult {
    pub dec_rad: f64,
    pub ra_rad: f64,
    pub blur: Option<f64>,
}

/// Outcome of one solve attempt. Failures are ordinary outcomes here; the
/// caller (the finder, the orchestrator) decides whether to dither and
/// retry.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    Solved(SolveResult),
    TooFewStars(u32),
    NoMatch,
    Failed(String),
}

/// Invokes the external `find_stars` and `star_match` programs. Both are
/// opaque; only their stdout contract matters: `stars: N` from find_stars,
/// and `match: DEC_RAD RA_RAD blur: B` or `nomatch` from star_match.
pub struct PlateSolver {
    find_stars: PathBuf,
    star_match: PathBuf,
    // Fewer detections than this and star_match is not worth running.
    minimum_stars: u32,
}

impl PlateSolver {
    pub fn new() -> Self {
        let dir = std::env::var("NIGHTWATCH_SOLVER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/local/bin"));
        PlateSolver {
            find_stars: dir.join("find_stars"),
            star_match: dir.join("star_match"),
            minimum_stars: 3,
        }
    }

    pub fn with_commands(find_stars: PathBuf, star_match: PathBuf) -> Self {
        PlateSolver { find_stars, star_match, minimum_stars: 3 }
    }

    fn run(&self, program: &Path, args: &[&str]) -> Result<String, CanonicalError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| failed_precondition_error(
                format!("cannot invoke {:?}: {}", program, e).as_str()))?;
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("{:?}: {}", program.file_name().unwrap_or_default(), line);
        }
        if !output.status.success() {
            return Err(failed_precondition_error(
                format!("{:?} failed with {:?}", program, output.status).as_str()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs star detection over the image; returns the detection count.
    pub fn find_stars(&self, image: &Path, dark: Option<&Path>)
                      -> Result<u32, CanonicalError> {
        let image_str = image.to_string_lossy().into_owned();
        let mut args = vec!["-i", image_str.as_str()];
        let dark_str;
        if let Some(dark) = dark {
            dark_str = dark.to_string_lossy().into_owned();
            args.push("-d");
            args.push(dark_str.as_str());
        }
        let stdout = self.run(&self.find_stars, &args)?;
        for line in stdout.lines() {
            if let Some(rest) = line.strip_prefix("stars:") {
                return rest.trim().parse().map_err(
                    |_| failed_precondition_error(
                        format!("bad find_stars output: {}", line).as_str()));
            }
        }
        Err(failed_precondition_error("find_stars produced no star count"))
    }

    /// Detects stars and attempts a catalog match against `object_name`'s
    /// field. Solve failures come back as outcomes, not errors.
    pub fn solve(&self, image: &Path, object_name: &str, dark: Option<&Path>)
                 -> SolveOutcome {
        let star_count = match self.find_stars(image, dark) {
            Ok(count) => count,
            Err(e) => return SolveOutcome::Failed(e.message),
        };
        if star_count < self.minimum_stars {
            info!("Only {} stars seen in {:?}", star_count, image);
            return SolveOutcome::TooFewStars(star_count);
        }
        let image_str = image.to_string_lossy().into_owned();
        let stdout = match self.run(
            &self.star_match,
            &["-e", "-f", "-h", "-n", object_name, "-i", image_str.as_str()])
        {
            Ok(stdout) => stdout,
            Err(e) => return SolveOutcome::Failed(e.message),
        };
        for line in stdout.lines() {
            let line = line.trim();
            if line == "nomatch" {
                return SolveOutcome::NoMatch;
            }
            if let Some(rest) = line.strip_prefix("match:") {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() < 2 {
                    return SolveOutcome::Failed(
                        format!("bad star_match output: {}", line));
                }
                let dec_rad = match fields[0].parse() {
                    Ok(v) => v,
                    Err(_) => return SolveOutcome::Failed(
                        format!("bad star_match dec: {}", fields[0])),
                };
                let ra_rad = match fields[1].parse() {
                    Ok(v) => v,
                    Err(_) => return SolveOutcome::Failed(
                        format!("bad star_match ra: {}", fields[1])),
                };
                // "blur: B" trails the coordinates when the matcher could
                // measure it.
                let blur = fields.iter()
                    .position(|&f| f == "blur:")
                    .and_then(|i| fields.get(i + 1))
                    .and_then(|s| s.parse().ok());
                return SolveOutcome::Solved(SolveResult { dec_rad, ra_rad, blur });
            }
        }
        SolveOutcome::Failed("star_match produced no verdict".to_string())
    }
}

impl Default for PlateSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path
    }

    fn stub_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(
            format!("nightwatch_solver_{}_{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_successful_solve() {
        let dir = stub_dir("ok");
        let find = write_stub(&dir, "find_stars", "echo 'stars: 42'");
        let matcher = write_stub(&dir, "star_match",
                                 "echo 'match: 0.25 3.14 blur: 2.5'");
        let solver = PlateSolver::with_commands(find, matcher);
        match solver.solve(Path::new("/tmp/x.fits"), "ss-cyg", None) {
            SolveOutcome::Solved(result) => {
                assert_eq!(result.dec_rad, 0.25);
                assert_eq!(result.ra_rad, 3.14);
                assert_eq!(result.blur, Some(2.5));
            },
            other => panic!("unexpected outcome {:?}", other),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_too_few_stars() {
        let dir = stub_dir("few");
        let find = write_stub(&dir, "find_stars", "echo 'stars: 2'");
        let matcher = write_stub(&dir, "star_match", "echo nomatch");
        let solver = PlateSolver::with_commands(find, matcher);
        assert_eq!(solver.solve(Path::new("/tmp/x.fits"), "ss-cyg", None),
                   SolveOutcome::TooFewStars(2));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_no_match() {
        let dir = stub_dir("nomatch");
        let find = write_stub(&dir, "find_stars", "echo 'stars: 17'");
        let matcher = write_stub(&dir, "star_match", "echo nomatch");
        let solver = PlateSolver::with_commands(find, matcher);
        assert_eq!(solver.solve(Path::new("/tmp/x.fits"), "ss-cyg", None),
                   SolveOutcome::NoMatch);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_tool_failure() {
        let dir = stub_dir("fail");
        let find = write_stub(&dir, "find_stars", "exit 3");
        let matcher = write_stub(&dir, "star_match", "echo nomatch");
        let solver = PlateSolver::with_commands(find, matcher);
        match solver.solve(Path::new("/tmp/x.fits"), "ss-cyg", None) {
            SolveOutcome::Failed(_) => (),
            other => panic!("unexpected outcome {:?}", other),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

}  // mod tests.
