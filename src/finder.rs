// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use log::{info, warn};

use crate::astro_util::angular_separation;
use crate::mount::Mount;
use crate::plate_solve::{SolveOutcome, SolveResult};

pub const FINDER_EXPOSURE_SECS: f64 = 20.0;

const ARCMIN_PER_RADIAN: f64 = 60.0 * 180.0 / std::f64::consts::PI;

#[derive(Debug, Clone, Copy)]
pub struct FinderParams {
    pub tolerance_rad: f64,
    // Consecutive solve failures before giving up.
    pub max_correlation_failures: u32,
    // Convergence moves before giving up.
    pub max_moves: u32,
    // Dither issued after a failed solve, arcmin (north, east).
    pub dither_arcmin: (f64, f64),
}

impl Default for FinderParams {
    fn default() -> Self {
        FinderParams {
            // 1 arcmin on each axis.
            tolerance_rad: (1.0 / 60.0) * std::f64::consts::PI / 180.0,
            max_correlation_failures: 3,
            max_moves: 4,
            dither_arcmin: (1.5, -1.5),  // 1.5' NW
        }
    }
}

/// Zeroes the telescope in on the target: expose, plate-solve, move by the
/// measured offset, repeat until within tolerance. The outer loop counts
/// convergence moves; the inner loop retries images that would not solve,
/// dithering between attempts so a slightly different star field is
/// imaged. Returns true on convergence.
///
/// `expose_and_solve` runs one finder exposure and plate-solves it; the
/// orchestrator supplies it so darks, filenames and filters stay its
/// business.
pub fn run_finder(object_name: &str,
                  target_dec_rad: f64, target_ra_rad: f64,
                  params: &FinderParams,
                  expose_and_solve: &mut dyn FnMut() -> SolveOutcome,
                  mount: &mut dyn Mount) -> Result<bool, CanonicalError> {
    let mut move_tries = 0;
    loop {
        let mut initial_tries = 0;
        let solution: SolveResult;
        loop {
            match expose_and_solve() {
                SolveOutcome::Solved(result) => {
                    info!("Finder match successful");
                    solution = result;
                    break;
                },
                SolveOutcome::TooFewStars(count) => {
                    warn!("Finder for {}: only {} stars seen", object_name, count);
                    initial_tries += 1;
                },
                SolveOutcome::NoMatch => {
                    warn!("Finder for {}: couldn't match", object_name);
                    initial_tries += 1;
                },
                SolveOutcome::Failed(message) => {
                    warn!("Finder for {}: solver failed: {}", object_name, message);
                    initial_tries += 1;
                },
            }
            if initial_tries >= params.max_correlation_failures {
                warn!("Finder giving up after {} failed correlations",
                      initial_tries);
                return Ok(false);
            }
            // Dither so the next attempt images a slightly different
            // field; maybe we get more stars.
            info!("Issuing dithering move command");
            mount.small_move(params.dither_arcmin.0, params.dither_arcmin.1)?;
        }

        let delta_dec = target_dec_rad - solution.dec_rad;
        let delta_ra = target_ra_rad - solution.ra_rad;
        let delta_ra_arcsec = delta_ra * target_dec_rad.cos();
        let separation = angular_separation(solution.ra_rad, solution.dec_rad,
                                            target_ra_rad, target_dec_rad);
        info!("Finder offset = {:.1} (arcmin N), {:.1} (arcmin E); {:.1}' total",
              delta_dec * ARCMIN_PER_RADIAN,
              delta_ra_arcsec * ARCMIN_PER_RADIAN,
              separation * ARCMIN_PER_RADIAN);

        if delta_dec.abs() < params.tolerance_rad
            && delta_ra_arcsec.abs() < params.tolerance_rad
        {
            return Ok(true);
        }
        move_tries += 1;
        if move_tries >= params.max_moves {
            warn!("Didn't converge on proper location");
            return Ok(false);
        }
        mount.small_move(delta_dec * ARCMIN_PER_RADIAN,
                         delta_ra_arcsec * ARCMIN_PER_RADIAN)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::SimMount;
    use crate::plate_solve::SolveResult;

    const ARCMIN: f64 = 1.0 / ARCMIN_PER_RADIAN;

    fn solved(dec: f64, ra: f64) -> SolveOutcome {
        SolveOutcome::Solved(SolveResult { dec_rad: dec, ra_rad: ra, blur: None })
    }

    #[test]
    fn test_converges_immediately_when_on_target() {
        let mut mount = SimMount::new();
        let mut outcomes = vec![solved(0.5, 1.0)];
        let mut step = move || outcomes.remove(0);
        let ok = run_finder("tgt", 0.5, 1.0, &FinderParams::default(),
                            &mut step, &mut mount).unwrap();
        assert!(ok);
        assert!(mount.moves.is_empty());
    }

    #[test]
    fn test_one_correction_move() {
        let mut mount = SimMount::new();
        // First solve is 5 arcmin south; second is on target.
        let mut outcomes = vec![solved(0.5 - 5.0 * ARCMIN, 1.0), solved(0.5, 1.0)];
        let mut step = move || outcomes.remove(0);
        let ok = run_finder("tgt", 0.5, 1.0, &FinderParams::default(),
                            &mut step, &mut mount).unwrap();
        assert!(ok);
        assert_eq!(mount.moves.len(), 1);
        // The correction is ~5 arcmin north.
        assert!((mount.moves[0].0 - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_dither_on_failed_solve() {
        let mut mount = SimMount::new();
        let mut outcomes = vec![SolveOutcome::TooFewStars(2),
                                SolveOutcome::NoMatch,
                                solved(0.5, 1.0)];
        let mut step = move || outcomes.remove(0);
        let ok = run_finder("tgt", 0.5, 1.0, &FinderParams::default(),
                            &mut step, &mut mount).unwrap();
        assert!(ok);
        // Two dithers of 1.5' NW were issued.
        assert_eq!(mount.moves.len(), 2);
        assert_eq!(mount.moves[0], (1.5, -1.5));
    }

    #[test]
    fn test_gives_up_after_correlation_failures() {
        let mut mount = SimMount::new();
        let mut step = || SolveOutcome::NoMatch;
        let ok = run_finder("tgt", 0.5, 1.0, &FinderParams::default(),
                            &mut step, &mut mount).unwrap();
        assert!(!ok);
        // max_correlation_failures - 1 dithers happened.
        assert_eq!(mount.moves.len(), 2);
    }

    #[test]
    fn test_gives_up_after_move_budget() {
        let mut mount = SimMount::new();
        // Always 10 arcmin off; never converges.
        let mut step = || solved(0.5 - 10.0 * ARCMIN, 1.0);
        let ok = run_finder("tgt", 0.5, 1.0, &FinderParams::default(),
                            &mut step, &mut mount).unwrap();
        assert!(!ok);
        assert_eq!(mount.moves.len(), 3);
    }

}  // mod tests.
