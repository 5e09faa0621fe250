// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use canonical_error::CanonicalError;
use log::{info, warn};
use nalgebra::{Matrix3, Vector3};

use crate::astro_util::unix_now;
use crate::focuser::{FocusMoveType, Focuser};

// Size of the intentional dither used to seed curvature in the fit.
const DITHER_TICKS: i64 = 10;
// Recent-sample window for the parabolic fit.
const MAX_SAMPLES: usize = 12;
// Need at least this many samples before trusting the fit.
const MIN_SAMPLES_FOR_FIT: usize = 4;

#[derive(Debug, Clone, Copy)]
struct FocusSample {
    position: i64,
    blur: f64,
    when_unix: i64,
}

/// Online estimator of the optimal focuser position from per-image blur
/// metrics: a parabolic fit over recent (position, blur) samples, nudging
/// the focuser one tick toward the fitted minimum between exposures.
pub struct RunningFocus {
    log: Option<File>,
    samples: Vec<FocusSample>,
    images_to_ignore: u32,
    ignore_remaining: u32,
    dither_sign: i64,
}

impl RunningFocus {
    pub fn new(log_path: Option<&Path>) -> Self {
        let log = log_path.and_then(|p| match File::create(p) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("Cannot create running focus log {:?}: {}", p, e);
                None
            }
        });
        RunningFocus {
            log,
            samples: Vec::new(),
            images_to_ignore: 0,
            ignore_remaining: 0,
            dither_sign: 1,
        }
    }

    /// Warm-up images to discard before the estimator starts listening.
    pub fn set_initial_images_to_ignore(&mut self, count: u32) {
        self.images_to_ignore = count;
        self.ignore_remaining = count;
    }

    /// Clears all samples; used after a meridian flip.
    pub fn restart(&mut self) {
        self.samples.clear();
        self.ignore_remaining = self.images_to_ignore;
        info!("Running focus restarted");
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Feeds one image's blur metric, taken at the given encoder position.
    pub fn add_image(&mut self, blur: f64, position: i64) {
        if self.ignore_remaining > 0 {
            self.ignore_remaining -= 1;
            info!("Running focus ignoring warm-up image ({} left)",
                  self.ignore_remaining);
            return;
        }
        let sample = FocusSample { position, blur, when_unix: unix_now() };
        if let Some(log) = self.log.as_mut() {
            let _ = writeln!(log, "{},{},{}", sample.when_unix,
                             sample.position, sample.blur);
            let _ = log.flush();
        }
        self.samples.push(sample);
        if self.samples.len() > MAX_SAMPLES {
            self.samples.remove(0);
        }
    }

    /// Moves the focuser a small step off its current position so the fit
    /// sees some curvature. Alternates direction on each call.
    pub fn perform_focus_dither(&mut self, focuser: &mut dyn Focuser)
                                -> Result<(), CanonicalError> {
        let step = self.dither_sign * DITHER_TICKS;
        self.dither_sign = -self.dither_sign;
        info!("Focus dither of {} ticks", step);
        focuser.move_to(step, FocusMoveType::Relative)?;
        Ok(())
    }

    /// Fits blur = a*(x - x0)^2 + c over recent samples. Returns the
    /// fitted optimum when the fit is convex and usable.
    fn fitted_optimum(&self) -> Option<f64> {
        if self.samples.len() < MIN_SAMPLES_FOR_FIT {
            return None;
        }
        // The fit needs position spread or the system is singular.
        let min_pos = self.samples.iter().map(|s| s.position).min().unwrap();
        let max_pos = self.samples.iter().map(|s| s.position).max().unwrap();
        if max_pos - min_pos < 2 {
            return None;
        }
        let mean: f64 = self.samples.iter().map(|s| s.position as f64).sum::<f64>()
            / self.samples.len() as f64;
        let mut sum_xx = Matrix3::<f64>::zeros();
        let mut sum_xy = Vector3::<f64>::zeros();
        for s in &self.samples {
            let x = s.position as f64 - mean;
            let v = Vector3::new(1.0, x, x * x);
            sum_xx += v * v.transpose();
            sum_xy += s.blur * v;
        }
        let sol = sum_xx.lu().solve(&sum_xy)?;
        let (c1, c2) = (sol[1], sol[2]);
        if c2 <= 0.0 {
            // Concave fit; no trustworthy minimum.
            return None;
        }
        Some(mean - c1 / (2.0 * c2))
    }

    /// Adjusts focus if the fit says so: at most one tick per call, toward
    /// the fitted optimum. Returns the commanded position, if any.
    pub fn update_focus(&mut self, focuser: &mut dyn Focuser)
                        -> Result<Option<i64>, CanonicalError> {
        let optimum = match self.fitted_optimum() {
            Some(o) => o,
            None => return Ok(None),
        };
        let current = focuser.position()?;
        let error = optimum - current as f64;
        if error.abs() < 1.0 {
            return Ok(None);
        }
        let step = if error > 0.0 { 1 } else { -1 };
        let new_position = focuser.move_to(step, FocusMoveType::Relative)?;
        info!("Running focus moved one tick to {} (optimum estimate {:.1})",
              new_position, optimum);
        Ok(Some(new_position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focuser::SimFocuser;

    fn blur_at(position: i64) -> f64 {
        let x = (position - 100) as f64;
        2.0 + 0.01 * x * x
    }

    #[test]
    fn test_warm_up_images_ignored() {
        let mut focus = RunningFocus::new(None);
        focus.set_initial_images_to_ignore(3);
        for i in 0..5 {
            focus.add_image(2.0 + i as f64, 100 + i);
        }
        assert_eq!(focus.sample_count(), 2);
    }

    #[test]
    fn test_no_move_without_spread() {
        let mut focus = RunningFocus::new(None);
        let mut focuser = SimFocuser::new(100);
        for _ in 0..6 {
            focus.add_image(2.0, 100);
        }
        assert_eq!(focus.update_focus(&mut focuser).unwrap(), None);
    }

    #[test]
    fn test_converges_toward_optimum() {
        let mut focus = RunningFocus::new(None);
        let mut focuser = SimFocuser::new(90);
        // Seed samples straddling the optimum at 100.
        for p in [88, 92, 96, 104, 108] {
            focus.add_image(blur_at(p), p);
        }
        let mut position = 90;
        for _ in 0..30 {
            if let Some(new_position) = focus.update_focus(&mut focuser).unwrap() {
                position = new_position;
                focus.add_image(blur_at(position), position);
            } else {
                break;
            }
        }
        assert!((position - 100).abs() <= 1, "position = {}", position);
    }

    #[test]
    fn test_dither_alternates() {
        let mut focus = RunningFocus::new(None);
        let mut focuser = SimFocuser::new(1000);
        focus.perform_focus_dither(&mut focuser).unwrap();
        assert_eq!(focuser.position().unwrap(), 1000 + DITHER_TICKS);
        focus.perform_focus_dither(&mut focuser).unwrap();
        assert_eq!(focuser.position().unwrap(), 1000);
    }

    #[test]
    fn test_restart_clears_samples() {
        let mut focus = RunningFocus::new(None);
        for p in [90, 95, 100, 105] {
            focus.add_image(blur_at(p), p);
        }
        assert_eq!(focus.sample_count(), 4);
        focus.restart();
        assert_eq!(focus.sample_count(), 0);
    }

}  // mod tests.
