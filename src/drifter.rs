// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use log::{info, warn};
use nalgebra::{Matrix3, Vector3};

use crate::astro_util::{jd_from_unix, unix_now};
use crate::mount::Mount;

// Interval between in-exposure corrections.
pub const UPDATE_TIME_SECS: f64 = 10.0;

// Arcseconds of sky motion per second of guide time. Assumes the mount's
// speed-correction option is off.
const GUIDE_RATE: f64 = 3.75;

// Corrections larger than this many seconds of guiding are implausible and
// are inhibited.
const MAX_GUIDE_SECONDS: f64 = 8.0;

// Per-sample weight growth; recent samples dominate the fit.
const WEIGHT_RATIO: f64 = 1.05;

const ARCSEC_PER_RADIAN: f64 = 180.0 * 3600.0 / std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Dec,
    Ra,
}

#[derive(Debug, Clone, Copy)]
struct AxisMeasurement {
    when_jd: f64,
    // Seconds relative to the newest sample; non-positive.
    delta_t: f64,
    // Arcsec offset from the anchor (first) measurement.
    measured_arcsec: f64,
    // Measured position plus all guidance issued before this sample.
    cum_arcsec: f64,
    weight: f64,
}

/// A correction the drifter wants issued: the sky amount and the
/// corresponding guide-pulse duration.
#[derive(Debug, Clone, Copy)]
pub struct GuidePulse {
    pub arcsec: f64,
    pub seconds: f64,
}

/// Models drift on one mount axis: a weighted quadratic fit over the
/// pointing history, used to predict where the target will be at the
/// midpoint of the next update window and pre-compensate.
pub struct AxisDrifter {
    axis: Axis,
    north_up: bool,
    // cos(dec) for the RA axis so both axes are true sky arcsec; 1 for Dec.
    scale: f64,
    anchor_position: f64,
    cum_guidance_arcsec: f64,
    // Fit origin is the newest sample.
    reference_time_jd: f64,
    intercept: f64,
    rate: f64,
    accel: f64,
    measurements: Vec<AxisMeasurement>,
}

impl AxisDrifter {
    fn new(axis: Axis) -> Self {
        AxisDrifter {
            axis,
            north_up: true,
            scale: 1.0,
            anchor_position: 0.0,
            cum_guidance_arcsec: 0.0,
            reference_time_jd: 0.0,
            intercept: 0.0,
            rate: 0.0,
            accel: 0.0,
            measurements: Vec::new(),
        }
    }

    fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }
    fn set_north_up(&mut self, north_up: bool) {
        self.north_up = north_up;
    }

    /// Current drift rate estimate, arcsec/second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn cum_guidance_arcsec(&self) -> f64 {
        self.cum_guidance_arcsec
    }

    pub fn weights(&self) -> Vec<f64> {
        self.measurements.iter().map(|m| m.weight).collect()
    }

    pub fn sample_times(&self) -> Vec<f64> {
        self.measurements.iter().map(|m| m.when_jd).collect()
    }

    /// Accepts a plate-solved position (radians on this axis) measured at
    /// `when_jd`. Times must be non-decreasing; a regressed time is bumped
    /// just past the newest sample.
    pub fn accept_center(&mut self, position_rad: f64, mut when_jd: f64) {
        if let Some(last) = self.measurements.last() {
            if when_jd < last.when_jd {
                warn!("Time arg regressed from {} to {}", last.when_jd, when_jd);
                when_jd = last.when_jd + 1e-6 / 86400.0;
            }
        } else {
            self.anchor_position = position_rad;
        }
        let measured_arcsec =
            ARCSEC_PER_RADIAN * (position_rad - self.anchor_position) * self.scale;
        self.measurements.push(AxisMeasurement {
            when_jd,
            delta_t: 0.0,
            measured_arcsec,
            cum_arcsec: measured_arcsec + self.cum_guidance_arcsec,
            weight: 1.0,
        });
        self.recalculate();
    }

    /// Recomputes the weighted quadratic fit p(dt) = a0 + a1*dt + a2*dt^2
    /// from the normal equations, dt in seconds relative to the newest
    /// sample.
    fn recalculate(&mut self) {
        let n = self.measurements.len();
        if n < 2 {
            self.intercept = 0.0;
            self.rate = 0.0;
            self.accel = 0.0;
            return;
        }
        self.reference_time_jd = self.measurements.last().unwrap().when_jd;
        let reference = self.reference_time_jd;
        let mut weight = 1.0;
        for m in self.measurements.iter_mut() {
            m.weight = weight;
            weight *= WEIGHT_RATIO;
            m.delta_t = (m.when_jd - reference) * 86400.0;
        }
        if n == 2 {
            // Two points only support a line.
            let m0 = &self.measurements[0];
            let m1 = &self.measurements[1];
            let dt = m1.delta_t - m0.delta_t;
            self.rate = if dt.abs() > 0.0 {
                (m1.cum_arcsec - m0.cum_arcsec) / dt
            } else {
                0.0
            };
            self.intercept = m1.cum_arcsec;
            self.accel = 0.0;
            return;
        }
        let mut sum_xx = Matrix3::<f64>::zeros();
        let mut sum_xy = Vector3::<f64>::zeros();
        for m in &self.measurements {
            let x = Vector3::new(1.0, m.delta_t, m.delta_t * m.delta_t);
            sum_xx += m.weight * x * x.transpose();
            sum_xy += m.weight * m.cum_arcsec * x;
        }
        match sum_xx.lu().solve(&sum_xy) {
            Some(sol) => {
                self.intercept = sol[0];
                self.rate = sol[1];
                self.accel = sol[2];
            },
            None => {
                warn!("Drift fit is singular; keeping previous estimates");
            }
        }
    }

    fn predict(&self, dt_secs: f64) -> f64 {
        self.intercept + self.rate * dt_secs + self.accel * dt_secs * dt_secs
    }

    /// Computes the correction for a prediction `dt_predict_secs` past the
    /// newest sample and commits it to the guidance total. Returns None
    /// when there is no usable fit or when the pulse guard trips.
    pub fn start_correction(&mut self, dt_predict_secs: f64) -> Option<GuidePulse> {
        if self.measurements.len() < 2 {
            return None;
        }
        let target_position = self.predict(dt_predict_secs);
        let guide_amount = target_position - self.cum_guidance_arcsec;
        let guide_sec = guide_amount / GUIDE_RATE;
        info!("{:?}: dt = {:.1}, intercept = {:.3}, rate = {:.5}, accel = {:.3e}, \
               guide_amount = {:.3}, guide_sec = {:.3}",
              self.axis, dt_predict_secs, self.intercept, self.rate, self.accel,
              guide_amount, guide_sec);
        if guide_sec.abs() >= MAX_GUIDE_SECONDS {
            info!("Unreasonable guide inhibited");
            return None;
        }
        self.cum_guidance_arcsec += guide_amount;
        Some(GuidePulse { arcsec: guide_amount, seconds: guide_sec })
    }

    /// Issues the correction through the mount for this axis.
    fn issue_correction(&mut self, mount: &mut dyn Mount, dt_predict_secs: f64) {
        let pulse = match self.start_correction(dt_predict_secs) {
            Some(p) => p,
            None => return,
        };
        let result = match self.axis {
            Axis::Dec => {
                let sign = if self.north_up { 1.0 } else { -1.0 };
                mount.pulse_guide(sign * pulse.seconds, 0.0)
            },
            Axis::Ra => {
                mount.pulse_guide(0.0, -pulse.seconds / self.scale)
            },
        };
        if let Err(e) = result {
            warn!("Guide pulse failed: {}", e.message);
        }
    }
}

/// Two-axis drift corrector. Call `accept_center` with each plate-solved
/// image center, `exposure_start` just before commanding an exposure, and
/// `exposure_guide` while it runs.
pub struct Drifter {
    dec: AxisDrifter,
    ra: AxisDrifter,
    exposure_start_unix: i64,
    exposure_duration: f64,
}

impl Drifter {
    pub fn new() -> Self {
        Drifter {
            dec: AxisDrifter::new(Axis::Dec),
            ra: AxisDrifter::new(Axis::Ra),
            exposure_start_unix: 0,
            exposure_duration: 0.0,
        }
    }

    pub fn set_north_up(&mut self, north_up: bool) {
        self.dec.set_north_up(north_up);
        self.ra.set_north_up(north_up);
    }

    pub fn accept_center(&mut self, dec_rad: f64, ra_rad: f64, when_jd: f64) {
        self.ra.set_scale(dec_rad.cos());
        self.dec.set_scale(1.0);
        self.dec.accept_center(dec_rad, when_jd);
        self.ra.accept_center(ra_rad, when_jd);
    }

    pub fn dec_axis(&self) -> &AxisDrifter {
        &self.dec
    }
    pub fn ra_axis(&self) -> &AxisDrifter {
        &self.ra
    }

    fn dt_predict(&self, axis: &AxisDrifter) -> f64 {
        let now_jd = jd_from_unix(unix_now());
        UPDATE_TIME_SECS / 2.0 - (axis.reference_time_jd - now_jd) * 86400.0
    }

    /// Issues the pre-exposure correction on both axes and records the
    /// expected end time. Returns quickly.
    pub fn exposure_start(&mut self, duration_secs: f64, mount: &mut dyn Mount) {
        let dt = self.dt_predict(&self.dec);
        self.dec.issue_correction(mount, dt);
        let dt = self.dt_predict(&self.ra);
        self.ra.issue_correction(mount, dt);
        self.exposure_start_unix = unix_now();
        self.exposure_duration = duration_secs;
    }

    /// Blocks for the remainder of the exposure, issuing one correction
    /// per update interval.
    pub fn exposure_guide(&mut self, mount: &mut dyn Mount) {
        let end_time = self.exposure_start_unix + self.exposure_duration as i64;
        loop {
            let now = unix_now();
            let remaining = end_time - now;
            if remaining <= 0 {
                break;
            }
            let sleep_secs = (UPDATE_TIME_SECS as i64).min(remaining);
            std::thread::sleep(Duration::from_secs(sleep_secs as u64));
            if unix_now() < end_time {
                let dt = self.dt_predict(&self.dec);
                self.dec.issue_correction(mount, dt);
                let dt = self.dt_predict(&self.ra);
                self.ra.issue_correction(mount, dt);
            }
        }
    }
}

impl Default for Drifter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    const ARCSEC: f64 = 1.0 / ARCSEC_PER_RADIAN;

    fn jd(t_secs: f64) -> f64 {
        2460000.0 + t_secs / 86400.0
    }

    #[test]
    fn test_rate_recovery() {
        // Cumulative positions 0, 1, 2 arcsec at t = 0, 10, 20 s.
        let mut axis = AxisDrifter::new(Axis::Ra);
        axis.set_scale(1.0);  // dec = 0
        axis.accept_center(0.0, jd(0.0));
        axis.accept_center(1.0 * ARCSEC, jd(10.0));
        axis.accept_center(2.0 * ARCSEC, jd(20.0));
        assert_abs_diff_eq!(axis.rate(), 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_pulse_for_predicted_midpoint() {
        let mut axis = AxisDrifter::new(Axis::Ra);
        axis.set_scale(1.0);
        axis.accept_center(0.0, jd(0.0));
        axis.accept_center(1.0 * ARCSEC, jd(10.0));
        axis.accept_center(2.0 * ARCSEC, jd(20.0));
        // First correction absorbs the accumulated 2 arcsec (p(0) = 2).
        let p0 = axis.start_correction(0.0).unwrap();
        assert_abs_diff_eq!(p0.arcsec, 2.0, epsilon = 1e-6);
        // The next correction, predicted half an update window ahead, is
        // just the incremental drift: a1 * (U/2) / GUIDE_RATE.
        let p1 = axis.start_correction(UPDATE_TIME_SECS / 2.0).unwrap();
        assert_abs_diff_eq!(p1.seconds, 0.1 * 5.0 / 3.75, epsilon = 1e-6);
    }

    #[test]
    fn test_weights_grow_geometrically() {
        let mut axis = AxisDrifter::new(Axis::Dec);
        for i in 0..6 {
            axis.accept_center((i as f64) * ARCSEC, jd(i as f64 * 10.0));
        }
        let weights = axis.weights();
        assert_eq!(weights.len(), 6);
        for pair in weights.windows(2) {
            assert_abs_diff_eq!(pair[1] / pair[0], 1.05, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_history_time_ordered() {
        let mut axis = AxisDrifter::new(Axis::Dec);
        axis.accept_center(0.0, jd(100.0));
        axis.accept_center(1.0 * ARCSEC, jd(50.0));  // regressed
        axis.accept_center(2.0 * ARCSEC, jd(200.0));
        let times = axis.sample_times();
        for pair in times.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_unreasonable_guide_inhibited() {
        let mut axis = AxisDrifter::new(Axis::Ra);
        axis.set_scale(1.0);
        // 40 arcsec of accumulated drift needs > 8 s of guiding.
        axis.accept_center(0.0, jd(0.0));
        axis.accept_center(40.0 * ARCSEC, jd(10.0));
        assert!(axis.start_correction(0.0).is_none());
        assert_eq!(axis.cum_guidance_arcsec(), 0.0);
    }

    #[test]
    fn test_dec_sign_flips_when_north_down() {
        let mut drifter = Drifter::new();
        drifter.set_north_up(false);
        drifter.accept_center(0.0, 0.0, jd(0.0));
        drifter.accept_center(2.0 * ARCSEC, 0.0, jd(10.0));
        let mut mount = crate::mount::SimMount::new();
        drifter.dec.issue_correction(&mut mount, 0.0);
        // Positive predicted dec motion becomes a negative (south) pulse.
        assert_eq!(mount.pulses.len(), 1);
        assert!(mount.pulses[0].0 < 0.0);
        assert_eq!(mount.pulses[0].1, 0.0);
    }

    #[test]
    fn test_ra_pulse_scaled_by_cos_dec() {
        let mut drifter = Drifter::new();
        let dec = (60.0f64).to_radians();  // cos(dec) = 0.5
        drifter.accept_center(dec, 0.0, jd(0.0));
        drifter.accept_center(dec, 4.0 * ARCSEC, jd(10.0));
        // 4 arcsec of raw RA motion is 2 arcsec of sky motion.
        let pulse = drifter.ra.start_correction(0.0).unwrap();
        assert_abs_diff_eq!(pulse.arcsec, 2.0, epsilon = 1e-6);
    }

}  // mod tests.
