// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::abstract_camera::{AbstractCamera, CameraDescriptor, CaptureSettings,
                             ParamRange, RawFrame};
use crate::frame::SensorGeometry;

// Thermal model constants, loosely matched to a TEC-cooled CMOS sensor:
// full PWM pulls the chip ~44 degrees below ambient and the chip relaxes
// toward equilibrium with a time constant of a couple of minutes.
const FULL_POWER_DELTA_C: f64 = 44.7;
const THERMAL_TAU_SECS: f64 = 120.0;

/// Synthetic camera used by tests and by servers started with --sim. Renders
/// a flat field with shot noise and a sparse grid of bright "stars", and
/// models the cooler well enough for the regulation loop to converge.
pub struct SimCamera {
    descriptor: CameraDescriptor,
    settings: Option<CaptureSettings>,
    exposure_start: Option<Instant>,
    exposure_duration: Duration,
    ambient_c: f64,
    chip_temp_c: f64,
    pwm: u8,
    last_thermal_update: Instant,
    rng: StdRng,
}

/// Discovers the (single) simulated camera. Mirrors the hardware backends,
/// which fail when zero or multiple devices answer the scan.
pub fn discover() -> Result<SimCamera, CanonicalError> {
    info!("Found 1 camera(s)");
    Ok(SimCamera::new(SensorGeometry {
        max_width: 6280,
        max_height: 4240,
        overscan_width: 34,
        optic_black_edge: 4179,
    }))
}

impl SimCamera {
    pub fn new(geometry: SensorGeometry) -> Self {
        SimCamera {
            descriptor: CameraDescriptor {
                model: "SIM268M".to_string(),
                firmware_version: "2024-01-09".to_string(),
                geometry,
                num_read_modes: 4,
                gain_range: ParamRange { min: 0.0, max: 100.0, step: 1.0 },
                offset_range: ParamRange { min: 0.0, max: 255.0, step: 1.0 },
                usb_traffic_range: ParamRange { min: 0.0, max: 60.0, step: 1.0 },
                exposure_range_usec: ParamRange {
                    min: 20.0, max: 3600.0 * 1e6, step: 1.0 },
                has_amp_glow_control: true,
            },
            settings: None,
            exposure_start: None,
            exposure_duration: Duration::ZERO,
            ambient_c: 20.0,
            chip_temp_c: 20.0,
            pwm: 0,
            last_thermal_update: Instant::now(),
            rng: StdRng::seed_from_u64(20240109),
        }
    }

    /// Overrides the modeled ambient temperature (tests).
    pub fn set_ambient(&mut self, ambient_c: f64) {
        self.ambient_c = ambient_c;
        self.chip_temp_c = ambient_c;
    }

    fn update_thermal_model(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_thermal_update);
        self.last_thermal_update = now;
        self.apply_thermal(dt);
    }

    /// Advances the thermal model by `dt` (also lets tests fast-forward).
    pub fn apply_thermal(&mut self, dt: Duration) {
        let equilibrium =
            self.ambient_c - FULL_POWER_DELTA_C * (self.pwm as f64 / 255.0);
        let alpha = 1.0 - (-dt.as_secs_f64() / THERMAL_TAU_SECS).exp();
        self.chip_temp_c += (equilibrium - self.chip_temp_c) * alpha;
    }
}

impl AbstractCamera for SimCamera {
    fn describe(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), CanonicalError> {
        self.settings = Some(*settings);
        self.exposure_duration =
            Duration::from_secs_f64(settings.exposure_usec / 1e6);
        Ok(())
    }

    fn start_exposure(&mut self) -> Result<(), CanonicalError> {
        if self.settings.is_none() {
            return Err(failed_precondition_error("start_exposure before configure"));
        }
        self.exposure_start = Some(Instant::now());
        Ok(())
    }

    fn remaining_time(&mut self) -> Result<u32, CanonicalError> {
        let start = self.exposure_start.ok_or_else(
            || failed_precondition_error("no exposure in progress"))?;
        let elapsed = start.elapsed();
        if elapsed >= self.exposure_duration {
            return Ok(0);
        }
        // Hardware reports a coarse percent-like countdown; reproduce that
        // imprecision.
        let frac = 1.0 - elapsed.as_secs_f64()
            / self.exposure_duration.as_secs_f64().max(1e-6);
        Ok((frac * 100.0).ceil() as u32)
    }

    fn read_frame(&mut self) -> Result<RawFrame, CanonicalError> {
        let settings = self.settings.ok_or_else(
            || failed_precondition_error("read_frame before configure"))?;
        if let Some(start) = self.exposure_start {
            let remaining = self.exposure_duration
                .saturating_sub(start.elapsed());
            std::thread::sleep(remaining);
        }
        self.exposure_start = None;

        let width = settings.frame.width as usize;
        let height = settings.frame.height as usize;
        let base = 800u16 + settings.offset as u16;
        let mut pixels = vec![0u16; width * height];
        for p in pixels.iter_mut() {
            *p = base + self.rng.gen_range(0..64);
        }
        // Sparse grid of bright stars.
        let mut y = 37;
        while y + 1 < height {
            let mut x = 53;
            while x + 1 < width {
                pixels[y * width + x] = 40000;
                pixels[y * width + x + 1] = 18000;
                pixels[(y + 1) * width + x] = 18000;
                x += 257;
            }
            y += 181;
        }
        Ok(RawFrame {
            width,
            height,
            bits_per_pixel: 16,
            channels: 1,
            pixels,
        })
    }

    fn sensor_temperature(&mut self) -> Result<f64, CanonicalError> {
        self.update_thermal_model();
        Ok(self.chip_temp_c)
    }

    fn cooler_pwm(&mut self) -> Result<f64, CanonicalError> {
        Ok(self.pwm as f64)
    }

    fn set_cooler_pwm(&mut self, pwm: u8) -> Result<(), CanonicalError> {
        self.update_thermal_model();
        self.pwm = pwm;
        Ok(())
    }

    fn chamber_conditions(&mut self) -> Result<(f64, f64), CanonicalError> {
        Ok((12.5, 1.6))
    }

    fn ambient_temperature(&mut self) -> Option<f64> {
        Some(self.ambient_c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Subframe, resolve_subframe};

    fn capture_settings(cam: &SimCamera, exposure_usec: f64) -> CaptureSettings {
        let frame = resolve_subframe(&cam.describe().geometry,
                                     &Subframe { top: 63, bottom: 0,
                                                 left: 0, right: 63 });
        CaptureSettings {
            frame,
            exposure_usec,
            mode: 0,
            gain: 10,
            offset: 5,
            usb_traffic: 0.0,
        }
    }

    #[test]
    fn test_exposure_cycle() {
        let mut cam = discover().unwrap();
        let settings = capture_settings(&cam, 10_000.0);
        cam.configure(&settings).unwrap();
        cam.start_exposure().unwrap();
        let frame = cam.read_frame().unwrap();
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 64);
        assert_eq!(frame.bits_per_pixel, 16);
        assert_eq!(cam.remaining_time().unwrap_err().code,
                   canonical_error::CanonicalErrorCode::FailedPrecondition);
    }

    #[test]
    fn test_cooler_pulls_below_ambient() {
        let mut cam = SimCamera::new(discover().unwrap().describe().geometry);
        cam.set_ambient(20.0);
        cam.set_cooler_pwm(255).unwrap();
        cam.apply_thermal(Duration::from_secs(3600));
        let temp = cam.sensor_temperature().unwrap();
        assert!(temp < -20.0, "temp = {}", temp);
    }

}  // mod tests.
