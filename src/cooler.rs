// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::abstract_camera::AbstractCamera;

pub const COOLER_CYCLE_SECS: u64 = 2;

const GAIN_P: f64 = 15.0;
const GAIN_I: f64 = 1.0;
const GAIN_D: f64 = 400.0;
const MAX_ALLOWED_SLOPE: f64 = 2.0 / 60.0;  // deg C per second
const MAX_SINGLESTEP_SETPOINT_CHANGE: f64 = 4.0;  // deg C
const SECONDS_PER_RAMP_STEP: i64 = 16;
const SLOPE_NUMBER_POINTS: usize = 8;
const DEFAULT_AMBIENT_OFFSET: f64 = 4.0;  // deg C
const DEFAULT_POWER_RATIO: f64 = 44.7 / 255.0;
const FIT_MIN_POINTS: usize = 20;

/// Commands flowing to the cooler worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoolerModeRequest {
    Off,
    Manual,
    Setpoint,
    Terminate,
}

/// Status flowing back from the cooler worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoolerMode {
    Off,
    Manual,
    Regulating,
    Error,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct CoolerCommand {
    pub mode: CoolerModeRequest,
    pub setpoint_c: f64,
    pub pwm: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct CoolerStatus {
    pub chip_temp_c: f64,
    pub pwm: i32,
    pub ambient_c: Option<f64>,
    pub humidity: f64,
    pub pressure: f64,
    pub mode: CoolerMode,
}

impl Default for CoolerStatus {
    fn default() -> Self {
        CoolerStatus {
            chip_temp_c: 0.0,
            pwm: -99,
            ambient_c: None,
            humidity: 0.0,
            pressure: 0.0,
            mode: CoolerMode::Off,
        }
    }
}

/// Recursive two-parameter least squares estimating (ambient_offset,
/// power_ratio) from the linear relation ambient - ccd = offset +
/// ratio * power. Only sums are retained, so the cost per point is O(1).
#[derive(Debug, Default)]
pub struct CoolerFit {
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    points: usize,
}

impl CoolerFit {
    pub fn accept_point(&mut self, power: f64, ccd_temp: f64, ambient: f64) {
        let x = power;
        let y = ambient - ccd_temp;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_yy += y * y;
        self.sum_xy += x * y;
        self.points += 1;
    }

    pub fn count(&self) -> usize {
        self.points
    }

    /// (ambient_offset, power_ratio), available once enough points are in.
    pub fn params(&self) -> Option<(f64, f64)> {
        if self.points <= FIT_MIN_POINTS {
            return None;
        }
        let n = self.points as f64;
        let den = n * self.sum_xx - self.sum_x * self.sum_x;
        if den.abs() < 1e-12 {
            return None;
        }
        let slope = (n * self.sum_xy - self.sum_x * self.sum_y) / den;
        let offset = (self.sum_y - slope * self.sum_x) / n;
        Some((offset, slope))
    }
}

#[derive(Debug, Clone, Copy)]
struct RampPoint {
    at_unix: i64,
    setpoint: f64,
}

/// One reading handed to the regulator each cycle.
#[derive(Debug, Clone, Copy)]
pub struct CoolerReading {
    pub now_unix: i64,
    pub chip_temp_c: f64,
    pub current_pwm: f64,
    pub ambient_c: Option<f64>,
}

/// The regulation state machine, separated from the worker thread so its
/// behavior is directly testable.
pub struct Regulator {
    working_setpoint: f64,
    ramp: VecDeque<RampPoint>,
    temp_history: VecDeque<f64>,
    integrated_error: f64,
    last_time_unix: Option<i64>,
    // Estimated online; logged but not fed back into the live gains.
    ambient_offset: f64,
    power_ratio: f64,
    pub fit: CoolerFit,
}

impl Regulator {
    pub fn new() -> Self {
        Regulator {
            working_setpoint: 0.0,
            ramp: VecDeque::new(),
            temp_history: VecDeque::new(),
            integrated_error: 0.0,
            last_time_unix: None,
            ambient_offset: DEFAULT_AMBIENT_OFFSET,
            power_ratio: DEFAULT_POWER_RATIO,
            fit: CoolerFit::default(),
        }
    }

    /// Clears PID and ramp state; called whenever the commanded mode
    /// changes.
    pub fn reset(&mut self) {
        self.integrated_error = 0.0;
        self.ramp.clear();
        self.temp_history.clear();
        self.last_time_unix = None;
    }

    pub fn integrated_error(&self) -> f64 {
        self.integrated_error
    }

    pub fn in_ramp(&self) -> bool {
        !self.ramp.is_empty()
    }

    pub fn ramp_len(&self) -> usize {
        self.ramp.len()
    }

    pub fn working_setpoint(&self) -> f64 {
        self.working_setpoint
    }

    fn build_ramp(&mut self, reading: &CoolerReading, commanded_setpoint: f64) {
        let current_err = (commanded_setpoint - reading.chip_temp_c).abs();
        let direction =
            if commanded_setpoint < reading.chip_temp_c { -1.0 } else { 1.0 };
        let total_secs = current_err / MAX_ALLOWED_SLOPE;
        let ramp_points = (total_secs / SECONDS_PER_RAMP_STEP as f64) as i64;
        let temp_increment = current_err / (ramp_points + 1) as f64;
        info!("New cooler ramp with {} points", ramp_points);
        for i in 0..ramp_points {
            self.ramp.push_back(RampPoint {
                at_unix: reading.now_unix + i * SECONDS_PER_RAMP_STEP,
                setpoint: reading.chip_temp_c
                    + (i + 1) as f64 * direction * temp_increment,
            });
        }
    }

    /// Runs one regulation cycle and returns the PWM command to write.
    pub fn cycle(&mut self, reading: &CoolerReading, commanded_setpoint: f64) -> u8 {
        let in_ramp_at_entry = self.in_ramp();
        let current_err = (commanded_setpoint - reading.chip_temp_c).abs();
        if !in_ramp_at_entry && current_err > MAX_SINGLESTEP_SETPOINT_CHANGE {
            self.build_ramp(reading, commanded_setpoint);
        }
        if let Some(front) = self.ramp.front() {
            if reading.now_unix >= front.at_unix {
                self.working_setpoint = front.setpoint;
                self.ramp.pop_front();
            }
        } else {
            self.working_setpoint = commanded_setpoint;
        }

        let ambient = reading.ambient_c.unwrap_or(reading.chip_temp_c);
        let target_power = (ambient - self.ambient_offset - self.working_setpoint)
            / self.power_ratio;

        self.temp_history.push_back(reading.chip_temp_c);
        if self.temp_history.len() > SLOPE_NUMBER_POINTS {
            self.temp_history.pop_front();
        }
        let n = self.temp_history.len();
        let slope = if n > 1 {
            (self.temp_history.back().unwrap() - self.temp_history.front().unwrap())
                / ((n - 1) as f64 * COOLER_CYCLE_SECS as f64)
        } else {
            0.0
        };

        let temp_err = self.working_setpoint - reading.chip_temp_c;
        if let Some(last) = self.last_time_unix {
            let delta_t = (reading.now_unix - last) as f64;
            self.integrated_error += delta_t * temp_err;
        }
        self.last_time_unix = Some(reading.now_unix);

        let mut command = target_power
            - (temp_err * GAIN_P
               + self.integrated_error * GAIN_I
               + slope * GAIN_D);
        if command > 255.0 {
            command = 255.0;
            self.integrated_error = 0.0;
        }
        if command < 0.0 {
            command = 0.0;
            self.integrated_error = 0.0;
        }

        if !self.in_ramp() {
            if let Some(ambient) = reading.ambient_c {
                self.fit.accept_point(reading.current_pwm,
                                      reading.chip_temp_c, ambient);
            }
        }
        if let Some((offset, ratio)) = self.fit.params() {
            info!("Cooler fit: amb_offset = {:.1}, power_ratio = {:.5} [{}]",
                  offset, ratio, self.fit.count());
        }

        command as u8
    }
}

/// Dedicated worker that regulates sensor temperature. Commands are posted
/// into the shared command cell; status is observed through the status
/// cell. Destroying the server transitions the commanded mode to Terminate
/// and joins the worker.
pub struct Cooler {
    command: Arc<Mutex<CoolerCommand>>,
    status: Arc<Mutex<CoolerStatus>>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for Cooler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Cooler {
    pub fn start(camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>>,
                 log_path: Option<PathBuf>) -> Self {
        let command = Arc::new(Mutex::new(CoolerCommand {
            mode: CoolerModeRequest::Manual,
            setpoint_c: 0.0,
            pwm: 0,
        }));
        let status = Arc::new(Mutex::new(CoolerStatus::default()));
        let command2 = command.clone();
        let status2 = status.clone();
        let worker_thread = Some(thread::spawn(move || {
            worker(camera, command2, status2, log_path);
        }));
        Cooler { command, status, worker_thread }
    }

    pub fn set_off(&self) {
        let mut cmd = self.command.lock().unwrap();
        cmd.mode = CoolerModeRequest::Off;
        cmd.pwm = 0;
    }

    pub fn set_manual(&self, pwm: u8) {
        let mut cmd = self.command.lock().unwrap();
        cmd.mode = CoolerModeRequest::Manual;
        cmd.pwm = pwm;
    }

    pub fn set_setpoint(&self, setpoint_c: f64) {
        let mut cmd = self.command.lock().unwrap();
        cmd.mode = CoolerModeRequest::Setpoint;
        cmd.setpoint_c = setpoint_c;
    }

    pub fn command(&self) -> CoolerCommand {
        *self.command.lock().unwrap()
    }

    pub fn status(&self) -> CoolerStatus {
        *self.status.lock().unwrap()
    }

    pub fn stop(&mut self) {
        self.command.lock().unwrap().mode = CoolerModeRequest::Terminate;
        if let Some(worker) = self.worker_thread.take() {
            let _ = worker.join();
        }
    }
}

fn worker(camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>>,
          command: Arc<Mutex<CoolerCommand>>,
          status: Arc<Mutex<CoolerStatus>>,
          log_path: Option<PathBuf>) {
    let mut cooler_log = log_path.and_then(|p| match File::create(&p) {
        Ok(f) => Some(f),
        Err(e) => {
            warn!("Cannot create cooler log {:?}: {}", p, e);
            None
        }
    });
    let mut regulator = Regulator::new();
    let mut prior_mode = CoolerModeRequest::Off;
    info!("Cooler worker started");

    loop {
        let cmd = *command.lock().unwrap();
        if cmd.mode == CoolerModeRequest::Terminate {
            break;
        }

        // Sample the hardware, holding the camera mutex only briefly.
        let reading = {
            let mut cam = camera.lock().unwrap();
            let chip = cam.sensor_temperature();
            let pwm = cam.cooler_pwm();
            let chamber = cam.chamber_conditions();
            let ambient = cam.ambient_temperature();
            match (chip, pwm) {
                (Ok(chip_temp_c), Ok(current_pwm)) => {
                    let mut st = status.lock().unwrap();
                    st.chip_temp_c = chip_temp_c;
                    st.pwm = (current_pwm + 0.5) as i32;
                    st.ambient_c = ambient;
                    if let Ok((humidity, pressure)) = chamber {
                        st.humidity = humidity;
                        st.pressure = pressure;
                    }
                    Some(CoolerReading {
                        now_unix: chrono::Utc::now().timestamp(),
                        chip_temp_c,
                        current_pwm,
                        ambient_c: ambient,
                    })
                },
                _ => None,
            }
        };

        let reading = match reading {
            Some(r) => r,
            None => {
                // Keep polling so that recovery can be observed.
                error!("Cooler status read failed");
                status.lock().unwrap().mode = CoolerMode::Error;
                thread::sleep(Duration::from_secs(COOLER_CYCLE_SECS));
                continue;
            }
        };

        if cmd.mode != prior_mode {
            regulator.reset();
        }
        prior_mode = cmd.mode;

        match cmd.mode {
            CoolerModeRequest::Off => {
                let result = camera.lock().unwrap().set_cooler_pwm(0);
                status.lock().unwrap().mode = match result {
                    Ok(()) => CoolerMode::Off,
                    Err(e) => {
                        error!("Cooler off command failed: {}", e.message);
                        CoolerMode::Error
                    }
                };
            },
            CoolerModeRequest::Manual => {
                let result = camera.lock().unwrap().set_cooler_pwm(cmd.pwm);
                status.lock().unwrap().mode = match result {
                    Ok(()) => CoolerMode::Manual,
                    Err(e) => {
                        error!("Cooler manual command failed: {}", e.message);
                        CoolerMode::Error
                    }
                };
            },
            CoolerModeRequest::Setpoint => {
                let pwm = regulator.cycle(&reading, cmd.setpoint_c);
                let result = camera.lock().unwrap().set_cooler_pwm(pwm);
                status.lock().unwrap().mode = match result {
                    Ok(()) => CoolerMode::Regulating,
                    Err(e) => {
                        error!("Cooler regulation command failed: {}", e.message);
                        CoolerMode::Error
                    }
                };
            },
            CoolerModeRequest::Terminate => unreachable!(),
        }

        if let Some(log) = cooler_log.as_mut() {
            let line = format!("{},{:.3},{},{:.1}\n",
                               reading.now_unix,
                               reading.chip_temp_c,
                               reading.current_pwm as i32,
                               reading.ambient_c.unwrap_or(-99.9));
            let _ = log.write_all(line.as_bytes());
            let _ = log.flush();
        }

        thread::sleep(Duration::from_secs(COOLER_CYCLE_SECS));
    }
    status.lock().unwrap().mode = CoolerMode::Terminated;
    info!("Cooler worker terminated");
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    fn reading(now: i64, chip: f64, pwm: f64, ambient: f64) -> CoolerReading {
        CoolerReading {
            now_unix: now,
            chip_temp_c: chip,
            current_pwm: pwm,
            ambient_c: Some(ambient),
        }
    }

    #[test]
    fn test_ramp_shape() {
        // Chip at +20, commanded to -10: a 30 degree change rate-limited to
        // 2 deg/min takes 15 minutes, in 16-second steps.
        let mut reg = Regulator::new();
        reg.cycle(&reading(1000, 20.0, 0.0, 20.0), -10.0);
        // One point is consumed immediately (its time is the present).
        assert_eq!(reg.ramp_len(), 55);
        let total_points = reg.ramp_len() + 1;
        assert_eq!(total_points, (30.0 / MAX_ALLOWED_SLOPE / 16.0) as usize);
        // The first working setpoint steps down from the chip temperature.
        assert_abs_diff_eq!(reg.working_setpoint(), 20.0 - 30.0 / 57.0,
                            epsilon = 0.01);
        // Rate across the whole ramp is 2 deg/min.
        let span_secs = (total_points * 16) as f64;
        assert_abs_diff_eq!(30.0 / (span_secs / 60.0), 2.0, epsilon = 0.1);
    }

    #[test]
    fn test_ramp_points_consumed_by_wall_clock() {
        let mut reg = Regulator::new();
        reg.cycle(&reading(1000, 20.0, 0.0, 20.0), -10.0);
        let after_first = reg.ramp_len();
        // Two seconds later: next point (at t+16) has not arrived.
        reg.cycle(&reading(1002, 19.8, 50.0, 20.0), -10.0);
        assert_eq!(reg.ramp_len(), after_first);
        // At t+16 the next point is taken.
        reg.cycle(&reading(1016, 19.5, 60.0, 20.0), -10.0);
        assert_eq!(reg.ramp_len(), after_first - 1);
    }

    #[test]
    fn test_integrator_zero_when_clamped() {
        // Warm chip, hot ambient: the command saturates at 255 and the
        // integrator must be reset on every such cycle.
        let mut reg = Regulator::new();
        for i in 0..5 {
            let cmd = reg.cycle(&reading(1000 + i * 2, -10.0, 200.0, 30.0), -13.9);
            assert_eq!(cmd, 255);
            assert_eq!(reg.integrated_error(), 0.0);
        }
        // Chip far above a setpoint that is still within the ramp-free
        // band, ambient low: the command clamps at 0.
        let mut reg = Regulator::new();
        for i in 0..5 {
            let cmd = reg.cycle(&reading(1000 + i * 2, 40.0, 10.0, 20.0), 36.1);
            assert_eq!(cmd, 0);
            assert_eq!(reg.integrated_error(), 0.0);
        }
        // Small error near setpoint leaves the command unclamped and the
        // integrator accumulating.
        let mut reg = Regulator::new();
        reg.cycle(&reading(1000, 15.2, 80.0, 20.0), 15.0);
        let cmd = reg.cycle(&reading(1002, 15.2, 80.0, 20.0), 15.0);
        assert!(cmd > 0 && cmd < 255, "cmd = {}", cmd);
        assert!(reg.integrated_error() != 0.0);
    }

    #[test]
    fn test_integrator_skips_first_cycle() {
        let mut reg = Regulator::new();
        reg.cycle(&reading(1000, 15.5, 80.0, 20.0), 15.0);
        assert_eq!(reg.integrated_error(), 0.0);
    }

    #[test]
    fn test_fit_recovers_linear_relation() {
        let mut fit = CoolerFit::default();
        // ambient - ccd = 4.0 + (44.7/255) * power
        for i in 0..30 {
            let power = (i * 8) as f64;
            let ambient = 20.0;
            let ccd = ambient - (4.0 + DEFAULT_POWER_RATIO * power);
            fit.accept_point(power, ccd, ambient);
        }
        let (offset, ratio) = fit.params().unwrap();
        assert_abs_diff_eq!(offset, 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ratio, DEFAULT_POWER_RATIO, epsilon = 1e-9);
    }

    #[test]
    fn test_no_fit_points_while_ramping() {
        let mut reg = Regulator::new();
        reg.cycle(&reading(1000, 20.0, 0.0, 20.0), -10.0);
        assert!(reg.in_ramp());
        reg.cycle(&reading(1002, 19.9, 100.0, 20.0), -10.0);
        assert_eq!(reg.fit.count(), 0);
    }

    #[test]
    fn test_mode_change_resets() {
        let mut reg = Regulator::new();
        reg.cycle(&reading(1000, 15.5, 80.0, 20.0), 15.0);
        reg.cycle(&reading(1002, 15.5, 80.0, 20.0), 15.0);
        assert!(reg.integrated_error() != 0.0);
        reg.reset();
        assert_eq!(reg.integrated_error(), 0.0);
        assert!(!reg.in_ramp());
    }

}  // mod tests.
