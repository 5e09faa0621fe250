// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;

use crate::frame::{ResolvedFrame, SensorGeometry};

#[derive(Debug, Clone, Copy, Default)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Read-mostly camera identity and limits, populated when the device is
/// opened. Refreshed only while holding the camera mutex.
#[derive(Debug, Clone)]
pub struct CameraDescriptor {
    pub model: String,
    pub firmware_version: String,
    pub geometry: SensorGeometry,
    pub num_read_modes: u32,
    pub gain_range: ParamRange,
    pub offset_range: ParamRange,
    pub usb_traffic_range: ParamRange,
    pub exposure_range_usec: ParamRange,
    pub has_amp_glow_control: bool,
}

/// Device settings for one exposure. The device is always driven unbinned;
/// binning happens in software after readout.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub frame: ResolvedFrame,
    pub exposure_usec: f64,
    pub mode: i64,
    pub gain: i64,
    pub offset: i64,
    pub usb_traffic: f64,
}

/// Unbinned pixels as returned by the device.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: usize,
    pub height: usize,
    pub bits_per_pixel: u32,
    pub channels: u32,
    pub pixels: Vec<u16>,
}

/// Uniform operations over an opaque camera backend (vendor SDK, INDI, or
/// the simulator). Discovery lives with each backend and fails when zero or
/// multiple devices are found.
pub trait AbstractCamera: Send {
    fn describe(&self) -> &CameraDescriptor;

    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), CanonicalError>;

    /// Returns immediately; the shutter opens asynchronously.
    fn start_exposure(&mut self) -> Result<(), CanonicalError>;

    /// Remaining exposure in implementation-defined units; for long
    /// exposures the value behaves roughly like a percentage, and it breaks
    /// down for short ones. Callers treat zero as "ready" and bound their
    /// trust in nonzero reports with their own timeout budget.
    fn remaining_time(&mut self) -> Result<u32, CanonicalError>;

    /// Blocks until pixels are available.
    fn read_frame(&mut self) -> Result<RawFrame, CanonicalError>;

    // Cooler-facing operations, exercised by the cooler worker while it
    // holds the camera mutex.
    fn sensor_temperature(&mut self) -> Result<f64, CanonicalError>;
    fn cooler_pwm(&mut self) -> Result<f64, CanonicalError>;
    fn set_cooler_pwm(&mut self, pwm: u8) -> Result<(), CanonicalError>;
    /// (humidity percent, pressure mbar) of the sensor chamber.
    fn chamber_conditions(&mut self) -> Result<(f64, f64), CanonicalError>;
    /// Ambient temperature when the camera carries a sensor for it.
    fn ambient_temperature(&mut self) -> Option<f64>;
}
