// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::abstract_camera::{AbstractCamera, CaptureSettings};
use crate::filter_wheel::{FilterBank, FilterWheel, staging_slot};
use crate::fits_image::FitsHeader;
use crate::frame::{BinnedFrame, ResolvedFrame, Subframe, bin_frame,
                   resolve_subframe};
use crate::message::PixelFormat;
use crate::system_config::SystemConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    Idle,
    Requested,
    FilterMoving,
    ReadyForExposure,
    Exposing,
    WaitingForEnd,
    ReadyForReadout,
}

/// One pending/active exposure, as parsed from an EXPOSE message.
#[derive(Debug, Clone)]
pub struct ExposureRequest {
    pub exposure_secs: f64,
    pub subframe: Subframe,
    pub binning: u32,
    pub mode: i64,
    pub gain: i64,
    pub offset: i64,
    pub usb_traffic: f64,
    pub pixel_format: PixelFormat,
    pub compress: bool,
    pub filter: char,
    pub shutter_open: bool,
    // Output path, or "-" for an in-memory FITS reply.
    pub image_name: String,
    // Client-supplied unique exposure id (the request's unique id).
    pub exposure_id: u8,
}

impl Default for ExposureRequest {
    fn default() -> Self {
        ExposureRequest {
            exposure_secs: 1.0,
            subframe: Subframe::default(),
            binning: 1,
            mode: 0,
            gain: 0,
            offset: 5,
            usb_traffic: 0.0,
            pixel_format: PixelFormat::U16,
            compress: false,
            filter: 'V',
            shutter_open: true,
            image_name: "-".to_string(),
            exposure_id: 0,
        }
    }
}

/// The finished exposure: binned pixels plus the header to encode with
/// them. Only produced after the state machine has passed through
/// ReadyForReadout.
#[derive(Debug)]
pub struct ExposureProduct {
    pub frame: BinnedFrame,
    pub header: FitsHeader,
    pub resolved: ResolvedFrame,
    pub compress: bool,
    pub image_name: String,
    pub exposure_id: u8,
}

/// Timing/backoff knobs, defaulted to the values the hardware needs. Tests
/// shrink them.
#[derive(Debug, Clone, Copy)]
pub struct EngineParams {
    pub cfw_tick: Duration,
    pub cfw_timeout: Duration,
    pub cfw_settle: Duration,
    pub exp_prewin: Duration,
    pub exp_tick: Duration,
    pub exp_postwin: Duration,
}

impl Default for EngineParams {
    fn default() -> Self {
        EngineParams {
            cfw_tick: Duration::from_millis(100),
            cfw_timeout: Duration::from_secs(25),
            cfw_settle: Duration::from_secs(1),
            exp_prewin: Duration::from_millis(100),
            exp_tick: Duration::from_millis(100),
            exp_postwin: Duration::from_secs(5),
        }
    }
}

struct EngineShared {
    state: ExposureState,
    // Transition record for the exposure in progress; reset at Requested.
    history: Vec<ExposureState>,
    wheel_slots: Option<u32>,
    current_slot: Option<u32>,
    end_time: Option<Instant>,
    shutter_open_start: Option<SystemTime>,
    shutter_fully_open: Option<SystemTime>,
    shutter_closed: Option<SystemTime>,
}

/// Drives the exposure state machine. At most one exposure is non-Idle per
/// server instance; a request arriving while one is active is logged and
/// rejected. The camera mutex is shared with the cooler worker; it is held
/// only across device calls, except that readout blocks under it (the
/// dispatcher owns the camera for the full readout).
pub struct ExposureEngine {
    camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>>,
    wheel: Arc<Mutex<Box<dyn FilterWheel + Send>>>,
    bank: Arc<Mutex<FilterBank>>,
    config: SystemConfig,
    params: EngineParams,
    shared: Arc<Mutex<EngineShared>>,
}

impl ExposureEngine {
    pub fn new(camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>>,
               wheel: Arc<Mutex<Box<dyn FilterWheel + Send>>>,
               bank: Arc<Mutex<FilterBank>>,
               config: SystemConfig,
               params: EngineParams) -> Self {
        ExposureEngine {
            camera,
            wheel,
            bank,
            config,
            params,
            shared: Arc::new(Mutex::new(EngineShared {
                state: ExposureState::Idle,
                history: Vec::new(),
                wheel_slots: None,
                current_slot: None,
                end_time: None,
                shutter_open_start: None,
                shutter_fully_open: None,
                shutter_closed: None,
            })),
        }
    }

    pub fn state(&self) -> ExposureState {
        self.shared.lock().unwrap().state
    }

    /// Transition record of the most recent exposure, oldest first.
    pub fn history(&self) -> Vec<ExposureState> {
        self.shared.lock().unwrap().history.clone()
    }

    pub fn current_filter_slot(&self) -> Option<u32> {
        self.shared.lock().unwrap().current_slot
    }

    /// Nominal seconds left in the active exposure, for status replies.
    pub fn seconds_remaining(&self) -> f64 {
        let shared = self.shared.lock().unwrap();
        match (shared.state, shared.end_time) {
            (ExposureState::Exposing, Some(end))
            | (ExposureState::WaitingForEnd, Some(end)) => {
                let now = Instant::now();
                if end > now { (end - now).as_secs_f64() } else { 0.0 }
            },
            _ => 0.0,
        }
    }

    fn set_state(&self, state: ExposureState) {
        let mut shared = self.shared.lock().unwrap();
        debug!("Exposure state: {:?} -> {:?}", shared.state, state);
        shared.state = state;
        shared.history.push(state);
    }

    fn fail_to_idle(&self, err: CanonicalError) -> CanonicalError {
        error!("Exposure failed: {}", err.message);
        self.set_state(ExposureState::Idle);
        err
    }

    /// Blocks for wheel init on the first exposure; hardware wheels take
    /// tens of seconds here.
    fn complete_wheel_init(&self) -> Result<u32, CanonicalError> {
        if let Some(slots) = self.shared.lock().unwrap().wheel_slots {
            return Ok(slots);
        }
        let slots = tokio::task::block_in_place(
            || self.wheel.lock().unwrap().finish_init())?;
        self.shared.lock().unwrap().wheel_slots = Some(slots);
        Ok(slots)
    }

    /// Commands motion to `slot` and polls until the wheel reports it,
    /// enforcing the motion budget. Fatal (deadline error) on expiry.
    async fn move_wheel_and_wait(&self, slot: u32) -> Result<(), CanonicalError> {
        self.wheel.lock().unwrap().move_to(slot)?;
        let mut budget = self.params.cfw_timeout;
        loop {
            tokio::time::sleep(self.params.cfw_tick).await;
            let position = self.wheel.lock().unwrap().current_slot()?;
            if let Some(position) = position {
                self.shared.lock().unwrap().current_slot = Some(position);
                if position == slot {
                    // Let the wheel stop moving.
                    tokio::time::sleep(self.params.cfw_settle).await;
                    return Ok(());
                }
            }
            budget = budget.saturating_sub(self.params.cfw_tick);
            if budget.is_zero() {
                return Err(deadline_exceeded_error("CFW timeout"));
            }
        }
    }

    /// Anti-backlash selection: approach the target via an adjacent
    /// staging slot so the final motion always comes from the same side.
    async fn select_filter(&self, target: u32) -> Result<(), CanonicalError> {
        let current = self.shared.lock().unwrap().current_slot;
        if current == Some(target) {
            // Already in position; skip FilterMoving entirely.
            return Ok(());
        }
        self.set_state(ExposureState::FilterMoving);
        let staging = staging_slot(target);
        info!("Moving filter wheel to staging slot {}", staging);
        self.move_wheel_and_wait(staging).await?;
        info!("Moving filter wheel to slot {}", target);
        self.move_wheel_and_wait(target).await?;
        Ok(())
    }

    /// Runs one exposure from request to readout, returning the product
    /// for the caller to encode. On failure the state machine is returned
    /// to Idle; filter-wheel timeouts surface as DeadlineExceeded and the
    /// server escalates them to process exit.
    pub async fn run_exposure(&self, req: &ExposureRequest)
                              -> Result<ExposureProduct, CanonicalError> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.state != ExposureState::Idle {
                // A state transition requested in an incompatible state is
                // logged and ignored.
                warn!("EXPOSE while state is {:?}; ignoring", shared.state);
                return Err(failed_precondition_error("exposure already active"));
            }
            shared.state = ExposureState::Requested;
            shared.history.clear();
            shared.history.push(ExposureState::Requested);
            shared.shutter_open_start = None;
            shared.shutter_fully_open = None;
            shared.shutter_closed = None;
        }
        debug!("Exposure state: Idle -> Requested");

        // Filter selection, with the dark slot overriding a shut-shutter
        // request.
        let slots = self.complete_wheel_init()?;
        if slots > 1 {
            let target = {
                let bank = self.bank.lock().unwrap();
                if !req.shutter_open {
                    bank.dark_slot().unwrap_or_else(|| bank.resolve(req.filter))
                } else {
                    bank.resolve(req.filter)
                }
            };
            if let Err(e) = self.select_filter(target).await {
                self.set_state(ExposureState::Idle);
                return Err(e);
            }
        }
        self.set_state(ExposureState::ReadyForExposure);

        // Program the device and start integration.
        let geometry = {
            let cam = self.camera.lock().unwrap();
            cam.describe().geometry
        };
        let resolved = resolve_subframe(&geometry, &req.subframe);
        let settings = CaptureSettings {
            frame: resolved,
            exposure_usec: req.exposure_secs * 1e6,
            mode: req.mode,
            gain: req.gain,
            offset: req.offset,
            usb_traffic: req.usb_traffic,
        };
        {
            let mut cam = self.camera.lock().unwrap();
            cam.configure(&settings).map_err(|e| self.fail_to_idle(e))?;
            let mut shared = self.shared.lock().unwrap();
            shared.shutter_open_start = Some(SystemTime::now());
            drop(shared);
            cam.start_exposure().map_err(|e| self.fail_to_idle(e))?;
        }
        let start = Instant::now();
        let end_time = start + Duration::from_secs_f64(req.exposure_secs);
        {
            let mut shared = self.shared.lock().unwrap();
            shared.shutter_fully_open = Some(SystemTime::now());
            shared.end_time = Some(end_time);
        }
        self.set_state(ExposureState::Exposing);

        // Sleep until just before the nominal end, then poll the device
        // for the actual end.
        let prewin_deadline = end_time.checked_sub(self.params.exp_prewin)
            .unwrap_or_else(Instant::now);
        tokio::time::sleep_until(tokio::time::Instant::from_std(prewin_deadline))
            .await;
        self.set_state(ExposureState::WaitingForEnd);

        let mut ticks = ((self.params.exp_postwin + self.params.exp_prewin)
                         .as_secs_f64()
                         / self.params.exp_tick.as_secs_f64()) as i64;
        loop {
            let remaining = {
                let mut cam = self.camera.lock().unwrap();
                cam.remaining_time().map_err(|e| self.fail_to_idle(e))?
            };
            if remaining == 0 {
                break;
            }
            ticks -= 1;
            if ticks <= 0 {
                // Give up on this exposure; the camera never reported
                // ready.
                return Err(self.fail_to_idle(deadline_exceeded_error(
                    "exposure timeout; camera still not ready")));
            }
            tokio::time::sleep(self.params.exp_tick).await;
        }
        self.shared.lock().unwrap().shutter_closed = Some(SystemTime::now());
        self.set_state(ExposureState::ReadyForReadout);

        // Readout blocks; the dispatcher owns the camera for its full
        // duration.
        let raw = {
            let mut cam = self.camera.lock().unwrap();
            tokio::task::block_in_place(|| cam.read_frame())
                .map_err(|e| self.fail_to_idle(e))?
        };
        if raw.bits_per_pixel != 16 {
            return Err(self.fail_to_idle(failed_precondition_error(
                format!("wrong pixel depth: {}", raw.bits_per_pixel).as_str())));
        }
        info!("Readout finished, w = {}, h = {}", raw.width, raw.height);

        let frame = bin_frame(&raw.pixels, raw.width, raw.height,
                              req.binning.max(1) as usize, req.pixel_format);

        let (open_start, closed, filter_name, camera_name) = {
            let shared = self.shared.lock().unwrap();
            let filter_name = shared.current_slot
                .and_then(|slot| self.bank.lock().unwrap().name_of(slot));
            (shared.shutter_open_start, shared.shutter_closed, filter_name,
             self.camera.lock().unwrap().describe().model.clone())
        };
        let exp_t1 = match (open_start, closed) {
            (Some(t0), Some(t1)) =>
                t1.duration_since(t0).ok().map(|d| d.as_secs_f64()),
            _ => None,
        };
        let date_obs: DateTime<Utc> =
            open_start.unwrap_or_else(SystemTime::now).into();
        let header = FitsHeader {
            exposure_secs: req.exposure_secs,
            pixel_scale_arcsec: self.config.pixel_scale_arcsec,
            exp_t1,
            filter_name,
            date_obs,
            gain: req.gain,
            mode: req.mode,
            offset: req.offset,
            frame_x: resolved.corner_x,
            frame_y: resolved.corner_y,
            focal_length_mm: self.config.focal_length_mm,
            camera: camera_name,
            telescope: self.config.telescope.clone(),
        };
        self.set_state(ExposureState::Idle);
        Ok(ExposureProduct {
            frame,
            header,
            resolved,
            compress: req.compress,
            image_name: req.image_name.clone(),
            exposure_id: req.exposure_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_wheel::SimFilterWheel;
    use crate::frame::BinnedData;
    use crate::sim_camera;

    fn test_engine(initial_slot_polls: u32) -> ExposureEngine {
        let camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>> =
            Arc::new(Mutex::new(Box::new(sim_camera::discover().unwrap())));
        let wheel: Arc<Mutex<Box<dyn FilterWheel + Send>>> =
            Arc::new(Mutex::new(Box::new(
                SimFilterWheel::new(7, initial_slot_polls))));
        let bank = Arc::new(Mutex::new(FilterBank::parse("L\nR\nV\nB\nI\nH\nD\n")
                                       .unwrap()));
        let params = EngineParams {
            cfw_tick: Duration::from_millis(1),
            cfw_timeout: Duration::from_millis(50),
            cfw_settle: Duration::from_millis(1),
            exp_prewin: Duration::from_millis(20),
            exp_tick: Duration::from_millis(5),
            exp_postwin: Duration::from_millis(200),
        };
        ExposureEngine::new(camera, wheel, bank,
                            SystemConfig::default(), params)
    }

    fn test_request() -> ExposureRequest {
        ExposureRequest {
            exposure_secs: 0.05,
            subframe: Subframe { top: 31, bottom: 0, left: 0, right: 31 },
            filter: 'V',
            ..ExposureRequest::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_basic_exposure_state_sequence() {
        let engine = test_engine(2);
        let product = engine.run_exposure(&test_request()).await.unwrap();
        assert_eq!(engine.state(), ExposureState::Idle);
        assert_eq!(engine.history(), vec![
            ExposureState::Requested,
            ExposureState::FilterMoving,
            ExposureState::ReadyForExposure,
            ExposureState::Exposing,
            ExposureState::WaitingForEnd,
            ExposureState::ReadyForReadout,
            ExposureState::Idle,
        ]);
        assert_eq!(product.frame.width, 32);
        assert_eq!(product.frame.height, 32);
        assert_eq!(product.header.filter_name, Some('V'));
        assert!(product.header.exp_t1.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_filter_already_at_target_skips_moving() {
        let engine = test_engine(2);
        // First exposure moves the wheel to V.
        engine.run_exposure(&test_request()).await.unwrap();
        // Second exposure with the same filter: Requested goes straight to
        // ReadyForExposure.
        engine.run_exposure(&test_request()).await.unwrap();
        assert!(!engine.history().contains(&ExposureState::FilterMoving));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dark_request_selects_dark_slot() {
        let engine = test_engine(2);
        let mut req = test_request();
        req.shutter_open = false;
        engine.run_exposure(&req).await.unwrap();
        assert_eq!(engine.current_filter_slot(), Some(6));
        let product = engine.run_exposure(&req).await.unwrap();
        assert_eq!(product.header.filter_name, Some('D'));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_anti_backlash_staging() {
        let engine = test_engine(2);
        // Request filter B (slot 3); the wheel must pass through slot 2.
        let mut req = test_request();
        req.filter = 'B';
        engine.run_exposure(&req).await.unwrap();
        assert_eq!(engine.current_filter_slot(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fits_payload_only_after_readout() {
        let engine = test_engine(2);
        let product = engine.run_exposure(&test_request()).await.unwrap();
        let history = engine.history();
        let readout_pos = history.iter().position(
            |&s| s == ExposureState::ReadyForReadout);
        assert!(readout_pos.is_some());
        // The product exists and the machine passed through ReadyForReadout
        // before returning to Idle.
        assert!(matches!(product.frame.data, BinnedData::U16(_)));
        assert_eq!(history.last(), Some(&ExposureState::Idle));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_filter_timeout_is_fatal_error() {
        // A wheel that needs more polls than the timeout budget allows.
        let engine = test_engine(10_000);
        let err = engine.run_exposure(&test_request()).await.unwrap_err();
        assert_eq!(err.code, canonical_error::CanonicalErrorCode::DeadlineExceeded);
        assert_eq!(engine.state(), ExposureState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_binned_exposure_pixel_count() {
        let engine = test_engine(2);
        let mut req = test_request();
        req.binning = 2;
        req.pixel_format = PixelFormat::U32;
        req.subframe = Subframe { top: 15, bottom: 0, left: 0, right: 15 };
        let product = engine.run_exposure(&req).await.unwrap();
        assert_eq!(product.frame.width, 8);
        assert_eq!(product.frame.height, 8);
        assert_eq!(product.frame.data.len(), 64);
    }

}  // mod tests.
