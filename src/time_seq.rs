// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::Write;
use std::path::PathBuf;

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use chrono::{Local, Timelike};
use log::{info, warn};

use crate::astro_util::{airmass, alt_az_from_equatorial, jd_from_unix, unix_now};
use crate::camera_client::{CameraClient, ExposureFlags, PointingKeywords,
                           append_pointing, next_valid_image_filename};
use crate::catalog::Catalog;
use crate::drifter::Drifter;
use crate::finder::{FINDER_EXPOSURE_SECS, FinderParams, run_finder};
use crate::focuser::Focuser;
use crate::mount::Mount;
use crate::notify::NotifyMailbox;
use crate::plate_solve::{PlateSolver, SolveOutcome, SolveResult};
use crate::running_focus::RunningFocus;
use crate::system_config::SystemConfig;

// Setup exposures used to initialize the drift guider when the science
// exposure is long.
const DRIFT_SETUP_EXPOSURES: u32 = 7;
const DRIFT_SETUP_SECS: f64 = 20.0;
// Science exposures at or above this length use the short setup images.
const QUICK_INIT_THRESHOLD_SECS: f64 = 30.0;
// Pause after a meridian flip to let the mount stabilize.
const POST_FLIP_SETTLE_SECS: u64 = 60;

/// Parses "hh:mm" into minutes. Rejects anything else.
pub fn parse_hhmm(s: &str) -> Result<i32, CanonicalError> {
    let bytes = s.as_bytes();
    let ok = bytes.len() == 5
        && bytes[0].is_ascii_digit() && bytes[1].is_ascii_digit()
        && bytes[2] == b':'
        && bytes[3].is_ascii_digit() && bytes[4].is_ascii_digit();
    if !ok {
        return Err(invalid_argument_error(
            format!("wrong time format ({}); must be hh:mm", s).as_str()));
    }
    let hours = (bytes[0] - b'0') as i32 * 10 + (bytes[1] - b'0') as i32;
    let minutes = (bytes[3] - b'0') as i32 * 10 + (bytes[4] - b'0') as i32;
    Ok(hours * 60 + minutes)
}

/// Midnight is "0 minutes"; times before midnight are negative, after are
/// positive.
pub fn signed_minutes(minutes_of_day: i32) -> i32 {
    if minutes_of_day < 12 * 60 {
        minutes_of_day
    } else {
        minutes_of_day - 24 * 60
    }
}

/// Parses an offset string like "1.5N" or "2.5W1.0S" into (north, east)
/// arcminutes.
pub fn parse_offset(s: &str) -> Result<(f64, f64), CanonicalError> {
    if s.len() > 32 {
        return Err(invalid_argument_error("offset string too long"));
    }
    let mut north = 0.0;
    let mut east = 0.0;
    let mut number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().map_err(
            |_| invalid_argument_error(
                format!("bad offset amount in {}", s).as_str()))?;
        number.clear();
        match c.to_ascii_uppercase() {
            'N' => north += value,
            'S' => north -= value,
            'E' => east += value,
            'W' => east -= value,
            _ => return Err(invalid_argument_error(
                format!("offset must use N, S, E or W ({})", c).as_str())),
        }
    }
    if !number.is_empty() {
        return Err(invalid_argument_error("offset missing direction character"));
    }
    Ok((north, east))
}

pub fn current_time_string() -> String {
    let now = Local::now();
    format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
}

#[derive(Debug, Clone)]
pub struct TimeSeqParams {
    pub exposure_secs: f64,
    pub target_name: String,
    pub filter: char,
    pub alternate_colors: bool,
    pub use_drift_guider: bool,
    pub use_running_focus: bool,
    pub offset_arcmin: Option<(f64, f64)>,
    // Minutes of day (hh*60+mm); None disables.
    pub quit_minutes: Option<i32>,
    pub flip_minutes: Option<i32>,
    pub profile: String,
    pub warmup_images: u32,
}

impl Default for TimeSeqParams {
    fn default() -> Self {
        TimeSeqParams {
            exposure_secs: 60.0,
            target_name: String::new(),
            filter: 'V',
            alternate_colors: false,
            use_drift_guider: true,
            use_running_focus: true,
            offset_arcmin: None,
            quit_minutes: None,
            flip_minutes: None,
            profile: "time_seq".to_string(),
            warmup_images: 3,
        }
    }
}

/// Wall-clock bookkeeping for flip/quit decisions, relative to midnight.
pub struct SessionClock {
    start_unix: i64,
    starting_minutes: i32,
    flip_minutes: Option<i32>,
    quit_minutes: Option<i32>,
}

impl SessionClock {
    pub fn new(start_unix: i64, start_minutes_of_day: i32,
               flip: Option<i32>, quit: Option<i32>) -> Self {
        SessionClock {
            start_unix,
            starting_minutes: signed_minutes(start_minutes_of_day),
            flip_minutes: flip.map(signed_minutes),
            quit_minutes: quit.map(signed_minutes),
        }
    }

    pub fn now() -> (i64, i32) {
        let local = Local::now();
        (unix_now(), (local.hour() * 60 + local.minute()) as i32)
    }

    pub fn time_to_flip(&self, now_unix: i64) -> bool {
        match self.flip_minutes {
            Some(flip) => {
                now_unix - self.start_unix
                    > (flip - self.starting_minutes) as i64 * 60
            },
            None => false,
        }
    }

    pub fn time_to_quit(&self, now_unix: i64) -> bool {
        match self.quit_minutes {
            Some(quit) => {
                now_unix - self.start_unix
                    > (quit - self.starting_minutes) as i64 * 60
            },
            None => false,
        }
    }
}

/// The dark frame library, keyed by exposure length. Missing darks are
/// tolerated; the solver just runs without dark subtraction.
pub fn dark_for(exposure_secs: f64) -> Option<PathBuf> {
    let dir = std::env::var("NIGHTWATCH_DARK_DIR").ok()?;
    let path = PathBuf::from(dir)
        .join(format!("dark_{:.0}.fits", exposure_secs));
    if path.exists() { Some(path) } else { None }
}

/// Everything a photometry session drives.
pub struct Session {
    pub params: TimeSeqParams,
    pub config: SystemConfig,
    pub camera: CameraClient,
    pub mount: Box<dyn Mount>,
    pub focuser: Option<Box<dyn Focuser>>,
    pub solver: PlateSolver,
    pub mailbox: NotifyMailbox,
    pub log: Box<dyn Write + Send>,

    drifter: Option<Drifter>,
    focus: RunningFocus,
    flags: ExposureFlags,
    use_alternate_color: bool,
}

impl Session {
    pub fn new(params: TimeSeqParams, config: SystemConfig,
               camera: CameraClient, mount: Box<dyn Mount>,
               focuser: Option<Box<dyn Focuser>>, solver: PlateSolver,
               mailbox: NotifyMailbox, log: Box<dyn Write + Send>,
               focus_log: Option<PathBuf>) -> Session {
        let mut flags = ExposureFlags::from_profile(&params.profile);
        flags.filter = params.filter;
        let mut focus = RunningFocus::new(focus_log.as_deref());
        if params.use_running_focus {
            focus.set_initial_images_to_ignore(params.warmup_images);
        }
        Session {
            params,
            config,
            camera,
            mount,
            focuser,
            solver,
            mailbox,
            log,
            drifter: None,
            focus,
            flags,
            use_alternate_color: false,
        }
    }

    fn check_notification(&self) -> bool {
        if let Some(message) = self.mailbox.take_notification() {
            info!("time_seq: received notify message '{}'. Quitting.", message);
            return true;
        }
        false
    }

    /// Exposes one image, plate-solves it, feeds the drifter (and
    /// optionally the focus estimator). Guides during the exposure when a
    /// drifter is active.
    fn expose_and_process(&mut self, exposure_secs: f64, purpose: &str,
                          feed_focus: bool)
                          -> Result<Option<SolveResult>, CanonicalError> {
        let filename = next_valid_image_filename(&self.config.image_dir);
        let start_unix = unix_now();
        let drift_args = match self.drifter.as_mut() {
            Some(drift) => Some((drift, &mut *self.mount as &mut dyn Mount)),
            None => None,
        };
        self.camera.expose_to_file(exposure_secs, &self.flags, &filename,
                                   purpose, drift_args)?;
        let _ = writeln!(self.log, "{}: {} ({})", current_time_string(),
                         filename.display(), self.flags.filter);
        let _ = self.log.flush();

        let dark = dark_for(exposure_secs);
        let outcome = self.solver.solve(&filename, &self.params.target_name,
                                        dark.as_deref());
        let result = match outcome {
            SolveOutcome::Solved(result) => result,
            other => {
                warn!("time_seq: image would not solve: {:?}", other);
                return Ok(None);
            }
        };
        let midpoint_jd = jd_from_unix(start_unix) + exposure_secs / 2.0 / 86400.0;
        if let Some(drift) = self.drifter.as_mut() {
            drift.accept_center(result.dec_rad, result.ra_rad, midpoint_jd);
        }

        // Pointing keywords are the client's to add.
        let north_up = !self.mount.on_west_side_of_pier().unwrap_or(false);
        let (alt, az, ha) = alt_az_from_equatorial(
            result.ra_rad, result.dec_rad,
            self.config.latitude_deg.to_radians(),
            self.config.longitude_deg.to_radians(),
            std::time::SystemTime::now());
        if let Err(e) = append_pointing(&filename, &PointingKeywords {
            dec_rad: result.dec_rad,
            ra_rad: result.ra_rad,
            altitude_rad: alt,
            azimuth_rad: az,
            airmass: airmass(alt),
            hour_angle_rad: ha,
            north_up,
        }) {
            warn!("Cannot append pointing keywords: {}", e.message);
        }
        if feed_focus && self.params.use_running_focus {
            if let (Some(blur), Some(focuser)) = (result.blur, self.focuser.as_mut()) {
                let position = focuser.position()?;
                self.focus.add_image(blur, position);
            }
        }
        Ok(Some(result))
    }

    fn run_finder_loop(&mut self, target_dec: f64, target_ra: f64)
                       -> Result<bool, CanonicalError> {
        let mut finder_flags = ExposureFlags::from_profile("finder");
        finder_flags.filter = self.params.filter;
        let image_dir = self.config.image_dir.clone();
        let target_name = self.params.target_name.clone();
        let camera = &mut self.camera;
        let solver = &self.solver;
        let mut expose_and_solve = || {
            let filename = next_valid_image_filename(&image_dir);
            if let Err(e) = camera.expose_to_file(
                FINDER_EXPOSURE_SECS, &finder_flags, &filename, "FINDER", None)
            {
                return SolveOutcome::Failed(e.message);
            }
            solver.solve(&filename, &target_name,
                         dark_for(FINDER_EXPOSURE_SECS).as_deref())
        };
        run_finder(&self.params.target_name, target_dec, target_ra,
                   &FinderParams::default(), &mut expose_and_solve,
                   &mut *self.mount)
    }

    /// Drift-guider initialization: a first image, then short setup
    /// exposures when the science exposure is long.
    fn drift_setup(&mut self) -> Result<bool, CanonicalError> {
        let quick_init = self.params.exposure_secs >= QUICK_INIT_THRESHOLD_SECS;
        let init_exposure = if quick_init {
            DRIFT_SETUP_SECS
        } else {
            self.params.exposure_secs
        };
        if self.params.use_drift_guider {
            let north_up = !self.mount.on_west_side_of_pier()?;
            if let Some(drift) = self.drifter.as_mut() {
                drift.set_north_up(north_up);
            }
        }
        // Short setup exposures tend to confuse the focus estimator,
        // because they are sharper just because they are shorter. Only
        // feed it full-length images.
        self.expose_and_process(init_exposure, "DRIFT_SETUP", !quick_init)?;
        if quick_init {
            info!("Starting initialization with short exposures");
            for _ in 0..DRIFT_SETUP_EXPOSURES {
                if self.check_notification() {
                    return Ok(false);
                }
                self.expose_and_process(init_exposure, "DRIFT_SETUP", false)?;
            }
            info!("Finished initialization with short exposures");
        }
        Ok(true)
    }

    /// The timed photometry session. Returns when the quit time passes or
    /// a notification arrives.
    pub fn run(&mut self) -> Result<(), CanonicalError> {
        let catalog = Catalog::load(&Catalog::default_path())?;
        let mut target = catalog.lookup(&self.params.target_name)?;
        if let Some((north, east)) = self.params.offset_arcmin {
            let arcmin_rad = std::f64::consts::PI / (180.0 * 60.0);
            target.dec_rad += north * arcmin_rad;
            target.ra_rad += east * arcmin_rad;
            info!("Using offset of {:.2} N, {:.2} E (arcmin)", north, east);
        }

        let (start_unix, start_minutes) = SessionClock::now();
        let clock = SessionClock::new(start_unix, start_minutes,
                                      self.params.flip_minutes,
                                      self.params.quit_minutes);

        self.mount.goto_j2000(target.dec_rad, target.ra_rad)?;
        self.mount.wait_for_stop()?;
        if !self.run_finder_loop(target.dec_rad, target.ra_rad)? {
            return Err(failed_precondition_error(
                "finder failed to converge on target"));
        }

        if self.params.use_drift_guider {
            self.drifter = Some(Drifter::new());
        }

        let mut flip_performed = false;
        let mut finished = false;
        // The outer loop is traversed at most twice; it handles the
        // restart required after a meridian flip.
        while !finished {
            if !self.drift_setup()? {
                return Ok(());
            }
            if self.params.use_running_focus {
                if let Some(focuser) = self.focuser.as_mut() {
                    self.focus.perform_focus_dither(focuser.as_mut())?;
                }
            }

            // The photometry loop, traversed hundreds of times.
            loop {
                if self.check_notification() {
                    return Ok(());
                }
                if self.params.use_running_focus {
                    if let Some(focuser) = self.focuser.as_mut() {
                        self.focus.update_focus(focuser.as_mut())?;
                    }
                }

                let mut feed_focus = true;
                if self.params.alternate_colors {
                    self.use_alternate_color = !self.use_alternate_color;
                    self.flags.filter = if self.use_alternate_color {
                        'R'
                    } else {
                        self.params.filter
                    };
                    feed_focus = !self.use_alternate_color;
                }
                self.expose_and_process(self.params.exposure_secs, "PHOTOMETRY",
                                        feed_focus)?;

                let now = unix_now();
                if !flip_performed && clock.time_to_flip(now) {
                    info!("Time to perform meridian flip");
                    match self.mount.meridian_flip() {
                        Ok(true) => {
                            flip_performed = true;
                            self.mount.wait_for_stop()?;
                            self.run_finder_loop(target.dec_rad, target.ra_rad)?;
                            if self.params.use_drift_guider {
                                self.drifter = Some(Drifter::new());
                            }
                            info!("Restarting running focus");
                            self.focus.restart();
                            std::thread::sleep(std::time::Duration::from_secs(
                                POST_FLIP_SETTLE_SECS));
                            // Repeat the drift initialization cycle.
                            break;
                        },
                        Ok(false) => warn!("Mount declined the meridian flip"),
                        Err(e) => warn!("Flip command did not execute okay: {}",
                                        e.message),
                    }
                }
                if clock.time_to_quit(unix_now()) {
                    finished = true;
                    break;
                }
            }
        }
        info!("time_seq: time is up");
        Ok(())
    }
}

// mod tests.
