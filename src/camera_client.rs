// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{info, warn};

use crate::drifter::Drifter;
use crate::frame::Subframe;
use crate::message::{CameraMessage, CommandCode, Message, PixelFormat,
                     read_message, write_message};
use crate::mount::Mount;

/// Client-side settings for one exposure, optionally seeded from a named
/// profile in the image_profiles.json file.
#[derive(Debug, Clone)]
pub struct ExposureFlags {
    pub filter: char,
    pub binning: u32,
    pub subframe: Subframe,
    pub gain: i64,
    pub mode: i64,
    pub offset: i64,
    pub usb_traffic: f64,
    pub pixel_format: PixelFormat,
    pub compress: bool,
    pub shutter_open: bool,
}

impl Default for ExposureFlags {
    fn default() -> Self {
        ExposureFlags {
            filter: 'V',
            binning: 1,
            subframe: Subframe::default(),
            gain: 0,
            mode: 0,
            offset: 5,
            usb_traffic: 0.0,
            pixel_format: PixelFormat::U16,
            compress: true,
            shutter_open: true,
        }
    }
}

impl ExposureFlags {
    /// Looks the profile up in image_profiles.json (NIGHTWATCH_PROFILES, or
    /// ~/.nightwatch/image_profiles.json). A missing file or profile keeps
    /// the defaults.
    pub fn from_profile(profile: &str) -> ExposureFlags {
        let mut flags = ExposureFlags::default();
        let path = std::env::var("NIGHTWATCH_PROFILES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                Path::new(&home).join(".nightwatch/image_profiles.json")
            });
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return flags,
        };
        let profiles: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Bad profiles file {:?}: {}", path, e);
                return flags;
            }
        };
        let entry = match profiles.get(profile) {
            Some(entry) => entry,
            None => {
                warn!("No profile named {} in {:?}", profile, path);
                return flags;
            }
        };
        if let Some(v) = entry.get("gain").and_then(|v| v.as_i64()) {
            flags.gain = v;
        }
        if let Some(v) = entry.get("mode").and_then(|v| v.as_i64()) {
            flags.mode = v;
        }
        if let Some(v) = entry.get("offset").and_then(|v| v.as_i64()) {
            flags.offset = v;
        }
        if let Some(v) = entry.get("binning").and_then(|v| v.as_i64()) {
            flags.binning = v.max(1) as u32;
        }
        if let Some(v) = entry.get("usb_traffic").and_then(|v| v.as_f64()) {
            flags.usb_traffic = v;
        }
        if let Some(v) = entry.get("compress").and_then(|v| v.as_bool()) {
            flags.compress = v;
        }
        if let Some(v) = entry.get("filter").and_then(|v| v.as_str()) {
            if let Some(letter) = v.chars().next() {
                flags.filter = letter;
            }
        }
        if let Some(v) = entry.get("format").and_then(|v| v.as_str()) {
            flags.pixel_format = match v {
                "32" => PixelFormat::U32,
                "float" => PixelFormat::F32,
                _ => PixelFormat::U16,
            };
        }
        flags
    }

    fn apply(&self, cm: &mut CameraMessage) {
        cm.set_filter(self.filter);
        cm.set_binning(self.binning);
        cm.set_subframe(self.subframe.bottom, self.subframe.top,
                        self.subframe.left, self.subframe.right);
        cm.set_camera_mode(self.mode);
        cm.set_camera_gain(self.gain);
        cm.set_offset(self.offset);
        cm.set_usb_traffic(self.usb_traffic);
        cm.set_pixel_format(self.pixel_format);
        cm.set_compress_image(self.compress);
        cm.set_shutter_open(self.shutter_open);
    }
}

/// Blocking connection to the camera server. Outbound commands are
/// auto-assigned a monotonic unique id; correlated replies echo it.
pub struct CameraClient {
    stream: TcpStream,
    next_unique_id: u8,
}

impl CameraClient {
    pub fn connect(addr: &str) -> Result<CameraClient, CanonicalError> {
        let stream = TcpStream::connect(addr).map_err(
            |e| failed_precondition_error(
                format!("cannot connect to camera server at {}: {}",
                        addr, e).as_str()))?;
        info!("Connected to camera server at {}", addr);
        Ok(CameraClient { stream, next_unique_id: 0 })
    }

    fn send(&mut self, mut cm: CameraMessage) -> Result<u8, CanonicalError> {
        self.next_unique_id = self.next_unique_id.wrapping_add(1);
        cm.unique_id = self.next_unique_id;
        let id = cm.unique_id;
        write_message(&mut self.stream, &Message::Camera(cm))?;
        Ok(id)
    }

    /// Waits for the status reply correlated with `unique_id`, skipping
    /// any queued replies with other ids.
    fn wait_for_status(&mut self, unique_id: u8)
                       -> Result<CameraMessage, CanonicalError> {
        loop {
            match read_message(&mut self.stream)? {
                Message::Camera(status) => {
                    if status.unique_id != unique_id {
                        info!("Skipping status reply with id {}",
                              status.unique_id);
                        continue;
                    }
                    return Ok(status);
                },
                Message::Fits(_) => {
                    warn!("Unexpected FITS message while awaiting status");
                }
            }
        }
    }

    /// Runs one exposure and returns the raw FITS bytes. When a drifter is
    /// supplied, the pre-exposure pulse is issued before the command is
    /// sent and in-exposure guiding runs while the camera integrates.
    pub fn expose_fits(&mut self, exposure_secs: f64, flags: &ExposureFlags,
                       mut drifter: Option<(&mut Drifter, &mut dyn Mount)>)
                       -> Result<Vec<u8>, CanonicalError> {
        if let Some((drift, mount)) = drifter.as_mut() {
            drift.exposure_start(exposure_secs, &mut **mount);
        }
        let mut cm = CameraMessage::new(CommandCode::Expose);
        cm.set_exposure(exposure_secs);
        cm.set_local_image_name("-");
        flags.apply(&mut cm);
        info!("Sending StartExposure command ({:.2} sec)", exposure_secs);
        self.send(cm)?;
        if let Some((drift, mount)) = drifter.as_mut() {
            // Blocks for the duration of the exposure.
            drift.exposure_guide(&mut **mount);
        }
        loop {
            match read_message(&mut self.stream)? {
                Message::Fits(fits) => return Ok(fits.data),
                Message::Camera(status) => {
                    // A status reply instead of pixels means the exposure
                    // failed server-side.
                    return Err(failed_precondition_error(
                        format!("exposure failed; camera status {}",
                                status.value_str("CAMERA_STATUS")
                                    .unwrap_or("unknown")).as_str()));
                }
            }
        }
    }

    /// Runs one exposure into `local_path`, appending the PURPOSE keyword.
    pub fn expose_to_file(&mut self, exposure_secs: f64, flags: &ExposureFlags,
                          local_path: &Path, purpose: &str,
                          drifter: Option<(&mut Drifter, &mut dyn Mount)>)
                          -> Result<(), CanonicalError> {
        let bytes = self.expose_fits(exposure_secs, flags, drifter)?;
        let mut file = std::fs::File::create(local_path).map_err(
            |e| failed_precondition_error(
                format!("cannot create {:?}: {}", local_path, e).as_str()))?;
        file.write_all(&bytes).map_err(
            |e| failed_precondition_error(
                format!("cannot write {:?}: {}", local_path, e).as_str()))?;
        drop(file);
        append_purpose(local_path, purpose)?;
        Ok(())
    }

    /// Runs one exposure on the server, leaving the product in the
    /// server's filesystem at `host_path`.
    pub fn host_expose(&mut self, exposure_secs: f64, flags: &ExposureFlags,
                       host_path: &str) -> Result<CameraMessage, CanonicalError> {
        let mut cm = CameraMessage::new(CommandCode::Expose);
        cm.set_exposure(exposure_secs);
        cm.set_local_image_name(host_path);
        flags.apply(&mut cm);
        let id = self.send(cm)?;
        self.wait_for_status(id)
    }

    pub fn cooler_off(&mut self) -> Result<(), CanonicalError> {
        let mut cm = CameraMessage::new(CommandCode::Cooler);
        cm.set_keyword("COOLER_MODE", "OFF");
        self.send(cm)?;
        Ok(())
    }

    pub fn cooler_manual(&mut self, power_fraction: f64) -> Result<(), CanonicalError> {
        let mut cm = CameraMessage::new(CommandCode::Cooler);
        cm.set_keyword("COOLER_MODE", "MANUAL");
        cm.set_keyword("POWER", &format!("{}", power_fraction));
        self.send(cm)?;
        Ok(())
    }

    pub fn cooler_setpoint(&mut self, setpoint_c: f64) -> Result<(), CanonicalError> {
        let mut cm = CameraMessage::new(CommandCode::Cooler);
        cm.set_keyword("COOLER_MODE", "SETPOINT");
        cm.set_keyword("SETPOINT", &format!("{}", setpoint_c));
        self.send(cm)?;
        Ok(())
    }

    /// Queries camera and cooler status.
    pub fn query_status(&mut self) -> Result<CameraMessage, CanonicalError> {
        let mut cm = CameraMessage::new(CommandCode::Cooler);
        cm.set_query();
        let id = self.send(cm)?;
        self.wait_for_status(id)
    }

    pub fn push_filter_config(&mut self, letters: &[char])
                              -> Result<CameraMessage, CanonicalError> {
        let mut cm = CameraMessage::new(CommandCode::FilterConfig);
        for (n, letter) in letters.iter().enumerate() {
            cm.set_keyword(&format!("FILTER_{}", n), &letter.to_string());
        }
        let id = self.send(cm)?;
        self.wait_for_status(id)
    }

    pub fn shutdown_server(&mut self) -> Result<(), CanonicalError> {
        let cm = CameraMessage::new(CommandCode::Shutdown);
        self.send(cm)?;
        Ok(())
    }
}

/// Next free `imageNNN.fits` name under `image_dir`.
pub fn next_valid_image_filename(image_dir: &Path) -> PathBuf {
    let pattern = image_dir.join("image*.fits");
    let mut highest: i64 = -1;
    if let Ok(entries) = glob::glob(&pattern.to_string_lossy()) {
        for entry in entries.flatten() {
            if let Some(stem) = entry.file_stem().and_then(|s| s.to_str()) {
                if let Ok(n) = stem.trim_start_matches("image").parse::<i64>() {
                    highest = highest.max(n);
                }
            }
        }
    }
    image_dir.join(format!("image{:03}.fits", highest + 1))
}

fn fits_err(context: &str, e: fitsio::errors::Error) -> CanonicalError {
    failed_precondition_error(format!("{}: {}", context, e).as_str())
}

fn append_purpose(path: &Path, purpose: &str) -> Result<(), CanonicalError> {
    let mut fptr = fitsio::FitsFile::edit(path)
        .map_err(|e| fits_err("fits edit", e))?;
    let hdu = fptr.primary_hdu().map_err(|e| fits_err("primary hdu", e))?;
    hdu.write_key(&mut fptr, "PURPOSE", purpose.to_string())
        .map_err(|e| fits_err("PURPOSE", e))?;
    Ok(())
}

/// Pointing keywords appended by the client after receipt.
pub struct PointingKeywords {
    pub dec_rad: f64,
    pub ra_rad: f64,
    pub altitude_rad: f64,
    pub azimuth_rad: f64,
    pub airmass: f64,
    pub hour_angle_rad: f64,
    pub north_up: bool,
}

pub fn append_pointing(path: &Path, pointing: &PointingKeywords)
                       -> Result<(), CanonicalError> {
    let mut fptr = fitsio::FitsFile::edit(path)
        .map_err(|e| fits_err("fits edit", e))?;
    let hdu = fptr.primary_hdu().map_err(|e| fits_err("primary hdu", e))?;
    let key = |k| move |e| fits_err(k, e);
    hdu.write_key(&mut fptr, "DEC-NOM", pointing.dec_rad.to_degrees())
        .map_err(key("DEC-NOM"))?;
    hdu.write_key(&mut fptr, "RA-NOM", pointing.ra_rad.to_degrees())
        .map_err(key("RA-NOM"))?;
    hdu.write_key(&mut fptr, "ALTITUDE", pointing.altitude_rad.to_degrees())
        .map_err(key("ALTITUDE"))?;
    hdu.write_key(&mut fptr, "AZIMUTH", pointing.azimuth_rad.to_degrees())
        .map_err(key("AZIMUTH"))?;
    hdu.write_key(&mut fptr, "AIRMASS", pointing.airmass)
        .map_err(key("AIRMASS"))?;
    hdu.write_key(&mut fptr, "HA-NOM", pointing.hour_angle_rad.to_degrees())
        .map_err(key("HA-NOM"))?;
    hdu.write_key(&mut fptr, "NORTH-UP",
                  if pointing.north_up { 1i64 } else { 0i64 })
        .map_err(key("NORTH-UP"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_valid_image_filename() {
        let dir = std::env::temp_dir().join(
            format!("nightwatch_names_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(next_valid_image_filename(&dir),
                   dir.join("image000.fits"));
        std::fs::write(dir.join("image000.fits"), b"x").unwrap();
        std::fs::write(dir.join("image007.fits"), b"x").unwrap();
        assert_eq!(next_valid_image_filename(&dir),
                   dir.join("image008.fits"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_profile_loading() {
        // Env manipulation happens once within a single test to avoid
        // races between parallel tests.
        std::env::set_var("NIGHTWATCH_PROFILES", "/nonexistent/profiles.json");
        let flags = ExposureFlags::from_profile("time_seq");
        assert_eq!(flags.binning, 1);
        assert_eq!(flags.filter, 'V');

        let path = std::env::temp_dir().join(
            format!("nightwatch_profiles_{}.json", std::process::id()));
        std::fs::write(&path, r#"{
            "finder": {"gain": 30, "binning": 2, "filter": "R", "format": "32"}
        }"#).unwrap();
        std::env::set_var("NIGHTWATCH_PROFILES", &path);
        let flags = ExposureFlags::from_profile("finder");
        assert_eq!(flags.gain, 30);
        assert_eq!(flags.binning, 2);
        assert_eq!(flags.filter, 'R');
        assert_eq!(flags.pixel_format, PixelFormat::U32);
        // An unknown profile name in a valid file keeps defaults.
        let flags = ExposureFlags::from_profile("nope");
        assert_eq!(flags.gain, 0);
        std::env::remove_var("NIGHTWATCH_PROFILES");
        std::fs::remove_file(&path).unwrap();
    }

}  // mod tests.
