// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use log::{info, warn};

/// Uniform operations over the mount. The mount's own TCP dialect is an
/// external collaborator; only the operations below are relied upon.
pub trait Mount: Send {
    fn goto_j2000(&mut self, dec_rad: f64, ra_rad: f64) -> Result<(), CanonicalError>;
    /// Blocks until the mount reports it is no longer slewing.
    fn wait_for_stop(&mut self) -> Result<(), CanonicalError>;
    fn sync(&mut self, dec_rad: f64, ra_rad: f64) -> Result<(), CanonicalError>;
    /// Guide-rate motion for the given durations (seconds); positive north,
    /// positive east.
    fn pulse_guide(&mut self, north_sec: f64, east_sec: f64) -> Result<(), CanonicalError>;
    /// Small relative move, arcminutes on the sky.
    fn small_move(&mut self, north_arcmin: f64, east_arcmin: f64)
                  -> Result<(), CanonicalError>;
    fn park(&mut self) -> Result<(), CanonicalError>;
    fn unpark(&mut self) -> Result<(), CanonicalError>;
    /// Epoch-of-day (dec, ra) radians; the caller converts to J2000.
    fn current_pointing(&mut self) -> Result<(f64, f64), CanonicalError>;
    /// Local sidereal time, radians.
    fn local_sidereal_time(&mut self) -> Result<f64, CanonicalError>;
    fn control_tracking(&mut self, enable: bool) -> Result<(), CanonicalError>;
    /// Returns false when the mount declined to flip.
    fn meridian_flip(&mut self) -> Result<bool, CanonicalError>;
    fn on_west_side_of_pier(&mut self) -> Result<bool, CanonicalError>;
    /// Guide rate, arcseconds per second of guide time.
    fn guide_rate(&mut self) -> Result<f64, CanonicalError>;
    fn set_refraction(&mut self, pressure_hpa: f64, temp_c: f64)
                      -> Result<(), CanonicalError>;
    fn add_alignment_point(&mut self, point: &str) -> Result<(), CanonicalError>;
    fn clear_alignment_points(&mut self) -> Result<(), CanonicalError>;
    fn list_alignment_points(&mut self) -> Result<Vec<String>, CanonicalError>;
}

pub fn format_ra(ra_rad: f64) -> String {
    let mut hours = ra_rad.to_degrees() / 15.0;
    while hours < 0.0 {
        hours += 24.0;
    }
    while hours >= 24.0 {
        hours -= 24.0;
    }
    let h = hours.trunc();
    let min_dec = (hours - h) * 60.0;
    let m = min_dec.trunc();
    let s = (min_dec - m) * 60.0;
    format!("{:02}:{:02}:{:04.1}", h as u32, m as u32, s)
}

pub fn format_dec(dec_rad: f64) -> String {
    let sign = if dec_rad.is_sign_negative() { '-' } else { '+' };
    let deg = dec_rad.to_degrees().abs();
    let d = deg.trunc();
    let min_dec = (deg - d) * 60.0;
    let m = min_dec.trunc();
    let s = (min_dec - m) * 60.0;
    format!("{}{:02}:{:02}:{:04.1}", sign, d as u32, m as u32, s)
}

/// Parses "HH:MM:SS[.S]" style sexagesimal strings (any of `:*'` as
/// separators) into a float in the leading unit.
pub fn parse_sexagesimal(s: &str) -> Result<f64, CanonicalError> {
    let s = s.trim_end_matches('#').trim();
    let negative = s.starts_with('-');
    let s = s.trim_start_matches(['+', '-']);
    let mut parts = s.split(|c| c == ':' || c == '*' || c == '\'');
    let mut value = 0.0;
    let mut scale = 1.0;
    let mut any = false;
    for part in parts.by_ref() {
        if part.is_empty() {
            continue;
        }
        let v: f64 = part.parse().map_err(
            |_| invalid_argument_error(
                format!("bad sexagesimal field: {}", part).as_str()))?;
        value += v * scale;
        scale /= 60.0;
        any = true;
    }
    if !any {
        return Err(invalid_argument_error("empty sexagesimal string"));
    }
    Ok(if negative { -value } else { value })
}

/// Client for the mount's ASCII TCP dialect: `#`-terminated commands with
/// `#`-terminated or single-character replies.
pub struct TcpMount {
    stream: TcpStream,
}

// Mount status values reported by :Gstat#. Only "slewing" matters to us.
const STATUS_SLEWING: i32 = 6;

impl TcpMount {
    pub fn connect(addr: &str) -> Result<TcpMount, CanonicalError> {
        let stream = TcpStream::connect(addr).map_err(
            |e| failed_precondition_error(
                format!("cannot connect to mount at {}: {}", addr, e).as_str()))?;
        stream.set_read_timeout(Some(Duration::from_secs(10))).map_err(
            |e| failed_precondition_error(
                format!("mount socket setup: {}", e).as_str()))?;
        info!("Connected to mount at {}", addr);
        Ok(TcpMount { stream })
    }

    fn send(&mut self, command: &str) -> Result<(), CanonicalError> {
        self.stream.write_all(command.as_bytes()).map_err(
            |e| failed_precondition_error(
                format!("mount write failed: {}", e).as_str()))
    }

    /// Sends a command and reads a `#`-terminated reply.
    fn transact(&mut self, command: &str) -> Result<String, CanonicalError> {
        self.send(command)?;
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.stream.read(&mut byte).map_err(
                |e| failed_precondition_error(
                    format!("mount read failed: {}", e).as_str()))?;
            if n == 0 {
                return Err(failed_precondition_error("mount connection closed"));
            }
            if byte[0] == b'#' {
                break;
            }
            reply.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Sends a command whose reply is a single character.
    fn transact_char(&mut self, command: &str) -> Result<char, CanonicalError> {
        self.send(command)?;
        let mut byte = [0u8; 1];
        let n = self.stream.read(&mut byte).map_err(
            |e| failed_precondition_error(
                format!("mount read failed: {}", e).as_str()))?;
        if n == 0 {
            return Err(failed_precondition_error("mount connection closed"));
        }
        Ok(byte[0] as char)
    }

    fn set_target(&mut self, dec_rad: f64, ra_rad: f64) -> Result<(), CanonicalError> {
        let r = self.transact_char(&format!(":Sr{}#", format_ra(ra_rad)))?;
        if r != '1' {
            return Err(failed_precondition_error("mount rejected target RA"));
        }
        let r = self.transact_char(&format!(":Sd{}#", format_dec(dec_rad)))?;
        if r != '1' {
            return Err(failed_precondition_error("mount rejected target Dec"));
        }
        Ok(())
    }

    fn status(&mut self) -> Result<i32, CanonicalError> {
        let reply = self.transact(":Gstat#")?;
        reply.trim().parse::<i32>().map_err(
            |_| failed_precondition_error(
                format!("bad mount status reply: {}", reply).as_str()))
    }
}

impl Mount for TcpMount {
    fn goto_j2000(&mut self, dec_rad: f64, ra_rad: f64) -> Result<(), CanonicalError> {
        self.set_target(dec_rad, ra_rad)?;
        let r = self.transact_char(":MS#")?;
        if r != '0' {
            return Err(failed_precondition_error(
                format!("mount goto refused: {}", r).as_str()));
        }
        Ok(())
    }

    fn wait_for_stop(&mut self) -> Result<(), CanonicalError> {
        // The mount's own status indicator is polled; there is no hard
        // timeout on this wait.
        loop {
            if self.status()? != STATUS_SLEWING {
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    fn sync(&mut self, dec_rad: f64, ra_rad: f64) -> Result<(), CanonicalError> {
        self.set_target(dec_rad, ra_rad)?;
        let reply = self.transact(":CM#")?;
        info!("Mount sync: {}", reply);
        Ok(())
    }

    fn pulse_guide(&mut self, north_sec: f64, east_sec: f64)
                   -> Result<(), CanonicalError> {
        let north_ms = (north_sec.abs() * 1000.0 + 0.5) as i64;
        if north_ms > 0 {
            let dir = if north_sec > 0.0 { 'n' } else { 's' };
            self.send(&format!(":Mg{}{:04}#", dir, north_ms.min(9999)))?;
        }
        let east_ms = (east_sec.abs() * 1000.0 + 0.5) as i64;
        if east_ms > 0 {
            let dir = if east_sec > 0.0 { 'e' } else { 'w' };
            self.send(&format!(":Mg{}{:04}#", dir, east_ms.min(9999)))?;
        }
        Ok(())
    }

    fn small_move(&mut self, north_arcmin: f64, east_arcmin: f64)
                  -> Result<(), CanonicalError> {
        // Relative moves are issued as timed guide-rate motion.
        let rate = self.guide_rate()?;
        if rate <= 0.0 {
            return Err(failed_precondition_error("mount guide rate unavailable"));
        }
        let north_sec = north_arcmin * 60.0 / rate;
        let east_sec = east_arcmin * 60.0 / rate;
        // The mount caps a single pulse at 9999 ms; chop longer moves.
        let mut remaining_n = north_sec;
        let mut remaining_e = east_sec;
        while remaining_n.abs() > 0.001 || remaining_e.abs() > 0.001 {
            let n = remaining_n.clamp(-9.9, 9.9);
            let e = remaining_e.clamp(-9.9, 9.9);
            self.pulse_guide(n, e)?;
            std::thread::sleep(Duration::from_secs_f64(
                n.abs().max(e.abs()) + 0.1));
            remaining_n -= n;
            remaining_e -= e;
        }
        Ok(())
    }

    fn park(&mut self) -> Result<(), CanonicalError> {
        self.send(":hP#")
    }

    fn unpark(&mut self) -> Result<(), CanonicalError> {
        self.send(":PO#")
    }

    fn current_pointing(&mut self) -> Result<(f64, f64), CanonicalError> {
        let ra = parse_sexagesimal(&self.transact(":GR#")?)?;
        let dec = parse_sexagesimal(&self.transact(":GD#")?)?;
        Ok((dec.to_radians(), (ra * 15.0).to_radians()))
    }

    fn local_sidereal_time(&mut self) -> Result<f64, CanonicalError> {
        let lst_hours = parse_sexagesimal(&self.transact(":GS#")?)?;
        Ok((lst_hours * 15.0).to_radians())
    }

    fn control_tracking(&mut self, enable: bool) -> Result<(), CanonicalError> {
        self.send(if enable { ":AP#" } else { ":AL#" })
    }

    fn meridian_flip(&mut self) -> Result<bool, CanonicalError> {
        let r = self.transact_char(":FLIP#")?;
        Ok(r == '1')
    }

    fn on_west_side_of_pier(&mut self) -> Result<bool, CanonicalError> {
        let reply = self.transact(":pS#")?;
        Ok(reply.starts_with('W') || reply.starts_with('w'))
    }

    fn guide_rate(&mut self) -> Result<f64, CanonicalError> {
        let reply = self.transact(":Ggr#")?;
        reply.trim().parse::<f64>().map_err(
            |_| failed_precondition_error(
                format!("bad guide rate reply: {}", reply).as_str()))
    }

    fn set_refraction(&mut self, pressure_hpa: f64, temp_c: f64)
                      -> Result<(), CanonicalError> {
        let r = self.transact_char(&format!(":SRPRS{:06.1}#", pressure_hpa))?;
        if r != '1' {
            warn!("Mount rejected refraction pressure");
        }
        let r = self.transact_char(&format!(":SRTMP{:+05.1}#", temp_c))?;
        if r != '1' {
            warn!("Mount rejected refraction temperature");
        }
        Ok(())
    }

    fn add_alignment_point(&mut self, point: &str) -> Result<(), CanonicalError> {
        let reply = self.transact(&format!(":newalpt{}#", point))?;
        if reply.starts_with('E') {
            return Err(invalid_argument_error(
                format!("mount rejected alignment point: {}", point).as_str()));
        }
        Ok(())
    }

    fn clear_alignment_points(&mut self) -> Result<(), CanonicalError> {
        let r = self.transact_char(":delalst#")?;
        if r != '1' {
            return Err(failed_precondition_error("mount failed to clear alignment"));
        }
        Ok(())
    }

    fn list_alignment_points(&mut self) -> Result<Vec<String>, CanonicalError> {
        let count: usize = self.transact(":getalst#")?.trim().parse().map_err(
            |_| failed_precondition_error("bad alignment count reply"))?;
        let mut points = Vec::with_capacity(count);
        for i in 0..count {
            points.push(self.transact(&format!(":getalp{}#", i))?);
        }
        Ok(points)
    }
}

/// In-memory mount used by tests: records commands, reports a settable
/// pointing.
#[derive(Default)]
pub struct SimMount {
    pub pointing: (f64, f64),  // (dec, ra) radians
    pub pulses: Vec<(f64, f64)>,  // (north_sec, east_sec)
    pub moves: Vec<(f64, f64)>,  // (north_arcmin, east_arcmin)
    pub gotos: Vec<(f64, f64)>,
    pub syncs: Vec<(f64, f64)>,
    pub tracking: bool,
    pub parked: bool,
    pub west_of_pier: bool,
    pub flip_result: bool,
    pub flips: usize,
    pub alignment_points: Vec<String>,
}

impl SimMount {
    pub fn new() -> Self {
        SimMount { tracking: true, flip_result: true, ..Default::default() }
    }
}

impl Mount for SimMount {
    fn goto_j2000(&mut self, dec_rad: f64, ra_rad: f64) -> Result<(), CanonicalError> {
        self.pointing = (dec_rad, ra_rad);
        self.gotos.push((dec_rad, ra_rad));
        Ok(())
    }
    fn wait_for_stop(&mut self) -> Result<(), CanonicalError> {
        Ok(())
    }
    fn sync(&mut self, dec_rad: f64, ra_rad: f64) -> Result<(), CanonicalError> {
        self.syncs.push((dec_rad, ra_rad));
        Ok(())
    }
    fn pulse_guide(&mut self, north_sec: f64, east_sec: f64)
                   -> Result<(), CanonicalError> {
        self.pulses.push((north_sec, east_sec));
        Ok(())
    }
    fn small_move(&mut self, north_arcmin: f64, east_arcmin: f64)
                  -> Result<(), CanonicalError> {
        self.moves.push((north_arcmin, east_arcmin));
        Ok(())
    }
    fn park(&mut self) -> Result<(), CanonicalError> {
        self.parked = true;
        Ok(())
    }
    fn unpark(&mut self) -> Result<(), CanonicalError> {
        self.parked = false;
        Ok(())
    }
    fn current_pointing(&mut self) -> Result<(f64, f64), CanonicalError> {
        Ok(self.pointing)
    }
    fn local_sidereal_time(&mut self) -> Result<f64, CanonicalError> {
        Ok(0.0)
    }
    fn control_tracking(&mut self, enable: bool) -> Result<(), CanonicalError> {
        self.tracking = enable;
        Ok(())
    }
    fn meridian_flip(&mut self) -> Result<bool, CanonicalError> {
        self.flips += 1;
        Ok(self.flip_result)
    }
    fn on_west_side_of_pier(&mut self) -> Result<bool, CanonicalError> {
        Ok(self.west_of_pier)
    }
    fn guide_rate(&mut self) -> Result<f64, CanonicalError> {
        Ok(3.75)
    }
    fn set_refraction(&mut self, _pressure_hpa: f64, _temp_c: f64)
                      -> Result<(), CanonicalError> {
        Ok(())
    }
    fn add_alignment_point(&mut self, point: &str) -> Result<(), CanonicalError> {
        self.alignment_points.push(point.to_string());
        Ok(())
    }
    fn clear_alignment_points(&mut self) -> Result<(), CanonicalError> {
        self.alignment_points.clear();
        Ok(())
    }
    fn list_alignment_points(&mut self) -> Result<Vec<String>, CanonicalError> {
        Ok(self.alignment_points.clone())
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_format_ra() {
        // 3h05m00s = 46.25 degrees.
        let ra = (46.25f64).to_radians();
        assert_eq!(format_ra(ra), "03:05:00.0");
    }

    #[test]
    fn test_format_dec() {
        let dec = -(10.5f64).to_radians();
        assert_eq!(format_dec(dec), "-10:30:00.0");
        assert_eq!(format_dec(0.0), "+00:00:00.0");
    }

    #[test]
    fn test_parse_sexagesimal() {
        assert_abs_diff_eq!(parse_sexagesimal("03:05:00#").unwrap(),
                            3.0 + 5.0 / 60.0, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_sexagesimal("-10*30'00").unwrap(),
                            -10.5, epsilon = 1e-9);
        assert!(parse_sexagesimal("xx:yy").is_err());
    }

    #[test]
    fn test_format_parse_round_trip() {
        for dec_deg in [-67.25, -0.1, 0.0, 12.34, 89.9] {
            let dec = dec_deg * PI / 180.0;
            let parsed = parse_sexagesimal(&format_dec(dec)).unwrap();
            assert_abs_diff_eq!(parsed, dec_deg, epsilon = 0.001);
        }
    }

}  // mod tests.
