// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Wire format. Every frame starts with a magic byte, followed by a 4-byte
// little-endian length counting all bytes after the magic (so it includes
// the length field itself and the kind byte), followed by the kind byte and
// the payload. On a magic mismatch we have lost sync; the connection is
// closed rather than attempting recovery.
pub const MAGIC: u8 = 0x73;

pub const STATUS_MESSAGE_ID: u8 = 0x92;
pub const FITS_MESSAGE_ID: u8 = 0x93;
pub const CAMERA_MESSAGE_ID: u8 = 0x97;

// A frame is at least the 4 length bytes plus the kind byte.
const MIN_FRAME_LEN: u32 = 5;

// Largest frame we will accept. A full-frame 32-bit FITS product is ~100MB;
// anything above this is a corrupted length field.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Expose = 1,
    Cooler = 2,
    Status = 3,
    FilterConfig = 4,
    Shutdown = 5,
    Focus = 6,
    FocusQuery = 7,
}

impl CommandCode {
    pub fn from_u8(v: u8) -> Option<CommandCode> {
        match v {
            1 => Some(CommandCode::Expose),
            2 => Some(CommandCode::Cooler),
            3 => Some(CommandCode::Status),
            4 => Some(CommandCode::FilterConfig),
            5 => Some(CommandCode::Shutdown),
            6 => Some(CommandCode::Focus),
            7 => Some(CommandCode::FocusQuery),
            _ => None,
        }
    }
}

// Output pixel format codes carried in the PIXEL_FORMAT keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    U16 = 0,
    U32 = 1,
    F32 = 2,
}

impl PixelFormat {
    pub fn from_i64(v: i64) -> Option<PixelFormat> {
        match v {
            0 => Some(PixelFormat::U16),
            1 => Some(PixelFormat::U32),
            2 => Some(PixelFormat::F32),
            _ => None,
        }
    }
}

/// A command or status message: a command code, the originating request's
/// unique id, and a keyword/value dictionary. Status replies echo the
/// request's unique id so clients can skip stale queued replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraMessage {
    pub command: CommandCode,
    pub unique_id: u8,
    keywords: BTreeMap<String, String>,
}

impl CameraMessage {
    pub fn new(command: CommandCode) -> Self {
        CameraMessage {
            command,
            unique_id: 0,
            keywords: BTreeMap::new(),
        }
    }

    pub fn set_keyword(&mut self, keyword: &str, value: &str) {
        self.keywords.insert(keyword.to_string(), value.to_string());
    }
    pub fn keyword_present(&self, keyword: &str) -> bool {
        self.keywords.contains_key(keyword)
    }
    pub fn value_str(&self, keyword: &str) -> Option<&str> {
        self.keywords.get(keyword).map(|s| s.as_str())
    }
    pub fn value_f64(&self, keyword: &str) -> Option<f64> {
        self.keywords.get(keyword).and_then(|s| s.parse::<f64>().ok())
    }
    pub fn value_i64(&self, keyword: &str) -> Option<i64> {
        self.keywords.get(keyword).and_then(|s| s.parse::<i64>().ok())
    }
    pub fn value_bool(&self, keyword: &str) -> Option<bool> {
        self.value_i64(keyword).map(|v| v != 0)
    }
    pub fn keywords(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keywords.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_exposure(&mut self, time_secs: f64) {
        self.set_keyword("EXPOSURE", &format!("{}", time_secs));
    }
    pub fn set_filter(&mut self, filter_letter: char) {
        self.set_keyword("FILTER", &filter_letter.to_string());
    }
    pub fn set_binning(&mut self, binning: u32) {
        self.set_keyword("BIN", &binning.to_string());
    }
    pub fn set_local_image_name(&mut self, filename: &str) {
        self.set_keyword("IMAGE", filename);
    }
    pub fn set_camera_mode(&mut self, mode: i64) {
        self.set_keyword("MODE", &mode.to_string());
    }
    pub fn set_camera_gain(&mut self, gain: i64) {
        self.set_keyword("GAIN", &gain.to_string());
    }
    pub fn set_offset(&mut self, offset: i64) {
        self.set_keyword("OFFSET", &offset.to_string());
    }
    pub fn set_usb_traffic(&mut self, usb_traffic: f64) {
        self.set_keyword("USBTRAFFIC", &format!("{}", usb_traffic));
    }
    pub fn set_pixel_format(&mut self, format: PixelFormat) {
        self.set_keyword("PIXEL_FORMAT", &(format as i64).to_string());
    }
    pub fn set_compress_image(&mut self, compress: bool) {
        self.set_keyword("COMPRESS", if compress { "1" } else { "0" });
    }
    pub fn set_shutter_open(&mut self, open: bool) {
        self.set_keyword("SHUTTER_OPEN", if open { "1" } else { "0" });
    }
    pub fn set_query(&mut self) {
        self.set_keyword("STATUS_QUERY", "1");
    }
    pub fn is_query(&self) -> bool {
        self.value_bool("STATUS_QUERY").unwrap_or(false)
    }

    pub fn set_subframe(&mut self, bottom: u32, top: u32, left: u32, right: u32) {
        self.set_keyword("LEFT", &left.to_string());
        self.set_keyword("RIGHT", &right.to_string());
        self.set_keyword("TOP", &top.to_string());
        self.set_keyword("BOTTOM", &bottom.to_string());
    }

    /// Returns (bottom, top, left, right) when all four corners are present.
    pub fn subframe(&self) -> Option<(u32, u32, u32, u32)> {
        Some((self.value_i64("BOTTOM")? as u32,
              self.value_i64("TOP")? as u32,
              self.value_i64("LEFT")? as u32,
              self.value_i64("RIGHT")? as u32))
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.command as u8);
        out.push(self.unique_id);
        for (k, v) in &self.keywords {
            out.extend_from_slice(b"\n*K/");
            out.extend_from_slice(k.as_bytes());
            out.push(b'/');
            out.extend_from_slice(v.len().to_string().as_bytes());
            out.extend_from_slice(b"V/");
            out.extend_from_slice(v.as_bytes());
            out.push(b'/');
        }
        out.extend_from_slice(b"\n*Q\0");
        out
    }

    fn decode_payload(payload: &[u8]) -> Result<CameraMessage, CanonicalError> {
        if payload.len() < 2 {
            return Err(invalid_argument_error("camera message payload too short"));
        }
        let command = CommandCode::from_u8(payload[0]).ok_or_else(
            || invalid_argument_error(
                format!("unknown camera command code {}", payload[0]).as_str()))?;
        let mut msg = CameraMessage::new(command);
        msg.unique_id = payload[1];

        let mut s = &payload[2..];
        loop {
            while s.first() == Some(&b'\n') {
                s = &s[1..];
            }
            if s.first() != Some(&b'*') {
                return Err(invalid_argument_error("bad keyword record start"));
            }
            s = &s[1..];
            match s.first() {
                Some(&b'Q') => break,
                Some(&b'K') => (),
                _ => return Err(invalid_argument_error("bad keyword record tag")),
            }
            s = &s[1..];
            if s.first() != Some(&b'/') {
                return Err(invalid_argument_error("missing keyword delimiter"));
            }
            s = &s[1..];

            let key_len = s.iter().position(|&c| c == b'/').ok_or_else(
                || invalid_argument_error("unterminated keyword"))?;
            let keyword = std::str::from_utf8(&s[..key_len]).map_err(
                |_| invalid_argument_error("keyword not ASCII"))?.to_string();
            s = &s[key_len + 1..];

            let digits = s.iter().position(|&c| !c.is_ascii_digit()).ok_or_else(
                || invalid_argument_error("unterminated value length"))?;
            let val_len: usize = std::str::from_utf8(&s[..digits]).unwrap()
                .parse().map_err(
                    |_| invalid_argument_error("bad value length"))?;
            if val_len > 65535 {
                return Err(invalid_argument_error("value length too large"));
            }
            s = &s[digits..];
            if s.len() < 2 || s[0] != b'V' || s[1] != b'/' {
                return Err(invalid_argument_error("missing value delimiter"));
            }
            s = &s[2..];
            if s.len() < val_len + 1 {
                return Err(invalid_argument_error("truncated value"));
            }
            let value = std::str::from_utf8(&s[..val_len]).map_err(
                |_| invalid_argument_error("value not ASCII"))?.to_string();
            s = &s[val_len..];
            if s[0] != b'/' {
                warn!("Keyword {} value missing trailing delimiter", keyword);
            } else {
                s = &s[1..];
            }
            msg.keywords.insert(keyword, value);
        }
        Ok(msg)
    }
}

/// A raw FITS file image (header plus pixel data) carried in-memory. Sent
/// by the camera server when a client names its output `IMAGE=-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitsMessage {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Camera(CameraMessage),
    Fits(FitsMessage),
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let (kind, payload) = match self {
            Message::Camera(cm) => {
                // Status replies are camera messages whose command is
                // Status; the legacy status kind id is not emitted.
                (CAMERA_MESSAGE_ID, cm.encode_payload())
            },
            Message::Fits(fm) => (FITS_MESSAGE_ID, fm.data.clone()),
        };
        let size = (MIN_FRAME_LEN as usize + payload.len()) as u32;
        let mut out = Vec::with_capacity(1 + size as usize);
        out.push(MAGIC);
        out.extend_from_slice(&size.to_le_bytes());
        out.push(kind);
        out.extend_from_slice(&payload);
        out
    }

    fn from_parts(kind: u8, payload: &[u8]) -> Result<Message, CanonicalError> {
        match kind {
            CAMERA_MESSAGE_ID | STATUS_MESSAGE_ID =>
                Ok(Message::Camera(CameraMessage::decode_payload(payload)?)),
            FITS_MESSAGE_ID => Ok(Message::Fits(
                FitsMessage { data: payload.to_vec() })),
            _ => Err(invalid_argument_error(
                format!("unable to handle inbound message kind 0x{:02x}",
                        kind).as_str())),
        }
    }
}

fn check_preface(preface: &[u8; 5]) -> Result<u32, CanonicalError> {
    if preface[0] != MAGIC {
        // We've lost sync. The caller closes the connection.
        return Err(failed_precondition_error("message sync lost; giving up"));
    }
    let size = u32::from_le_bytes([preface[1], preface[2], preface[3], preface[4]]);
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&size) {
        return Err(failed_precondition_error(
            format!("inbound message size {} invalid", size).as_str()));
    }
    Ok(size)
}

/// Blocking receive, used by client programs.
pub fn read_message(stream: &mut impl Read) -> Result<Message, CanonicalError> {
    let mut preface = [0u8; 5];
    stream.read_exact(&mut preface).map_err(
        |e| failed_precondition_error(
            format!("cannot read from socket: {}", e).as_str()))?;
    let size = check_preface(&preface)?;
    let mut body = vec![0u8; (size - 4) as usize];
    stream.read_exact(&mut body).map_err(
        |e| failed_precondition_error(
            format!("cannot read from socket: {}", e).as_str()))?;
    Message::from_parts(body[0], &body[1..])
}

/// Blocking send, used by client programs.
pub fn write_message(stream: &mut impl Write, msg: &Message)
                     -> Result<(), CanonicalError> {
    stream.write_all(&msg.encode()).map_err(
        |e| failed_precondition_error(
            format!("error writing message to socket: {}", e).as_str()))
}

/// Async receive, used by the servers.
pub async fn read_message_async<R: AsyncRead + Unpin>(stream: &mut R)
                                                      -> Result<Message, CanonicalError> {
    let mut preface = [0u8; 5];
    stream.read_exact(&mut preface).await.map_err(
        |e| failed_precondition_error(
            format!("cannot read from socket: {}", e).as_str()))?;
    let size = check_preface(&preface)?;
    let mut body = vec![0u8; (size - 4) as usize];
    stream.read_exact(&mut body).await.map_err(
        |e| failed_precondition_error(
            format!("cannot read from socket: {}", e).as_str()))?;
    Message::from_parts(body[0], &body[1..])
}

/// Async send, used by the servers.
pub async fn write_message_async<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message)
                                                        -> Result<(), CanonicalError> {
    stream.write_all(&msg.encode()).await.map_err(
        |e| failed_precondition_error(
            format!("error writing message to socket: {}", e).as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        let bytes = msg.encode();
        let mut cursor = std::io::Cursor::new(bytes);
        read_message(&mut cursor).unwrap()
    }

    #[test]
    fn test_camera_message_round_trip() {
        let mut cm = CameraMessage::new(CommandCode::Expose);
        cm.unique_id = 42;
        cm.set_exposure(0.5);
        cm.set_filter('V');
        cm.set_binning(2);
        cm.set_subframe(0, 15, 0, 15);
        cm.set_pixel_format(PixelFormat::U32);
        cm.set_local_image_name("/tmp/a.fits");
        cm.set_keyword("EMPTY", "");

        let decoded = round_trip(&Message::Camera(cm.clone()));
        match decoded {
            Message::Camera(out) => {
                assert_eq!(out, cm);
                assert_eq!(out.unique_id, 42);
                assert_eq!(out.value_f64("EXPOSURE"), Some(0.5));
                assert_eq!(out.subframe(), Some((0, 15, 0, 15)));
                assert_eq!(out.value_str("EMPTY"), Some(""));
            },
            _ => panic!("wrong message kind"),
        }
    }

    #[test]
    fn test_fits_message_round_trip() {
        let fm = FitsMessage { data: vec![0u8, 1, 2, 0x73, 255, 0] };
        match round_trip(&Message::Fits(fm.clone())) {
            Message::Fits(out) => assert_eq!(out.data, fm.data),
            _ => panic!("wrong message kind"),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut cm = CameraMessage::new(CommandCode::Status);
        cm.set_query();
        let mut bytes = Message::Camera(cm).encode();
        bytes[0] = 0x74;
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_message(&mut cursor).is_err());
    }

    #[test]
    fn test_value_with_slashes() {
        let mut cm = CameraMessage::new(CommandCode::Expose);
        cm.set_local_image_name("/images/2024/image042.fits");
        match round_trip(&Message::Camera(cm)) {
            Message::Camera(out) => assert_eq!(
                out.value_str("IMAGE"), Some("/images/2024/image042.fits")),
            _ => panic!("wrong message kind"),
        }
    }

    #[test]
    fn test_cooler_keywords() {
        let mut cm = CameraMessage::new(CommandCode::Cooler);
        cm.set_keyword("COOLER_MODE", "SETPOINT");
        cm.set_keyword("SETPOINT", "-10.0");
        match round_trip(&Message::Camera(cm)) {
            Message::Camera(out) => {
                assert_eq!(out.value_str("COOLER_MODE"), Some("SETPOINT"));
                assert_eq!(out.value_f64("SETPOINT"), Some(-10.0));
                assert!(!out.is_query());
            },
            _ => panic!("wrong message kind"),
        }
    }

}  // mod tests.
