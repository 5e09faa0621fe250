// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error, invalid_argument_error};
use log::{info, warn};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMoveType {
    Absolute,
    Relative,
}

/// Uniform operations over a motorized focuser backend.
pub trait Focuser: Send {
    /// Commands a move and blocks until the position readout stabilizes or
    /// the idle timeout elapses; returns the final observed position.
    fn move_to(&mut self, ticks: i64, move_type: FocusMoveType)
               -> Result<i64, CanonicalError>;

    fn position(&mut self) -> Result<i64, CanonicalError>;
}

// Successive position polls within this many ticks of each other count as
// "stopped".
const POSITION_TOLERANCE: i64 = 2;
// Poll-count budget for a move; past it we give up and report the last
// observed position.
const MOVE_IDLE_POLLS: u32 = 30;
const MOVE_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct ByteRing {
    buf: VecDeque<u8>,
    closed: bool,
}

/// A byte transport with a dedicated reader thread buffering inbound bytes
/// into a protected ring. The reader thread owns reads; callers own writes
/// and block on the condvar until response bytes arrive.
pub struct SerialLink {
    ring: Arc<(Mutex<ByteRing>, Condvar)>,
    writer: Box<dyn Write + Send>,
}

impl SerialLink {
    pub fn new(mut reader: impl Read + Send + 'static,
               writer: impl Write + Send + 'static) -> SerialLink {
        let ring = Arc::new((Mutex::new(ByteRing {
            buf: VecDeque::new(),
            closed: false,
        }), Condvar::new()));
        let ring2 = ring.clone();
        thread::spawn(move || {
            let mut byte = [0u8; 1];
            loop {
                match reader.read(&mut byte) {
                    Ok(0) | Err(_) => {
                        let (lock, cvar) = &*ring2;
                        lock.lock().unwrap().closed = true;
                        cvar.notify_all();
                        return;
                    },
                    Ok(_) => {
                        let (lock, cvar) = &*ring2;
                        lock.lock().unwrap().buf.push_back(byte[0]);
                        cvar.notify_all();
                    }
                }
            }
        });
        SerialLink { ring, writer: Box::new(writer) }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), CanonicalError> {
        self.writer.write_all(bytes).map_err(
            |e| failed_precondition_error(
                format!("focuser write failed: {}", e).as_str()))?;
        self.writer.flush().map_err(
            |e| failed_precondition_error(
                format!("focuser flush failed: {}", e).as_str()))
    }

    /// Next buffered byte, waiting up to `timeout`. Ok(None) on timeout.
    pub fn read_byte(&self, timeout: Duration) -> Result<Option<u8>, CanonicalError> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.ring;
        let mut ring = lock.lock().unwrap();
        loop {
            if let Some(b) = ring.buf.pop_front() {
                return Ok(Some(b));
            }
            if ring.closed {
                return Err(failed_precondition_error("focuser link closed"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _timeout_result) =
                cvar.wait_timeout(ring, deadline - now).unwrap();
            ring = guard;
        }
    }

    pub fn flush_input(&self) {
        let (lock, _) = &*self.ring;
        let mut ring = lock.lock().unwrap();
        if !ring.buf.is_empty() {
            info!("Flushing {} stale bytes from focuser link", ring.buf.len());
            ring.buf.clear();
        }
    }
}

/// Opens a serial device in raw mode at the given baud rate.
pub fn open_serial(path: &str, baud: u32) -> Result<SerialLink, CanonicalError> {
    use nix::sys::termios::{self, BaudRate, SetArg};

    let file = OpenOptions::new().read(true).write(true).open(path).map_err(
        |e| failed_precondition_error(
            format!("cannot open {}: {}", path, e).as_str()))?;
    let baud = match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _ => return Err(invalid_argument_error(
            format!("unsupported baud rate {}", baud).as_str())),
    };
    let mut termios = termios::tcgetattr(file.as_fd()).map_err(
        |e| failed_precondition_error(
            format!("tcgetattr failed: {}", e).as_str()))?;
    termios::cfmakeraw(&mut termios);
    termios::cfsetispeed(&mut termios, baud).map_err(
        |e| failed_precondition_error(format!("set input speed: {}", e).as_str()))?;
    termios::cfsetospeed(&mut termios, baud).map_err(
        |e| failed_precondition_error(format!("set output speed: {}", e).as_str()))?;
    termios::tcsetattr(file.as_fd(), SetArg::TCSAFLUSH, &termios).map_err(
        |e| failed_precondition_error(
            format!("tcsetattr failed: {}", e).as_str()))?;
    let reader = file.try_clone().map_err(
        |e| failed_precondition_error(
            format!("cannot clone serial fd: {}", e).as_str()))?;
    Ok(SerialLink::new(reader, file))
}

// Nibble prefixes of the packet protocol.
const PREFIX_MSGTYPE: u8 = 5;
const PREFIX_SEQ: u8 = 6;
const PREFIX_BYTE: u8 = 4;
const PREFIX_LONG: u8 = 2;
const PREFIX_EOM: u8 = 3;

// Message kinds.
const MSG_MOVE: u8 = 0;
const MSG_QUERY: u8 = 1;
const MSG_CURPOS: u8 = 3;

fn pack_byte(prefix: u8, data: u8) -> u8 {
    (prefix << 4) | (data & 0x0f)
}

#[derive(Debug, PartialEq, Eq)]
struct PacketReply {
    kind: u8,
    seq: u8,
    byte1: u8,
    word: Option<i16>,
}

/// Focuser speaking the 4-bit-nibble packet protocol. A MOVE carries a
/// signed 16-bit relative tick count; CURPOS replies report the encoder.
/// Each request carries a 4-bit sequence number echoed in the reply.
pub struct PacketFocuser {
    link: SerialLink,
    next_seq: u8,
}

impl PacketFocuser {
    pub fn new(link: SerialLink) -> Self {
        PacketFocuser { link, next_seq: 4 }
    }

    fn send_request(&mut self, kind: u8, word: Option<i16>)
                    -> Result<u8, CanonicalError> {
        let seq = self.next_seq & 0x0f;
        self.next_seq = (self.next_seq + 1) & 0x0f;
        let mut msg = vec![
            pack_byte(PREFIX_MSGTYPE, kind),
            pack_byte(PREFIX_SEQ, seq),
            pack_byte(PREFIX_BYTE, 0),
        ];
        if let Some(word) = word {
            let w = word as u16;
            msg.push(pack_byte(PREFIX_LONG, ((w & 0xf000) >> 12) as u8));
            msg.push(pack_byte(PREFIX_LONG, ((w & 0x0f00) >> 8) as u8));
            msg.push(pack_byte(PREFIX_LONG, ((w & 0x00f0) >> 4) as u8));
            msg.push(pack_byte(PREFIX_LONG, (w & 0x000f) as u8));
        }
        msg.push(pack_byte(PREFIX_EOM, PREFIX_EOM));
        self.link.write_all(&msg)?;
        Ok(seq)
    }

    fn read_nibble(&self, timeout: Duration) -> Result<(u8, u8), CanonicalError> {
        match self.link.read_byte(timeout)? {
            Some(b) => Ok(((b & 0xf0) >> 4, b & 0x0f)),
            None => Err(deadline_exceeded_error("focuser reply timeout")),
        }
    }

    fn read_reply(&self, timeout: Duration) -> Result<PacketReply, CanonicalError> {
        let bad = |what: &str| invalid_argument_error(
            format!("ill-formed focuser reply: {}", what).as_str());
        let (prefix, kind) = self.read_nibble(timeout)?;
        if prefix != PREFIX_MSGTYPE {
            return Err(bad("expected message type"));
        }
        let (prefix, seq) = self.read_nibble(timeout)?;
        if prefix != PREFIX_SEQ {
            return Err(bad("expected sequence"));
        }
        let (prefix, byte1) = self.read_nibble(timeout)?;
        if prefix != PREFIX_BYTE {
            return Err(bad("expected byte field"));
        }
        let word = if kind == MSG_CURPOS {
            let mut fullword: u16 = 0;
            for _ in 0..4 {
                let (prefix, nibble) = self.read_nibble(timeout)?;
                if prefix != PREFIX_LONG {
                    return Err(bad("expected word nibble"));
                }
                fullword = (fullword << 4) | nibble as u16;
            }
            Some(fullword as i16)
        } else {
            None
        };
        let (prefix, _) = self.read_nibble(timeout)?;
        if prefix != PREFIX_EOM {
            return Err(bad("expected end of message"));
        }
        Ok(PacketReply { kind, seq, byte1, word })
    }

    /// Queries the encoder, skipping replies whose sequence number does not
    /// match ours.
    fn query_position(&mut self) -> Result<i64, CanonicalError> {
        self.link.flush_input();
        let seq = self.send_request(MSG_QUERY, None)?;
        loop {
            let reply = self.read_reply(Duration::from_secs(5))?;
            if reply.seq != seq {
                warn!("Focuser reply seq {} does not match {}; skipping",
                      reply.seq, seq);
                continue;
            }
            if reply.kind != MSG_CURPOS {
                return Err(invalid_argument_error(
                    format!("unexpected focuser reply kind {}", reply.kind)
                        .as_str()));
            }
            return Ok(reply.word.unwrap() as i64);
        }
    }
}

/// Polls `position` until it stabilizes, or gives up after the idle budget
/// and returns the last observed position.
fn wait_for_stop(focuser: &mut dyn Focuser) -> Result<i64, CanonicalError> {
    let mut last = focuser.position()?;
    let mut stable_polls = 0;
    for _ in 0..MOVE_IDLE_POLLS {
        thread::sleep(MOVE_POLL_INTERVAL);
        let position = focuser.position()?;
        if (position - last).abs() <= POSITION_TOLERANCE {
            stable_polls += 1;
            if stable_polls >= 2 {
                return Ok(position);
            }
        } else {
            stable_polls = 0;
        }
        last = position;
    }
    warn!("Focuser move did not settle; reporting position {}", last);
    Ok(last)
}

impl Focuser for PacketFocuser {
    fn move_to(&mut self, ticks: i64, move_type: FocusMoveType)
               -> Result<i64, CanonicalError> {
        let current = self.query_position()?;
        let delta = match move_type {
            FocusMoveType::Absolute => ticks - current,
            FocusMoveType::Relative => ticks,
        };
        if delta == 0 {
            return Ok(current);
        }
        if !(-32768..=32767).contains(&delta) {
            return Err(invalid_argument_error(
                format!("focuser move {} out of range", delta).as_str()));
        }
        let seq = self.send_request(MSG_MOVE, Some(delta as i16))?;
        // The move acknowledgment echoes our sequence number; its byte
        // field is the controller's command status.
        loop {
            let reply = self.read_reply(Duration::from_secs(5))?;
            if reply.seq == seq {
                if reply.byte1 != 0 {
                    warn!("Focuser move status = {}", reply.byte1);
                }
                break;
            }
        }
        wait_for_stop(self)
    }

    fn position(&mut self) -> Result<i64, CanonicalError> {
        self.query_position()
    }
}

/// Focuser speaking the text JSON protocol: requests wrapped in
/// `{"req":{"get"|"set"|"cmd":{...}}}` with matching `{"res":...}`.
pub struct JsonFocuser {
    link: SerialLink,
    last_position: i64,
}

impl JsonFocuser {
    pub fn new(link: SerialLink) -> Self {
        JsonFocuser { link, last_position: 0 }
    }

    /// Reads one brace-balanced JSON response, quote-aware, dropping
    /// newlines outside quotes.
    fn read_response(&self) -> Result<serde_json::Value, CanonicalError> {
        let mut buffer = Vec::new();
        let mut bracket_count = 0i32;
        let mut in_quote = false;
        let mut started = false;
        loop {
            let c = match self.link.read_byte(Duration::from_secs(30))? {
                Some(c) => c,
                None => return Err(deadline_exceeded_error(
                    "focuser JSON reply timeout")),
            };
            if !in_quote {
                if c == b'{' {
                    bracket_count += 1;
                    started = true;
                }
                if c == b'}' {
                    bracket_count -= 1;
                }
            }
            if (c != b'\n' && c != b'\r' && c != 0) || in_quote {
                buffer.push(c);
            }
            if c == b'"' {
                in_quote = !in_quote;
            }
            if started && bracket_count == 0 {
                break;
            }
        }
        serde_json::from_slice(&buffer).map_err(
            |e| invalid_argument_error(
                format!("bad focuser JSON: {}", e).as_str()))
    }

    fn transact(&mut self, request: &serde_json::Value)
                -> Result<serde_json::Value, CanonicalError> {
        self.link.flush_input();
        self.link.write_all(request.to_string().as_bytes())?;
        self.read_response()
    }

    fn get_number(&mut self, response: &serde_json::Value, path: &[&str])
                  -> Result<f64, CanonicalError> {
        let mut node = response;
        for key in path {
            node = node.get(key).ok_or_else(|| invalid_argument_error(
                format!("focuser JSON missing {}", key).as_str()))?;
        }
        node.as_f64().ok_or_else(
            || invalid_argument_error("focuser JSON field not a number"))
    }

    fn read_position(&mut self) -> Result<i64, CanonicalError> {
        let request = json!({"req": {"get": {"MOT1": {"POSITION": ""}}}});
        let response = self.transact(&request)?;
        let position =
            self.get_number(&response, &["res", "get", "MOT1", "POSITION"])?;
        self.last_position = position as i64;
        Ok(position as i64)
    }

    fn busy(&mut self) -> Result<bool, CanonicalError> {
        let request = json!({"req": {"get": {"MOT1": {"STATUS": {"BUSY": ""}}}}});
        let response = self.transact(&request)?;
        let busy =
            self.get_number(&response, &["res", "get", "MOT1", "STATUS", "BUSY"])?;
        Ok(busy != 0.0)
    }
}

impl Focuser for JsonFocuser {
    fn move_to(&mut self, ticks: i64, move_type: FocusMoveType)
               -> Result<i64, CanonicalError> {
        let target = match move_type {
            FocusMoveType::Absolute => ticks,
            FocusMoveType::Relative => self.read_position()? + ticks,
        };
        let request = json!({"req": {"cmd": {"MOT1": {"GOTO": target.to_string()}}}});
        let _ = self.transact(&request)?;
        let deadline = Instant::now()
            + MOVE_POLL_INTERVAL * MOVE_IDLE_POLLS;
        loop {
            match self.busy() {
                Ok(false) => break,
                Ok(true) => (),
                Err(e) => {
                    warn!("Focuser busy poll failed: {}", e.message);
                }
            }
            if Instant::now() >= deadline {
                warn!("Focuser move did not settle; reporting position {}",
                      self.last_position);
                return Ok(self.last_position);
            }
            thread::sleep(MOVE_POLL_INTERVAL);
        }
        self.read_position()
    }

    fn position(&mut self) -> Result<i64, CanonicalError> {
        self.read_position()
    }
}

/// Instant-motion focuser used by tests and --sim servers.
pub struct SimFocuser {
    position: i64,
}

impl SimFocuser {
    pub fn new(position: i64) -> Self {
        SimFocuser { position }
    }
}

impl Focuser for SimFocuser {
    fn move_to(&mut self, ticks: i64, move_type: FocusMoveType)
               -> Result<i64, CanonicalError> {
        self.position = match move_type {
            FocusMoveType::Absolute => ticks,
            FocusMoveType::Relative => self.position + ticks,
        };
        Ok(self.position)
    }

    fn position(&mut self) -> Result<i64, CanonicalError> {
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    // The emulators answer over a loopback TCP pair standing in for the
    // serial port.
    fn link_pair() -> (SerialLink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (device, _) = listener.accept().unwrap();
        let link = SerialLink::new(client.try_clone().unwrap(), client);
        (link, device)
    }

    fn spawn_packet_device(mut device: TcpStream, position: i16) {
        thread::spawn(move || {
            let mut byte = [0u8; 1];
            let mut message = Vec::new();
            loop {
                match device.read(&mut byte) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => message.push(byte[0]),
                }
                if (byte[0] & 0xf0) >> 4 != PREFIX_EOM {
                    continue;
                }
                let kind = message[0] & 0x0f;
                let seq = message[1] & 0x0f;
                message.clear();
                // Reply CURPOS to both QUERY and MOVE, echoing the
                // sequence number.
                let w = position as u16;
                let reply = vec![
                    pack_byte(PREFIX_MSGTYPE, MSG_CURPOS),
                    pack_byte(PREFIX_SEQ, seq),
                    pack_byte(PREFIX_BYTE, 0),
                    pack_byte(PREFIX_LONG, ((w & 0xf000) >> 12) as u8),
                    pack_byte(PREFIX_LONG, ((w & 0x0f00) >> 8) as u8),
                    pack_byte(PREFIX_LONG, ((w & 0x00f0) >> 4) as u8),
                    pack_byte(PREFIX_LONG, (w & 0x000f) as u8),
                    pack_byte(PREFIX_EOM, PREFIX_EOM),
                ];
                let _ = device.write_all(&reply);
                let _ = kind;
            }
        });
    }

    #[test]
    fn test_packet_position_query() {
        let (link, device) = link_pair();
        spawn_packet_device(device, 1234);
        let mut focuser = PacketFocuser::new(link);
        assert_eq!(focuser.position().unwrap(), 1234);
    }

    #[test]
    fn test_packet_negative_position() {
        let (link, device) = link_pair();
        spawn_packet_device(device, -250);
        let mut focuser = PacketFocuser::new(link);
        assert_eq!(focuser.position().unwrap(), -250);
    }

    fn spawn_json_device(mut device: TcpStream, position: std::sync::Arc<Mutex<i64>>) {
        thread::spawn(move || {
            let mut byte = [0u8; 1];
            let mut buffer = Vec::new();
            let mut depth = 0i32;
            loop {
                match device.read(&mut byte) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        if byte[0] == b'{' {
                            depth += 1;
                        }
                        if byte[0] == b'}' {
                            depth -= 1;
                        }
                        buffer.push(byte[0]);
                    }
                }
                if depth != 0 || buffer.is_empty() {
                    continue;
                }
                let request: serde_json::Value =
                    serde_json::from_slice(&buffer).unwrap();
                buffer.clear();
                let response = if let Some(goto) =
                    request.pointer("/req/cmd/MOT1/GOTO")
                {
                    let target: i64 =
                        goto.as_str().unwrap().parse().unwrap();
                    *position.lock().unwrap() = target;
                    json!({"res": {"cmd": {"MOT1": {"GOTO": "done"}}}})
                } else if request.pointer("/req/get/MOT1/STATUS/BUSY").is_some() {
                    json!({"res": {"get": {"MOT1": {"STATUS": {"BUSY": 0}}}}})
                } else {
                    let p = *position.lock().unwrap();
                    json!({"res": {"get": {"MOT1": {"POSITION": p}}}})
                };
                let mut bytes = response.to_string().into_bytes();
                bytes.extend_from_slice(b"\r\n");
                let _ = device.write_all(&bytes);
            }
        });
    }

    #[test]
    fn test_json_position_and_move() {
        let (link, device) = link_pair();
        let position = std::sync::Arc::new(Mutex::new(190000i64));
        spawn_json_device(device, position.clone());
        let mut focuser = JsonFocuser::new(link);
        assert_eq!(focuser.position().unwrap(), 190000);
        let final_pos = focuser.move_to(191000, FocusMoveType::Absolute).unwrap();
        assert_eq!(final_pos, 191000);
        let final_pos = focuser.move_to(-500, FocusMoveType::Relative).unwrap();
        assert_eq!(final_pos, 190500);
    }

}  // mod tests.
