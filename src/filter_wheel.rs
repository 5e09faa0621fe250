// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use log::{info, warn};

use crate::focuser::{SerialLink, open_serial};

/// Uniform operations over an opaque filter wheel backend. Motion is
/// commanded by writing a single ASCII digit; the wheel reports its
/// position asynchronously, so `current_slot` must be polled.
pub trait FilterWheel: Send {
    /// Starts (possibly lengthy) wheel initialization without blocking.
    fn begin_init(&mut self) -> Result<(), CanonicalError>;

    /// Blocks until initialization completes; returns the slot count.
    fn finish_init(&mut self) -> Result<u32, CanonicalError>;

    /// Commands motion toward `slot` and returns immediately.
    fn move_to(&mut self, slot: u32) -> Result<(), CanonicalError>;

    /// Most recently reported position, or None while no report has
    /// arrived since the last move command.
    fn current_slot(&mut self) -> Result<Option<u32>, CanonicalError>;
}

/// Maps single-letter filter requests (e.g. `V`) to wheel slots. The
/// configuration lists installed filters in slot order; `D` names the
/// dedicated dark slot when the wheel has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterBank {
    slots: Vec<char>,
}

pub const DARK_FILTER: char = 'D';

impl FilterBank {
    /// One filter letter per line, ordered by slot. Blank lines and lines
    /// starting with '#' are ignored.
    pub fn parse(text: &str) -> Result<FilterBank, CanonicalError> {
        let mut slots = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let letter = line.chars().next().unwrap();
            if !letter.is_ascii_alphabetic() {
                return Err(invalid_argument_error(
                    format!("bad filter name: {}", line).as_str()));
            }
            slots.push(letter);
        }
        Ok(FilterBank { slots })
    }

    pub fn default_bank() -> FilterBank {
        FilterBank { slots: vec!['L', 'R', 'V', 'B', 'I', 'H', DARK_FILTER] }
    }

    pub fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slot_for(&self, letter: char) -> Option<u32> {
        self.slots.iter().position(|&c| c == letter).map(|p| p as u32)
    }

    pub fn name_of(&self, slot: u32) -> Option<char> {
        self.slots.get(slot as usize).copied()
    }

    pub fn dark_slot(&self) -> Option<u32> {
        self.slot_for(DARK_FILTER)
    }

    /// Resolves a requested filter letter, falling back to slot 0 on an
    /// unknown letter (logged), matching the server's tolerance for bad
    /// requests.
    pub fn resolve(&self, letter: char) -> u32 {
        match self.slot_for(letter) {
            Some(slot) => slot,
            None => {
                warn!("Invalid filter request: '{}'", letter);
                0
            }
        }
    }
}

/// Staging slot for the anti-backlash approach: one step toward the
/// low-numbered side, except that slot 0 stages from slot 1. The highest
/// slot is therefore always approached from below.
pub fn staging_slot(target: u32) -> u32 {
    if target == 0 { 1 } else { target - 1 }
}

// The wheel takes this long after power-up before it will talk.
const WHEEL_STARTUP: Duration = Duration::from_secs(22);
// How long to wait for single-byte replies during init.
const INIT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Wheel on a USB serial bridge. Motion is commanded by writing a single
/// ASCII digit; the wheel echoes the digit when it arrives, which the
/// reader thread buffers for `current_slot` to poll.
pub struct SerialFilterWheel {
    link: SerialLink,
    startup: Duration,
    init_started: Option<Instant>,
    init_complete: bool,
    num_slots: u32,
    current_position: Option<u32>,
    in_move: bool,
}

impl SerialFilterWheel {
    pub fn open(device: &str) -> Result<SerialFilterWheel, CanonicalError> {
        Ok(Self::with_link(open_serial(device, 9600)?, WHEEL_STARTUP))
    }

    pub fn with_link(link: SerialLink, startup: Duration) -> SerialFilterWheel {
        SerialFilterWheel {
            link,
            startup,
            init_started: None,
            init_complete: false,
            num_slots: 0,
            current_position: None,
            in_move: false,
        }
    }

    fn await_byte(&self) -> Result<u8, CanonicalError> {
        match self.link.read_byte(INIT_REPLY_TIMEOUT)? {
            Some(b) => Ok(b),
            None => Err(failed_precondition_error("no reply from filter wheel")),
        }
    }
}

impl FilterWheel for SerialFilterWheel {
    fn begin_init(&mut self) -> Result<(), CanonicalError> {
        self.init_started = Some(Instant::now());
        Ok(())
    }

    fn finish_init(&mut self) -> Result<u32, CanonicalError> {
        if self.init_complete {
            return Ok(self.num_slots);
        }
        let started = match self.init_started {
            Some(started) => started,
            None => {
                self.begin_init()?;
                self.init_started.unwrap()
            }
        };
        // The wheel ignores us until its startup spin finishes.
        let elapsed = started.elapsed();
        if elapsed < self.startup {
            let to_go = self.startup - elapsed;
            info!("Filter wheel init: sleeping for {:?}", to_go);
            std::thread::sleep(to_go);
        }
        self.link.flush_input();
        // Command a move to slot 0; it completes quickly and proves the
        // wheel is listening.
        self.link.write_all(b"0")?;
        let reply = self.await_byte()?;
        if reply != b'0' {
            warn!("Filter wheel init: unexpected response 0x{:02x}", reply);
        }
        self.current_position = Some(0);

        // Fetch the slot count.
        self.link.flush_input();
        self.link.write_all(b"MXP")?;
        let reply = self.await_byte()?;
        if !reply.is_ascii_digit() {
            return Err(failed_precondition_error(
                format!("bad filter count reply 0x{:02x}", reply).as_str()));
        }
        self.num_slots = (reply - b'0') as u32 + 1;

        // Fetch the firmware version, 8 bytes.
        self.link.flush_input();
        self.link.write_all(b"VRS")?;
        let mut version = Vec::with_capacity(8);
        for _ in 0..8 {
            version.push(self.await_byte()?);
        }
        info!("CFW firmware version = {}", String::from_utf8_lossy(&version));

        self.link.flush_input();
        self.init_complete = true;
        Ok(self.num_slots)
    }

    fn move_to(&mut self, slot: u32) -> Result<(), CanonicalError> {
        if slot > 9 || (self.init_complete && slot >= self.num_slots) {
            return Err(invalid_argument_error(
                format!("invalid filter wheel index {}", slot).as_str()));
        }
        self.link.flush_input();
        self.link.write_all(&[b'0' + slot as u8])?;
        self.in_move = true;
        Ok(())
    }

    fn current_slot(&mut self) -> Result<Option<u32>, CanonicalError> {
        if self.in_move {
            // The wheel reports the digit back when the move completes.
            match self.link.read_byte(Duration::ZERO)? {
                Some(b) if b.is_ascii_digit() => {
                    self.current_position = Some((b - b'0') as u32);
                    self.in_move = false;
                },
                Some(b) => {
                    warn!("Filter wheel: unexpected byte 0x{:02x}", b);
                    return Ok(None);
                },
                None => return Ok(None),
            }
        }
        Ok(self.current_position)
    }
}

/// Simulated wheel: position reports become available a fixed number of
/// polls after a move is commanded.
pub struct SimFilterWheel {
    num_slots: u32,
    position: u32,
    target: u32,
    polls_until_arrival: u32,
    polls_per_move: u32,
    initialized: bool,
}

impl SimFilterWheel {
    pub fn new(num_slots: u32, polls_per_move: u32) -> Self {
        SimFilterWheel {
            num_slots,
            position: 0,
            target: 0,
            polls_until_arrival: 0,
            polls_per_move,
            initialized: false,
        }
    }
}

impl FilterWheel for SimFilterWheel {
    fn begin_init(&mut self) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn finish_init(&mut self) -> Result<u32, CanonicalError> {
        self.initialized = true;
        info!("Simulated CFW ready with {} slots", self.num_slots);
        Ok(self.num_slots)
    }

    fn move_to(&mut self, slot: u32) -> Result<(), CanonicalError> {
        if slot >= self.num_slots {
            return Err(invalid_argument_error(
                format!("invalid filter wheel index {}", slot).as_str()));
        }
        self.target = slot;
        self.polls_until_arrival = self.polls_per_move;
        Ok(())
    }

    fn current_slot(&mut self) -> Result<Option<u32>, CanonicalError> {
        if self.polls_until_arrival > 0 {
            self.polls_until_arrival -= 1;
            if self.polls_until_arrival == 0 {
                self.position = self.target;
            }
            return Ok(None);
        }
        Ok(Some(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_bank_parse() {
        let bank = FilterBank::parse("# installed filters\nL\nR\nV\nB\nD\n").unwrap();
        assert_eq!(bank.num_slots(), 5);
        assert_eq!(bank.slot_for('V'), Some(2));
        assert_eq!(bank.name_of(4), Some('D'));
        assert_eq!(bank.dark_slot(), Some(4));
        assert_eq!(bank.resolve('X'), 0);
    }

    #[test]
    fn test_staging_slot() {
        assert_eq!(staging_slot(0), 1);
        assert_eq!(staging_slot(1), 0);
        assert_eq!(staging_slot(6), 5);
    }

    #[test]
    fn test_serial_wheel_init_and_move() {
        use std::io::{Read, Write};
        use std::net::{TcpListener, TcpStream};

        // Loopback TCP pair stands in for the serial port; the emulator
        // answers move digits and the MXP/VRS queries.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut device, _) = listener.accept().unwrap();
        std::thread::spawn(move || {
            let mut byte = [0u8; 1];
            let mut command = Vec::new();
            loop {
                match device.read(&mut byte) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => (),
                }
                if byte[0].is_ascii_digit() {
                    command.clear();
                    // Echo the digit once the (instant) move completes.
                    let _ = device.write_all(&byte);
                    continue;
                }
                command.push(byte[0]);
                if command.ends_with(b"MXP") {
                    let _ = device.write_all(b"6");  // 7 slots
                    command.clear();
                } else if command.ends_with(b"VRS") {
                    let _ = device.write_all(b"20210901");
                    command.clear();
                }
            }
        });

        let link = SerialLink::new(client.try_clone().unwrap(), client);
        let mut wheel = SerialFilterWheel::with_link(link, Duration::ZERO);
        wheel.begin_init().unwrap();
        assert_eq!(wheel.finish_init().unwrap(), 7);
        assert_eq!(wheel.current_slot().unwrap(), Some(0));

        wheel.move_to(4).unwrap();
        // Poll until the completion byte arrives.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(slot) = wheel.current_slot().unwrap() {
                if slot == 4 {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "wheel never reported arrival");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(wheel.move_to(9).is_err());
    }

    #[test]
    fn test_sim_wheel_motion() {
        let mut wheel = SimFilterWheel::new(7, 3);
        wheel.begin_init().unwrap();
        assert_eq!(wheel.finish_init().unwrap(), 7);
        wheel.move_to(4).unwrap();
        assert_eq!(wheel.current_slot().unwrap(), None);
        assert_eq!(wheel.current_slot().unwrap(), None);
        assert_eq!(wheel.current_slot().unwrap(), None);
        assert_eq!(wheel.current_slot().unwrap(), Some(4));
        assert!(wheel.move_to(9).is_err());
    }

}  // mod tests.
