// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{info, warn};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

// Two special files in the runtime directory: one holds the most recent
// image filename (or a control word like "abort"), the other the single
// PID of the process that wants to be told when it changes. Writers take
// an exclusive advisory lock on the lock file; readers take a shared one,
// so a PID we read is a PID and a filename is never sliced in half by a
// concurrent write. After writing, the notifier sends SIGUSR1 to the
// stored PID.

const PID_FILENAME: &str = "ASTRO_image_monitor.pid";
const MESSAGE_FILENAME: &str = "ASTRO_last_image.filename";
const LOCK_FILENAME: &str = "ASTRO_notification_lock";

const NOTIFY_SIG: Signal = Signal::SIGUSR1;

static NOTIFY_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn notify_handler(_: i32) {
    // Signal context: only the flag is touched; consumers poll it.
    NOTIFY_FLAG.store(true, Ordering::Relaxed);
}

pub struct NotifyMailbox {
    dir: PathBuf,
}

impl NotifyMailbox {
    pub fn new(dir: &Path) -> Result<NotifyMailbox, CanonicalError> {
        std::fs::create_dir_all(dir).map_err(
            |e| failed_precondition_error(
                format!("cannot create runtime dir {:?}: {}", dir, e).as_str()))?;
        Ok(NotifyMailbox { dir: dir.to_path_buf() })
    }

    /// NIGHTWATCH_RUN_DIR, or /var/tmp/nightwatch.
    pub fn default_runtime_dir() -> PathBuf {
        std::env::var("NIGHTWATCH_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/tmp/nightwatch"))
    }

    fn take_lock(&self, arg: FlockArg) -> Result<Flock<File>, CanonicalError> {
        let file = File::create(self.dir.join(LOCK_FILENAME)).map_err(
            |e| failed_precondition_error(
                format!("cannot open notification lock file: {}", e).as_str()))?;
        Flock::lock(file, arg).map_err(
            |(_, e)| failed_precondition_error(
                format!("flock failed: {}", e).as_str()))
    }

    /// Registers the calling process as the notification consumer: stores
    /// our PID and installs the signal handler that sets the poll flag.
    pub fn register(&self) -> Result<(), CanonicalError> {
        let action = SigAction::new(SigHandler::Handler(notify_handler),
                                    SaFlags::empty(), SigSet::empty());
        unsafe {
            signal::sigaction(NOTIFY_SIG, &action).map_err(
                |e| failed_precondition_error(
                    format!("sigaction failed: {}", e).as_str()))?;
        }
        let lock = self.take_lock(FlockArg::LockExclusive)?;
        std::fs::write(self.dir.join(PID_FILENAME),
                       format!("{}\n", std::process::id())).map_err(
            |e| failed_precondition_error(
                format!("cannot write PID file: {}", e).as_str()))?;
        drop(lock);
        info!("Registered PID {} for notifications", std::process::id());
        Ok(())
    }

    /// Writes `message` into the mailbox and signals the registered
    /// consumer, if any.
    pub fn post(&self, message: &str) -> Result<(), CanonicalError> {
        let lock = self.take_lock(FlockArg::LockExclusive)?;
        std::fs::write(self.dir.join(MESSAGE_FILENAME), message).map_err(
            |e| failed_precondition_error(
                format!("cannot write mailbox file: {}", e).as_str()))?;
        let pid = match std::fs::read_to_string(self.dir.join(PID_FILENAME)) {
            Ok(text) => text.trim().parse::<i32>().ok(),
            Err(_) => None,
        };
        drop(lock);
        if let Some(pid) = pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid), NOTIFY_SIG) {
                warn!("Cannot signal PID {}: {}", pid, e);
            }
        }
        Ok(())
    }

    /// Current mailbox content, first line only.
    pub fn read_current(&self) -> Result<Option<String>, CanonicalError> {
        let path = self.dir.join(MESSAGE_FILENAME);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };
        let lock = self.take_lock(FlockArg::LockShared)?;
        let mut content = String::new();
        file.read_to_string(&mut content).map_err(
            |e| failed_precondition_error(
                format!("cannot read mailbox file: {}", e).as_str()))?;
        drop(lock);
        Ok(Some(content.lines().next().unwrap_or("").to_string()))
    }

    /// Non-blocking poll: when a notification arrived since the last call,
    /// clears the flag and returns the mailbox content.
    pub fn take_notification(&self) -> Option<String> {
        if !NOTIFY_FLAG.swap(false, Ordering::Relaxed) {
            return None;
        }
        match self.read_current() {
            Ok(message) => message,
            Err(e) => {
                warn!("Notification arrived but mailbox unreadable: {}",
                      e.message);
                None
            }
        }
    }
}

/// Writes the name of a finished image into the mailbox (camera clients
/// call this after every exposure completes locally).
pub fn notify_new_image(mailbox: &NotifyMailbox, filename: &Path) {
    if let Err(e) = mailbox.post(&filename.to_string_lossy()) {
        warn!("Image notification failed: {}", e.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn test_mailbox(tag: &str) -> NotifyMailbox {
        let dir = std::env::temp_dir().join(
            format!("nightwatch_notify_{}_{}", tag, std::process::id()));
        NotifyMailbox::new(&dir).unwrap()
    }

    #[test]
    fn test_post_and_read() {
        let mailbox = test_mailbox("rw");
        mailbox.post("/images/image042.fits").unwrap();
        assert_eq!(mailbox.read_current().unwrap().unwrap(),
                   "/images/image042.fits");
    }

    #[test]
    fn test_signal_driven_notification() {
        let mailbox = test_mailbox("sig");
        mailbox.register().unwrap();
        assert_eq!(mailbox.take_notification(), None);
        // Post sends SIGUSR1 to the registered PID (ourselves).
        mailbox.post("abort").unwrap();
        // Delivery is asynchronous; poll briefly.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut message = None;
        while Instant::now() < deadline {
            message = mailbox.take_notification();
            if message.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(message.as_deref(), Some("abort"));
        // The flag is one-shot.
        assert_eq!(mailbox.take_notification(), None);
    }

}  // mod tests.
