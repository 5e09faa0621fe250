// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};

use canonical_error::CanonicalErrorCode;
use log::{info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::focuser::{FocusMoveType, Focuser};
use crate::message::{CameraMessage, CommandCode, Message, read_message_async,
                     write_message_async};

/// Which installed focuser a request names. A scope can carry one or two
/// (coarse moves the mirror, fine moves a motorized drawtube).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocuserSelect {
    Coarse,
    Fine,
}

pub struct ScopeServerState {
    coarse: Option<Mutex<Box<dyn Focuser>>>,
    fine: Option<Mutex<Box<dyn Focuser>>>,
    shutdown: tokio::sync::Notify,
}

impl ScopeServerState {
    pub fn new(coarse: Option<Box<dyn Focuser>>,
               fine: Option<Box<dyn Focuser>>) -> Self {
        ScopeServerState {
            coarse: coarse.map(Mutex::new),
            fine: fine.map(Mutex::new),
            shutdown: tokio::sync::Notify::new(),
        }
    }

    pub fn num_focusers(&self) -> u32 {
        self.coarse.is_some() as u32 + self.fine.is_some() as u32
    }

    fn select(&self, which: FocuserSelect) -> Option<&Mutex<Box<dyn Focuser>>> {
        match which {
            FocuserSelect::Coarse => self.coarse.as_ref().or(self.fine.as_ref()),
            FocuserSelect::Fine => self.fine.as_ref().or(self.coarse.as_ref()),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

pub async fn run_server(state: Arc<ScopeServerState>, listener: TcpListener) {
    info!("Waiting for connection on {:?}", listener.local_addr());
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!("Connection established from {}", addr);
                        let state = state.clone();
                        tokio::spawn(async move {
                            serve_connection(state, stream).await;
                        });
                    },
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                }
            },
            _ = state.shutdown.notified() => {
                info!("Scope server shutting down");
                return;
            }
        }
    }
}

async fn serve_connection(state: Arc<ScopeServerState>, mut stream: TcpStream) {
    loop {
        let message = match read_message_async(&mut stream).await {
            Ok(m) => m,
            Err(e) if e.code == CanonicalErrorCode::InvalidArgument => {
                warn!("Dropping malformed message: {}", e.message);
                continue;
            },
            Err(e) => {
                info!("Closing connection: {}", e.message);
                return;
            }
        };
        let cm = match message {
            Message::Camera(cm) => cm,
            Message::Fits(_) => {
                warn!("Bad inbound message type");
                continue;
            }
        };
        let keep_going = match cm.command {
            CommandCode::Focus => handle_focus_move(&state, &mut stream, &cm).await,
            CommandCode::FocusQuery | CommandCode::Status =>
                handle_focus_query(&state, &mut stream, &cm).await,
            CommandCode::Shutdown => {
                info!("Shutdown requested by client");
                state.request_shutdown();
                false
            },
            other => {
                warn!("scope_server: unrecognized command: {:?}", other);
                true
            }
        };
        if !keep_going {
            return;
        }
    }
}

fn selected_focuser(cm: &CameraMessage) -> FocuserSelect {
    match cm.value_str("FOCUSER") {
        Some("F") => FocuserSelect::Fine,
        _ => FocuserSelect::Coarse,
    }
}

async fn handle_focus_move(state: &Arc<ScopeServerState>, stream: &mut TcpStream,
                           cm: &CameraMessage) -> bool {
    let ticks = match cm.value_i64("TICKS") {
        Some(ticks) => ticks,
        None => {
            warn!("FOCUS without TICKS keyword");
            return true;
        }
    };
    let move_type = match cm.value_str("MOVE_TYPE") {
        Some("ABS") => FocusMoveType::Absolute,
        _ => FocusMoveType::Relative,
    };
    let which = selected_focuser(cm);
    let result = match state.select(which) {
        Some(focuser) => {
            // The move blocks until the position settles.
            tokio::task::block_in_place(|| {
                focuser.lock().unwrap().move_to(ticks, move_type)
            })
        },
        None => {
            warn!("No focuser installed");
            return true;
        }
    };
    let mut reply = CameraMessage::new(CommandCode::Status);
    reply.unique_id = cm.unique_id;
    match result {
        Ok(position) => {
            reply.set_keyword("FOCUS_POSITION", &position.to_string());
        },
        Err(e) => {
            warn!("Focuser move failed: {}", e.message);
            reply.set_keyword("FOCUS_ERROR", &e.message);
        }
    }
    send(stream, reply).await
}

async fn handle_focus_query(state: &Arc<ScopeServerState>, stream: &mut TcpStream,
                            cm: &CameraMessage) -> bool {
    let which = selected_focuser(cm);
    let mut reply = CameraMessage::new(CommandCode::Status);
    reply.unique_id = cm.unique_id;
    reply.set_keyword("NUM_FOCUSERS", &state.num_focusers().to_string());
    if let Some(focuser) = state.select(which) {
        match tokio::task::block_in_place(|| focuser.lock().unwrap().position()) {
            Ok(position) => {
                reply.set_keyword("FOCUS_POSITION", &position.to_string());
            },
            Err(e) => {
                warn!("Focuser query failed: {}", e.message);
                reply.set_keyword("FOCUS_ERROR", &e.message);
            }
        }
    }
    send(stream, reply).await
}

async fn send(stream: &mut TcpStream, reply: CameraMessage) -> bool {
    match write_message_async(stream, &Message::Camera(reply)).await {
        Ok(()) => true,
        Err(e) => {
            warn!("{}", e.message);
            false
        }
    }
}

/// Client-side helper for the focus commands, shared by set_focus and the
/// orchestrator's focuser proxy.
pub mod client {
    use std::net::TcpStream;

    use canonical_error::{CanonicalError, failed_precondition_error};

    use crate::focuser::{FocusMoveType, Focuser};
    use crate::message::{CameraMessage, CommandCode, Message, read_message,
                         write_message};
    use super::FocuserSelect;

    /// Drives a remote focuser through the scope server, presenting the
    /// same Focuser capability the local backends do.
    pub struct RemoteFocuser {
        stream: TcpStream,
        which: FocuserSelect,
        next_unique_id: u8,
    }

    impl RemoteFocuser {
        pub fn connect(addr: &str, which: FocuserSelect)
                       -> Result<RemoteFocuser, CanonicalError> {
            let stream = TcpStream::connect(addr).map_err(
                |e| failed_precondition_error(
                    format!("cannot connect to scope server at {}: {}",
                            addr, e).as_str()))?;
            Ok(RemoteFocuser { stream, which, next_unique_id: 0 })
        }

        fn transact(&mut self, mut cm: CameraMessage)
                    -> Result<CameraMessage, CanonicalError> {
            self.next_unique_id = self.next_unique_id.wrapping_add(1);
            cm.unique_id = self.next_unique_id;
            cm.set_keyword("FOCUSER", match self.which {
                FocuserSelect::Coarse => "C",
                FocuserSelect::Fine => "F",
            });
            write_message(&mut self.stream, &Message::Camera(cm))?;
            loop {
                match read_message(&mut self.stream)? {
                    Message::Camera(reply)
                        if reply.unique_id == self.next_unique_id =>
                        return Ok(reply),
                    _ => continue,
                }
            }
        }

        fn position_from(reply: &CameraMessage) -> Result<i64, CanonicalError> {
            if let Some(err) = reply.value_str("FOCUS_ERROR") {
                return Err(failed_precondition_error(err));
            }
            reply.value_i64("FOCUS_POSITION").ok_or_else(
                || failed_precondition_error("focus reply without position"))
        }
    }

    impl Focuser for RemoteFocuser {
        fn move_to(&mut self, ticks: i64, move_type: FocusMoveType)
                   -> Result<i64, CanonicalError> {
            let mut cm = CameraMessage::new(CommandCode::Focus);
            cm.set_keyword("TICKS", &ticks.to_string());
            cm.set_keyword("MOVE_TYPE", match move_type {
                FocusMoveType::Absolute => "ABS",
                FocusMoveType::Relative => "REL",
            });
            let reply = self.transact(cm)?;
            Self::position_from(&reply)
        }

        fn position(&mut self) -> Result<i64, CanonicalError> {
            let cm = CameraMessage::new(CommandCode::FocusQuery);
            let reply = self.transact(cm)?;
            Self::position_from(&reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focuser::SimFocuser;

    async fn start_test_server() -> std::net::SocketAddr {
        let state = Arc::new(ScopeServerState::new(
            Some(Box::new(SimFocuser::new(5000))),
            Some(Box::new(SimFocuser::new(120000)))));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            run_server(state, listener).await;
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_focuser_moves() {
        let addr = start_test_server().await;
        let position = tokio::task::spawn_blocking(move || {
            let mut focuser = client::RemoteFocuser::connect(
                &addr.to_string(), FocuserSelect::Coarse).unwrap();
            assert_eq!(focuser.position().unwrap(), 5000);
            focuser.move_to(250, FocusMoveType::Relative).unwrap();
            focuser.move_to(4000, FocusMoveType::Absolute).unwrap()
        }).await.unwrap();
        assert_eq!(position, 4000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fine_focuser_selected() {
        let addr = start_test_server().await;
        let position = tokio::task::spawn_blocking(move || {
            let mut focuser = client::RemoteFocuser::connect(
                &addr.to_string(), FocuserSelect::Fine).unwrap();
            focuser.position().unwrap()
        }).await.unwrap();
        assert_eq!(position, 120000);
    }

}  // mod tests.
