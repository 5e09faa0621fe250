// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;
use std::sync::{Arc, Mutex};

use canonical_error::{CanonicalError, CanonicalErrorCode,
                      failed_precondition_error};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::abstract_camera::AbstractCamera;
use crate::cooler::{Cooler, CoolerModeRequest};
use crate::exposure_engine::{ExposureEngine, ExposureRequest, ExposureState};
use crate::filter_wheel::FilterBank;
use crate::fits_image;
use crate::frame::Subframe;
use crate::message::{CameraMessage, CommandCode, FitsMessage, Message,
                     PixelFormat, read_message_async, write_message_async};
use crate::system_config::SystemConfig;

/// Everything the dispatcher needs, threaded through explicitly; no
/// process-wide singletons.
pub struct CcdServerState {
    pub camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>>,
    pub engine: ExposureEngine,
    pub cooler: Mutex<Cooler>,
    pub bank: Arc<Mutex<FilterBank>>,
    pub config: SystemConfig,
    shutdown: tokio::sync::Notify,
}

impl CcdServerState {
    pub fn new(camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>>,
               engine: ExposureEngine,
               cooler: Cooler,
               bank: Arc<Mutex<FilterBank>>,
               config: SystemConfig) -> Self {
        CcdServerState {
            camera,
            engine,
            cooler: Mutex::new(cooler),
            bank,
            config,
            shutdown: tokio::sync::Notify::new(),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Accept loop. Returns after a SHUTDOWN command or `request_shutdown`.
pub async fn run_server(state: Arc<CcdServerState>, listener: TcpListener) {
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
                        error!("Accept failed: {}", e);
                    }
                }
            },
            _ = state.shutdown.notified() => {
                info!("Server shutting down");
                state.cooler.lock().unwrap().stop();
                return;
            }
        }
    }
}

async fn serve_connection(state: Arc<CcdServerState>, mut stream: TcpStream) {
    loop {
        let message = match read_message_async(&mut stream).await {
            Ok(m) => m,
            Err(e) if e.code == CanonicalErrorCode::InvalidArgument => {
                // Protocol error within a well-framed message: drop it
                // without a reply; the caller will time out on a status
                // query.
                warn!("Dropping malformed message: {}", e.message);
                continue;
            },
            Err(e) => {
                // Transport error or sync loss: close the connection.
                info!("Closing connection: {}", e.message);
                return;
            }
        };
        let keep_going = match message {
            Message::Camera(cm) => handle_camera_message(&state, &mut stream, cm).await,
            Message::Fits(_) => {
                // We only originate these, never receive them.
                warn!("Bad inbound message type");
                true
            }
        };
        if !keep_going {
            return;
        }
    }
}

async fn handle_camera_message(state: &Arc<CcdServerState>,
                               stream: &mut TcpStream,
                               cm: CameraMessage) -> bool {
    match cm.command {
        CommandCode::Expose => handle_expose(state, stream, &cm).await,
        CommandCode::Cooler => {
            if cm.is_query() {
                return send_status(state, stream, Some(cm.unique_id)).await;
            }
            handle_cooler(state, &cm);
            // No response message at all.
            true
        },
        CommandCode::Status => send_status(state, stream, Some(cm.unique_id)).await,
        CommandCode::FilterConfig => handle_filter_config(state, stream, &cm).await,
        CommandCode::Shutdown => {
            info!("Shutdown requested by client");
            state.request_shutdown();
            false
        },
        CommandCode::Focus | CommandCode::FocusQuery => {
            warn!("Focus command sent to the camera server; ignoring");
            true
        },
    }
}

fn parse_expose(cm: &CameraMessage) -> Result<ExposureRequest, CanonicalError> {
    let exposure_secs = cm.value_f64("EXPOSURE").ok_or_else(
        || failed_precondition_error("EXPOSE without EXPOSURE keyword"))?;
    let mut req = ExposureRequest {
        exposure_secs,
        exposure_id: cm.unique_id,
        ..ExposureRequest::default()
    };
    if let Some((bottom, top, left, right)) = cm.subframe() {
        req.subframe = Subframe { top, bottom, left, right };
    }
    if let Some(bin) = cm.value_i64("BIN") {
        req.binning = bin.max(1) as u32;
    }
    if let Some(format) = cm.value_i64("PIXEL_FORMAT") {
        match PixelFormat::from_i64(format) {
            Some(f) => req.pixel_format = f,
            None => warn!("Bad PIXEL_FORMAT: {}", format),
        }
    }
    if let Some(mode) = cm.value_i64("MODE") {
        req.mode = mode;
    }
    if let Some(gain) = cm.value_i64("GAIN") {
        req.gain = gain;
    }
    if let Some(offset) = cm.value_i64("OFFSET") {
        req.offset = offset;
    }
    if let Some(usb) = cm.value_f64("USBTRAFFIC") {
        req.usb_traffic = usb;
    }
    req.compress = cm.value_bool("COMPRESS").unwrap_or(false);
    if let Some(open) = cm.value_bool("SHUTTER_OPEN") {
        req.shutter_open = open;
    }
    if let Some(filter) = cm.value_str("FILTER").and_then(|s| s.chars().next()) {
        req.filter = filter;
    }
    if let Some(name) = cm.value_str("IMAGE") {
        req.image_name = name.to_string();
    }
    Ok(req)
}

async fn handle_expose(state: &Arc<CcdServerState>, stream: &mut TcpStream,
                       cm: &CameraMessage) -> bool {
    info!("Received expose message");
    let req = match parse_expose(cm) {
        Ok(req) => req,
        Err(e) => {
            warn!("{}", e.message);
            return true;
        }
    };
    let product = match state.engine.run_exposure(&req).await {
        Ok(product) => product,
        Err(e) => {
            if e.code == CanonicalErrorCode::DeadlineExceeded
                && e.message.contains("CFW")
            {
                // Filter wheel timeout. Bad news.
                error!("Fatal timeout");
                std::process::exit(2);
            }
            // Best-effort status reply; no exception crosses the wire.
            error!("Exposure failed: {}", e.message);
            return send_status(state, stream, Some(cm.unique_id)).await;
        }
    };
    if product.image_name == "-" {
        let bytes = match fits_image::encode_fits(&product.frame, &product.header,
                                                  product.compress) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("FITS encode failed: {}", e.message);
                return send_status(state, stream, Some(cm.unique_id)).await;
            }
        };
        info!("Sending FITS message, length = {}", bytes.len());
        if let Err(e) = write_message_async(
            stream, &Message::Fits(FitsMessage { data: bytes })).await
        {
            warn!("{}", e.message);
            return false;
        }
        true
    } else {
        let path = product.image_name.clone();
        if let Err(e) = fits_image::write_fits(Path::new(&path), &product.frame,
                                               &product.header, product.compress) {
            error!("FITS write failed: {}", e.message);
        }
        let mut reply = build_status(state);
        reply.unique_id = cm.unique_id;
        reply.set_keyword("IMAGE", &path);
        send_message(stream, reply).await
    }
}

fn handle_cooler(state: &Arc<CcdServerState>, cm: &CameraMessage) {
    let mode = cm.value_str("COOLER_MODE").unwrap_or("");
    info!("handle_cooler_message: mode = {}", mode);
    let cooler = state.cooler.lock().unwrap();
    match mode {
        "OFF" => cooler.set_off(),
        "MANUAL" => {
            // Power level arrives as a fraction 0..1.
            let power = cm.value_f64("POWER").unwrap_or(0.0);
            cooler.set_manual((255.0 * power.clamp(0.0, 1.0)) as u8);
        },
        "SETPOINT" => {
            match cm.value_f64("SETPOINT") {
                Some(setpoint) => cooler.set_setpoint(setpoint),
                None => warn!("SETPOINT mode without SETPOINT keyword"),
            }
        },
        "" => warn!("Cooler mode missing from camera message"),
        other => warn!("Unknown cooler mode: {}", other),
    }
}

async fn handle_filter_config(state: &Arc<CcdServerState>,
                              stream: &mut TcpStream,
                              cm: &CameraMessage) -> bool {
    if !cm.is_query() {
        // Someone giving us info on installed filters.
        let mut slots = Vec::new();
        for n in 0.. {
            match cm.value_str(&format!("FILTER_{}", n))
                .and_then(|s| s.chars().next())
            {
                Some(letter) => slots.push(letter.to_string()),
                None => break,
            }
        }
        if !slots.is_empty() {
            match FilterBank::parse(&slots.join("\n")) {
                Ok(bank) => *state.bank.lock().unwrap() = bank,
                Err(e) => warn!("Bad filter config: {}", e.message),
            }
        }
    }
    let mut reply = CameraMessage::new(CommandCode::FilterConfig);
    reply.unique_id = cm.unique_id;
    {
        let bank = state.bank.lock().unwrap();
        for n in 0..bank.num_slots() {
            if let Some(letter) = bank.name_of(n) {
                reply.set_keyword(&format!("FILTER_{}", n), &letter.to_string());
            }
        }
    }
    send_message(stream, reply).await
}

/// Assembles the STATUS reply carrying camera and cooler fields.
pub fn build_status(state: &Arc<CcdServerState>) -> CameraMessage {
    let mut outbound = CameraMessage::new(CommandCode::Status);
    let cooler_status = state.cooler.lock().unwrap().status();
    let cooler_command = state.cooler.lock().unwrap().command();
    if cooler_status.pwm <= 0 {
        outbound.set_keyword("COOLER_MODE", "OFF");
    } else {
        outbound.set_keyword("COOLER_MODE",
                             match cooler_command.mode {
                                 CoolerModeRequest::Setpoint => "SETPOINT",
                                 _ => "MANUAL",
                             });
    }
    outbound.set_keyword("CCD_TEMP", &format!("{:.2}", cooler_status.chip_temp_c));
    outbound.set_keyword("AMBIENT_TEMP",
                         &format!("{:.2}", cooler_status.ambient_c.unwrap_or(99.9)));
    outbound.set_keyword("POWER",
                         &format!("{:.4}", cooler_status.pwm.max(0) as f64 / 256.0));
    outbound.set_keyword("HUMIDITY", &format!("{:.1}", cooler_status.humidity));
    outbound.set_keyword("SETPOINT", &format!("{}", cooler_command.setpoint_c));
    outbound.set_keyword("CAMERA_STATUS", match state.engine.state() {
        ExposureState::Exposing | ExposureState::WaitingForEnd => "EXPOSING",
        ExposureState::ReadyForReadout => "READOUT",
        _ => "IDLE",
    });
    outbound
}

async fn send_status(state: &Arc<CcdServerState>, stream: &mut TcpStream,
                     echo_id: Option<u8>) -> bool {
    let mut reply = build_status(state);
    if let Some(id) = echo_id {
        reply.unique_id = id;
    }
    send_message(stream, reply).await
}

async fn send_message(stream: &mut TcpStream, reply: CameraMessage) -> bool {
    match write_message_async(stream, &Message::Camera(reply)).await {
        Ok(()) => true,
        Err(e) => {
            warn!("{}", e.message);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;
    use crate::exposure_engine::EngineParams;
    use crate::filter_wheel::{FilterWheel, SimFilterWheel};
    use crate::message::{read_message, write_message};
    use crate::sim_camera;

    async fn start_test_server() -> (Arc<CcdServerState>, std::net::SocketAddr) {
        let camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>> =
            Arc::new(Mutex::new(Box::new(sim_camera::discover().unwrap())));
        let wheel: Arc<Mutex<Box<dyn FilterWheel + Send>>> =
            Arc::new(Mutex::new(Box::new(SimFilterWheel::new(7, 2))));
        let bank = Arc::new(Mutex::new(
            FilterBank::parse("L\nR\nV\nB\nI\nH\nD\n").unwrap()));
        let params = EngineParams {
            cfw_tick: Duration::from_millis(1),
            cfw_timeout: Duration::from_millis(100),
            cfw_settle: Duration::from_millis(1),
            exp_prewin: Duration::from_millis(20),
            exp_tick: Duration::from_millis(5),
            exp_postwin: Duration::from_millis(200),
        };
        let engine = ExposureEngine::new(camera.clone(), wheel, bank.clone(),
                                         SystemConfig::default(), params);
        let cooler = Cooler::start(camera.clone(), None);
        let state = Arc::new(CcdServerState::new(
            camera, engine, cooler, bank, SystemConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_state = state.clone();
        tokio::spawn(async move {
            run_server(server_state, listener).await;
        });
        (state, addr)
    }

    fn transact(addr: std::net::SocketAddr, msg: Message) -> Message {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        write_message(&mut stream, &msg).unwrap();
        read_message(&mut stream).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_query_echoes_unique_id() {
        let (_state, addr) = start_test_server().await;
        let mut cm = CameraMessage::new(CommandCode::Status);
        cm.unique_id = 77;
        cm.set_query();
        let reply = tokio::task::spawn_blocking(move || {
            transact(addr, Message::Camera(cm))
        }).await.unwrap();
        match reply {
            Message::Camera(status) => {
                assert_eq!(status.unique_id, 77);
                assert_eq!(status.command, CommandCode::Status);
                assert!(status.keyword_present("CCD_TEMP"));
                assert_eq!(status.value_str("CAMERA_STATUS"), Some("IDLE"));
            },
            _ => panic!("wrong reply kind"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expose_in_memory_returns_fits() {
        let (_state, addr) = start_test_server().await;
        let mut cm = CameraMessage::new(CommandCode::Expose);
        cm.unique_id = 9;
        cm.set_exposure(0.05);
        cm.set_binning(1);
        cm.set_filter('V');
        cm.set_local_image_name("-");
        cm.set_shutter_open(true);
        cm.set_subframe(0, 31, 0, 31);
        let reply = tokio::task::spawn_blocking(move || {
            transact(addr, Message::Camera(cm))
        }).await.unwrap();
        match reply {
            Message::Fits(fits) => {
                assert!(fits.data.starts_with(b"SIMPLE"));
                assert_eq!(fits.data.len() % 2880, 0);
            },
            _ => panic!("expected FITS reply"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expose_to_file_replies_status() {
        let (_state, addr) = start_test_server().await;
        let path = std::env::temp_dir().join(
            format!("nightwatch_srv_test_{}.fits", std::process::id()));
        let path_str = path.display().to_string();
        let mut cm = CameraMessage::new(CommandCode::Expose);
        cm.unique_id = 10;
        cm.set_exposure(0.05);
        cm.set_filter('V');
        cm.set_local_image_name(&path_str);
        cm.set_subframe(0, 31, 0, 31);
        let reply = tokio::task::spawn_blocking(move || {
            transact(addr, Message::Camera(cm))
        }).await.unwrap();
        match reply {
            Message::Camera(status) => {
                assert_eq!(status.unique_id, 10);
                assert_eq!(status.value_str("IMAGE"), Some(path_str.as_str()));
            },
            _ => panic!("expected status reply"),
        }
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cooler_command_and_query() {
        let (state, addr) = start_test_server().await;
        let mut cm = CameraMessage::new(CommandCode::Cooler);
        cm.set_keyword("COOLER_MODE", "SETPOINT");
        cm.set_keyword("SETPOINT", "-10");
        // No reply to a cooler command; send it and then query status on
        // the same connection.
        let reply = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            write_message(&mut stream, &Message::Camera(cm)).unwrap();
            let mut query = CameraMessage::new(CommandCode::Cooler);
            query.unique_id = 33;
            query.set_query();
            write_message(&mut stream, &Message::Camera(query)).unwrap();
            read_message(&mut stream).unwrap()
        }).await.unwrap();
        match reply {
            Message::Camera(status) => {
                assert_eq!(status.unique_id, 33);
                assert_eq!(status.value_str("SETPOINT"), Some("-10"));
            },
            _ => panic!("expected status reply"),
        }
        assert_eq!(state.cooler.lock().unwrap().command().mode,
                   CoolerModeRequest::Setpoint);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bad_magic_closes_connection() {
        let (_state, addr) = start_test_server().await;
        tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(&[0x00u8; 16]).unwrap();
            // Server closes; the read eventually returns 0 bytes.
            let mut buf = [0u8; 1];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_filter_config_round_trip() {
        let (_state, addr) = start_test_server().await;
        let mut cm = CameraMessage::new(CommandCode::FilterConfig);
        cm.unique_id = 5;
        cm.set_keyword("FILTER_0", "V");
        cm.set_keyword("FILTER_1", "R");
        cm.set_keyword("FILTER_2", "D");
        let reply = tokio::task::spawn_blocking(move || {
            transact(addr, Message::Camera(cm))
        }).await.unwrap();
        match reply {
            Message::Camera(config) => {
                assert_eq!(config.value_str("FILTER_0"), Some("V"));
                assert_eq!(config.value_str("FILTER_2"), Some("D"));
                assert_eq!(config.unique_id, 5);
            },
            _ => panic!("expected filter config reply"),
        }
    }

}  // mod tests.
