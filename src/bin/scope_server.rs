// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt, registry};

use nightwatch::focuser::{Focuser, JsonFocuser, PacketFocuser, SimFocuser,
                          open_serial};
use nightwatch::scope_server::{ScopeServerState, run_server};

#[derive(Parser)]
#[command(about = "Mount/focus server")]
struct Args {
    /// Port to listen on for focus clients.
    #[arg(long, default_value_t = 16011)]
    port: u16,

    /// Serial device of the coarse (mirror) focuser; packet protocol at
    /// 9600 baud.
    #[arg(long)]
    coarse_device: Option<String>,

    /// Serial device of the fine (drawtube) focuser; JSON protocol at
    /// 115200 baud.
    #[arg(long)]
    fine_device: Option<String>,

    /// Use an in-memory focuser instead of hardware.
    #[arg(long)]
    sim: bool,

    /// Directory for the server log file.
    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "scope_server_log.txt")]
    log_file: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let file_appender = tracing_appender::rolling::never(&args.log_dir, &args.log_file);
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let coarse: Option<Box<dyn Focuser>> = if args.sim {
        Some(Box::new(SimFocuser::new(5000)))
    } else {
        match args.coarse_device.as_deref() {
            Some(device) => match open_serial(device, 9600) {
                Ok(link) => Some(Box::new(PacketFocuser::new(link))),
                Err(e) => {
                    error!("Cannot open coarse focuser: {}", e.message);
                    std::process::exit(2);
                }
            },
            None => None,
        }
    };
    let fine: Option<Box<dyn Focuser>> = if args.sim {
        Some(Box::new(SimFocuser::new(190000)))
    } else {
        match args.fine_device.as_deref() {
            Some(device) => match open_serial(device, 115200) {
                Ok(link) => Some(Box::new(JsonFocuser::new(link))),
                Err(e) => {
                    error!("Cannot open fine focuser: {}", e.message);
                    std::process::exit(2);
                }
            },
            None => None,
        }
    };
    if coarse.is_none() && fine.is_none() {
        warn!("No focusers configured; serving queries only");
    }

    let state = Arc::new(ScopeServerState::new(coarse, fine));
    let ctrlc_state = state.clone();
    ctrlc::set_handler(move || {
        info!("Got control-c");
        ctrlc_state.request_shutdown();
    }).unwrap();

    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Error binding socket: {}", e);
            std::process::exit(2);
        }
    };
    run_server(state, listener).await;
}
