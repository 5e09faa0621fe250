// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt, registry};

use nightwatch::abstract_camera::AbstractCamera;
use nightwatch::ccd_server::{CcdServerState, run_server};
use nightwatch::cooler::Cooler;
use nightwatch::exposure_engine::{EngineParams, ExposureEngine};
use nightwatch::filter_wheel::{FilterBank, FilterWheel, SerialFilterWheel,
                               SimFilterWheel};
use nightwatch::sim_camera;
use nightwatch::system_config::SystemConfig;

#[derive(Parser)]
#[command(about = "Camera/cooler/filter server")]
struct Args {
    /// Port to listen on for camera clients.
    #[arg(long, default_value_t = 16007)]
    port: u16,

    /// Where the cooler's cycle log goes.
    #[arg(long, default_value = "cooler.log")]
    cooler_log: PathBuf,

    /// Installed-filter config file, one letter per line in slot order.
    #[arg(long)]
    filters: Option<PathBuf>,

    /// Serial device of the USB filter wheel; simulated when absent.
    #[arg(long)]
    cfw_device: Option<String>,

    /// Directory for the server log file.
    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "ccd_server_log.txt")]
    log_file: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logging.
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

    let config = SystemConfig::load_default();

    // Camera discovery is fatal when it does not find exactly one device.
    let camera = match sim_camera::discover() {
        Ok(camera) => camera,
        Err(e) => {
            error!("Camera discovery failed: {}. Give up.", e.message);
            std::process::exit(3);
        }
    };
    let camera: Arc<Mutex<Box<dyn AbstractCamera + Send>>> =
        Arc::new(Mutex::new(Box::new(camera)));

    let bank = match args.filters.as_ref().or(config.filter_config.as_ref()) {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => FilterBank::parse(&text).unwrap_or_else(|e| {
                error!("Bad filter config {:?}: {}", path, e.message);
                std::process::exit(2);
            }),
            Err(e) => {
                error!("Cannot read filter config {:?}: {}", path, e);
                std::process::exit(2);
            }
        },
        None => FilterBank::default_bank(),
    };
    let bank = Arc::new(Mutex::new(bank));

    let mut wheel: Box<dyn FilterWheel + Send> = match args.cfw_device.as_deref() {
        Some(device) => match SerialFilterWheel::open(device) {
            Ok(wheel) => Box::new(wheel),
            Err(e) => {
                error!("Cannot open filter wheel {}: {}", device, e.message);
                std::process::exit(2);
            }
        },
        None => Box::new(SimFilterWheel::new(bank.lock().unwrap().num_slots(), 3)),
    };
    if let Err(e) = wheel.begin_init() {
        error!("Filter wheel init failed: {}", e.message);
        std::process::exit(2);
    }
    let wheel: Arc<Mutex<Box<dyn FilterWheel + Send>>> =
        Arc::new(Mutex::new(wheel));

    let engine = ExposureEngine::new(camera.clone(), wheel, bank.clone(),
                                     config.clone(), EngineParams::default());
    let cooler = Cooler::start(camera.clone(), Some(args.cooler_log.clone()));
    let state = Arc::new(CcdServerState::new(camera, engine, cooler, bank,
                                             config));

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
