// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::{Parser, Subcommand};
use log::error;

use nightwatch::camera_client::CameraClient;
use nightwatch::system_config::SystemConfig;

#[derive(Parser)]
#[command(about = "Camera server housekeeping: status, cooler, filters")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query camera and cooler status.
    Status,
    /// Turn the cooler off.
    CoolerOff,
    /// Manual cooler power, 0..1.
    CoolerManual { power: f64 },
    /// Closed-loop regulation to the given setpoint, deg C.
    CoolerSetpoint { setpoint_c: f64 },
    /// Push the installed-filter list, e.g. `L R V B I H D`.
    Filters { letters: Vec<char> },
    /// Ask the server to exit.
    Shutdown,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = SystemConfig::load_default();
    let mut camera = match CameraClient::connect(&config.camera_server) {
        Ok(camera) => camera,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(2);
        }
    };

    let result = match args.command {
        Command::Status => camera.query_status().map(|status| {
            for (keyword, value) in status.keywords() {
                println!("{} = {}", keyword, value);
            }
        }),
        Command::CoolerOff => camera.cooler_off(),
        Command::CoolerManual { power } => camera.cooler_manual(power),
        Command::CoolerSetpoint { setpoint_c } => camera.cooler_setpoint(setpoint_c),
        Command::Filters { letters } => {
            if letters.is_empty() {
                error!("Need at least one filter letter");
                std::process::exit(2);
            }
            camera.push_filter_config(&letters).map(|config| {
                for (keyword, value) in config.keywords() {
                    println!("{} = {}", keyword, value);
                }
            })
        },
        Command::Shutdown => camera.shutdown_server(),
    };
    if let Err(e) = result {
        error!("{}", e.message);
        std::process::exit(1);
    }
}
