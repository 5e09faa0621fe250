// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use nightwatch::mount::{Mount, TcpMount, format_dec, format_ra};
use nightwatch::sync_session::SyncSession;
use nightwatch::system_config::SystemConfig;

#[derive(Parser)]
#[command(about = "Mount housekeeping: park, tracking, flip, alignment model")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Park the mount.
    Park,
    /// Unpark the mount.
    Unpark,
    /// Resume sidereal tracking.
    TrackOn,
    /// Stop the RA motor.
    TrackOff,
    /// Command a meridian flip.
    Flip,
    /// Report pointing, pier side, sidereal time and guide rate.
    Status,
    /// List the mount's stored alignment points.
    ListAlign,
    /// Clear the mount's pointing model. Cannot be undone.
    ClearAlign,
    /// Replay a session's sync points into the mount's pointing model.
    LoadAlign { session_file: PathBuf },
    /// Send refraction inputs to the mount.
    Refraction { pressure_hpa: f64, temp_c: f64 },
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = SystemConfig::load_default();
    let mut mount = match TcpMount::connect(&config.mount) {
        Ok(mount) => mount,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(2);
        }
    };

    let result = match args.command {
        Command::Park => mount.park(),
        Command::Unpark => mount.unpark(),
        Command::TrackOn => mount.control_tracking(true),
        Command::TrackOff => mount.control_tracking(false),
        Command::Flip => match mount.meridian_flip() {
            Ok(true) => {
                info!("Flip commanded");
                Ok(())
            },
            Ok(false) => {
                warn!("Mount declined the flip");
                std::process::exit(1);
            },
            Err(e) => Err(e),
        },
        Command::Status => (|| -> Result<(), canonical_error::CanonicalError> {
            let (dec, ra) = mount.current_pointing()?;
            let lst = mount.local_sidereal_time()?;
            let west = mount.on_west_side_of_pier()?;
            let rate = mount.guide_rate()?;
            println!("pointing: {} {}", format_ra(ra), format_dec(dec));
            println!("pier side: {}", if west { "west" } else { "east" });
            println!("sidereal time: {}", format_ra(lst));
            println!("guide rate: {:.2} arcsec/s", rate);
            Ok(())
        })(),
        Command::ListAlign => match mount.list_alignment_points() {
            Ok(points) => {
                for (i, point) in points.iter().enumerate() {
                    println!("{:3}: {}", i, point);
                }
                Ok(())
            },
            Err(e) => Err(e),
        },
        Command::ClearAlign => mount.clear_alignment_points(),
        Command::LoadAlign { session_file } => {
            match SyncSession::open(&session_file) {
                Ok(session) => session.push_to_mount(&mut mount).map(|count| {
                    info!("Loaded {} points", count);
                }),
                Err(e) => Err(e),
            }
        },
        Command::Refraction { pressure_hpa, temp_c } =>
            mount.set_refraction(pressure_hpa, temp_c),
    };
    if let Err(e) = result {
        error!("{}", e.message);
        std::process::exit(1);
    }
}
