// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::Parser;
use log::{error, info};

use nightwatch::mount::{Mount, TcpMount};
use nightwatch::system_config::SystemConfig;
use nightwatch::time_seq::parse_offset;

#[derive(Parser)]
#[command(about = "Small relative mount move, e.g. `scope-move 1.5N 2W`")]
struct Args {
    /// Offsets in arcminutes with direction suffixes: N/S/E/W on the sky,
    /// or U/D/L/R in the camera frame (flipped with the pier side).
    offsets: Vec<String>,

    /// Issue the motion as guide pulses instead of a mount move.
    #[arg(short = 'g')]
    guide: bool,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.offsets.is_empty() {
        error!("Need at least one offset like 1.5N");
        std::process::exit(2);
    }
    let combined = args.offsets.join("");
    let camera_frame = combined.to_ascii_uppercase()
        .chars().any(|c| "UDLR".contains(c));
    let sky_form = combined.to_ascii_uppercase()
        .replace('U', "N").replace('D', "S")
        .replace('L', "E").replace('R', "W");
    let (mut north, mut east) = match parse_offset(&sky_form) {
        Ok(offsets) => offsets,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(2);
        }
    };

    let config = SystemConfig::load_default();
    let mut mount = match TcpMount::connect(&config.mount) {
        Ok(mount) => mount,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(2);
        }
    };

    if camera_frame {
        // Camera up/down/left/right invert when the dec axis is flipped on
        // the other side of the pier.
        match mount.on_west_side_of_pier() {
            Ok(true) => {
                north = -north;
                east = -east;
            },
            Ok(false) => (),
            Err(e) => {
                error!("Cannot determine pier side: {}", e.message);
                std::process::exit(1);
            }
        }
    }

    let result = if args.guide {
        match mount.guide_rate() {
            Ok(rate) if rate > 0.0 =>
                mount.pulse_guide(north * 60.0 / rate, east * 60.0 / rate),
            Ok(_) => {
                error!("Mount guide rate unavailable");
                std::process::exit(1);
            },
            Err(e) => Err(e),
        }
    } else {
        mount.small_move(north, east)
    };
    if let Err(e) = result {
        error!("Move failed: {}", e.message);
        std::process::exit(1);
    }
    info!("Moved {:.2}' N, {:.2}' E", north, east);
}
