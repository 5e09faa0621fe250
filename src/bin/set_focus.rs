// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::Parser;
use log::error;

use nightwatch::focuser::{FocusMoveType, Focuser};
use nightwatch::scope_server::FocuserSelect;
use nightwatch::scope_server::client::RemoteFocuser;
use nightwatch::system_config::SystemConfig;

#[derive(Parser)]
#[command(about = "Move or query the focuser")]
struct Args {
    /// Which focuser: C (coarse) or F (fine).
    #[arg(short = 'F', default_value = "C")]
    focuser: char,

    /// Relative move in ticks.
    #[arg(short = 't')]
    relative: Option<i64>,

    /// Absolute move in ticks.
    #[arg(short = 'a')]
    absolute: Option<i64>,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let which = match args.focuser.to_ascii_uppercase() {
        'C' => FocuserSelect::Coarse,
        'F' => FocuserSelect::Fine,
        other => {
            error!("Bad -F value {}; must be C or F", other);
            std::process::exit(2);
        }
    };
    if args.relative.is_some() && args.absolute.is_some() {
        error!("Use only one of -t and -a");
        std::process::exit(2);
    }

    let config = SystemConfig::load_default();
    let mut focuser = match RemoteFocuser::connect(&config.scope_server, which) {
        Ok(focuser) => focuser,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(2);
        }
    };

    let result = if let Some(ticks) = args.relative {
        focuser.move_to(ticks, FocusMoveType::Relative)
    } else if let Some(ticks) = args.absolute {
        focuser.move_to(ticks, FocusMoveType::Absolute)
    } else {
        focuser.position()
    };
    match result {
        Ok(position) => println!("{}", position),
        Err(e) => {
            error!("Focuser operation failed: {}", e.message);
            std::process::exit(1);
        }
    }
}
