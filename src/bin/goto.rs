// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::Parser;
use log::{error, info, warn};

use nightwatch::catalog::Catalog;
use nightwatch::mount::{Mount, TcpMount, parse_sexagesimal};
use nightwatch::system_config::SystemConfig;

#[derive(Parser)]
#[command(about = "Slew the mount to a named object or to coordinates",
          disable_help_flag = true)]
struct Args {
    /// Target name, resolved against the named-star catalog.
    #[arg(short = 'n')]
    name: Option<String>,

    /// Encourage a meridian flip with this goto.
    #[arg(short = 'h')]
    flip: bool,

    /// Literal coordinates: RA (hours, sexagesimal) then Dec (degrees).
    coordinates: Vec<String>,

    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = SystemConfig::load_default();

    let (dec_rad, ra_rad) = if let Some(name) = args.name.as_deref() {
        let catalog = match Catalog::load(&Catalog::default_path()) {
            Ok(catalog) => catalog,
            Err(e) => {
                error!("{}", e.message);
                std::process::exit(2);
            }
        };
        match catalog.lookup(name) {
            Ok(target) => (target.dec_rad, target.ra_rad),
            Err(e) => {
                error!("{}", e.message);
                std::process::exit(2);
            }
        }
    } else if args.coordinates.len() == 2 {
        let ra_hours = parse_sexagesimal(&args.coordinates[0]);
        let dec_deg = parse_sexagesimal(&args.coordinates[1]);
        match (ra_hours, dec_deg) {
            (Ok(ra), Ok(dec)) =>
                (dec.to_radians(), (ra * 15.0).to_radians()),
            _ => {
                error!("Cannot parse coordinates {:?}", args.coordinates);
                std::process::exit(2);
            }
        }
    } else {
        error!("Need -n NAME or literal RA DEC");
        std::process::exit(2);
    };

    let mut mount = match TcpMount::connect(&config.mount) {
        Ok(mount) => mount,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(2);
        }
    };
    if let Err(e) = mount.goto_j2000(dec_rad, ra_rad) {
        error!("Goto failed: {}", e.message);
        std::process::exit(1);
    }
    if let Err(e) = mount.wait_for_stop() {
        error!("Wait for stop failed: {}", e.message);
        std::process::exit(1);
    }
    if args.flip {
        match mount.meridian_flip() {
            Ok(true) => info!("Meridian flip commanded"),
            Ok(false) => warn!("Mount declined the meridian flip"),
            Err(e) => warn!("Flip failed: {}", e.message),
        }
    }
    info!("Goto complete");
}
