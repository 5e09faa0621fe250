// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use clap::Parser;
use log::error;

use nightwatch::camera_client::CameraClient;
use nightwatch::focuser::Focuser;
use nightwatch::mount::TcpMount;
use nightwatch::notify::NotifyMailbox;
use nightwatch::plate_solve::PlateSolver;
use nightwatch::scope_server::FocuserSelect;
use nightwatch::scope_server::client::RemoteFocuser;
use nightwatch::system_config::SystemConfig;
use nightwatch::time_seq::{Session, TimeSeqParams, parse_hhmm, parse_offset};

#[derive(Parser)]
#[command(about = "Obtain a time series of exposures of one object")]
struct Args {
    /// Exposure time in seconds.
    #[arg(short = 't')]
    time: f64,

    /// Target name.
    #[arg(short = 'n')]
    name: String,

    /// Session log file.
    #[arg(short = 'l')]
    log: PathBuf,

    /// Exposure profile name.
    #[arg(short = 'P', default_value = "time_seq")]
    profile: String,

    /// Filter name.
    #[arg(short = 'f', default_value = "V")]
    filter: char,

    /// Alternate filters V and R on consecutive exposures.
    #[arg(short = 'a')]
    alternate: bool,

    /// Offset from the object location, e.g. 1.5N2W (arcmin).
    #[arg(short = 'o')]
    offset: Option<String>,

    /// Quit time, hh:mm local.
    #[arg(short = 'q')]
    quit: Option<String>,

    /// Meridian flip time, hh:mm local.
    #[arg(short = 'm')]
    flip: Option<String>,

    /// Inhibit use of the drift guider.
    #[arg(short = 'd')]
    no_drift: bool,

    /// Inhibit use of running focus.
    #[arg(short = 'r')]
    no_running_focus: bool,
}

fn fail(message: &str) -> ! {
    error!("{}", message);
    std::process::exit(2);
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = SystemConfig::load_default();

    let offset_arcmin = args.offset.as_deref().map(|s| {
        parse_offset(s).unwrap_or_else(|e| fail(&e.message))
    });
    let quit_minutes = args.quit.as_deref().map(|s| {
        parse_hhmm(s).unwrap_or_else(|e| fail(&e.message))
    });
    let flip_minutes = args.flip.as_deref().map(|s| {
        parse_hhmm(s).unwrap_or_else(|e| fail(&e.message))
    });

    let params = TimeSeqParams {
        exposure_secs: args.time,
        target_name: args.name.clone(),
        filter: args.filter,
        alternate_colors: args.alternate,
        use_drift_guider: !args.no_drift,
        use_running_focus: !args.no_running_focus,
        offset_arcmin,
        quit_minutes,
        flip_minutes,
        profile: args.profile.clone(),
        ..TimeSeqParams::default()
    };

    let log = std::fs::File::create(&args.log).unwrap_or_else(
        |e| fail(&format!("unable to create logfile {:?}: {}", args.log, e)));

    let camera = CameraClient::connect(&config.camera_server)
        .unwrap_or_else(|e| fail(&e.message));
    let mount = TcpMount::connect(&config.mount)
        .unwrap_or_else(|e| fail(&e.message));
    let focuser: Option<Box<dyn Focuser>> = if params.use_running_focus {
        match RemoteFocuser::connect(&config.scope_server, FocuserSelect::Fine) {
            Ok(focuser) => Some(Box::new(focuser)),
            Err(e) => fail(&e.message),
        }
    } else {
        None
    };

    let mailbox = NotifyMailbox::new(&NotifyMailbox::default_runtime_dir())
        .unwrap_or_else(|e| fail(&e.message));
    mailbox.register().unwrap_or_else(|e| fail(&e.message));

    let focus_log = args.log.parent()
        .map(|dir| dir.join("running_focus.log"));
    let mut session = Session::new(params, config, camera, Box::new(mount),
                                   focuser, PlateSolver::new(), mailbox,
                                   Box::new(log), focus_log);
    if let Err(e) = session.run() {
        error!("time_seq: {}", e.message);
        std::process::exit(1);
    }
}
