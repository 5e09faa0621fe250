// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use nightwatch::camera_client::{CameraClient, ExposureFlags,
                                next_valid_image_filename};
use nightwatch::frame::Subframe;
use nightwatch::message::PixelFormat;
use nightwatch::notify::{NotifyMailbox, notify_new_image};
use nightwatch::system_config::SystemConfig;

#[derive(Parser)]
#[command(about = "Perform a camera exposure", disable_help_flag = true)]
struct Args {
    /// Exposure time in seconds.
    #[arg(short = 't')]
    time: f64,

    /// Output filename; defaults to the next free image name.
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Dark image; keep the shutter shut.
    #[arg(short = 'd')]
    dark: bool,

    /// Subframe bounds (0-origin, inclusive, bottom-left).
    #[arg(short = 'u')]
    box_upper: Option<u32>,
    #[arg(short = 'b')]
    box_bottom: Option<u32>,
    #[arg(short = 'r')]
    box_right: Option<u32>,
    #[arg(short = 'l')]
    box_left: Option<u32>,

    /// Filter name.
    #[arg(short = 'f')]
    filter: Option<char>,

    /// PURPOSE keyword for the FITS header.
    #[arg(short = 'p', default_value = "UNKNOWN")]
    purpose: String,

    /// Exposure profile name.
    #[arg(short = 'P', default_value = "default")]
    profile: String,

    /// Camera gain [0..100].
    #[arg(short = 'g')]
    gain: Option<i64>,

    /// Readout mode [0..3].
    #[arg(short = 'm')]
    mode: Option<i64>,

    /// Binning (NxN).
    #[arg(short = 'B')]
    binning: Option<u32>,

    /// Output pixel format: 16, 32 or float.
    #[arg(short = 'F')]
    format: Option<String>,

    /// Camera offset [0..255].
    #[arg(short = 'z')]
    offset: Option<i64>,

    /// USB traffic setting [0..60].
    #[arg(short = 'U')]
    usb_traffic: Option<f64>,

    /// Do not compress.
    #[arg(short = 'c')]
    no_compress: bool,

    /// Leave the product in the server's filesystem at -o instead of
    /// transferring it.
    #[arg(long)]
    host: bool,

    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = SystemConfig::load_default();

    let mut flags = ExposureFlags::from_profile(&args.profile);
    if let Some(filter) = args.filter {
        flags.filter = filter;
    }
    if args.dark {
        flags.shutter_open = false;
    }
    if let Some(gain) = args.gain {
        flags.gain = gain;
    }
    if let Some(mode) = args.mode {
        flags.mode = mode;
    }
    if let Some(binning) = args.binning {
        flags.binning = binning.max(1);
    }
    if let Some(offset) = args.offset {
        flags.offset = offset;
    }
    if let Some(usb) = args.usb_traffic {
        flags.usb_traffic = usb;
    }
    if args.no_compress {
        flags.compress = false;
    }
    if let Some(format) = args.format.as_deref() {
        flags.pixel_format = match format {
            "16" => PixelFormat::U16,
            "32" => PixelFormat::U32,
            "float" => PixelFormat::F32,
            other => {
                error!("Bad -F value {}; must be 16, 32 or float", other);
                std::process::exit(2);
            }
        };
    }
    let mut subframe = Subframe::default();
    if let Some(v) = args.box_upper {
        subframe.top = v;
    }
    if let Some(v) = args.box_bottom {
        subframe.bottom = v;
    }
    if let Some(v) = args.box_left {
        subframe.left = v;
    }
    if let Some(v) = args.box_right {
        subframe.right = v;
    }
    flags.subframe = subframe;

    let output = args.output.unwrap_or_else(
        || next_valid_image_filename(&config.image_dir));

    let mut camera = match CameraClient::connect(&config.camera_server) {
        Ok(camera) => camera,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(2);
        }
    };
    if args.host {
        // Product stays in the server's filesystem; we only get a status
        // reply.
        if let Err(e) = camera.host_expose(args.time, &flags,
                                           &output.to_string_lossy()) {
            error!("Exposure failed: {}", e.message);
            std::process::exit(1);
        }
        info!("Exposure complete on server: {}", output.display());
        return;
    }
    if let Err(e) = camera.expose_to_file(args.time, &flags, &output,
                                          &args.purpose, None) {
        error!("Exposure failed: {}", e.message);
        std::process::exit(1);
    }
    info!("Exposure complete: {}", output.display());
    println!("{}", output.display());

    match NotifyMailbox::new(&NotifyMailbox::default_runtime_dir()) {
        Ok(mailbox) => notify_new_image(&mailbox, &output),
        Err(e) => info!("No image notification: {}", e.message),
    }
}
