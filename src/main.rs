//! Progressive camera calibration from a list of images.
//!
//! Usage:
//! ```bash
//! progressive-calib -w 9 -h 6 -s 0.025 -o camera.yml --write-extrinsics images.yaml
//! ```
//!
//! Exit codes: `0` on success or help, `-1` on invalid arguments or input,
//! `-2` when the image list is empty.

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::{error, info};
use progressive_calib::{
    CalibrationError, CalibrationFlags, CalibrationPipeline, CalibrationSession,
    CalibrationSettings, CornerFileDetector, ImageListSource, PatternKind, PlanarCalibrator,
    ResultPersister,
};
use std::path::PathBuf;
use std::process;

const EXIT_INVALID: i32 = -1;
const EXIT_EMPTY_LIST: i32 = -2;

/// Incremental camera calibration: re-solves and rewrites the output after every detected view
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_help_flag = true)]
struct Cli {
    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Number of inner corners (or circles) per pattern row
    #[arg(short = 'w', long)]
    width: Option<u32>,

    /// Number of inner corners (or circles) per pattern column
    #[arg(short = 'h', long)]
    height: Option<u32>,

    /// Pattern kind (chessboard, circles, acircles)
    #[arg(short = 't', long)]
    pattern: Option<String>,

    /// Square size in user-defined units (default: 1)
    #[arg(short = 's', long)]
    square_size: Option<f64>,

    /// Output file, YAML or .json (default: out_camera_data.yml)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Write detected feature points
    #[arg(long)]
    write_points: bool,

    /// Write per-view errors and extrinsic parameters
    #[arg(long)]
    write_extrinsics: bool,

    /// Assume zero tangential distortion
    #[arg(long)]
    zero_tangent_dist: bool,

    /// Fix fx/fy to the given ratio
    #[arg(short = 'a', long)]
    aspect_ratio: Option<f64>,

    /// Fix the principal point at the image center
    #[arg(long)]
    fix_principal_point: bool,

    /// Flip frames (and detections) around the horizontal axis
    #[arg(short = 'v', long)]
    flip_vertical: bool,

    /// Capture from a live camera (not supported)
    #[arg(long)]
    live: bool,

    /// Settings file; command-line options override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// YAML document listing the input images
    input: Option<PathBuf>,
}

fn build_settings(cli: &Cli) -> Result<CalibrationSettings, CalibrationError> {
    let mut settings = match &cli.config {
        Some(path) => CalibrationSettings::load_from_yaml(path)?,
        None => CalibrationSettings::default(),
    };

    if let Some(width) = cli.width {
        settings.pattern.width = width;
    }
    if let Some(height) = cli.height {
        settings.pattern.height = height;
    }
    if let Some(kind) = &cli.pattern {
        settings.pattern.kind = kind.parse::<PatternKind>()?;
    }
    if let Some(size) = cli.square_size {
        settings.pattern.square_size = size;
    }
    if let Some(output) = &cli.output {
        settings.output = output.clone();
    }
    if let Some(ratio) = cli.aspect_ratio {
        settings.aspect_ratio = ratio;
        settings.flags |= CalibrationFlags::FIX_ASPECT_RATIO;
    }
    if cli.zero_tangent_dist {
        settings.flags |= CalibrationFlags::ZERO_TANGENT_DIST;
    }
    if cli.fix_principal_point {
        settings.flags |= CalibrationFlags::FIX_PRINCIPAL_POINT;
    }
    settings.write_points |= cli.write_points;
    settings.write_extrinsics |= cli.write_extrinsics;
    settings.flip_vertical |= cli.flip_vertical;

    settings.validate()?;
    Ok(settings)
}

fn run(cli: Cli) -> i32 {
    if cli.live {
        error!("Live capture is not supported, pass an image list instead");
        return EXIT_INVALID;
    }
    let settings = match build_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return EXIT_INVALID;
        }
    };
    let Some(input) = cli.input else {
        error!("Input filename is missing");
        return EXIT_INVALID;
    };

    let mut source = match ImageListSource::from_list_file(&input, settings.flip_vertical) {
        Ok(source) => source,
        Err(e) => {
            error!("Could not read image list {}: {}", input.display(), e);
            return EXIT_INVALID;
        }
    };
    if source.is_empty() {
        error!("Image list {} is empty", input.display());
        return EXIT_EMPTY_LIST;
    }

    let session = match CalibrationSession::new(
        settings.pattern.clone(),
        settings.flags,
        settings.aspect_ratio,
    ) {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            return EXIT_INVALID;
        }
    };
    info!(
        "Calibrating with a {}x{} {} (square size {}), flags {}{}",
        settings.pattern.width,
        settings.pattern.height,
        settings.pattern.kind,
        settings.pattern.square_size,
        settings.flags.bits(),
        settings.flags.describe()
    );

    let persister = ResultPersister::new(settings.output.clone(), settings.persist_options());
    let mut pipeline = CalibrationPipeline::new(session, PlanarCalibrator::default(), persister);

    match pipeline.run(&mut source, &mut CornerFileDetector) {
        Ok(summary) => {
            info!(
                "Processed {} frames: {} views, {} rejected, {} skipped, {} results written to {}",
                summary.frames,
                summary.views,
                summary.rejected_frames,
                summary.skipped_frames,
                summary.saved_rounds,
                settings.output.display()
            );
            0
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if std::env::args_os().len() <= 1 {
        let _ = Cli::command().print_help();
        return;
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_INVALID,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    process::exit(run(cli));
}
