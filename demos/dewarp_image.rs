//! Image Dewarping Example
//!
//! Resamples a distorted fisheye image into the rectified image of the lens,
//! optionally cropped and with a chosen horizontal field of view.
//!
//! Usage:
//! ```bash
//! cargo run --example dewarp_image -- \
//!   --input frame.png \
//!   --preset M3106 \
//!   --fov 100 \
//!   --crop 1920x1080 \
//!   --bilinear
//! ```

use clap::Parser;
use lensdist_tools::camera::{LensDescription, LensModel, LensPreset, Resolution};
use lensdist_tools::util::{self, Interpolation};
use log::info;
use std::path::PathBuf;

/// Dewarp a fisheye image through a lens model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Distorted input image
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Name of a calibrated lens preset
    #[arg(short = 'p', long, default_value = "M3106")]
    preset: String,

    /// Lens description JSON, overrides the preset
    #[arg(short = 'l', long)]
    lens: Option<PathBuf>,

    /// Horizontal field of view of the rectified image, in degrees
    #[arg(long)]
    fov: Option<f64>,

    /// Centred crop of the rectified image, as WIDTHxHEIGHT
    #[arg(long)]
    crop: Option<String>,

    /// Use bilinear instead of nearest-neighbour sampling
    #[arg(short = 'b', long)]
    bilinear: bool,

    /// Rectified output image
    #[arg(short = 'o', long, default_value = "output/dewarped.png")]
    output: PathBuf,
}

fn parse_crop(crop: &str) -> Result<(u32, u32), Box<dyn std::error::Error>> {
    let (w, h) = crop
        .split_once('x')
        .ok_or("crop must look like WIDTHxHEIGHT")?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let input = cli.input.to_str().ok_or("Invalid input path string")?;
    let image = util::load_image(input)?;
    let resolution = Resolution::new(image.width(), image.height());
    info!("Loaded {}x{} image from {input}", image.width(), image.height());

    let mut lens = match &cli.lens {
        Some(path) => {
            LensModel::from_description(resolution, &LensDescription::load_json(path)?)?
        }
        None => LensModel::from_preset(cli.preset.parse::<LensPreset>()?, resolution)?,
    };
    if let Some(crop) = &cli.crop {
        let (width, height) = parse_crop(crop)?;
        lens.crop(width, height, None, None)?;
    }
    if let Some(fov) = cli.fov {
        lens.set_dewarped_fov(fov.to_radians())?;
    }

    let interpolation = if cli.bilinear {
        Interpolation::Bilinear
    } else {
        Interpolation::Nearest
    };
    let dewarped = util::dewarp_image(&lens, &image, interpolation)?;
    let grid = lens.forward_grid();
    info!(
        "{} of {} rectified pixels sample the sensor",
        grid.valid_count(),
        grid.resolution().pixel_count()
    );

    if let Some(parent) = cli.output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    dewarped.save(&cli.output)?;
    info!("Saved rectified image to {:?}", cli.output);
    Ok(())
}
