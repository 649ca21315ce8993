//! Field of View Example
//!
//! Builds a lens, projects the image border onto the floor and intersects the
//! usable field of view with a walkable region.
//!
//! Usage:
//! ```bash
//! cargo run --example lens_fov -- \
//!   --preset M3106 \
//!   --camera-height 6.0 \
//!   --tilt 20 \
//!   --walkable samples/walkable.json \
//!   --output output/visible_region.csv
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use geo::Area;
use lensdist_tools::camera::{LensDescription, LensModel, LensPreset, LensUpdate, Resolution};
use lensdist_tools::{fov, geometry, util};
use log::info;
use std::fs;
use std::path::PathBuf;

/// Usable field of view and visible walkable region of one camera
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name of a calibrated lens preset
    #[arg(short = 'p', long, default_value = "M3106")]
    preset: String,

    /// Lens description JSON, overrides the preset
    #[arg(short = 'l', long)]
    lens: Option<PathBuf>,

    /// Sensor width in pixels
    #[arg(long, default_value_t = 2688)]
    width: u32,

    /// Sensor height in pixels
    #[arg(long, default_value_t = 1512)]
    height: u32,

    /// Camera height above the floor
    #[arg(short = 'c', long, default_value_t = 6.0)]
    camera_height: f64,

    /// Downward tilt about the sensor x axis, in degrees
    #[arg(short = 't', long, default_value_t = 0.0)]
    tilt: f64,

    /// Walkable polygons as a JSON list of [x, y] rings
    #[arg(short = 'w', long)]
    walkable: Option<PathBuf>,

    /// CSV file receiving the visible walkable polygons
    #[arg(short = 'o', long, default_value = "output/visible_region.csv")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        // error;warn;info;debug;trace
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    let resolution = Resolution::new(cli.width, cli.height);

    let mut lens = match &cli.lens {
        Some(path) => {
            info!("Loading lens description from {path:?}");
            LensModel::from_description(resolution, &LensDescription::load_json(path)?)?
        }
        None => {
            let preset: LensPreset = cli.preset.parse()?;
            info!("Using lens preset {preset}");
            LensModel::from_preset(preset, resolution)?
        }
    };
    if cli.tilt != 0.0 {
        lens.update(LensUpdate {
            nominal_homography: Some(geometry::rotmat(cli.tilt.to_radians(), 0.0, 0.0)),
            ..LensUpdate::default()
        })?;
    }
    info!(
        "Lens focal {:.3} px, principal point ({:.1}, {:.1})",
        lens.focal(),
        lens.principal_point().x,
        lens.principal_point().y
    );

    let usable = fov::compute_usable_fov(&lens, cli.camera_height)?;
    info!(
        "Usable field of view: {} vertices, area {:.3}",
        usable.exterior().0.len(),
        usable.unsigned_area()
    );

    let Some(walkable_path) = &cli.walkable else {
        return Ok(());
    };
    let walkable: Vec<Vec<(f64, f64)>> = serde_json::from_str(&fs::read_to_string(walkable_path)?)?;
    let region = fov::intersect_with_walkable(&usable, &walkable);
    for (i, boundary) in region.boundaries().iter().enumerate() {
        info!("Visible polygon {i}: {} vertices", boundary.len());
    }

    if let Some(parent) = cli.output.parent() {
        fs::create_dir_all(parent)?;
    }
    util::export_visible_region(&region, &cli.output)?;
    info!(
        "Visible walkable area {:.3} written to {:?}",
        region.area(),
        cli.output
    );
    Ok(())
}
