//! Example: stitch a DEM over a bounding box and write it as a GeoTIFF.
//!
//! Run with:
//! `cargo run -p dem-stitcher --example stitch_bounds -- -119.1 33.4 -118.9 35.4 glo_30 dem.tif`
//!
//! Tile indexes are read from `--data-dir` (default `data/`), or from the
//! `data_dir` of a YAML config passed with `--config`.

use clap::Parser;
use dem_stitcher::{isce_xml_path, write_geotiff, DemRequest, PixelRegistration, StitchConfig, Stitcher};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Stitch DEM tiles over a bounding box")]
struct Args {
    /// Western edge in degrees.
    #[arg(allow_hyphen_values = true)]
    xmin: f64,
    /// Southern edge in degrees.
    #[arg(allow_hyphen_values = true)]
    ymin: f64,
    /// Eastern edge in degrees; may exceed 180.
    #[arg(allow_hyphen_values = true)]
    xmax: f64,
    /// Northern edge in degrees.
    #[arg(allow_hyphen_values = true)]
    ymax: f64,
    /// Dataset name (glo_30, glo_90, glo_90_missing, 3dep, srtm_v3, nasadem).
    dataset: String,
    /// Output GeoTIFF path.
    output: PathBuf,

    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding the tile indexes; ignored with --config.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Output pixel registration: point or area.
    #[arg(long, default_value = "point")]
    registration: PixelRegistration,
    /// Keep orthometric heights instead of converting to the ellipsoid.
    #[arg(long)]
    orthometric: bool,
    /// Output resolution in degrees.
    #[arg(long)]
    resolution: Option<f64>,
    /// Fill pixels without data with 0 instead of NaN.
    #[arg(long)]
    zero_fill: bool,
    /// Do not patch glo_30 holes with glo_90 tiles.
    #[arg(long)]
    no_fill_gaps: bool,
    /// Write an ISCE2 DEM (ellipsoidal, point registered, 0 for missing data)
    /// instead of a GeoTIFF; other output options are ignored.
    #[arg(long)]
    isce2: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => StitchConfig::from_yaml_file(path)?,
        None => StitchConfig::with_data_dir(&args.data_dir),
    };

    let stitcher = Stitcher::new(config)?;
    if args.isce2 {
        let bounds = [args.xmin, args.ymin, args.xmax, args.ymax];
        let path = stitcher.stitch_for_isce2(bounds, &args.dataset, Some(&args.output), 0.0)?;
        let xml = isce_xml_path(&path);
        println!("Wrote {} and {}", path.display(), xml.display());
        return Ok(());
    }

    let mut request = DemRequest::new([args.xmin, args.ymin, args.xmax, args.ymax], args.dataset.as_str())
        .with_registration(args.registration)
        .with_ellipsoidal_height(!args.orthometric)
        .with_merge_nodata(if args.zero_fill { 0.0 } else { f64::NAN })
        .with_fill_gaps(!args.no_fill_gaps);
    if let Some(resolution) = args.resolution {
        request = request.with_resolution(resolution);
    }

    let (buffer, grid) = stitcher.stitch(&request)?;
    write_geotiff(&args.output, &buffer, &grid, request.dst_registration)?;

    let (xres, yres) = grid.resolution();
    println!(
        "Wrote {} ({}x{} pixels, {:.8}° x {:.8}°, bounds {})",
        args.output.display(),
        grid.width(),
        grid.height(),
        xres,
        yres,
        grid.bounds()
    );
    Ok(())
}
