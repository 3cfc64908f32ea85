//! # dem-stitcher
//!
//! Mosaic global Digital Elevation Model (DEM) tiles over a bounding box.
//!
//! Given bounds in degrees and a dataset name, the stitcher finds the tiles
//! that overlap the bounds, fetches them concurrently, merges them into one
//! raster cropped to the bounds, normalizes datum, resolution, and pixel
//! registration, and optionally converts orthometric heights to ellipsoidal
//! heights by adding a geoid model.
//!
//! ## Datasets
//!
//! | Name | Source | Tiles | Geoid |
//! |------|--------|-------|-------|
//! | `glo_30` | Copernicus GLO-30 | GeoTIFF, 1" | EGM2008 |
//! | `glo_90` | Copernicus GLO-90 | GeoTIFF, 3" | EGM2008 |
//! | `glo_90_missing` | GLO-90 tiles absent from GLO-30 | GeoTIFF, 3" | EGM2008 |
//! | `3dep` | USGS 3DEP | GeoTIFF, 1" | GEOID18 |
//! | `srtm_v3` | SRTM v3 | zipped HGT, 1" | EGM96 |
//! | `nasadem` | NASADEM | zipped HGT, 1" | EGM96 |
//!
//! `glo_30` has coverage holes; with gap filling on, `glo_90_missing` tiles
//! are used there instead.
//!
//! ## The dateline
//!
//! Bounds may extend past ±180°, e.g. `[179, 52, 181, 53]`. Tiles and geoid
//! pieces on the far side are moved by 360° so the output is one contiguous
//! raster in the bounds' own longitude frame. Bounds crossing both -180° and
//! 180° are rejected.
//!
//! ## Output
//!
//! Stitched rasters can be written as float32 GeoTIFFs with [`write_geotiff`],
//! or as ISCE2-ready DEMs tagged with ellipsoidal heights with
//! [`Stitcher::stitch_for_isce2`].
//!
//! ## Example
//!
//! ```no_run
//! use dem_stitcher::{DemRequest, PixelRegistration, StitchConfig, Stitcher};
//!
//! let stitcher = Stitcher::new(StitchConfig::with_data_dir("data"))?;
//! let request = DemRequest::new([-119.085, 33.402, -118.984, 35.435], "glo_30")
//!     .with_registration(PixelRegistration::Area)
//!     .with_ellipsoidal_height(false);
//! let (buffer, grid) = stitcher.stitch(&request)?;
//! println!("{}x{} pixels at {:?}", grid.width(), grid.height(), grid.resolution());
//! # let _ = buffer;
//! # Ok::<(), dem_stitcher::StitchError>(())
//! ```

mod acquisition;
mod bounds;
mod config;
mod credentials;
mod dataset;
mod error;
mod geoid;
mod geotiff;
mod isce;
mod merge;
mod normalize;
mod raster;
mod stitcher;
mod tile_index;
mod transform;
mod warp;
mod window;

pub use acquisition::{
    acquire_tiles, decode_hgt, hgt_corner, read_zipped_hgt, AcquiredTile, DatasetTileSource, DownloadStats,
    Downloader, TileSource, HGT_NODATA, HGT_SUFFIX,
};
pub use bounds::{
    classify_dateline_crossing, split_across_dateline, validate_bounds, BoundingBox, DatelineCrossing,
    EASTERN_HEMISPHERE, WESTERN_HEMISPHERE, WORLD,
};
pub use config::{is_remote, StitchConfig, DEFAULT_EARTHDATA_HOST, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_MAX_WORKERS};
pub use credentials::{ensure_credentials, find_netrc_entry, netrc_path, NetrcEntry};
pub use dataset::{available_datasets, Dataset, Geoid, TileFormat, ARC_SECOND, EGM08_URL};
pub use error::StitchError;
pub use geoid::{
    insufficient_buffer, read_geoid, remove_geoid, GeoTiffGeoidSource, GeoidRead, GeoidSource,
    DEFAULT_READ_BUFFER, DEFAULT_REMOVAL_BUFFER,
};
pub use geotiff::{write_geotiff, write_geotiff_to, GeoTiffReader};
pub use isce::{
    isce_xml_path, read_isce_dem, read_isce_metadata, tag_dem_xml_as_ellipsoidal, write_isce_dem, IsceMetadata,
    ISCE_REFERENCE_DATUM,
};
pub use merge::{crop_grid, merge_rasters, MergeNodata};
pub use normalize::{reproject_to_crs, retarget_resolution, shift_for_registration, update_grid_resolution};
pub use raster::{Crs, DataType, PixelRegistration, Raster, RasterBuffer, RasterGrid, Resolution};
pub use stitcher::{stitch_dem, stitch_dem_for_isce2, DemRequest, Stitcher};
pub use tile_index::{TileFootprint, TileIndex, TileIndexRegistry};
pub use transform::{aligned_target, Affine, Rounding, ROWCOL_SNAP_EPSILON};
pub use warp::{calculate_default_transform, reproject, reproject_to_grid, transform_bounds, transform_point, Resampling};
pub use window::{
    get_indices_from_extent, read_window, window_from_extent, ExtentWindow, MemoryRaster, PixelWindow,
    WindowedRaster,
};

/// Result type for stitching operations.
pub type Result<T> = std::result::Result<T, StitchError>;
