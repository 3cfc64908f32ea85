//! Geoid rasters and conversion from orthometric to ellipsoidal heights.
//!
//! Geoid models are global rasters of geoid undulation (metres above the
//! ellipsoid) stored in Area registration. Only the part covering a DEM is
//! read; a DEM crossing the dateline is served by reading both sides of the
//! geoid and joining them in one longitude frame.

use crate::acquisition::Downloader;
use crate::bounds::{classify_dateline_crossing, split_across_dateline, BoundingBox, DatelineCrossing};
use crate::config::{is_remote, StitchConfig};
use crate::geotiff::GeoTiffReader;
use crate::merge::{merge_rasters, MergeNodata};
use crate::normalize::shift_for_registration;
use crate::raster::{Crs, DataType, PixelRegistration, Raster, RasterBuffer, RasterGrid};
use crate::warp::{reproject, Resampling};
use crate::window::{read_window, PixelWindow, WindowedRaster};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Pixel buffer used by [`read_geoid`] when none is given.
pub const DEFAULT_READ_BUFFER: usize = 1;

/// Pixel buffer used by [`remove_geoid`] when none is given.
pub const DEFAULT_REMOVAL_BUFFER: usize = 2;

/// Slack when deciding whether a geoid raster reaches ±180°.
const DATELINE_TOLERANCE: f64 = 1e-9;

/// Opens geoid rasters by address.
pub trait GeoidSource: Send + Sync {
    /// Open the geoid stored at `address` (a path or URL).
    fn open(&self, address: &str) -> Result<Box<dyn WindowedRaster + Send>>;
}

/// Geoid source backed by GeoTIFF files, downloading remote ones into a cache directory.
pub struct GeoTiffGeoidSource {
    cache_dir: PathBuf,
    downloader: Downloader,
}

impl std::fmt::Debug for GeoTiffGeoidSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTiffGeoidSource")
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl GeoTiffGeoidSource {
    /// Create a source caching downloads in `cache_dir`.
    pub fn new<P: AsRef<Path>>(cache_dir: P, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            downloader: Downloader::new(timeout_secs)?,
        })
    }

    /// Create a source from configuration.
    pub fn from_config(config: &StitchConfig) -> Result<Self> {
        Self::new(config.geoid_cache_dir(), config.http_timeout_secs)
    }

    /// Local path of `address`, downloading it first if it is remote and not yet cached.
    pub fn localize(&self, address: &str) -> Result<PathBuf> {
        if !is_remote(address) {
            return Ok(PathBuf::from(address));
        }

        let file_name = address.rsplit('/').next().unwrap_or(address);
        let cache_path = self.cache_dir.join(file_name);

        // Fast path: already cached
        if cache_path.exists() {
            return Ok(cache_path);
        }

        fs::create_dir_all(&self.cache_dir)?;
        info!(url = address, path = %cache_path.display(), "Downloading geoid");
        self.downloader.download_to(address, &cache_path, None)?;
        Ok(cache_path)
    }
}

impl GeoidSource for GeoTiffGeoidSource {
    fn open(&self, address: &str) -> Result<Box<dyn WindowedRaster + Send>> {
        let path = self.localize(address)?;
        Ok(Box::new(GeoTiffReader::open(path)?))
    }
}

/// A geoid read, with NaN marking missing values.
#[derive(Debug, Clone)]
pub struct GeoidRead {
    /// Undulation values.
    pub buffer: RasterBuffer,
    /// Georeferencing of `buffer`.
    pub grid: RasterGrid,
    /// Whether the geoid source reaches both -180° and 180°.
    pub spans_dateline: bool,
}

impl GeoidRead {
    /// Split into buffer and grid.
    pub fn into_raster(self) -> Raster {
        (self.buffer, self.grid)
    }
}

/// True when `bounds` reaches both sides of the dateline.
fn spans_dateline(bounds: &BoundingBox) -> bool {
    bounds.xmin <= -180.0 + DATELINE_TOLERANCE && bounds.xmax >= 180.0 - DATELINE_TOLERANCE
}

/// Read the geoid over `extent` (the whole raster when `None`), padded by `res_buffer` pixels.
///
/// An extent crossing the dateline is split; both pieces are read and the
/// piece on the far side is moved by 360° so the result is one contiguous
/// raster in the extent's own longitude frame.
pub fn read_geoid<W: WindowedRaster + ?Sized>(
    raster: &mut W,
    extent: Option<&BoundingBox>,
    res_buffer: usize,
) -> Result<GeoidRead> {
    let source_bounds = raster.grid().bounds();
    let spans = spans_dateline(&source_bounds);
    if !spans {
        warn!(
            geoid = %source_bounds,
            "Geoid does not span -180 to 180; values near the dateline may be inconsistent"
        );
    }

    let (buffer, grid) = match extent {
        None => {
            let grid = raster.grid().clone();
            let buffer = raster.read_pixels(PixelWindow::full(grid.height(), grid.width()))?;
            (buffer, grid)
        }
        Some(extent) => read_extent(raster, extent, res_buffer)?,
    };

    let (buffer, grid) = nodata_to_nan(buffer, &grid);
    Ok(GeoidRead {
        buffer,
        grid,
        spans_dateline: spans,
    })
}

fn read_extent<W: WindowedRaster + ?Sized>(raster: &mut W, extent: &BoundingBox, res_buffer: usize) -> Result<Raster> {
    let crossing = classify_dateline_crossing(extent)?;
    let (western, eastern) = split_across_dateline(extent)?;
    let eastern = match eastern {
        Some(eastern) if crossing.crosses() => eastern,
        _ => return read_window(raster, &western, Crs::Wgs84, res_buffer),
    };

    let west = read_window(raster, &western, Crs::Wgs84, res_buffer)?;
    let east = read_window(raster, &eastern, Crs::Wgs84, res_buffer)?;
    // Keep the side in the extent's frame first; move the other across.
    let pieces = match crossing {
        DatelineCrossing::East => [east, translate_longitude(west, 360.0)],
        _ => [west, translate_longitude(east, -360.0)],
    };
    debug!(extent = %extent, crossing = ?crossing, "Joining geoid across the dateline");
    merge_rasters(&pieces, None, MergeNodata::Nan, Resampling::Bilinear)
}

/// Shift a raster east by `dx` degrees, in whole pixels of its own transform.
fn translate_longitude((buffer, grid): Raster, dx: f64) -> Raster {
    let transform = grid.transform().translate_pixels(dx / grid.transform().a, 0.0);
    (buffer, grid.with_transform(transform))
}

fn nodata_to_nan(mut buffer: RasterBuffer, grid: &RasterGrid) -> Raster {
    for value in buffer.data_mut() {
        if !grid.is_valid(*value) {
            *value = f32::NAN;
        }
    }
    let grid = grid.with_dtype(DataType::Float32).with_nodata(Some(f64::NAN));
    (buffer, grid)
}

/// Recommended buffer when `res_buffer` geoid pixels do not reach past one DEM pixel.
///
/// Returns `None` when the buffer is sufficient, otherwise the smallest buffer
/// that is.
pub fn insufficient_buffer(dem_resolution: f64, geoid_resolution: f64, res_buffer: usize) -> Option<usize> {
    if geoid_resolution * res_buffer as f64 <= dem_resolution {
        Some((dem_resolution / geoid_resolution).floor() as usize + 1)
    } else {
        None
    }
}

/// Convert orthometric heights to ellipsoidal heights by adding the geoid.
///
/// The geoid is read over the DEM's footprint padded by `res_buffer` geoid
/// pixels, shifted to Point registration when the DEM is Point-registered,
/// and resampled bilinearly onto the DEM grid. Every band gets the same
/// offset; pixels without geoid coverage become NaN.
pub fn remove_geoid<W: WindowedRaster + ?Sized>(
    dem: &RasterBuffer,
    dem_grid: &RasterGrid,
    geoid: &mut W,
    registration: PixelRegistration,
    res_buffer: usize,
) -> Result<RasterBuffer> {
    dem.check_matches(dem_grid)?;
    let extent = dem_grid.bounds();

    let dem_resolution = dem_grid.resolution().0;
    let geoid_resolution = geoid.grid().resolution().0;
    if let Some(recommended) = insufficient_buffer(dem_resolution, geoid_resolution, res_buffer) {
        warn!(
            dem_resolution,
            geoid_resolution,
            res_buffer,
            recommended,
            "Geoid read buffer is too small for the DEM resolution; increase the buffer"
        );
    }

    let read = read_geoid(geoid, Some(&extent), res_buffer)?;
    let geoid_grid = match registration {
        PixelRegistration::Point => shift_for_registration(&read.grid, PixelRegistration::Area, PixelRegistration::Point),
        PixelRegistration::Area => read.grid,
    };

    let target = dem_grid.with_band_count(1);
    let offset = reproject(&read.buffer, &geoid_grid, &target, Resampling::Bilinear, Some(f64::NAN))?;

    let mut out = dem.clone();
    let geoid_values = offset.band(0);
    for band in 0..out.bands() {
        for (value, undulation) in out.band_mut(band).iter_mut().zip(geoid_values) {
            *value += *undulation;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Affine;
    use crate::window::MemoryRaster;

    fn global_geoid(res: f64) -> MemoryRaster {
        let width = (360.0 / res) as usize;
        let height = (180.0 / res) as usize;
        let data = (0..height)
            .flat_map(|r| (0..width).map(move |c| (r * 1000 + c) as f32))
            .collect();
        let grid = RasterGrid::new(width, height, Affine::from_origin(-180.0, 90.0, res, res), Crs::Wgs84).unwrap();
        MemoryRaster::new(RasterBuffer::new(1, height, width, data).unwrap(), grid).unwrap()
    }

    #[test]
    fn test_insufficient_buffer() {
        assert_eq!(insufficient_buffer(1.0 / 3600.0, 0.25, 2), None);
        assert_eq!(insufficient_buffer(1.0, 0.25, 2), Some(5));
        assert_eq!(insufficient_buffer(0.5, 0.25, 2), Some(3));
        assert_eq!(insufficient_buffer(0.6, 0.25, 3), None);
    }

    #[test]
    fn test_read_whole_geoid() {
        let mut geoid = global_geoid(10.0);
        let read = read_geoid(&mut geoid, None, DEFAULT_READ_BUFFER).unwrap();
        assert!(read.spans_dateline);
        assert_eq!((read.grid.width(), read.grid.height()), (36, 18));
        assert!(read.grid.nodata().unwrap().is_nan());
    }

    #[test]
    fn test_sentinel_becomes_nan() {
        let grid = RasterGrid::new(2, 1, Affine::from_origin(0.0, 1.0, 1.0, 1.0), Crs::Wgs84)
            .unwrap()
            .with_nodata(Some(-9999.0));
        let buf = RasterBuffer::new(1, 1, 2, vec![-9999.0, 3.0]).unwrap();
        let mut geoid = MemoryRaster::new(buf, grid).unwrap();
        let read = read_geoid(&mut geoid, None, 0).unwrap();
        assert!(!read.spans_dateline);
        assert!(read.buffer.get(0, 0, 0).is_nan());
        assert_eq!(read.buffer.get(0, 0, 1), 3.0);
    }

    #[test]
    fn test_dateline_read_is_contiguous() {
        let mut geoid = global_geoid(1.0);
        let read = read_geoid(&mut geoid, Some(&BoundingBox::new(179.0, 0.0, 181.0, 1.0)), 0).unwrap();
        let bounds = read.grid.bounds();
        assert_eq!((bounds.xmin, bounds.xmax), (179.0, 181.0));
        // Row 89 of the source; last column then first column.
        assert_eq!(read.buffer.get(0, 0, 0), (89 * 1000 + 359) as f32);
        assert_eq!(read.buffer.get(0, 0, 1), (89 * 1000) as f32);
    }

    #[test]
    fn test_remove_geoid_adds_offset_to_every_band() {
        let mut geoid = global_geoid(1.0);
        let dem_grid = RasterGrid::new(2, 2, Affine::from_origin(10.0, 2.0, 1.0, 1.0), Crs::Wgs84)
            .unwrap()
            .with_band_count(2);
        let dem = RasterBuffer::filled(2, 2, 2, 100.0);
        let out = remove_geoid(&dem, &dem_grid, &mut geoid, PixelRegistration::Area, 2).unwrap();
        // Aligned grids: DEM pixel (0, 0) is geoid row 88, column 190.
        let expected = 100.0 + (88 * 1000 + 190) as f32;
        assert_eq!(out.get(0, 0, 0), expected);
        assert_eq!(out.get(1, 0, 0), expected);
    }
}
