//! Request orchestration: lookup, acquisition, merge, normalization, geoid removal, gap filling.
//!
//! A request runs against its dataset (the primary tier). When that dataset
//! has a coarser gap tier whose footprints touch the bounds and gap filling is
//! on, the gap tier is stitched as well: it replaces the primary result when
//! the primary tier has no tiles there, and otherwise patches the primary
//! result's holes. Gap filling goes at most one level deep.

use crate::acquisition::{acquire_tiles, DatasetTileSource, TileSource};
use crate::bounds::{classify_dateline_crossing, validate_bounds, BoundingBox, DatelineCrossing};
use crate::config::{is_remote, StitchConfig};
use crate::credentials::ensure_credentials;
use crate::dataset::Dataset;
use crate::geoid::{remove_geoid, GeoTiffGeoidSource, GeoidSource, DEFAULT_REMOVAL_BUFFER};
use crate::geotiff::write_geotiff;
use crate::isce::{tag_dem_xml_as_ellipsoidal, write_isce_dem};
use crate::merge::{merge_rasters, MergeNodata};
use crate::normalize::{reproject_to_crs, retarget_resolution, shift_for_registration};
use crate::raster::{Crs, PixelRegistration, Raster, Resolution};
use crate::tile_index::TileIndexRegistry;
use crate::warp::Resampling;
use crate::{Result, StitchError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// Parameters of one stitch.
#[derive(Debug, Clone, PartialEq)]
pub struct DemRequest {
    /// Area to cover, `(xmin, ymin, xmax, ymax)` in degrees. May cross ±180°.
    pub bounds: BoundingBox,
    /// Dataset name, e.g. `glo_30`.
    pub dataset_name: String,
    /// Convert heights to the ellipsoid by adding the dataset's geoid.
    pub want_ellipsoidal_height: bool,
    /// Registration of the output.
    pub dst_registration: PixelRegistration,
    /// Output resolution; `None` keeps the source resolution.
    pub dst_resolution: Option<Resolution>,
    /// Value for pixels no tile covers: NaN or 0.
    pub merge_nodata_value: f64,
    /// Patch coverage gaps from the dataset's coarser gap tier.
    pub fill_gaps: bool,
}

impl DemRequest {
    /// Request with default options: ellipsoidal heights, Point registration,
    /// native resolution, NaN gaps, gap filling on.
    pub fn new(bounds: impl Into<BoundingBox>, dataset_name: impl Into<String>) -> Self {
        Self {
            bounds: bounds.into(),
            dataset_name: dataset_name.into(),
            want_ellipsoidal_height: true,
            dst_registration: PixelRegistration::Point,
            dst_resolution: None,
            merge_nodata_value: f64::NAN,
            fill_gaps: true,
        }
    }

    /// Set whether to convert to ellipsoidal heights.
    pub fn with_ellipsoidal_height(mut self, enabled: bool) -> Self {
        self.want_ellipsoidal_height = enabled;
        self
    }

    /// Set the output registration.
    pub fn with_registration(mut self, registration: PixelRegistration) -> Self {
        self.dst_registration = registration;
        self
    }

    /// Set the output resolution.
    pub fn with_resolution(mut self, resolution: impl Into<Resolution>) -> Self {
        self.dst_resolution = Some(resolution.into());
        self
    }

    /// Set the value written where no tile has data.
    pub fn with_merge_nodata(mut self, value: f64) -> Self {
        self.merge_nodata_value = value;
        self
    }

    /// Set whether to fill gaps from the gap tier.
    pub fn with_fill_gaps(mut self, enabled: bool) -> Self {
        self.fill_gaps = enabled;
        self
    }

    fn plan(&self) -> Result<Plan> {
        validate_bounds(&self.bounds)?;
        let dataset: Dataset = self.dataset_name.parse()?;
        let nodata = MergeNodata::try_from(self.merge_nodata_value)?;
        if let Some(resolution) = &self.dst_resolution {
            resolution.validate()?;
        }
        let crossing = classify_dateline_crossing(&self.bounds)?;
        Ok(Plan {
            bounds: self.bounds,
            crossing,
            dataset,
            nodata,
            registration: self.dst_registration,
            ellipsoidal: self.want_ellipsoidal_height,
            fill_gaps: self.fill_gaps,
        })
    }
}

/// A validated request.
#[derive(Debug, Clone, Copy)]
struct Plan {
    bounds: BoundingBox,
    crossing: DatelineCrossing,
    dataset: Dataset,
    nodata: MergeNodata,
    registration: PixelRegistration,
    ellipsoidal: bool,
    fill_gaps: bool,
}

/// Stitches DEM tiles into one raster per request.
///
/// Holds the tile index cache and the sources used to read tiles and geoids,
/// so one instance can serve many requests, including concurrently.
pub struct Stitcher {
    config: StitchConfig,
    index: Arc<TileIndexRegistry>,
    tiles: Arc<dyn TileSource>,
    geoids: Arc<dyn GeoidSource>,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Stitcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stitcher")
            .field("config", &self.config)
            .field("resampling_threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Stitcher {
    /// Stitcher reading tile indexes from `config.data_dir` and tiles and geoids from their addresses.
    pub fn new(config: StitchConfig) -> Result<Self> {
        config.validate()?;
        let index = Arc::new(TileIndexRegistry::from_config(&config));
        let tiles: Arc<dyn TileSource> = Arc::new(DatasetTileSource::from_config(&config)?);
        let geoids: Arc<dyn GeoidSource> = Arc::new(GeoTiffGeoidSource::from_config(&config)?);
        Self::with_sources(config, index, tiles, geoids)
    }

    /// Stitcher with explicit index and sources.
    pub fn with_sources(
        config: StitchConfig,
        index: Arc<TileIndexRegistry>,
        tiles: Arc<dyn TileSource>,
        geoids: Arc<dyn GeoidSource>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.resampling_threads.unwrap_or(0))
            .thread_name(|i| format!("dem-resample-{}", i))
            .build()?;
        Ok(Self {
            config,
            index,
            tiles,
            geoids,
            pool,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    /// Tile index cache.
    pub fn tile_index(&self) -> &TileIndexRegistry {
        &self.index
    }

    /// Stitch the request into one Float32 raster with NaN nodata.
    ///
    /// Fails with [`StitchError::NoCoverage`] when neither the dataset nor an
    /// applicable gap tier has tiles over the bounds. The request is fully
    /// validated before any tile is looked up.
    pub fn stitch(&self, request: &DemRequest) -> Result<Raster> {
        let plan = request.plan()?;
        info!(
            dataset = %plan.dataset,
            bounds = %plan.bounds,
            crossing = ?plan.crossing,
            "Stitching DEM"
        );

        let gap_tier = match plan.dataset.gap_tier() {
            Some(tier) if plan.fill_gaps && self.index.intersects_any(&plan.bounds, tier)? => Some(tier),
            _ => None,
        };
        let requested = request.dst_resolution;

        let primary = self.stitch_tier(&plan, plan.dataset, requested)?;
        match (primary, gap_tier) {
            (Some(primary), None) => Ok(primary),
            (Some(primary), Some(tier)) => {
                let (xres, yres) = primary.1.resolution();
                let Some(patch) = self.stitch_tier(&plan, tier, Some(Resolution::new(xres, yres)))? else {
                    return Ok(primary);
                };
                debug!(tier = %tier, "Patching gaps from coarser tier");
                self.pool
                    .install(|| merge_rasters(&[primary, patch], None, plan.nodata, Resampling::Bilinear))
            }
            (None, Some(tier)) => {
                info!(dataset = %plan.dataset, tier = %tier, "No tiles in requested dataset; using gap tier");
                let resolution = requested.unwrap_or_else(|| Resolution::square(plan.dataset.native_resolution()));
                self.stitch_tier(&plan, tier, Some(resolution))?
                    .ok_or_else(|| no_coverage(plan.dataset))
            }
            (None, None) => Err(no_coverage(plan.dataset)),
        }
    }

    /// Stitch ellipsoidal, Point-registered heights and write them as an ISCE2 DEM.
    ///
    /// The DEM goes to `dst_path`, or `<dataset_name>.wgs.84` in the working
    /// directory, with pixels lacking data set to `nodata`. Its `.xml`
    /// descriptor is tagged with the WGS84 reference datum. Returns the DEM path.
    pub fn stitch_for_isce2(
        &self,
        bounds: impl Into<BoundingBox>,
        dataset_name: &str,
        dst_path: Option<&Path>,
        nodata: f64,
    ) -> Result<PathBuf> {
        let request = DemRequest::new(bounds, dataset_name)
            .with_ellipsoidal_height(true)
            .with_registration(PixelRegistration::Point);
        let (buffer, grid) = self.stitch(&request)?;

        let out_path = dst_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(format!("{}.wgs.84", dataset_name)));
        write_isce_dem(&out_path, &buffer, &grid, nodata)?;
        tag_dem_xml_as_ellipsoidal(&out_path)?;
        info!(path = %out_path.display(), "Wrote ISCE2 DEM");
        Ok(out_path)
    }

    /// Source addresses of the tiles of `dataset_name` overlapping `bounds`, in tile-id order.
    ///
    /// With `localize_to`, each tile is fetched and written there as
    /// `<tile_id>.tif`, and the local paths of the tiles that exist are
    /// returned instead.
    pub fn get_dem_tile_paths(
        &self,
        bounds: &BoundingBox,
        dataset_name: &str,
        localize_to: Option<&Path>,
    ) -> Result<Vec<String>> {
        validate_bounds(bounds)?;
        let dataset: Dataset = dataset_name.parse()?;
        let tiles = self.index.get_overlapping_tiles(bounds, dataset)?;

        let Some(dir) = localize_to else {
            return Ok(tiles.into_iter().map(|t| t.source_address).collect());
        };

        fs::create_dir_all(dir)?;
        self.check_credentials(dataset, tiles.iter().map(|t| t.source_address.as_str()))?;
        let scratch = self.scratch_dir()?;
        let mut paths = Vec::with_capacity(tiles.len());
        for tile in &tiles {
            let Some(acquired) = self
                .tiles
                .fetch_tile(dataset, &tile.source_address, scratch.path())?
            else {
                debug!(tile = %tile.tile_id, "Tile not available; skipping");
                continue;
            };
            let path = dir.join(format!("{}.tif", tile.tile_id));
            write_geotiff(&path, &acquired.buffer, &acquired.grid, acquired.registration)?;
            paths.push(path.to_string_lossy().into_owned());
        }
        Ok(paths)
    }

    /// Stitch one dataset over the plan's bounds. `None` when no tile is available.
    fn stitch_tier(&self, plan: &Plan, dataset: Dataset, resolution: Option<Resolution>) -> Result<Option<Raster>> {
        let tiles = self.index.get_overlapping_tiles(&plan.bounds, dataset)?;
        if tiles.is_empty() {
            debug!(dataset = %dataset, "No tiles overlap the bounds");
            return Ok(None);
        }
        self.check_credentials(dataset, tiles.iter().map(|t| t.source_address.as_str()))?;

        // Removed on every exit path when dropped.
        let scratch = self.scratch_dir()?;
        let acquired = acquire_tiles(
            self.tiles.as_ref(),
            dataset,
            &tiles,
            scratch.path(),
            self.config.max_workers,
        )?;
        let Some(first) = acquired.first() else {
            return Ok(None);
        };
        let src_registration = first.registration;

        // Far-side tiles already carry their 360° shift from the lookup.
        let rasters: Vec<Raster> = acquired.into_iter().map(|tile| tile.into_raster()).collect();
        let merged = merge_rasters(&rasters, Some(&plan.bounds), plan.nodata, Resampling::Nearest)?;
        drop(rasters);

        self.pool
            .install(|| self.normalize(merged, dataset, src_registration, plan, resolution))
            .map(Some)
    }

    /// Datum, resolution, registration, then geoid.
    fn normalize(
        &self,
        merged: Raster,
        dataset: Dataset,
        src_registration: PixelRegistration,
        plan: &Plan,
        resolution: Option<Resolution>,
    ) -> Result<Raster> {
        let (mut buffer, mut grid) = merged;
        match grid.crs() {
            Crs::Wgs84 => {
                if let Some(resolution) = resolution {
                    (buffer, grid) = retarget_resolution(&buffer, &grid, resolution)?;
                }
            }
            Crs::Nad83 => {
                debug!(dataset = %dataset, "Reprojecting from NAD83 to WGS84");
                (buffer, grid) = reproject_to_crs(&buffer, &grid, Crs::Wgs84, Resampling::Bilinear, resolution)?;
            }
            other => return Err(StitchError::UnsupportedCrs(other.epsg())),
        }

        grid = shift_for_registration(&grid, src_registration, plan.registration);

        if plan.ellipsoidal {
            let geoid = dataset.geoid();
            let address = self.config.geoid_address(geoid);
            debug!(geoid = %geoid, address = %address, "Removing geoid");
            let mut raster = self.geoids.open(&address)?;
            buffer = remove_geoid(
                &buffer,
                &grid,
                raster.as_mut(),
                plan.registration,
                DEFAULT_REMOVAL_BUFFER,
            )?;
        }
        Ok((buffer, grid))
    }

    fn check_credentials<'a>(&self, dataset: Dataset, mut addresses: impl Iterator<Item = &'a str>) -> Result<()> {
        if dataset.requires_earthdata_login() && addresses.any(is_remote) {
            ensure_credentials(&self.config.earthdata_host)?;
        }
        Ok(())
    }

    /// Fresh per-request directory for downloaded tiles.
    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dem-stitcher-");
        let dir = match &self.config.scratch_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

fn no_coverage(dataset: Dataset) -> StitchError {
    StitchError::NoCoverage {
        dataset: dataset.to_string(),
    }
}

/// Stitch one request with a fresh [`Stitcher`].
pub fn stitch_dem(request: &DemRequest, config: StitchConfig) -> Result<Raster> {
    Stitcher::new(config)?.stitch(request)
}

/// Stitch an ISCE2 DEM with a fresh [`Stitcher`]. See [`Stitcher::stitch_for_isce2`].
pub fn stitch_dem_for_isce2(
    bounds: impl Into<BoundingBox>,
    dataset_name: &str,
    dst_path: Option<&Path>,
    nodata: f64,
    config: StitchConfig,
) -> Result<PathBuf> {
    Stitcher::new(config)?.stitch_for_isce2(bounds, dataset_name, dst_path, nodata)
}
