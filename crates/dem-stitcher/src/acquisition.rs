//! Fetching source tiles and decoding them into rasters.
//!
//! Each dataset stores its tiles either as GeoTIFFs or as zipped SRTM HGT
//! files. A [`TileSource`] turns a tile's source address into a raster, or
//! into `None` when the source genuinely has no such tile. Tiles of one
//! request are fetched concurrently by [`acquire_tiles`] and returned in
//! tile-index order.

use crate::config::{is_remote, StitchConfig};
use crate::credentials::{ensure_credentials, NetrcEntry};
use crate::dataset::{Dataset, TileFormat};
use crate::geotiff::GeoTiffReader;
use crate::raster::{Crs, DataType, PixelRegistration, Raster, RasterBuffer, RasterGrid};
use crate::tile_index::TileFootprint;
use crate::transform::Affine;
use crate::{Result, StitchError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Suffix of the payload inside SRTM/NASADEM archives.
pub const HGT_SUFFIX: &str = ".hgt";

/// Void value in HGT files.
pub const HGT_NODATA: f64 = -32768.0;

/// Download statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadStats {
    /// Number of files downloaded this session.
    pub files_downloaded: usize,
    /// Total bytes downloaded this session.
    pub bytes_downloaded: u64,
}

/// Blocking HTTP downloader shared by tile and geoid sources.
pub struct Downloader {
    client: reqwest::blocking::Client,
    files_downloaded: AtomicUsize,
    bytes_downloaded: AtomicU64,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Downloader {
    /// Create a downloader whose requests time out after `timeout_secs`.
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            files_downloaded: AtomicUsize::new(0),
            bytes_downloaded: AtomicU64::new(0),
        })
    }

    /// Download statistics for this session.
    pub fn stats(&self) -> DownloadStats {
        DownloadStats {
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Fetch `url` into memory. A 404 yields `None`.
    pub fn fetch(&self, url: &str, credentials: Option<&NetrcEntry>) -> Result<Option<Vec<u8>>> {
        let mut request = self.client.get(url);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.login, Some(&credentials.password));
        }
        let response = request.send()?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(url, "Remote file not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StitchError::DownloadFailed {
                address: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let bytes = response.bytes()?;
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(Some(bytes.to_vec()))
    }

    /// Download `url` to `path`. Returns `false` on a 404.
    pub fn download_to(&self, url: &str, path: &Path, credentials: Option<&NetrcEntry>) -> Result<bool> {
        let Some(bytes) = self.fetch(url, credentials)? else {
            return Ok(false);
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        Ok(true)
    }
}

/// A decoded source tile.
#[derive(Debug, Clone)]
pub struct AcquiredTile {
    /// Pixel values.
    pub buffer: RasterBuffer,
    /// Georeferencing; the transform always describes pixel corners.
    pub grid: RasterGrid,
    /// Registration convention the source declares.
    pub registration: PixelRegistration,
}

impl AcquiredTile {
    /// Split into buffer and grid.
    pub fn into_raster(self) -> Raster {
        (self.buffer, self.grid)
    }

    /// Move the tile east by `dx` degrees. Pixels are untouched.
    pub fn translated(self, dx: f64) -> Self {
        if dx == 0.0 {
            return self;
        }
        let transform = self.grid.transform().translate_pixels(dx / self.grid.transform().a, 0.0);
        Self {
            grid: self.grid.with_transform(transform),
            ..self
        }
    }
}

/// Produces tile rasters from source addresses.
pub trait TileSource: Send + Sync {
    /// Fetch and decode one tile of `dataset`.
    ///
    /// Returns `Ok(None)` when the source has no such tile. Temporary files
    /// go under `scratch`, which the caller removes afterwards.
    fn fetch_tile(&self, dataset: Dataset, address: &str, scratch: &Path) -> Result<Option<AcquiredTile>>;
}

/// Tile source reading each dataset's native format from URLs or local paths.
pub struct DatasetTileSource {
    downloader: Downloader,
    earthdata_host: String,
}

impl std::fmt::Debug for DatasetTileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetTileSource")
            .field("earthdata_host", &self.earthdata_host)
            .finish()
    }
}

impl DatasetTileSource {
    /// Create a source from configuration.
    pub fn from_config(config: &StitchConfig) -> Result<Self> {
        Ok(Self {
            downloader: Downloader::new(config.http_timeout_secs)?,
            earthdata_host: config.earthdata_host.clone(),
        })
    }

    /// Download statistics for this session.
    pub fn download_stats(&self) -> DownloadStats {
        self.downloader.stats()
    }

    /// Local path for `address`, downloading remote files into `scratch`.
    fn localize(&self, dataset: Dataset, address: &str, scratch: &Path) -> Result<Option<PathBuf>> {
        if !is_remote(address) {
            let path = PathBuf::from(address);
            if !path.exists() {
                debug!(path = %path.display(), "Local tile missing");
                return Ok(None);
            }
            return Ok(Some(path));
        }

        let local = scratch.join(scratch_file_name(address));
        if local.exists() {
            return Ok(Some(local));
        }

        let credentials = if dataset.requires_earthdata_login() {
            Some(ensure_credentials(&self.earthdata_host)?)
        } else {
            None
        };
        if self.downloader.download_to(address, &local, credentials.as_ref())? {
            Ok(Some(local))
        } else {
            Ok(None)
        }
    }
}

/// Scratch file name for a remote address: a hash of the whole address
/// followed by its last path segment, so tiles sharing a basename stay apart.
fn scratch_file_name(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    let prefix: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    let base = address
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("tile");
    format!("{}-{}", prefix, base)
}

impl TileSource for DatasetTileSource {
    fn fetch_tile(&self, dataset: Dataset, address: &str, scratch: &Path) -> Result<Option<AcquiredTile>> {
        let Some(path) = self.localize(dataset, address, scratch)? else {
            return Ok(None);
        };
        match dataset.tile_format() {
            TileFormat::GeoTiff => read_geotiff_tile(&path).map(Some),
            TileFormat::ZippedHgt => read_zipped_hgt(&path, address).map(Some),
        }
    }
}

fn read_geotiff_tile(path: &Path) -> Result<AcquiredTile> {
    let mut reader = GeoTiffReader::open(path)?;
    let registration = reader.registration();
    let (buffer, grid) = reader.read_all()?;
    Ok(AcquiredTile {
        buffer,
        grid,
        registration,
    })
}

/// Decode the single `.hgt` entry of a zip archive.
pub fn read_zipped_hgt(path: &Path, address: &str) -> Result<AcquiredTile> {
    let file = fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut matches = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.name().to_ascii_lowercase().ends_with(HGT_SUFFIX) {
            matches.push(i);
        }
    }
    let index = match matches.as_slice() {
        [index] => *index,
        _ => {
            return Err(StitchError::AmbiguousArchive {
                address: address.to_string(),
                suffix: HGT_SUFFIX.to_string(),
                count: matches.len(),
            })
        }
    };

    let mut entry = archive.by_index(index)?;
    let name = entry.name().to_string();
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    debug!(entry = %name, bytes = bytes.len(), "Extracted HGT payload");
    decode_hgt(&name, &bytes)
}

/// Decode an HGT payload named like `N34W118.hgt`.
///
/// HGT files are square grids of big-endian `i16` (1201 or 3601 per side)
/// whose outer samples lie on the tile's whole-degree edges, so they are
/// Point registered and the corner transform starts half a pixel outside the tile.
pub fn decode_hgt(name: &str, bytes: &[u8]) -> Result<AcquiredTile> {
    let invalid = |reason: String| StitchError::InvalidHgt {
        name: name.to_string(),
        reason,
    };

    let samples = bytes.len() / 2;
    let size = match samples {
        n if n == 1201 * 1201 => 1201,
        n if n == 3601 * 3601 => 3601,
        _ => {
            return Err(invalid(format!(
                "{} bytes is not a 1201x1201 or 3601x3601 grid of i16",
                bytes.len()
            )))
        }
    };
    let (lat, lon) = hgt_corner(name).ok_or_else(|| invalid("name has no N/S..E/W.. coordinate".to_string()))?;

    let data: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as f32)
        .collect();

    let res = 1.0 / (size - 1) as f64;
    let transform = Affine::from_origin(lon - res / 2.0, lat + 1.0 + res / 2.0, res, res);
    let grid = RasterGrid::new(size, size, transform, Crs::Wgs84)?
        .with_dtype(DataType::Int16)
        .with_nodata(Some(HGT_NODATA));
    let buffer = RasterBuffer::new(1, size, size, data)?;
    Ok(AcquiredTile {
        buffer,
        grid,
        registration: PixelRegistration::Point,
    })
}

/// South-west corner `(lat, lon)` encoded in an HGT file name.
pub fn hgt_corner(name: &str) -> Option<(f64, f64)> {
    let file_name = Path::new(name).file_name()?.to_str()?.to_ascii_lowercase();
    let chars: Vec<char> = file_name.chars().collect();

    let digits_from = |start: usize| -> (String, usize) {
        let digits: String = chars[start..].iter().take_while(|c| c.is_ascii_digit()).collect();
        let end = start + digits.len();
        (digits, end)
    };

    // Pattern: [ns]\d+[ew]\d+
    for (i, &c) in chars.iter().enumerate() {
        if c != 'n' && c != 's' {
            continue;
        }
        let (lat_str, lat_end) = digits_from(i + 1);
        if lat_str.is_empty() {
            continue;
        }
        let Some(&dir) = chars.get(lat_end) else {
            continue;
        };
        if dir != 'e' && dir != 'w' {
            continue;
        }
        let (lon_str, _) = digits_from(lat_end + 1);
        if lon_str.is_empty() {
            continue;
        }

        let lat: f64 = lat_str.parse().ok()?;
        let lon: f64 = lon_str.parse().ok()?;
        let lat = if c == 'n' { lat } else { -lat };
        let lon = if dir == 'e' { lon } else { -lon };
        return Some((lat, lon));
    }
    None
}

/// Fetch `tiles` with up to `max_workers` threads.
///
/// Tasks and results carry the tile's position so the output follows the
/// input order regardless of completion order. Tiles the source does not
/// have are dropped; the first error (in tile order) fails the whole call.
/// Each tile is moved by its footprint's
/// [`longitude_shift`](TileFootprint::longitude_shift) so it lands in the
/// request's longitude frame.
pub fn acquire_tiles(
    source: &dyn TileSource,
    dataset: Dataset,
    tiles: &[TileFootprint],
    scratch: &Path,
    max_workers: usize,
) -> Result<Vec<AcquiredTile>> {
    if tiles.is_empty() {
        return Ok(Vec::new());
    }
    let workers = max_workers.clamp(1, tiles.len());
    info!(dataset = %dataset, tiles = tiles.len(), workers, "Acquiring tiles");

    let (task_tx, task_rx) = crossbeam_channel::unbounded::<(usize, &str)>();
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, Result<Option<AcquiredTile>>)>();
    for (index, tile) in tiles.iter().enumerate() {
        if task_tx.send((index, tile.source_address.as_str())).is_err() {
            break;
        }
    }
    drop(task_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for (index, address) in task_rx.iter() {
                    let result = source.fetch_tile(dataset, address, scratch);
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut results: Vec<_> = result_rx.iter().collect();
    results.sort_by_key(|(index, _)| *index);

    let mut acquired = Vec::with_capacity(results.len());
    for (index, result) in results {
        match result? {
            Some(tile) => {
                let shift = tiles[index].longitude_shift;
                if shift != 0.0 {
                    debug!(tile = %tiles[index].tile_id, shift, "Translating tile across the dateline");
                }
                acquired.push(tile.translated(shift));
            }
            None => debug!(tile = %tiles[index].tile_id, "Tile not available; skipping"),
        }
    }
    debug!(acquired = acquired.len(), requested = tiles.len(), "Tile acquisition finished");
    Ok(acquired)
}
