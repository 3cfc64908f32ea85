//! Error types for the stitcher crate.

use thiserror::Error;

/// Errors that can occur while looking up, reading, merging, or normalizing DEM tiles.
#[derive(Debug, Error)]
pub enum StitchError {
    /// Bounds are malformed, reach past a pole, or miss the globe entirely.
    #[error("Invalid bounds [{xmin}, {ymin}, {xmax}, {ymax}]: {reason}")]
    InvalidBounds {
        /// West edge.
        xmin: f64,
        /// South edge.
        ymin: f64,
        /// East edge.
        xmax: f64,
        /// North edge.
        ymax: f64,
        /// What is wrong with them.
        reason: String,
    },

    /// Bounds cross both the -180 and +180 meridians.
    #[error("Bounds [{xmin}, {xmax}] cross both the -180 and +180 meridians")]
    DoubleCrossing {
        /// West edge.
        xmin: f64,
        /// East edge.
        xmax: f64,
    },

    /// Unknown dataset name.
    #[error("Unsupported dataset '{0}' (expected one of: glo_30, glo_90, glo_90_missing, 3dep, srtm_v3, nasadem)")]
    UnsupportedDataset(String),

    /// Unknown geoid name.
    #[error("Unsupported geoid '{0}' (expected one of: geoid_18, egm_08, egm_96)")]
    UnsupportedGeoid(String),

    /// The raster is in a CRS this crate cannot transform.
    #[error("Unsupported CRS EPSG:{0} (only EPSG:4326 and EPSG:4269 are supported)")]
    UnsupportedCrs(u32),

    /// Two rasters that must share a CRS do not.
    #[error("CRS mismatch: expected EPSG:{expected}, found EPSG:{found}")]
    CrsMismatch {
        /// CRS of the reference raster.
        expected: u32,
        /// CRS of the offending raster.
        found: u32,
    },

    /// A configuration value is outside its allowed set.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Extent is not well ordered (xmin < xmax and ymin < ymax).
    #[error("Invalid extent [{xmin}, {ymin}, {xmax}, {ymax}]: expected xmin < xmax and ymin < ymax")]
    InvalidExtent {
        /// West edge.
        xmin: f64,
        /// South edge.
        ymin: f64,
        /// East edge.
        xmax: f64,
        /// North edge.
        ymax: f64,
    },

    /// Requested extent and raster footprint do not share an area.
    #[error("Extent does not overlap the raster with any area: {0}")]
    NoOverlap(String),

    /// No tiles of the dataset intersect the bounds.
    #[error("No {dataset} tiles cover the requested bounds")]
    NoCoverage {
        /// Dataset that was searched.
        dataset: String,
    },

    /// Nothing to merge.
    #[error("Merge requires at least one raster")]
    EmptyMerge,

    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Invalid GeoTIFF - missing or inconsistent georeferencing tags.
    #[error("Invalid GeoTIFF: {0}")]
    InvalidGeoTiff(String),

    /// HTTP request error when fetching tiles or geoids.
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// Failed to download a file from a remote server.
    #[error("Failed to download {address}: {reason}")]
    DownloadFailed {
        /// URL that was requested.
        address: String,
        /// Reason for failure.
        reason: String,
    },

    /// Zip archive error.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Archive holds zero or several payload files with the expected suffix.
    #[error("Archive {address} contains {count} '{suffix}' entries (expected exactly one)")]
    AmbiguousArchive {
        /// Archive location.
        address: String,
        /// Suffix that was searched for.
        suffix: String,
        /// Number of matching entries.
        count: usize,
    },

    /// HGT payload has an unexpected size or name.
    #[error("Invalid HGT file {name}: {reason}")]
    InvalidHgt {
        /// Entry name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// JSON error decoding a tile index.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error decoding a configuration file.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A tile index record could not be interpreted.
    #[error("Invalid tile index for {dataset}: {reason}")]
    InvalidTileIndex {
        /// Dataset whose index is malformed.
        dataset: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Tile index file is missing from the data directory.
    #[error("Tile index for {dataset} not found at {path}")]
    TileIndexMissing {
        /// Dataset whose index is missing.
        dataset: String,
        /// Path that was checked.
        path: String,
    },

    /// Buffer dimensions disagree with its grid.
    #[error("Shape mismatch: buffer is {buffer:?} (bands, rows, cols) but grid expects {grid:?}")]
    ShapeMismatch {
        /// Buffer shape.
        buffer: (usize, usize, usize),
        /// Grid shape.
        grid: (usize, usize, usize),
    },

    /// Invalid raster grid (zero size or degenerate transform).
    #[error("Invalid raster grid: {0}")]
    InvalidGrid(String),

    /// No credential record for a host that requires one.
    #[error("No credentials for {host} found in {path}; add a 'machine {host} login <user> password <pass>' entry")]
    MissingCredentials {
        /// Host that needs credentials.
        host: String,
        /// Netrc file that was checked.
        path: String,
    },

    /// XML error reading or writing ISCE image metadata.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// ISCE image metadata is missing or lacks a required property.
    #[error("Invalid ISCE metadata {path}: {reason}")]
    InvalidIsceMetadata {
        /// Metadata file.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Cache lock was poisoned (a thread panicked while holding the lock).
    #[error("Tile index cache lock was poisoned")]
    CacheLockPoisoned,

    /// Worker thread pool could not be built.
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
