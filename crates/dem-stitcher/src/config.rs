//! Stitcher configuration.

use crate::dataset::{Dataset, Geoid};
use crate::{Result, StitchError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default number of concurrent tile downloads.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Host that issues NASA Earthdata logins.
pub const DEFAULT_EARTHDATA_HOST: &str = "urs.earthdata.nasa.gov";

/// Runtime settings shared by every request a [`crate::Stitcher`] serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StitchConfig {
    /// Directory holding `<dataset>.geojson.gz` tile indexes and local geoid rasters.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of tiles fetched concurrently.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Threads used by resampling kernels. `None` uses every available core.
    #[serde(default)]
    pub resampling_threads: Option<usize>,

    /// HTTP request timeout.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Per-geoid location overrides (URL or path).
    #[serde(default)]
    pub geoid_paths: BTreeMap<Geoid, String>,

    /// Directory where remote geoid rasters are cached. Defaults to `<data_dir>/geoids`.
    #[serde(default)]
    pub geoid_cache_dir: Option<PathBuf>,

    /// Parent of per-request scratch directories. `None` uses the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Host whose `.netrc` entry authenticates Earthdata downloads.
    #[serde(default = "default_earthdata_host")]
    pub earthdata_host: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_earthdata_host() -> String {
    DEFAULT_EARTHDATA_HOST.to_string()
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_workers: DEFAULT_MAX_WORKERS,
            resampling_threads: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            geoid_paths: BTreeMap::new(),
            geoid_cache_dir: None,
            scratch_dir: None,
            earthdata_host: default_earthdata_host(),
        }
    }
}

impl StitchConfig {
    /// Defaults with a specific data directory.
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: StitchConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Reject settings no request could run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(StitchError::InvalidConfiguration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.resampling_threads == Some(0) {
            return Err(StitchError::InvalidConfiguration(
                "resampling_threads must be at least 1 when set".to_string(),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(StitchError::InvalidConfiguration(
                "http_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the bundled tile index for `dataset`.
    pub fn tile_index_path(&self, dataset: Dataset) -> PathBuf {
        self.data_dir.join(format!("{}.geojson.gz", dataset.name()))
    }

    /// Where to read `geoid` from: an override, a URL, or a file under `data_dir`.
    pub fn geoid_address(&self, geoid: Geoid) -> String {
        if let Some(address) = self.geoid_paths.get(&geoid) {
            return address.clone();
        }
        let default = geoid.default_address();
        if is_remote(default) {
            default.to_string()
        } else {
            self.data_dir.join(default).to_string_lossy().into_owned()
        }
    }

    /// Directory for cached copies of remote geoids.
    pub fn geoid_cache_dir(&self) -> PathBuf {
        self.geoid_cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("geoids"))
    }
}

/// True when `address` is an HTTP(S) URL rather than a path.
pub fn is_remote(address: &str) -> bool {
    address.starts_with("http://") || address.starts_with("https://")
}
