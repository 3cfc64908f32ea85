//! Supported DEM datasets and geoid models.

use crate::{Result, StitchError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One arc-second in degrees.
pub const ARC_SECOND: f64 = 1.0 / 3600.0;

/// A DEM dataset with a tile index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dataset {
    /// Copernicus GLO-30 (1 arc-second).
    #[serde(rename = "glo_30")]
    Glo30,
    /// Copernicus GLO-90 (3 arc-second).
    #[serde(rename = "glo_90")]
    Glo90,
    /// GLO-90 tiles covering areas absent from GLO-30.
    #[serde(rename = "glo_90_missing")]
    Glo90Missing,
    /// USGS 3DEP 1 arc-second.
    #[serde(rename = "3dep")]
    ThreeDep,
    /// SRTM v3 (SRTMGL1).
    #[serde(rename = "srtm_v3")]
    SrtmV3,
    /// NASADEM.
    #[serde(rename = "nasadem")]
    Nasadem,
}

/// How a dataset's tiles are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFormat {
    /// Plain GeoTIFF.
    GeoTiff,
    /// Zip archive holding exactly one `.hgt` file.
    ZippedHgt,
}

impl Dataset {
    /// All datasets, in catalogue order.
    pub const ALL: [Dataset; 6] = [
        Dataset::Glo30,
        Dataset::Glo90,
        Dataset::Glo90Missing,
        Dataset::ThreeDep,
        Dataset::SrtmV3,
        Dataset::Nasadem,
    ];

    /// Canonical name, also the stem of the bundled tile index file.
    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Glo30 => "glo_30",
            Dataset::Glo90 => "glo_90",
            Dataset::Glo90Missing => "glo_90_missing",
            Dataset::ThreeDep => "3dep",
            Dataset::SrtmV3 => "srtm_v3",
            Dataset::Nasadem => "nasadem",
        }
    }

    /// Geoid the dataset's heights are referenced to.
    pub fn geoid(&self) -> Geoid {
        match self {
            Dataset::ThreeDep => Geoid::Geoid18,
            Dataset::Glo30 | Dataset::Glo90 | Dataset::Glo90Missing => Geoid::Egm08,
            Dataset::SrtmV3 | Dataset::Nasadem => Geoid::Egm96,
        }
    }

    /// Storage format of the dataset's tiles.
    pub fn tile_format(&self) -> TileFormat {
        match self {
            Dataset::SrtmV3 | Dataset::Nasadem => TileFormat::ZippedHgt,
            _ => TileFormat::GeoTiff,
        }
    }

    /// Native pixel size in degrees.
    pub fn native_resolution(&self) -> f64 {
        match self {
            Dataset::Glo90 | Dataset::Glo90Missing => 3.0 * ARC_SECOND,
            _ => ARC_SECOND,
        }
    }

    /// Coarser dataset that fills this dataset's coverage gaps.
    pub fn gap_tier(&self) -> Option<Dataset> {
        match self {
            Dataset::Glo30 => Some(Dataset::Glo90Missing),
            _ => None,
        }
    }

    /// True for datasets served from NASA Earthdata, which requires a login.
    pub fn requires_earthdata_login(&self) -> bool {
        matches!(self, Dataset::SrtmV3 | Dataset::Nasadem)
    }
}

impl FromStr for Dataset {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self> {
        Dataset::ALL
            .into_iter()
            .find(|d| d.name() == s)
            .ok_or_else(|| StitchError::UnsupportedDataset(s.to_string()))
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Names of all supported datasets.
pub fn available_datasets() -> Vec<&'static str> {
    Dataset::ALL.iter().map(Dataset::name).collect()
}

/// Geoid undulation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Geoid {
    /// NOAA GEOID18 (CONUS).
    #[serde(rename = "geoid_18")]
    Geoid18,
    /// EGM2008.
    #[serde(rename = "egm_08")]
    Egm08,
    /// EGM96.
    #[serde(rename = "egm_96")]
    Egm96,
}

/// Public EGM2008 raster (1 arc-minute, EPSG:4326).
pub const EGM08_URL: &str =
    "https://aria-geoid.s3.us-west-2.amazonaws.com/us_nga_egm2008_1_4326__agisoft.tif";

impl Geoid {
    /// All geoids.
    pub const ALL: [Geoid; 3] = [Geoid::Geoid18, Geoid::Egm08, Geoid::Egm96];

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Geoid::Geoid18 => "geoid_18",
            Geoid::Egm08 => "egm_08",
            Geoid::Egm96 => "egm_96",
        }
    }

    /// Default location: a URL, or a file name relative to the data directory.
    pub fn default_address(&self) -> &'static str {
        match self {
            Geoid::Geoid18 => "geoid_18.tif",
            Geoid::Egm08 => EGM08_URL,
            Geoid::Egm96 => "egm96_15.tif",
        }
    }
}

impl FromStr for Geoid {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self> {
        Geoid::ALL
            .into_iter()
            .find(|g| g.name() == s)
            .ok_or_else(|| StitchError::UnsupportedGeoid(s.to_string()))
    }
}

impl fmt::Display for Geoid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for dataset in Dataset::ALL {
            assert_eq!(dataset.name().parse::<Dataset>().unwrap(), dataset);
        }
        assert_eq!(
            available_datasets(),
            vec!["glo_30", "glo_90", "glo_90_missing", "3dep", "srtm_v3", "nasadem"]
        );
    }

    #[test]
    fn test_unknown_dataset() {
        let err = "aster".parse::<Dataset>().unwrap_err();
        assert!(matches!(err, StitchError::UnsupportedDataset(name) if name == "aster"));
    }

    #[test]
    fn test_geoid_per_dataset() {
        assert_eq!(Dataset::ThreeDep.geoid(), Geoid::Geoid18);
        assert_eq!(Dataset::Glo30.geoid(), Geoid::Egm08);
        assert_eq!(Dataset::Glo90Missing.geoid(), Geoid::Egm08);
        assert_eq!(Dataset::SrtmV3.geoid(), Geoid::Egm96);
        assert_eq!(Dataset::Nasadem.geoid(), Geoid::Egm96);
    }

    #[test]
    fn test_gap_tier() {
        assert_eq!(Dataset::Glo30.gap_tier(), Some(Dataset::Glo90Missing));
        assert_eq!(Dataset::Glo90.gap_tier(), None);
        assert_eq!(Dataset::Glo90Missing.gap_tier(), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Dataset::ThreeDep).unwrap();
        assert_eq!(json, "\"3dep\"");
        let geoid: Geoid = serde_json::from_str("\"egm_08\"").unwrap();
        assert_eq!(geoid, Geoid::Egm08);
    }
}
