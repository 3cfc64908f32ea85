//! Tile footprint indexes and overlap queries.
//!
//! Each dataset ships a gzip-compressed GeoJSON `FeatureCollection` with one
//! feature per tile (`tile_id` and `url` properties). Indexes are loaded on
//! first use and cached for the lifetime of the registry; lookups only take a
//! read lock once an index is present.

use crate::bounds::{classify_dateline_crossing, BoundingBox};
use crate::config::StitchConfig;
use crate::dataset::Dataset;
use crate::{Result, StitchError};
use flate2::read::GzDecoder;
use geo::{Area, BooleanOps, BoundingRect, Coord, LineString, MultiPolygon, Polygon, Translate};
use rstar::{RTree, RTreeObject, AABB};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// One tile of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFootprint {
    /// Identifier, unique within the dataset.
    pub tile_id: String,
    /// Footprint in geographic degrees.
    pub geometry: MultiPolygon<f64>,
    /// URL or path the tile is read from.
    pub source_address: String,
    /// Dataset the tile belongs to.
    pub dataset: Dataset,
    /// Degrees the footprint was moved east to sit beside a dateline-crossing
    /// query. Zero for tiles in their own longitude frame.
    pub longitude_shift: f64,
}

impl TileFootprint {
    /// Create a footprint.
    pub fn new(
        tile_id: impl Into<String>,
        geometry: impl Into<MultiPolygon<f64>>,
        source_address: impl Into<String>,
        dataset: Dataset,
    ) -> Self {
        Self {
            tile_id: tile_id.into(),
            geometry: geometry.into(),
            source_address: source_address.into(),
            dataset,
            longitude_shift: 0.0,
        }
    }

    /// Rectangular footprint, the common case for 1x1 degree tiles.
    pub fn from_bounds(
        tile_id: impl Into<String>,
        bounds: BoundingBox,
        source_address: impl Into<String>,
        dataset: Dataset,
    ) -> Self {
        Self::new(tile_id, bounds.to_rect().to_polygon(), source_address, dataset)
    }

    /// Bounding box of the footprint.
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.geometry
            .bounding_rect()
            .map(|r| BoundingBox::new(r.min().x, r.min().y, r.max().x, r.max().y))
    }

    /// Copy shifted east by `dx` degrees. The shift accumulates in
    /// [`longitude_shift`](Self::longitude_shift) so the tile's raster can be
    /// moved the same way once fetched.
    pub fn translated(&self, dx: f64) -> Self {
        Self {
            geometry: self.geometry.translate(dx, 0.0),
            longitude_shift: self.longitude_shift + dx,
            ..self.clone()
        }
    }

    /// True when the footprint shares a positive area with `bounds`.
    ///
    /// Edge or corner contact does not count.
    pub fn overlaps_with_area(&self, bounds: &BoundingBox) -> bool {
        let query = MultiPolygon::new(vec![bounds.to_rect().to_polygon()]);
        self.geometry.intersection(&query).unsigned_area() > 0.0
    }
}

/// R-tree entry: a footprint envelope plus its position in the index.
#[derive(Debug, Clone)]
struct TileBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for TileBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope(bounds: &BoundingBox) -> AABB<[f64; 2]> {
    AABB::from_corners([bounds.xmin, bounds.ymin], [bounds.xmax, bounds.ymax])
}

/// Spatial index over the footprints of one dataset.
pub struct TileIndex {
    dataset: Dataset,
    footprints: Vec<TileFootprint>,
    tree: RTree<TileBox>,
}

impl std::fmt::Debug for TileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileIndex")
            .field("dataset", &self.dataset)
            .field("tiles", &self.footprints.len())
            .finish()
    }
}

impl TileIndex {
    /// Build an index, rejecting duplicate tile ids.
    pub fn from_footprints(dataset: Dataset, footprints: Vec<TileFootprint>) -> Result<Self> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(footprints.len());
        let mut boxes = Vec::with_capacity(footprints.len());
        for (idx, footprint) in footprints.iter().enumerate() {
            if !seen.insert(&footprint.tile_id) {
                return Err(StitchError::InvalidTileIndex {
                    dataset: dataset.to_string(),
                    reason: format!("duplicate tile_id '{}'", footprint.tile_id),
                });
            }
            let bounds = footprint.bounds().ok_or_else(|| StitchError::InvalidTileIndex {
                dataset: dataset.to_string(),
                reason: format!("tile '{}' has an empty geometry", footprint.tile_id),
            })?;
            boxes.push(TileBox {
                idx,
                env: envelope(&bounds),
            });
        }
        drop(seen);

        Ok(Self {
            dataset,
            footprints,
            tree: RTree::bulk_load(boxes),
        })
    }

    /// Decode an uncompressed GeoJSON `FeatureCollection`.
    pub fn from_geojson_reader<R: Read>(dataset: Dataset, reader: R) -> Result<Self> {
        let collection: FeatureCollection = serde_json::from_reader(reader)?;
        let footprints = collection
            .features
            .into_iter()
            .map(|feature| feature.into_footprint(dataset))
            .collect::<Result<Vec<_>>>()?;
        Self::from_footprints(dataset, footprints)
    }

    /// Load a gzip-compressed GeoJSON file.
    pub fn from_geojson_gz_path<P: AsRef<Path>>(dataset: Dataset, path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_geojson_reader(dataset, GzDecoder::new(std::io::BufReader::new(file)))
    }

    /// Dataset this index covers.
    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    /// Number of tiles.
    pub fn len(&self) -> usize {
        self.footprints.len()
    }

    /// True when the index has no tiles.
    pub fn is_empty(&self) -> bool {
        self.footprints.is_empty()
    }

    /// All footprints, in load order.
    pub fn footprints(&self) -> &[TileFootprint] {
        &self.footprints
    }

    /// Footprints whose envelope touches `bounds`.
    fn candidates(&self, bounds: &BoundingBox) -> Vec<&TileFootprint> {
        let env = envelope(bounds);
        self.tree
            .locate_in_envelope_intersecting(&env)
            .map(|tb| &self.footprints[tb.idx])
            .collect()
    }

    /// Footprints sharing a positive area with `bounds`, sorted by `tile_id`.
    ///
    /// For dateline-crossing bounds, tiles on the far side of the meridian are
    /// returned shifted by 360 degrees so they sit next to the box, with the
    /// shift recorded in [`TileFootprint::longitude_shift`]. Tiles already
    /// inside the box's frame are returned unshifted whichever hemisphere
    /// they lie in.
    pub fn overlapping(&self, bounds: &BoundingBox) -> Result<Vec<TileFootprint>> {
        let crossing = classify_dateline_crossing(bounds)?;

        let mut tiles: Vec<TileFootprint> = self
            .candidates(bounds)
            .into_iter()
            .filter(|t| t.overlaps_with_area(bounds))
            .cloned()
            .collect();

        if crossing.crosses() {
            // Footprints shifted by 2 * meridian land beside the box; query with
            // the box shifted the other way.
            let shift = 2.0 * crossing.meridian();
            let mirrored = bounds.translate(-shift);
            tiles.extend(
                self.candidates(&mirrored)
                    .into_iter()
                    .map(|t| t.translated(shift))
                    .filter(|t| t.overlaps_with_area(bounds)),
            );
        }

        tiles.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));
        debug!(
            dataset = %self.dataset,
            bounds = %bounds,
            tiles = tiles.len(),
            "Tile lookup"
        );
        Ok(tiles)
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: FeatureProperties,
    geometry: GeoJsonGeometry,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    tile_id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
enum GeoJsonGeometry {
    Polygon(Vec<Vec<Vec<f64>>>),
    MultiPolygon(Vec<Vec<Vec<Vec<f64>>>>),
}

impl Feature {
    fn into_footprint(self, dataset: Dataset) -> Result<TileFootprint> {
        let tile_id = self.properties.tile_id;
        let invalid = |reason: &str| StitchError::InvalidTileIndex {
            dataset: dataset.to_string(),
            reason: format!("tile '{}': {}", tile_id, reason),
        };

        let polygons = match self.geometry {
            GeoJsonGeometry::Polygon(rings) => {
                vec![polygon_from_rings(rings).ok_or_else(|| invalid("bad polygon"))?]
            }
            GeoJsonGeometry::MultiPolygon(parts) => parts
                .into_iter()
                .map(|rings| {
                    polygon_from_rings(rings).ok_or_else(|| invalid("bad multipolygon part"))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(TileFootprint::new(
            tile_id.clone(),
            MultiPolygon::new(polygons),
            self.properties.url,
            dataset,
        ))
    }
}

fn ring(points: Vec<Vec<f64>>) -> Option<LineString<f64>> {
    points
        .into_iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Some(Coord { x: *x, y: *y }),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .map(LineString::new)
}

fn polygon_from_rings(rings: Vec<Vec<Vec<f64>>>) -> Option<Polygon<f64>> {
    let mut rings = rings.into_iter();
    let exterior = ring(rings.next()?)?;
    let interiors = rings.map(ring).collect::<Option<Vec<_>>>()?;
    Some(Polygon::new(exterior, interiors))
}

/// Cache of per-dataset tile indexes.
///
/// This type is thread-safe; indexes are built once and shared through `Arc`.
#[derive(Debug)]
pub struct TileIndexRegistry {
    /// Directory holding `<dataset>.geojson.gz` files.
    data_dir: PathBuf,
    /// Loaded indexes.
    indexes: RwLock<HashMap<Dataset, Arc<TileIndex>>>,
}

impl TileIndexRegistry {
    /// Registry reading index files from `data_dir`.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Registry for a configuration's data directory.
    pub fn from_config(config: &StitchConfig) -> Self {
        Self::new(&config.data_dir)
    }

    /// Install an index built in memory, replacing any cached one.
    pub fn register(&self, index: TileIndex) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| StitchError::CacheLockPoisoned)?;
        indexes.insert(index.dataset(), Arc::new(index));
        Ok(())
    }

    /// Index for `dataset`, loading it from disk on first use.
    pub fn get_tile_extents(&self, dataset: Dataset) -> Result<Arc<TileIndex>> {
        {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| StitchError::CacheLockPoisoned)?;
            if let Some(index) = indexes.get(&dataset) {
                return Ok(Arc::clone(index));
            }
        }

        let path = self.data_dir.join(format!("{}.geojson.gz", dataset.name()));
        if !path.exists() {
            return Err(StitchError::TileIndexMissing {
                dataset: dataset.to_string(),
                path: path.display().to_string(),
            });
        }
        let loaded = TileIndex::from_geojson_gz_path(dataset, &path)?;
        info!(dataset = %dataset, tiles = loaded.len(), "Loaded tile index");

        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| StitchError::CacheLockPoisoned)?;
        // Another thread may have loaded it while we were reading the file.
        let index = indexes
            .entry(dataset)
            .or_insert_with(|| Arc::new(loaded));
        Ok(Arc::clone(index))
    }

    /// Tiles of `dataset` overlapping `bounds`, sorted by `tile_id`.
    pub fn get_overlapping_tiles(
        &self,
        bounds: &BoundingBox,
        dataset: Dataset,
    ) -> Result<Vec<TileFootprint>> {
        self.get_tile_extents(dataset)?.overlapping(bounds)
    }

    /// True when `bounds` overlaps any tile of `dataset`.
    pub fn intersects_any(&self, bounds: &BoundingBox, dataset: Dataset) -> Result<bool> {
        Ok(!self.get_overlapping_tiles(bounds, dataset)?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn degree_tile(id: &str, west: f64, south: f64) -> TileFootprint {
        TileFootprint::from_bounds(
            id,
            BoundingBox::new(west, south, west + 1.0, south + 1.0),
            format!("https://tiles.example/{}.tif", id),
            Dataset::Glo30,
        )
    }

    fn ids(tiles: &[TileFootprint]) -> Vec<&str> {
        tiles.iter().map(|t| t.tile_id.as_str()).collect()
    }

    #[test]
    fn test_lookup_sorted_by_tile_id() {
        let index = TileIndex::from_footprints(
            Dataset::Glo30,
            vec![
                degree_tile("c", 11.0, 0.0),
                degree_tile("a", 10.0, 0.0),
                degree_tile("b", 10.0, 1.0),
                degree_tile("z", 50.0, 0.0),
            ],
        )
        .unwrap();
        let bounds = BoundingBox::new(10.5, 0.5, 11.5, 1.5);
        let first = index.overlapping(&bounds).unwrap();
        assert_eq!(ids(&first), vec!["a", "b", "c"]);
        let second = index.overlapping(&bounds).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_edge_contact_is_not_overlap() {
        let index = TileIndex::from_footprints(
            Dataset::Glo30,
            vec![degree_tile("a", 10.0, 0.0), degree_tile("b", 11.0, 0.0)],
        )
        .unwrap();
        // Shares only the x = 11 edge with tile b.
        let tiles = index.overlapping(&BoundingBox::new(10.2, 0.2, 11.0, 0.8)).unwrap();
        assert_eq!(ids(&tiles), vec!["a"]);
    }

    #[test]
    fn test_dateline_lookup_translates_far_side() {
        let index = TileIndex::from_footprints(
            Dataset::Glo30,
            vec![
                degree_tile("east", 179.0, 52.0),
                degree_tile("west", -180.0, 52.0),
                degree_tile("west2", -179.0, 52.0),
            ],
        )
        .unwrap();
        let tiles = index.overlapping(&BoundingBox::new(179.5, 52.2, 180.5, 52.8)).unwrap();
        assert_eq!(ids(&tiles), vec!["east", "west"]);
        let west = tiles[1].bounds().unwrap();
        assert_eq!(west, BoundingBox::new(180.0, 52.0, 181.0, 53.0));
        // Address is unchanged by translation.
        assert_eq!(tiles[1].source_address, "https://tiles.example/west.tif");
        assert_eq!(tiles[0].longitude_shift, 0.0);
        assert_eq!(tiles[1].longitude_shift, 360.0);
    }

    #[test]
    fn test_wide_crossing_keeps_in_frame_tiles_unshifted() {
        let index = TileIndex::from_footprints(
            Dataset::Glo30,
            vec![
                degree_tile("far_west", -180.0, 0.0),
                degree_tile("near_west", -10.0, 0.0),
                degree_tile("east", 179.0, 0.0),
                degree_tile("far_east", 179.0, 5.0),
            ],
        )
        .unwrap();
        // Crosses +180 and reaches well into the western hemisphere.
        let tiles = index.overlapping(&BoundingBox::new(-10.0, 0.0, 181.0, 1.0)).unwrap();
        assert_eq!(ids(&tiles), vec!["east", "far_west", "near_west"]);
        let shifts: Vec<f64> = tiles.iter().map(|t| t.longitude_shift).collect();
        assert_eq!(shifts, vec![0.0, 360.0, 0.0]);
        assert_eq!(tiles[2].bounds().unwrap(), BoundingBox::new(-10.0, 0.0, -9.0, 1.0));

        // Mirror image across -180.
        let tiles = index.overlapping(&BoundingBox::new(-181.0, 0.0, -9.5, 1.0)).unwrap();
        assert_eq!(ids(&tiles), vec!["east", "far_west", "near_west"]);
        let shifts: Vec<f64> = tiles.iter().map(|t| t.longitude_shift).collect();
        assert_eq!(shifts, vec![-360.0, 0.0, 0.0]);
    }

    #[test]
    fn test_overlap_uses_polygon_intersection() {
        let triangle = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (2.0, 0.0), (0.0, 2.0), (0.0, 0.0)]),
            vec![],
        );
        let footprint = TileFootprint::new("tri", triangle, "tri.tif", Dataset::Glo30);
        // Inside the envelope but beyond the hypotenuse.
        assert!(!footprint.overlaps_with_area(&BoundingBox::new(1.5, 1.5, 2.0, 2.0)));
        assert!(footprint.overlaps_with_area(&BoundingBox::new(0.5, 0.5, 1.0, 1.0)));
    }

    #[test]
    fn test_dateline_seam_tiles_not_duplicated() {
        let index = TileIndex::from_footprints(
            Dataset::Glo30,
            vec![degree_tile("east", 179.0, 0.0), degree_tile("west", -180.0, 0.0)],
        )
        .unwrap();
        // Touches +180 exactly; the western tile only meets it along the seam.
        let tiles = index.overlapping(&BoundingBox::new(179.2, 0.2, 180.0, 0.8)).unwrap();
        assert_eq!(ids(&tiles), vec!["east"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = TileIndex::from_footprints(
            Dataset::Glo30,
            vec![degree_tile("a", 0.0, 0.0), degree_tile("a", 1.0, 0.0)],
        )
        .unwrap_err();
        assert!(matches!(err, StitchError::InvalidTileIndex { .. }));
    }

    #[test]
    fn test_geojson_gz_loading_and_cache() {
        let geojson = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature",
                 "properties": {"tile_id": "N00_00_E010_00", "url": "https://tiles.example/a.tif"},
                 "geometry": {"type": "Polygon", "coordinates": [[[10,0],[11,0],[11,1],[10,1],[10,0]]]}},
                {"type": "Feature",
                 "properties": {"tile_id": "N00_00_E011_00", "url": "https://tiles.example/b.tif"},
                 "geometry": {"type": "MultiPolygon", "coordinates": [[[[11,0,0],[12,0,0],[12,1,0],[11,1,0],[11,0,0]]]]}}
            ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glo_30.geojson.gz");
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(geojson.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let registry = TileIndexRegistry::new(dir.path());
        let index = registry.get_tile_extents(Dataset::Glo30).unwrap();
        assert_eq!(index.len(), 2);
        let again = registry.get_tile_extents(Dataset::Glo30).unwrap();
        assert!(Arc::ptr_eq(&index, &again));

        let tiles = registry
            .get_overlapping_tiles(&BoundingBox::new(10.5, 0.5, 11.5, 0.6), Dataset::Glo30)
            .unwrap();
        assert_eq!(ids(&tiles), vec!["N00_00_E010_00", "N00_00_E011_00"]);
    }

    #[test]
    fn test_missing_index_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TileIndexRegistry::new(dir.path());
        let err = registry.get_tile_extents(Dataset::Nasadem).unwrap_err();
        assert!(matches!(err, StitchError::TileIndexMissing { .. }));
    }
}
