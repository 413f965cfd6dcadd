//! Embedded feature/tile storage.
//!
//! Three sled trees back the pipeline: `features` (spatial key → raw
//! feature or feature pack), `tiles` (tile key → MVT bytes) and `meta`
//! (named values: the string dictionaries and the prepared-zoom marker).
//! All keys are big-endian so lexicographic order equals numeric order.
//!
//! Raw ingestion entries carry a 12-byte key — the 8-byte spatial key plus
//! a 4-byte insertion sequence — holding exactly one serialized feature.
//! Packs live under the bare 8-byte spatial key. Writes go through
//! atomic batches; transient storage failures are retried with
//! exponential backoff before a phase gives up.

use std::path::Path;
use std::time::Duration;

use crate::feature::{serialize_feature, Feature};
use crate::fixed::{bounding_box, FixedBox};
use crate::strings::StringDict;
use crate::tile::{spatial_key, tile_key, Tile};
use crate::{Error, Result, FIX_BITS, Z_IDX};

pub const META_CODING_VEC: &str = "coding_vec";
pub const META_LAYER_NAMES: &str = "layer_names";
pub const META_MAX_PREPARED_Z: &str = "max_prepared_z";

/// Entries buffered by the inserter before a batch write.
const INSERT_BATCH_LEN: usize = 4096;

/// Attempts for a storage operation before the phase fails.
const RETRY_ATTEMPTS: u32 = 3;

/// 8-byte pack key for a spatial key.
pub fn pack_key(spatial: u64) -> [u8; 8] {
    spatial.to_be_bytes()
}

/// 12-byte raw-entry key: spatial key plus insertion sequence.
pub fn raw_key(spatial: u64, seq: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&spatial.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Spatial-key prefix of either key form.
pub fn key_spatial(key: &[u8]) -> Result<u64> {
    let prefix: [u8; 8] = key
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::corrupt(0, "feature key shorter than 8 bytes"))?;
    Ok(u64::from_be_bytes(prefix))
}

/// Retry a storage operation with exponential backoff. Only storage
/// errors are considered transient; everything else fails immediately.
pub(crate) fn with_retry<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e @ Error::Store(_)) if attempt < RETRY_ATTEMPTS => {
                log::warn!("{what} failed (attempt {attempt}/{RETRY_ATTEMPTS}), retrying in {delay:?}: {e}");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Handle on the tile database.
#[derive(Clone)]
pub struct TileDb {
    db: sled::Db,
    features: sled::Tree,
    tiles: sled::Tree,
    meta: sled::Tree,
}

impl TileDb {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_db(sled::Config::new().path(path).open()?)
    }

    /// In-memory database for tests.
    pub fn open_temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let features = db.open_tree("features")?;
        let tiles = db.open_tree("tiles")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            features,
            tiles,
            meta,
        })
    }

    pub fn features(&self) -> &sled::Tree {
        &self.features
    }

    pub fn tiles(&self) -> &sled::Tree {
        &self.tiles
    }

    pub fn meta(&self) -> &sled::Tree {
        &self.meta
    }

    /// Force pending writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn get_tile(&self, tile: Tile) -> Result<Option<sled::IVec>> {
        Ok(self.tiles.get(tile_key(tile).to_be_bytes())?)
    }

    pub fn load_dict(&self, name: &str) -> Result<StringDict> {
        match self.meta.get(name)? {
            Some(bytes) => StringDict::from_bytes(&bytes),
            None => Ok(StringDict::new()),
        }
    }

    pub fn store_dict(&self, name: &str, dict: &StringDict) -> Result<()> {
        self.meta.insert(name, dict.to_bytes())?;
        Ok(())
    }

    pub fn max_prepared_z(&self) -> Result<Option<u8>> {
        let Some(bytes) = self.meta.get(META_MAX_PREPARED_Z)? else {
            return Ok(None);
        };
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .map(Some)
            .ok_or_else(|| Error::corrupt(0, "unreadable max_prepared_z"))
    }

    pub fn set_max_prepared_z(&self, z: u8) -> Result<()> {
        self.meta.insert(META_MAX_PREPARED_Z, z.to_string().as_bytes())?;
        Ok(())
    }
}

/// Index tile responsible for a feature with bounding box `bbox`: the
/// tile under the box centroid, falling back to the min corner when the
/// box straddles an index-tile boundary. Both cases reduce to the min
/// corner's tile.
pub fn index_tile_for(bbox: &FixedBox) -> Tile {
    index_tile_at(bbox.minx, bbox.miny)
}

fn index_tile_at(x: i64, y: i64) -> Tile {
    let limit = (1i64 << FIX_BITS) - 1;
    let shift = FIX_BITS - u32::from(Z_IDX);
    let tx = (x.clamp(0, limit) >> shift) as u32;
    let ty = (y.clamp(0, limit) >> shift) as u32;
    Tile::new(tx, ty, Z_IDX)
}

/// Buffered feature writer used by the import phase.
///
/// Meta strings of inserted features are appended to the coding
/// dictionary, layer names to the layer table; both are persisted when
/// the inserter finishes.
pub struct FeatureInserter<'a> {
    db: &'a TileDb,
    coding: StringDict,
    layer_names: StringDict,
    batch: sled::Batch,
    buffered: usize,
    seq: u32,
    inserted: u64,
}

impl<'a> FeatureInserter<'a> {
    pub fn new(db: &'a TileDb) -> Result<Self> {
        Ok(Self {
            db,
            coding: db.load_dict(META_CODING_VEC)?,
            layer_names: db.load_dict(META_LAYER_NAMES)?,
            batch: sled::Batch::default(),
            buffered: 0,
            seq: 0,
            inserted: 0,
        })
    }

    /// Resolve a layer name to its table index, appending it if new.
    pub fn layer_idx(&mut self, name: &str) -> usize {
        self.layer_names.intern(name) as usize
    }

    pub fn insert(&mut self, feature: &Feature) -> Result<()> {
        let bbox = bounding_box(&feature.geometry)
            .ok_or_else(|| Error::malformed("feature with null geometry"))?;

        for (key, value) in &feature.meta {
            self.coding.intern(key);
            self.coding.intern(value);
        }
        let bytes = serialize_feature(feature, &self.coding);

        let spatial = spatial_key(index_tile_for(&bbox));
        self.batch.insert(&raw_key(spatial, self.seq)[..], bytes);
        self.seq += 1;
        self.buffered += 1;
        self.inserted += 1;
        if self.buffered >= INSERT_BATCH_LEN {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.buffered = 0;
        with_retry("feature batch write", || {
            self.db.features.apply_batch(batch.clone())?;
            Ok(())
        })
    }

    /// Flush remaining features and persist the dictionaries.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_batch()?;
        self.db.store_dict(META_CODING_VEC, &self.coding)?;
        self.db.store_dict(META_LAYER_NAMES, &self.layer_names)?;
        self.db.flush()?;
        Ok(self.inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{FixedGeometry, FixedPoint};
    use crate::INVALID_ZOOM;

    fn point_feature(x: i64, y: i64) -> Feature {
        Feature {
            id: 1,
            layer: 0,
            min_z: 0,
            max_z: INVALID_ZOOM,
            meta: vec![("kind".to_owned(), "poi".to_owned())],
            geometry: FixedGeometry::Point(FixedPoint::new(x, y)),
        }
    }

    #[test]
    fn test_key_forms() {
        let spatial = spatial_key(Tile::new(3, 7, Z_IDX));
        assert_eq!(pack_key(spatial).len(), 8);
        let raw = raw_key(spatial, 42);
        assert_eq!(raw.len(), 12);
        assert_eq!(key_spatial(&raw).unwrap(), spatial);
        assert_eq!(key_spatial(&pack_key(spatial)).unwrap(), spatial);
        // raw entries sort after the bare pack key
        assert!(raw.as_slice() > pack_key(spatial).as_slice());
    }

    #[test]
    fn test_index_tile_min_corner_on_boundary_cross() {
        let tile_size = 1i64 << (FIX_BITS - u32::from(Z_IDX));
        let inside = FixedBox::new(10, 10, tile_size - 10, tile_size - 10);
        assert_eq!(index_tile_for(&inside), Tile::new(0, 0, Z_IDX));

        let crossing = FixedBox::new(tile_size - 10, 10, tile_size + 10, 20);
        assert_eq!(index_tile_for(&crossing), Tile::new(0, 0, Z_IDX));
    }

    #[test]
    fn test_inserter_writes_raw_entries_and_dicts() {
        let db = TileDb::open_temporary().unwrap();
        let mut inserter = FeatureInserter::new(&db).unwrap();
        let layer = inserter.layer_idx("poi");

        let mut f = point_feature(1 << 25, 1 << 25);
        f.layer = layer;
        inserter.insert(&f).unwrap();
        assert_eq!(inserter.finish().unwrap(), 1);

        assert_eq!(db.features().len(), 1);
        let (key, _value) = db.features().iter().next().unwrap().unwrap();
        assert_eq!(key.len(), 12);

        let coding = db.load_dict(META_CODING_VEC).unwrap();
        assert!(coding.find("kind").is_some());
        assert!(coding.find("poi").is_some());
        let layers = db.load_dict(META_LAYER_NAMES).unwrap();
        assert_eq!(layers.resolve(layer as u32), Some("poi"));
    }

    #[test]
    fn test_max_prepared_z_roundtrip() {
        let db = TileDb::open_temporary().unwrap();
        assert_eq!(db.max_prepared_z().unwrap(), None);
        db.set_max_prepared_z(14).unwrap();
        assert_eq!(db.max_prepared_z().unwrap(), Some(14));
    }
}
