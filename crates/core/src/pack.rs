//! Feature packs: the compact per-index-tile storage record.
//!
//! A pack groups all features of one index tile into spans sorted by their
//! quad key (the path from the index tile to the feature's *best tile*,
//! the deepest tile whose insert bounds still contain the feature), with
//! one quad-tree directory per minimum-zoom bucket:
//!
//! ```text
//! [u32 feature_count][u32 index_offset]            (little-endian)
//!   <spans: varint-length-prefixed payloads, 0-terminated>
//!   <quad-tree blobs, one per populated bucket>
//!   <index array: one varint blob offset per bucket, 0 when empty>
//! ```
//!
//! The packing phase drains raw ingestion entries in bounded batches:
//! read-and-delete the sources atomically, build the packs, flush, then
//! write the packs back in a second atomic batch. A resume key lets an
//! interrupted run continue with the first unpacked index tile.

use crate::feature::{deserialize_feature, serialize_feature};
use crate::fixed::{bounding_box, FixedBox};
use crate::quad_tree::{all_spans, make_quad_tree, QuadTreeInput};
use crate::store::{key_spatial, pack_key, with_retry, TileDb, META_CODING_VEC};
use crate::strings::StringDict;
use crate::tile::{quad_key, tile_from_key, tile_key, Tile, TileSpec};
use crate::wire::{get_varint, put_varint};
use crate::{Error, Result, MAX_Z, PACK_BATCH_BYTES};

/// Fixed pack header: feature count and index offset.
pub const PACK_HEADER_LEN: usize = 8;

/// Structural floor for one serialized feature (id, layer, zoom, meta
/// count and geometry tag take at least a byte each); zero is the span
/// terminator.
const MIN_PAYLOAD_LEN: usize = 5;

// ---------------------------------------------------------------------------
// Pack writer
// ---------------------------------------------------------------------------

struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    fn new(feature_count: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&feature_count.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // index offset slot
        Self { buf }
    }

    fn write_index_offset(&mut self, offset: u32) {
        self.buf[4..8].copy_from_slice(&offset.to_le_bytes());
    }

    fn append_span<'p>(&mut self, payloads: impl Iterator<Item = &'p [u8]>) -> u32 {
        let offset = self.buf.len() as u32;
        for payload in payloads {
            debug_assert!(payload.len() >= MIN_PAYLOAD_LEN);
            put_varint(&mut self.buf, payload.len() as u64);
            self.buf.extend_from_slice(payload);
        }
        put_varint(&mut self.buf, 0);
        offset
    }

    fn append_packed(&mut self, values: &[u32]) -> u32 {
        let offset = self.buf.len() as u32;
        for &v in values {
            put_varint(&mut self.buf, u64::from(v));
        }
        offset
    }

    fn append_blob(&mut self, blob: &[u8]) -> u32 {
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(blob);
        offset
    }
}

// ---------------------------------------------------------------------------
// Best tile
// ---------------------------------------------------------------------------

/// Deepest tile below `root` whose insert bounds contain `bbox` without
/// the box reaching into a sibling. Descent stops as soon as two children
/// intersect the box (the parent is kept) or `MAX_Z` is reached.
pub fn find_best_tile(root: Tile, bbox: &FixedBox) -> Tile {
    let mut best = root;
    while best.z < MAX_Z {
        let mut next = None;
        for child in best.direct_children() {
            if TileSpec::new(child).insert_bounds.intersects(bbox) {
                if next.is_some() {
                    return best; // two matches: keep the parent
                }
                next = Some(child);
            }
        }
        match next {
            Some(child) => best = child,
            None => return best,
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Packing one index tile
// ---------------------------------------------------------------------------

struct PackableFeature {
    quad_key: Vec<u8>,
    best_key: u64,
    best_tile: Tile,
    payload: Vec<u8>,
}

/// Build the pack for `tile` from raw serialized features. Every payload
/// is re-coded through `coding` so meta strings become dictionary
/// indices.
pub fn pack_features(tile: Tile, coding: &StringDict, raw: &[Vec<u8>]) -> Result<Vec<u8>> {
    let bucket_count = usize::from(MAX_Z - tile.z) + 1;
    let mut buckets: Vec<Vec<PackableFeature>> = Vec::new();
    buckets.resize_with(bucket_count, Vec::new);

    for payload in raw {
        let feature = deserialize_feature(payload, coding)?;
        let bbox = bounding_box(&feature.geometry)
            .ok_or_else(|| Error::malformed("stored feature with null geometry"))?;
        let recoded = serialize_feature(&feature, coding);

        let best_tile = find_best_tile(tile, &bbox);
        let bucket = usize::from(feature.min_z.max(tile.z) - tile.z);
        buckets[bucket].push(PackableFeature {
            quad_key: quad_key(tile, best_tile),
            best_key: tile_key(best_tile),
            best_tile,
            payload: recoded,
        });
    }

    let mut packer = Packer::new(raw.len() as u32);
    let mut blobs: Vec<Vec<u8>> = Vec::with_capacity(bucket_count);
    for bucket in &mut buckets {
        if bucket.is_empty() {
            blobs.push(Vec::new());
            continue;
        }
        bucket.sort_by(|a, b| {
            (&a.quad_key, a.best_key, &a.payload).cmp(&(&b.quad_key, b.best_key, &b.payload))
        });

        let mut inputs = Vec::new();
        let mut start = 0;
        while start < bucket.len() {
            let mut end = start + 1;
            while end < bucket.len() && bucket[end].quad_key == bucket[start].quad_key {
                end += 1;
            }
            let offset =
                packer.append_span(bucket[start..end].iter().map(|f| f.payload.as_slice()));
            inputs.push(QuadTreeInput {
                best_tile: bucket[start].best_tile,
                span_offset: offset,
            });
            start = end;
        }
        blobs.push(make_quad_tree(tile, &inputs));
    }

    let index: Vec<u32> = blobs
        .iter()
        .map(|blob| {
            if blob.is_empty() {
                0
            } else {
                packer.append_blob(blob)
            }
        })
        .collect();
    let index_offset = packer.append_packed(&index);
    packer.write_index_offset(index_offset);
    Ok(packer.buf)
}

// ---------------------------------------------------------------------------
// Pack reader
// ---------------------------------------------------------------------------

/// Zero-copy view of a stored pack.
pub struct FeaturePack<'a> {
    data: &'a [u8],
    feature_count: u32,
    /// Blob offset per minimum-zoom bucket; 0 marks an empty bucket.
    index: Vec<u32>,
}

impl<'a> FeaturePack<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < PACK_HEADER_LEN {
            return Err(Error::malformed("pack shorter than its header"));
        }
        let feature_count = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let index_offset = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if index_offset < PACK_HEADER_LEN || index_offset > data.len() {
            return Err(Error::malformed("pack index offset out of range"));
        }

        let mut tail = &data[index_offset..];
        let mut index = Vec::new();
        while !tail.is_empty() {
            index.push(get_varint(&mut tail)? as u32);
        }
        Ok(Self {
            data,
            feature_count,
            index,
        })
    }

    pub fn feature_count(&self) -> u32 {
        self.feature_count
    }

    /// The quad-tree blob of one minimum-zoom bucket.
    pub fn quad_tree(&self, bucket: usize) -> Option<&'a [u8]> {
        match self.index.get(bucket) {
            Some(&offset) if offset != 0 => self.data.get(offset as usize..),
            _ => None,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.index.len()
    }

    /// Iterate the payloads of the span starting at `offset`.
    pub fn span_payloads(&self, offset: u32) -> Result<Vec<&'a [u8]>> {
        let mut buf = self
            .data
            .get(offset as usize..)
            .ok_or_else(|| Error::malformed("span offset out of range"))?;
        let mut payloads = Vec::new();
        loop {
            let len = get_varint(&mut buf)? as usize;
            if len == 0 {
                return Ok(payloads);
            }
            if len < MIN_PAYLOAD_LEN {
                return Err(Error::malformed("undersized feature payload"));
            }
            let payload = buf
                .get(..len)
                .ok_or_else(|| Error::malformed("truncated feature payload"))?;
            payloads.push(payload);
            buf = &buf[len..];
        }
    }

    /// Every payload in the pack, across all buckets.
    pub fn all_payloads(&self) -> Result<Vec<&'a [u8]>> {
        let mut payloads = Vec::with_capacity(self.feature_count as usize);
        for bucket in 0..self.index.len() {
            if let Some(blob) = self.quad_tree(bucket) {
                for offset in all_spans(blob)? {
                    payloads.extend(self.span_payloads(offset)?);
                }
            }
        }
        Ok(payloads)
    }
}

// ---------------------------------------------------------------------------
// Packing phase driver
// ---------------------------------------------------------------------------

/// Rewrite all raw feature entries into feature packs, in batches bounded
/// by [`PACK_BATCH_BYTES`] of new output.
pub fn pack_database(db: &TileDb) -> Result<()> {
    let coding = db.load_dict(META_CODING_VEC)?;
    let mut resume_key: Option<u64> = None;
    let mut packed_tiles = 0u64;

    loop {
        let mut delete = sled::Batch::default();
        let mut write = sled::Batch::default();
        let mut packed_bytes = 0usize;
        let mut next_resume = None;

        let mut current: Option<(u64, Vec<Vec<u8>>)> = None;
        let mut finish_group = |spatial: u64,
                                payloads: Vec<Vec<u8>>,
                                write: &mut sled::Batch|
         -> Result<usize> {
            let tile = tile_from_key(spatial);
            let pack = pack_features(tile, &coding, &payloads).map_err(|e| match e {
                Error::MalformedFeature(reason) => Error::corrupt(spatial, reason),
                other => other,
            })?;
            let len = pack.len();
            write.insert(&pack_key(spatial)[..], pack);
            packed_tiles += 1;
            Ok(len)
        };

        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            match resume_key {
                Some(key) => Box::new(db.features().range(pack_key(key).to_vec()..)),
                None => Box::new(db.features().iter()),
            };

        for entry in iter {
            let (key, value) = entry?;
            let spatial = key_spatial(&key)?;

            let group_done = current.as_ref().is_some_and(|(s, _)| *s != spatial);
            if group_done && packed_bytes >= PACK_BATCH_BYTES {
                next_resume = Some(spatial);
                break;
            }
            if group_done {
                let (s, payloads) = current.take().unwrap();
                packed_bytes += finish_group(s, payloads, &mut write)?;
            }

            let payloads = &mut current.get_or_insert_with(|| (spatial, Vec::new())).1;
            if key.len() == PACK_HEADER_LEN {
                // an earlier pack for this tile: merge its features back in
                let pack = FeaturePack::parse(&value).map_err(|e| match e {
                    Error::MalformedFeature(reason) => Error::corrupt(spatial, reason),
                    other => other,
                })?;
                for payload in pack.all_payloads()? {
                    payloads.push(payload.to_vec());
                }
            } else {
                payloads.push(value.to_vec());
            }
            delete.remove(key);
        }

        if let Some((s, payloads)) = current.take() {
            finish_group(s, payloads, &mut write)?;
        }

        with_retry("pack source delete", || {
            db.features().apply_batch(delete.clone())?;
            Ok(())
        })?;
        db.flush()?;
        with_retry("pack writeback", || {
            db.features().apply_batch(write.clone())?;
            Ok(())
        })?;

        match next_resume {
            Some(key) => resume_key = Some(key),
            None => break,
        }
    }

    log::info!("packed {packed_tiles} index tiles");
    Ok(())
}
