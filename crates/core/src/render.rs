//! Render context and feature queries.
//!
//! A render visits the feature packs of every index tile its requested
//! tile touches. Above the index zoom that is a single ancestor pack
//! queried through its quad trees; at or below the index zoom it is a
//! per-row range scan over the intersecting index tiles, reading each
//! pack's base bucket in full.

use crate::builder::TileBuilder;
use crate::feature::deserialize_feature;
use crate::pack::{FeaturePack, PACK_HEADER_LEN};
use crate::quad_tree::lookup;
use crate::store::{key_spatial, pack_key, raw_key, TileDb, META_CODING_VEC, META_LAYER_NAMES};
use crate::strings::StringDict;
use crate::tile::{spatial_key, tile_from_key, Tile};
use crate::{Error, Result, Z_IDX};

/// Shared per-process render state: the string dictionaries and the
/// prepared-zoom watermark, loaded once from the `meta` tree.
#[derive(Clone)]
pub struct RenderCtx {
    pub coding: StringDict,
    pub layer_names: StringDict,
    pub max_prepared_z: Option<u8>,
}

pub fn make_render_ctx(db: &TileDb) -> Result<RenderCtx> {
    Ok(RenderCtx {
        coding: db.load_dict(META_CODING_VEC)?,
        layer_names: db.load_dict(META_LAYER_NAMES)?,
        max_prepared_z: db.max_prepared_z()?,
    })
}

/// One `features`-tree entry a render needs: either a feature pack or a
/// raw (not yet packed) single feature.
pub struct PackRef {
    pub tile: Tile,
    pub raw: bool,
    pub bytes: sled::IVec,
}

/// Collect the feature entries for every index tile `tile` touches.
pub fn collect_pack_refs(db: &TileDb, tile: Tile) -> Result<Vec<PackRef>> {
    let rect = tile.bounds_on_z(Z_IDX);
    let mut refs = Vec::new();
    for y in rect.miny..=rect.maxy {
        let begin = pack_key(spatial_key(Tile::new(rect.minx, y, Z_IDX))).to_vec();
        let end = raw_key(spatial_key(Tile::new(rect.maxx, y, Z_IDX)), u32::MAX).to_vec();
        for entry in db.features().range(begin..=end) {
            let (key, bytes) = entry?;
            let t = tile_from_key(key_spatial(&key)?);
            // the curve order interleaves rows; keep only this row's run
            if t.y != y || t.x < rect.minx || t.x > rect.maxx {
                continue;
            }
            refs.push(PackRef {
                tile: t,
                raw: key.len() != PACK_HEADER_LEN,
                bytes,
            });
        }
    }
    Ok(refs)
}

fn corrupt_at(tile: Tile, e: Error) -> Error {
    match e {
        Error::MalformedFeature(reason) => Error::corrupt(spatial_key(tile), reason),
        other => other,
    }
}

/// Render `tile` from already-collected pack references. Returns `None`
/// when no layer received any geometry.
pub fn render_tile_from_packs(
    ctx: &RenderCtx,
    tile: Tile,
    packs: &[PackRef],
) -> Result<Option<Vec<u8>>> {
    let mut builder = TileBuilder::new(tile, &ctx.layer_names);

    for record in packs {
        if record.raw {
            match deserialize_feature(&record.bytes, &ctx.coding) {
                Ok(f) => {
                    if f.is_visible_at(tile.z) {
                        builder.add_feature(&f);
                    }
                }
                Err(e) => log::warn!("skipping unreadable feature: {e}"),
            }
            continue;
        }

        let pack = FeaturePack::parse(&record.bytes).map_err(|e| corrupt_at(record.tile, e))?;
        // when the request is at or above the index zoom only the base
        // bucket can hold visible features; below it, every bucket whose
        // minimum zoom has been reached
        let (lookup_tile, max_bucket) = if tile.z <= record.tile.z {
            (record.tile, 0)
        } else {
            (tile, usize::from(tile.z - record.tile.z))
        };

        for bucket in 0..=max_bucket.min(pack.bucket_count().saturating_sub(1)) {
            let Some(blob) = pack.quad_tree(bucket) else {
                continue;
            };
            let offsets =
                lookup(blob, record.tile, lookup_tile).map_err(|e| corrupt_at(record.tile, e))?;
            for offset in offsets {
                let payloads = pack
                    .span_payloads(offset)
                    .map_err(|e| corrupt_at(record.tile, e))?;
                for payload in payloads {
                    let f = deserialize_feature(payload, &ctx.coding)
                        .map_err(|e| corrupt_at(record.tile, e))?;
                    if f.is_visible_at(tile.z) {
                        builder.add_feature(&f);
                    }
                }
            }
        }
    }

    Ok(builder.finish())
}

/// Query the store and render `tile` in one step.
pub fn render_tile(db: &TileDb, ctx: &RenderCtx, tile: Tile) -> Result<Option<Vec<u8>>> {
    let packs = collect_pack_refs(db, tile)?;
    render_tile_from_packs(ctx, tile, &packs)
}

/// Serve-path read: a stored tile if prepared, a fresh render above the
/// prepared range, `None` for a genuinely empty tile.
pub fn fetch_or_render(db: &TileDb, ctx: &RenderCtx, tile: Tile) -> Result<Option<Vec<u8>>> {
    if let Some(bytes) = db.get_tile(tile)? {
        return Ok(Some(bytes.to_vec()));
    }
    match ctx.max_prepared_z {
        Some(max) if tile.z <= max => Ok(None),
        _ => render_tile(db, ctx, tile),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::fixed::{FixedGeometry, FixedPoint};
    use crate::pack::pack_database;
    use crate::store::FeatureInserter;
    use crate::tile::TileSpec;
    use crate::vector_tile;
    use crate::INVALID_ZOOM;
    use prost::Message;

    fn seed_db() -> (TileDb, Tile) {
        let db = TileDb::open_temporary().unwrap();
        let mut inserter = FeatureInserter::new(&db).unwrap();
        let layer = inserter.layer_idx("poi");

        let index_tile = Tile::new(10, 20, Z_IDX);
        let spec = TileSpec::new(index_tile);
        for i in 0..5i64 {
            inserter
                .insert(&Feature {
                    id: i as u64,
                    layer,
                    min_z: 0,
                    max_z: INVALID_ZOOM,
                    meta: vec![("kind".to_owned(), "cafe".to_owned())],
                    geometry: FixedGeometry::Point(FixedPoint::new(
                        spec.pixel_bounds.minx + 1000 + i * 211,
                        spec.pixel_bounds.miny + 1000 + i * 173,
                    )),
                })
                .unwrap();
        }
        inserter.finish().unwrap();
        (db, index_tile)
    }

    #[test]
    fn test_collect_refs_above_and_below_index_zoom() {
        let (db, index_tile) = seed_db();
        pack_database(&db).unwrap();

        // ancestor request at z0 touches the single populated pack
        let refs = collect_pack_refs(&db, Tile::new(0, 0, 0)).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].tile, index_tile);
        assert!(!refs[0].raw);

        // a deep descendant of the index tile reaches the same pack
        let deep = Tile::new(index_tile.x << 4, index_tile.y << 4, Z_IDX + 4);
        let refs = collect_pack_refs(&db, deep).unwrap();
        assert_eq!(refs.len(), 1);

        // an unrelated index tile sees nothing
        let refs = collect_pack_refs(&db, Tile::new(500, 500, Z_IDX)).unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn test_render_before_and_after_packing_agree() {
        let (db, index_tile) = seed_db();
        let ctx = make_render_ctx(&db).unwrap();

        let raw_tile = render_tile(&db, &ctx, index_tile).unwrap().unwrap();
        pack_database(&db).unwrap();
        let packed_tile = render_tile(&db, &ctx, index_tile).unwrap().unwrap();

        let a = vector_tile::Tile::decode(raw_tile.as_slice()).unwrap();
        let b = vector_tile::Tile::decode(packed_tile.as_slice()).unwrap();
        assert_eq!(a.layers.len(), 1);
        assert_eq!(a.layers[0].features.len(), 5);
        assert_eq!(b.layers[0].features.len(), 5);
    }

    #[test]
    fn test_zoom_range_filter_applies() {
        let db = TileDb::open_temporary().unwrap();
        let mut inserter = FeatureInserter::new(&db).unwrap();
        let layer = inserter.layer_idx("roads");

        let index_tile = Tile::new(1, 1, Z_IDX);
        let spec = TileSpec::new(index_tile);
        inserter
            .insert(&Feature {
                id: 9,
                layer,
                min_z: 14,
                max_z: 16,
                meta: Vec::new(),
                geometry: FixedGeometry::Polyline(vec![vec![
                    FixedPoint::new(spec.pixel_bounds.minx + 10, spec.pixel_bounds.miny + 10),
                    FixedPoint::new(spec.pixel_bounds.minx + 900, spec.pixel_bounds.miny + 700),
                ]]),
            })
            .unwrap();
        inserter.finish().unwrap();
        pack_database(&db).unwrap();
        let ctx = make_render_ctx(&db).unwrap();

        // not visible below its minimum zoom
        assert!(render_tile(&db, &ctx, index_tile).unwrap().is_none());

        // visible within the range, at the feature's corner of the tile
        let target = Tile::new(index_tile.x << 4, index_tile.y << 4, Z_IDX + 4);
        assert!(render_tile(&db, &ctx, target).unwrap().is_some());

        // expired above max_z
        let deeper = Tile::new(index_tile.x << 8, index_tile.y << 8, Z_IDX + 8);
        assert!(render_tile(&db, &ctx, deeper).unwrap().is_none());
    }

    #[test]
    fn test_fetch_or_render_prefers_stored_tiles() {
        let (db, index_tile) = seed_db();
        pack_database(&db).unwrap();

        let canned = vec![1u8, 2, 3];
        db.tiles()
            .insert(crate::tile::tile_key(index_tile).to_be_bytes(), canned.clone())
            .unwrap();
        db.set_max_prepared_z(Z_IDX).unwrap();
        let ctx = make_render_ctx(&db).unwrap();

        assert_eq!(
            fetch_or_render(&db, &ctx, index_tile).unwrap(),
            Some(canned)
        );

        // an empty tile inside the prepared range is not re-rendered
        let empty = Tile::new(900, 900, Z_IDX);
        assert_eq!(fetch_or_render(&db, &ctx, empty).unwrap(), None);

        // above the prepared range we render on demand
        let deep = Tile::new(index_tile.x << 5, index_tile.y << 5, Z_IDX + 5);
        assert!(fetch_or_render(&db, &ctx, deep).unwrap().is_some());
    }
}
