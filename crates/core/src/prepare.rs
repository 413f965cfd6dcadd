//! Parallel tile preparation.
//!
//! Walks every tile of `z ∈ [0, max_z]` within the coverage of the
//! populated index tiles and renders it into the `tiles` tree. Workers
//! are plain OS threads sharing one mutex-protected scheduler; batches
//! shrink toward low zoom so the expensive world-spanning tiles do not
//! serialize the run. Per batch: one read pass collecting pack bytes,
//! rendering outside any store access, then one atomic writeback.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::render::{collect_pack_refs, render_tile_from_packs, RenderCtx};
use crate::store::{key_spatial, with_retry, TileDb};
use crate::tile::{tile_from_key, tile_key, Tile, TileRect, TileRectIter};
use crate::{Error, Result};

#[derive(Default, Clone)]
struct ZoomStats {
    total: u64,
    finished: u64,
    empty: u64,
    sum_size: u64,
    sum_dur: Duration,
}

struct SchedState {
    cur_z: u8,
    iter: TileRectIter,
    done: bool,
    stats: Vec<ZoomStats>,
}

impl SchedState {
    fn next_tile(&mut self, base: &TileRect, max_z: u8) -> Option<Tile> {
        loop {
            if self.done {
                return None;
            }
            if let Some(tile) = self.iter.next() {
                return Some(tile);
            }
            if self.cur_z == max_z {
                self.done = true;
                return None;
            }
            self.cur_z += 1;
            self.iter = base.on_z(self.cur_z).iter();
        }
    }
}

/// Shared scheduler state for the prepare workers.
pub struct PrepareManager {
    base: TileRect,
    max_z: u8,
    state: Mutex<SchedState>,
}

impl PrepareManager {
    pub fn new(base: TileRect, max_z: u8) -> Self {
        let state = SchedState {
            cur_z: 0,
            iter: base.on_z(0).iter(),
            done: false,
            stats: vec![ZoomStats::default(); usize::from(max_z) + 1],
        };
        Self {
            base,
            max_z,
            state: Mutex::new(state),
        }
    }

    /// Draw the next batch of tiles. The batch budget is `2^8` with a
    /// draw cost of `2^max(8 - z, 0)` per tile, so low-zoom batches stay
    /// small. An empty batch means the walk is complete.
    pub fn get_batch(&self) -> Vec<Tile> {
        let mut state = self.state.lock().unwrap();
        let mut batch = Vec::new();
        let mut budget_used = 0u32;
        while budget_used < 1 << 8 {
            let Some(tile) = state.next_tile(&self.base, self.max_z) else {
                break;
            };
            state.stats[usize::from(tile.z)].total += 1;
            budget_used += 1 << 8u32.saturating_sub(u32::from(tile.z));
            batch.push(tile);
        }
        batch
    }

    /// Record one rendered tile; logs a summary when its zoom completes.
    pub fn finish(&self, tile: Tile, size: u64, dur: Duration) {
        let mut state = self.state.lock().unwrap();
        let still_issuing = tile.z == state.cur_z && !state.done;
        let stats = &mut state.stats[usize::from(tile.z)];
        stats.finished += 1;
        stats.sum_size += size;
        stats.sum_dur += dur;
        if size == 0 {
            stats.empty += 1;
        }

        if still_issuing || stats.finished < stats.total {
            return;
        }
        let rendered = stats.total - stats.empty;
        let avg_size = if rendered == 0 {
            0
        } else {
            stats.sum_size / rendered
        };
        log::info!(
            "tiles z{:>2} | {:>8} total | {:>8} empty | avg {:>8} bytes | {:?}",
            tile.z,
            stats.total,
            stats.empty,
            avg_size,
            stats.sum_dur
        );
    }
}

/// Bounding rectangle of all populated index tiles.
fn populated_index_rect(db: &TileDb) -> Result<Option<TileRect>> {
    let mut rect: Option<TileRect> = None;
    for key in db.features().iter().keys() {
        let tile = tile_from_key(key_spatial(&key?)?);
        rect = Some(match rect {
            None => tile.bounds_on_z(tile.z),
            Some(r) => TileRect {
                minx: r.minx.min(tile.x),
                miny: r.miny.min(tile.y),
                maxx: r.maxx.max(tile.x),
                maxy: r.maxy.max(tile.y),
                z: r.z,
            },
        });
    }
    Ok(rect)
}

fn run_batch(
    db: &TileDb,
    ctx: &RenderCtx,
    manager: &PrepareManager,
    batch: &[Tile],
) -> Result<()> {
    // read pass: every pack the batch needs, before any rendering
    let mut tasks = Vec::with_capacity(batch.len());
    for &tile in batch {
        tasks.push((tile, collect_pack_refs(db, tile)?));
    }

    let mut write = sled::Batch::default();
    for (tile, packs) in &tasks {
        let start = Instant::now();
        let result = render_tile_from_packs(ctx, *tile, packs)?;
        let dur = start.elapsed();

        let size = result.as_ref().map_or(0, |b| b.len() as u64);
        if let Some(bytes) = result {
            write.insert(&tile_key(*tile).to_be_bytes()[..], bytes);
        }
        manager.finish(*tile, size, dur);
    }

    with_retry("tile writeback", || {
        db.tiles().apply_batch(write.clone())?;
        Ok(())
    })
}

/// Render and store every tile up to `max_z`, then record the prepared
/// watermark.
pub fn prepare_tiles(db: &TileDb, ctx: &RenderCtx, max_z: u8) -> Result<()> {
    let Some(base) = populated_index_rect(db)? else {
        log::info!("no features stored, nothing to prepare");
        db.set_max_prepared_z(max_z)?;
        return Ok(());
    };

    let manager = PrepareManager::new(base, max_z);
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let failure: Mutex<Option<Error>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failure.lock().unwrap().is_some() {
                    return;
                }
                let batch = manager.get_batch();
                if batch.is_empty() {
                    return;
                }
                if let Err(e) = run_batch(db, ctx, &manager, &batch) {
                    let mut slot = failure.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    return;
                }
            });
        }
    });

    if let Some(e) = failure.into_inner().unwrap() {
        return Err(e);
    }
    db.set_max_prepared_z(max_z)?;
    db.flush()?;
    Ok(())
}
