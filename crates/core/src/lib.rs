//! Core library for building and serving OpenStreetMap vector tiles.
//!
//! The pipeline runs as ordered phases over an embedded [`sled`] database:
//!
//! 1. **Import** — OSM features are classified, serialized and bucketed
//!    under spatial keys at the index zoom level ([`import`]).
//! 2. **Pack** — per-index-tile feature lists are rewritten into compact
//!    feature packs with a quad-tree directory ([`pack`]).
//! 3. **Prepare** — all tiles of a zoom range are rendered in parallel and
//!    stored as Mapbox Vector Tile blobs ([`prepare`]).
//! 4. **Serve** — prepared tiles are read back (or rendered on demand) by
//!    the HTTP front end via [`render`].
//!
//! All geometry lives in a fixed-point integer grid `2^FIX_BITS` pixels
//! wide at the reference zoom level; see [`fixed`] for the primitives and
//! [`builder`] for the render-time transformation into MVT tile space.

use thiserror::Error;

pub mod builder;
pub mod clip;
pub mod feature;
pub mod fixed;
pub mod import;
pub mod pack;
pub mod prepare;
pub mod quad_tree;
pub mod render;
pub mod simplify;
pub mod stats;
pub mod store;
pub mod strings;
pub mod tile;
pub mod vector_tile;
pub mod wire;

/// Width of the world in fixed-point pixels is `2^FIX_BITS`.
pub const FIX_BITS: u32 = 32;

/// Zoom level whose pixel grid is the canonical fixed-point space.
pub const Z_REF: u8 = 20;

/// Deepest addressable zoom level.
pub const MAX_Z: u8 = 20;

/// Zoom level at which feature storage is bucketed.
pub const Z_IDX: u8 = 10;

/// Tile extent in MVT pixels (per the vector tile spec).
pub const TILE_EXTENT: u32 = 4096;

/// Sentinel for an unbounded upper zoom limit; fits the 6-bit zoom field.
pub const INVALID_ZOOM: u8 = 63;

/// Draw-bounds buffer in output pixels, applied around a rendered tile.
pub const DRAW_BUFFER_PX: i64 = 64;

/// Upper bound on freshly packed bytes per packing batch.
pub const PACK_BATCH_BYTES: usize = 64 * 1024 * 1024;

/// Errors surfaced by the tile pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// A stored entry failed a structural invariant. Fatal for the phase
    /// that hit it; carries the offending database key.
    #[error("corrupt entry at key {key:#018x}: {reason}")]
    Corrupt { key: u64, reason: String },

    /// A single feature could not be decoded. Phase drivers skip these.
    #[error("malformed feature: {0}")]
    MalformedFeature(String),

    /// Tile coordinates outside the addressable range.
    #[error("tile out of range: {z}/{x}/{y}")]
    TileOutOfRange { z: u8, x: u32, y: u32 },

    /// Underlying key-value store failure; retried by batch drivers.
    #[error("storage error: {0}")]
    Store(#[from] sled::Error),

    #[error("failed to read OSM input: {0}")]
    OsmRead(#[from] osmpbf::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupt(key: u64, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            key,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedFeature(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub use feature::Feature;
pub use fixed::{FixedBox, FixedGeometry, FixedPoint};
pub use render::RenderCtx;
pub use store::TileDb;
pub use tile::{Tile, TileSpec};
