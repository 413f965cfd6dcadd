//! MVT tile building.
//!
//! Features are binned into per-layer builders by their layer-table
//! entry; each accepted geometry runs through simplify → clip (against
//! the tile's draw bounds) → shift, then is encoded as an MVT command
//! stream (`MoveTo`/`LineTo`/`ClosePath` with zigzag-coded deltas).
//! Layers that never received geometry are omitted from the output tile.

use std::collections::{BTreeMap, HashMap};

use prost::Message;

use crate::clip::clip;
use crate::feature::Feature;
use crate::fixed::{shift, FixedGeometry, FixedPoint};
use crate::simplify::simplify;
use crate::strings::StringDict;
use crate::tile::{Tile, TileSpec};
use crate::vector_tile::{self, tile::GeomType};
use crate::TILE_EXTENT;

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

/// Pack a command with its repeat count: `(count << 3) | cmd`.
#[inline]
fn command(cmd: u32, count: u32) -> u32 {
    (cmd & 0x7) | (count << 3)
}

#[inline]
fn zigzag32(value: i64) -> u32 {
    let v = value as i32;
    ((v << 1) ^ (v >> 31)) as u32
}

/// Builds one MVT tile from the features a render query discovers.
pub struct TileBuilder<'a> {
    spec: TileSpec,
    layer_names: &'a StringDict,
    layers: BTreeMap<String, LayerBuilder>,
}

impl<'a> TileBuilder<'a> {
    pub fn new(tile: Tile, layer_names: &'a StringDict) -> Self {
        Self {
            spec: TileSpec::new(tile),
            layer_names,
            layers: BTreeMap::new(),
        }
    }

    /// Route a feature to its layer builder. Features whose layer index
    /// is unknown are skipped with a log line.
    pub fn add_feature(&mut self, feature: &Feature) {
        let Some(name) = self.layer_names.resolve(feature.layer as u32) else {
            log::warn!(
                "skipping feature {}: unknown layer index {}",
                feature.id,
                feature.layer
            );
            return;
        };
        self.layers
            .entry(name.to_owned())
            .or_insert_with(|| LayerBuilder::new(name))
            .add_feature(feature, &self.spec);
    }

    /// Encode the tile; `None` when no layer received any geometry.
    pub fn finish(self) -> Option<Vec<u8>> {
        let layers: Vec<vector_tile::tile::Layer> = self
            .layers
            .into_values()
            .filter(|layer| !layer.features.is_empty())
            .map(LayerBuilder::build)
            .collect();
        if layers.is_empty() {
            return None;
        }
        Some(vector_tile::Tile { layers }.encode_to_vec())
    }
}

struct LayerBuilder {
    name: String,
    features: Vec<vector_tile::tile::Feature>,
    keys: Vec<String>,
    key_index: HashMap<String, u32>,
    values: Vec<String>,
    value_index: HashMap<String, u32>,
}

impl LayerBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            features: Vec::new(),
            keys: Vec::new(),
            key_index: HashMap::new(),
            values: Vec::new(),
            value_index: HashMap::new(),
        }
    }

    fn add_feature(&mut self, feature: &Feature, spec: &TileSpec) {
        let mut geometry = simplify(feature.geometry.clone(), spec.tile.z);
        geometry = clip(geometry, &spec.draw_bounds);
        if geometry.is_null() {
            return;
        }
        shift(&mut geometry, spec.tile.z);

        let (commands, geom_type) = encode_geometry(&geometry, spec.tile);
        if commands.is_empty() {
            return;
        }

        let mut tags = Vec::with_capacity(feature.meta.len() * 2);
        for (key, value) in &feature.meta {
            if key == "layer" || key.starts_with("__") {
                continue;
            }
            let key_idx = intern(&mut self.keys, &mut self.key_index, key);
            let value_idx = intern(&mut self.values, &mut self.value_index, value);
            tags.push(key_idx);
            tags.push(value_idx);
        }

        self.features.push(vector_tile::tile::Feature {
            id: Some(feature.id),
            tags,
            r#type: Some(geom_type as i32),
            geometry: commands,
        });
    }

    fn build(self) -> vector_tile::tile::Layer {
        vector_tile::tile::Layer {
            version: 2,
            name: self.name,
            features: self.features,
            keys: self.keys,
            values: self
                .values
                .into_iter()
                .map(|v| vector_tile::tile::Value {
                    string_value: Some(v),
                    ..Default::default()
                })
                .collect(),
            extent: Some(TILE_EXTENT),
        }
    }
}

fn intern(entries: &mut Vec<String>, index: &mut HashMap<String, u32>, value: &str) -> u32 {
    if let Some(&idx) = index.get(value) {
        return idx;
    }
    let idx = entries.len() as u32;
    entries.push(value.to_owned());
    index.insert(value.to_owned(), idx);
    idx
}

/// Encode a shifted geometry as MVT commands relative to the tile origin.
fn encode_geometry(geometry: &FixedGeometry, tile: Tile) -> (Vec<u32>, GeomType) {
    let origin_x = i64::from(tile.x) * i64::from(TILE_EXTENT);
    let origin_y = i64::from(tile.y) * i64::from(TILE_EXTENT);
    let mut cursor = (0i64, 0i64);

    match geometry {
        FixedGeometry::Null => (Vec::new(), GeomType::Unknown),
        FixedGeometry::Point(p) => {
            let commands = vec![
                command(CMD_MOVE_TO, 1),
                zigzag32(p.x - origin_x),
                zigzag32(p.y - origin_y),
            ];
            (commands, GeomType::Point)
        }
        FixedGeometry::Polyline(rings) => {
            let mut commands = Vec::new();
            for ring in rings {
                if ring.len() < 2 {
                    continue;
                }
                encode_run(&mut commands, ring, origin_x, origin_y, &mut cursor, false);
            }
            (commands, GeomType::Linestring)
        }
        FixedGeometry::Polygon(rings) => {
            let mut commands = Vec::new();
            for ring in rings {
                // drop the closing point; ClosePath implies it
                if ring.len() < 4 {
                    continue;
                }
                encode_run(
                    &mut commands,
                    &ring[..ring.len() - 1],
                    origin_x,
                    origin_y,
                    &mut cursor,
                    true,
                );
            }
            (commands, GeomType::Polygon)
        }
    }
}

fn encode_run(
    commands: &mut Vec<u32>,
    points: &[FixedPoint],
    origin_x: i64,
    origin_y: i64,
    cursor: &mut (i64, i64),
    close: bool,
) {
    let first = points[0];
    let (x, y) = (first.x - origin_x, first.y - origin_y);
    commands.push(command(CMD_MOVE_TO, 1));
    commands.push(zigzag32(x - cursor.0));
    commands.push(zigzag32(y - cursor.1));
    *cursor = (x, y);

    commands.push(command(CMD_LINE_TO, (points.len() - 1) as u32));
    for p in &points[1..] {
        let (x, y) = (p.x - origin_x, p.y - origin_y);
        commands.push(zigzag32(x - cursor.0));
        commands.push(zigzag32(y - cursor.1));
        *cursor = (x, y);
    }
    if close {
        commands.push(command(CMD_CLOSE_PATH, 1));
    }
}
