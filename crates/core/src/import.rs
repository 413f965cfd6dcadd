//! OSM import.
//!
//! Reads an OSM PBF extract in two passes: nodes first (building the
//! id → fixed-coordinate table), then ways and tagged nodes. A built-in
//! tag profile classifies elements into layers with zoom ranges and
//! selects the tags carried as feature meta. Unclassified elements and
//! ways with unresolvable geometry are skipped; everything else flows
//! through the buffered [`FeatureInserter`].

use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::Path;

use osmpbf::{Element, ElementReader};

use crate::feature::Feature;
use crate::fixed::{FixedGeometry, FixedPoint};
use crate::store::{FeatureInserter, TileDb};
use crate::{Error, Result, FIX_BITS, INVALID_ZOOM};

/// Project WGS84 degrees onto the fixed-point Web Mercator grid.
pub fn project(lon: f64, lat: f64) -> FixedPoint {
    let size = (1u64 << FIX_BITS) as f64;
    let x = (lon + 180.0) / 360.0 * size;
    let y = (1.0 - lat.to_radians().tan().asinh() / PI) / 2.0 * size;

    let limit = (1i64 << FIX_BITS) - 1;
    FixedPoint::new(
        (x as i64).clamp(0, limit),
        (y as i64).clamp(0, limit),
    )
}

#[derive(Debug, Default)]
pub struct ImportStats {
    pub nodes: u64,
    pub ways: u64,
    pub features: u64,
    pub skipped: u64,
}

#[derive(Clone, Copy)]
enum GeomKind {
    Point,
    Line,
    Area,
}

struct Classified {
    layer: &'static str,
    min_z: u8,
    max_z: u8,
    kind: GeomKind,
    keep: &'static [&'static str],
}

fn class(
    layer: &'static str,
    min_z: u8,
    kind: GeomKind,
    keep: &'static [&'static str],
) -> Option<Classified> {
    Some(Classified {
        layer,
        min_z,
        max_z: INVALID_ZOOM,
        kind,
        keep,
    })
}

/// The built-in feature profile: tag combinations worth rendering, their
/// target layer and the zoom level they appear at.
fn classify(tags: &[(&str, &str)]) -> Option<Classified> {
    let get = |key: &str| tags.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

    if get("building").is_some() {
        return class("building", 14, GeomKind::Area, &["building"]);
    }
    if get("natural") == Some("water") || matches!(get("landuse"), Some("reservoir" | "basin")) {
        return class("water", 6, GeomKind::Area, &["natural", "name"]);
    }
    if let Some(waterway) = get("waterway") {
        let min_z = match waterway {
            "river" | "canal" => 8,
            _ => 12,
        };
        return class("waterway", min_z, GeomKind::Line, &["waterway", "name"]);
    }
    if matches!(get("railway"), Some("rail" | "light_rail" | "subway" | "tram")) {
        return class("rail", 8, GeomKind::Line, &["railway"]);
    }
    if let Some(highway) = get("highway") {
        let min_z = match highway {
            "motorway" | "trunk" => 5,
            "primary" | "secondary" => 8,
            "tertiary" | "unclassified" | "residential" => 11,
            _ => 13,
        };
        return class("road", min_z, GeomKind::Line, &["highway", "name", "ref"]);
    }
    if let Some(place) = get("place") {
        let min_z = match place {
            "city" => 4,
            "town" => 7,
            "village" => 10,
            _ => 12,
        };
        return class("place", min_z, GeomKind::Point, &["place", "name"]);
    }
    if get("amenity").is_some() {
        return class("poi", 14, GeomKind::Point, &["amenity", "name"]);
    }
    None
}

fn kept_meta(tags: &[(&str, &str)], keep: &[&str]) -> Vec<(String, String)> {
    keep.iter()
        .filter_map(|key| {
            tags.iter()
                .find(|(k, _)| k == key)
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        })
        .collect()
}

struct Importer<'a> {
    inserter: FeatureInserter<'a>,
    locations: HashMap<i64, FixedPoint>,
    stats: ImportStats,
    failure: Option<Error>,
}

impl Importer<'_> {
    fn insert(&mut self, id: u64, classified: &Classified, meta: Vec<(String, String)>, geometry: FixedGeometry) {
        if self.failure.is_some() {
            return;
        }
        let feature = Feature {
            id,
            layer: self.inserter.layer_idx(classified.layer),
            min_z: classified.min_z,
            max_z: classified.max_z,
            meta,
            geometry,
        };
        match self.inserter.insert(&feature) {
            Ok(()) => self.stats.features += 1,
            Err(e @ Error::MalformedFeature(_)) => {
                log::warn!("skipping feature {id}: {e}");
                self.stats.skipped += 1;
            }
            Err(e) => self.failure = Some(e),
        }
    }

    fn handle_node(&mut self, id: i64, location: FixedPoint, tags: &[(&str, &str)]) {
        self.locations.insert(id, location);
        self.stats.nodes += 1;

        let Some(classified) = classify(tags) else {
            return;
        };
        if !matches!(classified.kind, GeomKind::Point) {
            return;
        }
        self.insert(
            id as u64,
            &classified,
            kept_meta(tags, classified.keep),
            FixedGeometry::Point(location),
        );
    }

    fn handle_way(&mut self, id: i64, refs: &[i64], tags: &[(&str, &str)]) {
        self.stats.ways += 1;
        let Some(classified) = classify(tags) else {
            return;
        };

        let mut points = Vec::with_capacity(refs.len());
        for node_id in refs {
            match self.locations.get(node_id) {
                Some(p) => points.push(*p),
                None => {
                    log::warn!("skipping way {id}: node {node_id} not in extract");
                    self.stats.skipped += 1;
                    return;
                }
            }
        }

        let geometry = match classified.kind {
            GeomKind::Point => return,
            GeomKind::Line => {
                if points.len() < 2 {
                    self.stats.skipped += 1;
                    return;
                }
                FixedGeometry::Polyline(vec![points])
            }
            GeomKind::Area => {
                if points.first() != points.last() {
                    let Some(&first) = points.first() else {
                        self.stats.skipped += 1;
                        return;
                    };
                    points.push(first);
                }
                if points.len() < 4 {
                    self.stats.skipped += 1;
                    return;
                }
                FixedGeometry::Polygon(vec![points])
            }
        };

        self.insert(
            id as u64,
            &classified,
            kept_meta(tags, classified.keep),
            geometry,
        );
    }
}

/// Import an OSM PBF file into the feature store.
pub fn import_osm(db: &TileDb, path: &Path) -> Result<ImportStats> {
    let mut importer = Importer {
        inserter: FeatureInserter::new(db)?,
        locations: HashMap::new(),
        stats: ImportStats::default(),
        failure: None,
    };

    // pass 1: node locations (and point features)
    ElementReader::from_path(path)?.for_each(|element| match element {
        Element::Node(node) => {
            let tags: Vec<(&str, &str)> = node.tags().collect();
            importer.handle_node(node.id(), project(node.lon(), node.lat()), &tags);
        }
        Element::DenseNode(node) => {
            let tags: Vec<(&str, &str)> = node.tags().collect();
            importer.handle_node(node.id(), project(node.lon(), node.lat()), &tags);
        }
        _ => {}
    })?;

    // pass 2: ways over the resolved locations
    ElementReader::from_path(path)?.for_each(|element| {
        if let Element::Way(way) = element {
            let refs: Vec<i64> = way.refs().collect();
            let tags: Vec<(&str, &str)> = way.tags().collect();
            importer.handle_way(way.id(), &refs, &tags);
        }
    })?;

    if let Some(e) = importer.failure {
        return Err(e);
    }
    let stats = importer.stats;
    importer.inserter.finish()?;
    log::info!(
        "imported {} features from {} nodes / {} ways ({} skipped)",
        stats.features,
        stats.nodes,
        stats.ways,
        stats.skipped
    );
    Ok(stats)
}
