//! Fixed-point geometry primitives.
//!
//! Every geometry in the pipeline is expressed on an integer grid
//! `2^FIX_BITS` pixels wide covering the world at the reference zoom level
//! (`Z_REF`). Coordinates are signed so that buffered clip bounds can
//! reach past the world edge without wrapping.

use crate::Z_REF;

/// A coordinate pair on the fixed-point grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedPoint {
    pub x: i64,
    pub y: i64,
}

impl FixedPoint {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// An ordered run of points. Polyline rings hold ≥2 points; polygon rings
/// hold ≥4 stored points with equal endpoints.
pub type FixedRing = Vec<FixedPoint>;

/// Tagged geometry variant.
///
/// `Null` is the "dropped" sentinel produced when clipping or
/// simplification eliminates a geometry entirely. For `Polygon`, the first
/// ring is the outer ring; the rest are holes.
#[derive(Debug, Clone, PartialEq)]
pub enum FixedGeometry {
    Null,
    Point(FixedPoint),
    Polyline(Vec<FixedRing>),
    Polygon(Vec<FixedRing>),
}

impl FixedGeometry {
    pub fn is_null(&self) -> bool {
        matches!(self, FixedGeometry::Null)
    }
}

/// Closed axis-aligned box, `min ≤ max` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBox {
    pub minx: i64,
    pub miny: i64,
    pub maxx: i64,
    pub maxy: i64,
}

impl FixedBox {
    pub fn new(minx: i64, miny: i64, maxx: i64, maxy: i64) -> Self {
        Self {
            minx,
            miny,
            maxx,
            maxy,
        }
    }

    /// Box around a single point.
    pub fn of_point(p: FixedPoint) -> Self {
        Self::new(p.x, p.y, p.x, p.y)
    }

    pub fn contains_point(&self, p: FixedPoint) -> bool {
        self.minx <= p.x && p.x <= self.maxx && self.miny <= p.y && p.y <= self.maxy
    }

    pub fn contains_box(&self, other: &FixedBox) -> bool {
        self.minx <= other.minx
            && other.maxx <= self.maxx
            && self.miny <= other.miny
            && other.maxy <= self.maxy
    }

    pub fn intersects(&self, other: &FixedBox) -> bool {
        !(other.maxx < self.minx
            || other.minx > self.maxx
            || other.maxy < self.miny
            || other.miny > self.maxy)
    }

    pub fn grow(&self, amount: i64) -> FixedBox {
        FixedBox::new(
            self.minx - amount,
            self.miny - amount,
            self.maxx + amount,
            self.maxy + amount,
        )
    }

    fn take_point(&mut self, p: FixedPoint) {
        self.minx = self.minx.min(p.x);
        self.miny = self.miny.min(p.y);
        self.maxx = self.maxx.max(p.x);
        self.maxy = self.maxy.max(p.y);
    }
}

/// Axis-aligned bounding box of a geometry; `None` for [`FixedGeometry::Null`].
pub fn bounding_box(geometry: &FixedGeometry) -> Option<FixedBox> {
    let rings = match geometry {
        FixedGeometry::Null => return None,
        FixedGeometry::Point(p) => return Some(FixedBox::of_point(*p)),
        FixedGeometry::Polyline(rings) | FixedGeometry::Polygon(rings) => rings,
    };

    let first = *rings.first()?.first()?;
    let mut bbox = FixedBox::of_point(first);
    for ring in rings {
        for &p in ring {
            bbox.take_point(p);
        }
    }
    Some(bbox)
}

/// Rescale a geometry from the reference grid to the pixel grid of zoom
/// `z` by arithmetic right shift. After shifting, the origin of tile
/// `(z, x, y)` sits at `(x * TILE_EXTENT, y * TILE_EXTENT)`.
pub fn shift(geometry: &mut FixedGeometry, z: u8) {
    let delta = u32::from(Z_REF - z);
    match geometry {
        FixedGeometry::Null => {}
        FixedGeometry::Point(p) => {
            p.x >>= delta;
            p.y >>= delta;
        }
        FixedGeometry::Polyline(rings) | FixedGeometry::Polygon(rings) => {
            for ring in rings {
                for p in ring {
                    p.x >>= delta;
                    p.y >>= delta;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: i64, y: i64) -> FixedPoint {
        FixedPoint::new(x, y)
    }

    #[test]
    fn test_bounding_box_null_is_none() {
        assert_eq!(bounding_box(&FixedGeometry::Null), None);
    }

    #[test]
    fn test_bounding_box_point() {
        let bbox = bounding_box(&FixedGeometry::Point(pt(3, -7))).unwrap();
        assert_eq!(bbox, FixedBox::new(3, -7, 3, -7));
    }

    #[test]
    fn test_bounding_box_polyline_spans_rings() {
        let g = FixedGeometry::Polyline(vec![
            vec![pt(0, 0), pt(10, 5)],
            vec![pt(-3, 8), pt(2, 2)],
        ]);
        assert_eq!(bounding_box(&g).unwrap(), FixedBox::new(-3, 0, 10, 8));
    }

    #[test]
    fn test_box_contains_is_inclusive() {
        let b = FixedBox::new(10, 10, 20, 20);
        assert!(b.contains_point(pt(10, 10)));
        assert!(b.contains_point(pt(20, 12)));
        assert!(!b.contains_point(pt(21, 12)));
    }

    #[test]
    fn test_box_intersects_at_shared_edge() {
        let a = FixedBox::new(0, 0, 10, 10);
        let b = FixedBox::new(10, 0, 20, 10);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&FixedBox::new(11, 0, 20, 10)));
    }

    #[test]
    fn test_shift_halves_per_zoom_step() {
        let mut g = FixedGeometry::Point(pt(1 << 12, 1 << 12));
        shift(&mut g, Z_REF - 2);
        assert_eq!(g, FixedGeometry::Point(pt(1 << 10, 1 << 10)));
    }

    #[test]
    fn test_shift_identity_at_reference_zoom() {
        let mut g = FixedGeometry::Polyline(vec![vec![pt(5, 6), pt(7, 8)]]);
        let orig = g.clone();
        shift(&mut g, Z_REF);
        assert_eq!(g, orig);
    }
}
