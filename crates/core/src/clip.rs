//! Geometry clipping against fixed-point boxes.
//!
//! Points are kept or dropped by an inclusive bounds test, polylines go
//! through Liang-Barsky per segment with coalescing of contiguous runs,
//! and polygon rings are clipped with Sutherland-Hodgman against the four
//! half-planes. Render-time callers pass a tile's draw bounds (pixel
//! bounds grown by the seam buffer); the packer passes bare insert bounds.

use crate::fixed::{FixedBox, FixedGeometry, FixedPoint, FixedRing};

/// Clip a geometry to `bounds`. Returns [`FixedGeometry::Null`] when
/// nothing survives; the bounds themselves are inclusive on all four
/// edges.
pub fn clip(geometry: FixedGeometry, bounds: &FixedBox) -> FixedGeometry {
    match geometry {
        FixedGeometry::Null => FixedGeometry::Null,
        FixedGeometry::Point(p) => {
            if bounds.contains_point(p) {
                FixedGeometry::Point(p)
            } else {
                FixedGeometry::Null
            }
        }
        FixedGeometry::Polyline(rings) => clip_polyline(rings, bounds),
        FixedGeometry::Polygon(rings) => clip_polygon(rings, bounds),
    }
}

// ---------------------------------------------------------------------------
// Polylines (Liang-Barsky)
// ---------------------------------------------------------------------------

/// Clip one segment, returning the surviving sub-segment. Endpoints on the
/// boundary are kept.
fn clip_segment(a: FixedPoint, b: FixedPoint, bounds: &FixedBox) -> Option<(FixedPoint, FixedPoint)> {
    let dx = (b.x - a.x) as f64;
    let dy = (b.y - a.y) as f64;

    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;

    let edges = [
        (-dx, (a.x - bounds.minx) as f64),
        (dx, (bounds.maxx - a.x) as f64),
        (-dy, (a.y - bounds.miny) as f64),
        (dy, (bounds.maxy - a.y) as f64),
    ];
    for (p, q) in edges {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                if r > t0 {
                    t0 = r;
                }
            } else {
                if r < t0 {
                    return None;
                }
                if r < t1 {
                    t1 = r;
                }
            }
        }
    }

    let at = |t: f64| {
        FixedPoint::new(
            (a.x as f64 + t * dx).round() as i64,
            (a.y as f64 + t * dy).round() as i64,
        )
    };
    let p0 = if t0 > 0.0 { at(t0) } else { a };
    let p1 = if t1 < 1.0 { at(t1) } else { b };
    Some((p0, p1))
}

fn clip_polyline(rings: Vec<FixedRing>, bounds: &FixedBox) -> FixedGeometry {
    let mut out: Vec<FixedRing> = Vec::new();
    let mut flush = |cur: &mut Option<FixedRing>, out: &mut Vec<FixedRing>| {
        if let Some(r) = cur.take() {
            if r.len() >= 2 {
                out.push(r);
            }
        }
    };

    for ring in rings {
        let mut cur: Option<FixedRing> = None;
        for w in ring.windows(2) {
            match clip_segment(w[0], w[1], bounds) {
                Some((p0, p1)) => {
                    // contiguous with the previous kept segment?
                    let joined = cur.as_ref().is_some_and(|r| *r.last().unwrap() == p0);
                    if joined {
                        if p1 != p0 {
                            cur.as_mut().unwrap().push(p1);
                        }
                    } else {
                        flush(&mut cur, &mut out);
                        let mut r = vec![p0];
                        if p1 != p0 {
                            r.push(p1);
                        }
                        cur = Some(r);
                    }
                }
                None => flush(&mut cur, &mut out),
            }
        }
        flush(&mut cur, &mut out);
    }

    if out.is_empty() {
        FixedGeometry::Null
    } else {
        FixedGeometry::Polyline(out)
    }
}

// ---------------------------------------------------------------------------
// Polygons (Sutherland-Hodgman)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Edge {
    MinX(f64),
    MaxX(f64),
    MinY(f64),
    MaxY(f64),
}

impl Edge {
    fn inside(&self, p: (f64, f64)) -> bool {
        match *self {
            Edge::MinX(v) => p.0 >= v,
            Edge::MaxX(v) => p.0 <= v,
            Edge::MinY(v) => p.1 >= v,
            Edge::MaxY(v) => p.1 <= v,
        }
    }

    fn intersect(&self, a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
        match *self {
            Edge::MinX(v) | Edge::MaxX(v) => {
                let t = (v - a.0) / (b.0 - a.0);
                (v, a.1 + t * (b.1 - a.1))
            }
            Edge::MinY(v) | Edge::MaxY(v) => {
                let t = (v - a.1) / (b.1 - a.1);
                (a.0 + t * (b.0 - a.0), v)
            }
        }
    }
}

/// Clip a single closed ring; `None` when fewer than three distinct
/// points remain.
fn clip_ring(ring: &[FixedPoint], bounds: &FixedBox) -> Option<FixedRing> {
    // work on the open ring
    let n = ring.len().checked_sub(1)?;
    if n < 3 {
        return None;
    }
    let mut pts: Vec<(f64, f64)> = ring[..n].iter().map(|p| (p.x as f64, p.y as f64)).collect();

    let edges = [
        Edge::MinX(bounds.minx as f64),
        Edge::MaxX(bounds.maxx as f64),
        Edge::MinY(bounds.miny as f64),
        Edge::MaxY(bounds.maxy as f64),
    ];
    for edge in edges {
        if pts.is_empty() {
            return None;
        }
        let mut next = Vec::with_capacity(pts.len() + 4);
        for i in 0..pts.len() {
            let a = pts[i];
            let b = pts[(i + 1) % pts.len()];
            match (edge.inside(a), edge.inside(b)) {
                (true, true) => next.push(b),
                (true, false) => next.push(edge.intersect(a, b)),
                (false, true) => {
                    next.push(edge.intersect(a, b));
                    next.push(b);
                }
                (false, false) => {}
            }
        }
        pts = next;
    }

    let mut rounded: FixedRing = Vec::with_capacity(pts.len() + 1);
    for (x, y) in pts {
        let p = FixedPoint::new(x.round() as i64, y.round() as i64);
        if rounded.last() != Some(&p) {
            rounded.push(p);
        }
    }
    while rounded.len() > 1 && rounded.first() == rounded.last() {
        rounded.pop();
    }
    if rounded.len() < 3 {
        return None;
    }
    let first = rounded[0];
    rounded.push(first);
    Some(rounded)
}

fn clip_polygon(rings: Vec<FixedRing>, bounds: &FixedBox) -> FixedGeometry {
    let mut iter = rings.iter();
    let outer = match iter.next().and_then(|r| clip_ring(r, bounds)) {
        Some(r) => r,
        None => return FixedGeometry::Null,
    };

    let mut out = vec![outer];
    out.extend(iter.filter_map(|r| clip_ring(r, bounds)));
    FixedGeometry::Polygon(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: i64, y: i64) -> FixedPoint {
        FixedPoint::new(x, y)
    }

    fn bounds() -> FixedBox {
        FixedBox::new(10, 10, 20, 20)
    }

    #[test]
    fn test_point_inside_kept() {
        let g = FixedGeometry::Point(pt(15, 15));
        assert_eq!(clip(g.clone(), &bounds()), g);
    }

    #[test]
    fn test_point_outside_dropped() {
        let g = FixedGeometry::Point(pt(42, 23));
        assert_eq!(clip(g, &bounds()), FixedGeometry::Null);
    }

    #[test]
    fn test_point_on_boundary_kept() {
        let g = FixedGeometry::Point(pt(20, 12));
        assert_eq!(clip(g.clone(), &bounds()), g);
    }

    #[test]
    fn test_polyline_fully_outside_dropped() {
        let g = FixedGeometry::Polyline(vec![vec![pt(0, 0), pt(0, 30)]]);
        assert_eq!(clip(g, &bounds()), FixedGeometry::Null);
    }

    #[test]
    fn test_polyline_fully_inside_unchanged() {
        let g = FixedGeometry::Polyline(vec![vec![pt(12, 12), pt(18, 18)]]);
        assert_eq!(clip(g.clone(), &bounds()), g);
    }

    #[test]
    fn test_polyline_crossing_emits_clipped_segment() {
        let g = FixedGeometry::Polyline(vec![vec![pt(12, 8), pt(12, 12)]]);
        let expected = FixedGeometry::Polyline(vec![vec![pt(12, 10), pt(12, 12)]]);
        assert_eq!(clip(g, &bounds()), expected);
    }

    #[test]
    fn test_polyline_reentry_splits_rings() {
        // leaves through the top edge, comes back further right
        let g = FixedGeometry::Polyline(vec![vec![
            pt(12, 12),
            pt(12, 30),
            pt(18, 30),
            pt(18, 12),
        ]]);
        match clip(g, &bounds()) {
            FixedGeometry::Polyline(rings) => {
                assert_eq!(rings.len(), 2);
                assert_eq!(rings[0], vec![pt(12, 12), pt(12, 20)]);
                assert_eq!(rings[1], vec![pt(18, 20), pt(18, 12)]);
            }
            other => panic!("expected polyline, got {other:?}"),
        }
    }

    #[test]
    fn test_polygon_corner_overlap() {
        let g = FixedGeometry::Polygon(vec![vec![
            pt(15, 15),
            pt(25, 15),
            pt(25, 25),
            pt(15, 25),
            pt(15, 15),
        ]]);
        let expected = FixedGeometry::Polygon(vec![vec![
            pt(15, 20),
            pt(15, 15),
            pt(20, 15),
            pt(20, 20),
            pt(15, 20),
        ]]);
        assert_eq!(clip(g, &bounds()), expected);
    }

    #[test]
    fn test_polygon_outside_dropped() {
        let g = FixedGeometry::Polygon(vec![vec![
            pt(30, 30),
            pt(40, 30),
            pt(40, 40),
            pt(30, 40),
            pt(30, 30),
        ]]);
        assert_eq!(clip(g, &bounds()), FixedGeometry::Null);
    }

    #[test]
    fn test_clip_is_idempotent() {
        let cases = vec![
            FixedGeometry::Point(pt(15, 15)),
            FixedGeometry::Polyline(vec![vec![pt(5, 15), pt(25, 15)]]),
            FixedGeometry::Polygon(vec![vec![
                pt(5, 5),
                pt(25, 5),
                pt(25, 25),
                pt(5, 25),
                pt(5, 5),
            ]]),
        ];
        for g in cases {
            let once = clip(g, &bounds());
            let twice = clip(once.clone(), &bounds());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_polygon_hole_clipped_with_outer() {
        let outer = vec![pt(0, 0), pt(30, 0), pt(30, 30), pt(0, 30), pt(0, 0)];
        let hole = vec![pt(12, 12), pt(18, 12), pt(18, 18), pt(12, 18), pt(12, 12)];
        match clip(FixedGeometry::Polygon(vec![outer, hole.clone()]), &bounds()) {
            FixedGeometry::Polygon(rings) => {
                assert_eq!(rings.len(), 2);
                // the hole is fully inside the clip box and survives intact
                assert_eq!(rings[1].len(), hole.len());
            }
            other => panic!("expected polygon, got {other:?}"),
        }
    }
}
