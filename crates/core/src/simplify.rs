//! Zoom-based geometry simplification.
//!
//! Ramer-Douglas-Peucker on the fixed-point grid. The tolerance is tied to
//! the zoom level a tile is rendered at: one step coarser doubles the
//! tolerance, so vertex counts shrink roughly geometrically toward low
//! zoom. At the reference zoom the input passes through untouched.

use crate::fixed::{FixedGeometry, FixedPoint, FixedRing};
use crate::Z_REF;

/// Simplification tolerance in fixed-point pixels for a render at zoom `z`:
/// `2^(Z_REF - z - 2)`, i.e. a quarter-pixel at the target resolution.
fn tolerance(z: u8) -> f64 {
    (1u64 << u32::from(Z_REF - z)) as f64 / 4.0
}

/// Simplify a geometry for rendering at zoom `z`.
///
/// Points pass through unchanged. Polyline and polygon rings are
/// simplified independently; a ring that collapses below its minimum
/// cardinality is dropped. A polygon whose outer ring is dropped becomes
/// `Null`, as does a polyline with no surviving rings.
pub fn simplify(geometry: FixedGeometry, z: u8) -> FixedGeometry {
    if z >= Z_REF {
        return geometry;
    }
    let tol = tolerance(z);

    match geometry {
        FixedGeometry::Null | FixedGeometry::Point(_) => geometry,
        FixedGeometry::Polyline(rings) => {
            let rings: Vec<FixedRing> = rings
                .into_iter()
                .map(|r| douglas_peucker(r, tol))
                .filter(|r| r.len() >= 2)
                .collect();
            if rings.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polyline(rings)
            }
        }
        FixedGeometry::Polygon(rings) => {
            let mut out = Vec::with_capacity(rings.len());
            for (i, ring) in rings.into_iter().enumerate() {
                let simplified = douglas_peucker(ring, tol);
                // closed ring: 3 distinct points plus the closing one
                if simplified.len() >= 4 {
                    out.push(simplified);
                } else if i == 0 {
                    return FixedGeometry::Null;
                }
            }
            FixedGeometry::Polygon(out)
        }
    }
}

/// Squared perpendicular distance of `p` from the segment `a..b`.
fn perp_dist_sq(p: FixedPoint, a: FixedPoint, b: FixedPoint) -> f64 {
    let dx = (b.x - a.x) as f64;
    let dy = (b.y - a.y) as f64;
    let px = (p.x - a.x) as f64;
    let py = (p.y - a.y) as f64;

    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return px * px + py * py;
    }
    let cross = dx * py - dy * px;
    cross * cross / len_sq
}

fn douglas_peucker(ring: FixedRing, tol: f64) -> FixedRing {
    if ring.len() <= 2 {
        return ring;
    }

    let tol_sq = tol * tol;
    let mut keep = vec![false; ring.len()];
    keep[0] = true;
    keep[ring.len() - 1] = true;

    let mut stack = vec![(0usize, ring.len() - 1)];
    while let Some((lo, hi)) = stack.pop() {
        if hi <= lo + 1 {
            continue;
        }
        let mut max_d = 0.0f64;
        let mut max_i = lo;
        for i in lo + 1..hi {
            let d = perp_dist_sq(ring[i], ring[lo], ring[hi]);
            if d > max_d {
                max_d = d;
                max_i = i;
            }
        }
        if max_d > tol_sq {
            keep[max_i] = true;
            stack.push((lo, max_i));
            stack.push((max_i, hi));
        }
    }

    ring.into_iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: i64, y: i64) -> FixedPoint {
        FixedPoint::new(x, y)
    }

    fn zigzag_line(n: i64, amplitude: i64) -> FixedRing {
        (0..n)
            .map(|i| pt(i * 1024, if i % 2 == 0 { 0 } else { amplitude }))
            .collect()
    }

    #[test]
    fn test_identity_at_reference_zoom() {
        let g = FixedGeometry::Polyline(vec![zigzag_line(20, 3)]);
        assert_eq!(simplify(g.clone(), Z_REF), g);
    }

    #[test]
    fn test_points_pass_through() {
        let g = FixedGeometry::Point(pt(100, 200));
        assert_eq!(simplify(g.clone(), 0), g);
    }

    #[test]
    fn test_small_oscillation_removed_at_low_zoom() {
        // amplitude 3 is far below the zoom-5 tolerance
        let g = FixedGeometry::Polyline(vec![zigzag_line(50, 3)]);
        match simplify(g, 5) {
            FixedGeometry::Polyline(rings) => assert_eq!(rings[0].len(), 2),
            other => panic!("expected polyline, got {other:?}"),
        }
    }

    #[test]
    fn test_vertex_count_monotone_in_zoom() {
        let ring = zigzag_line(64, 1 << 12);
        let count_at = |z: u8| match simplify(FixedGeometry::Polyline(vec![ring.clone()]), z) {
            FixedGeometry::Polyline(rings) => rings[0].len(),
            FixedGeometry::Null => 0,
            other => panic!("unexpected {other:?}"),
        };
        let mut prev = count_at(Z_REF);
        for z in (0..Z_REF).rev() {
            let n = count_at(z);
            assert!(n <= prev, "vertex count grew from z{} to z{}", z + 1, z);
            prev = n;
        }
    }

    #[test]
    fn test_collapsed_outer_ring_nulls_polygon() {
        // a sliver far below the zoom-0 tolerance collapses entirely
        let ring = vec![pt(0, 0), pt(10, 1), pt(20, 0), pt(0, 0)];
        let g = FixedGeometry::Polygon(vec![ring]);
        assert_eq!(simplify(g, 0), FixedGeometry::Null);
    }

    #[test]
    fn test_collapsed_hole_is_dropped_but_polygon_survives() {
        let size = 1i64 << 30;
        let outer = vec![pt(0, 0), pt(size, 0), pt(size, size), pt(0, size), pt(0, 0)];
        let hole = vec![pt(5, 5), pt(8, 5), pt(8, 8), pt(5, 5)];
        let g = FixedGeometry::Polygon(vec![outer.clone(), hole]);
        match simplify(g, 4) {
            FixedGeometry::Polygon(rings) => {
                assert_eq!(rings.len(), 1);
                assert_eq!(rings[0].first(), outer.first());
            }
            other => panic!("expected polygon, got {other:?}"),
        }
    }
}
