//! Byte-level codecs shared by the feature and pack formats.
//!
//! Varints follow the standard base-128 convention (via `prost`), signed
//! values are zigzag coded, and geometry coordinates are stored as deltas
//! between consecutive points with the cursor carried across rings. All
//! fixed-width header fields elsewhere in the pack format are
//! little-endian.

use crate::fixed::{FixedGeometry, FixedPoint, FixedRing};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Varint / zigzag primitives
// ---------------------------------------------------------------------------

pub fn put_varint(buf: &mut Vec<u8>, value: u64) {
    prost::encoding::encode_varint(value, buf);
}

pub fn get_varint(buf: &mut &[u8]) -> Result<u64> {
    prost::encoding::decode_varint(buf).map_err(|_| Error::malformed("truncated varint"))
}

#[inline]
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn put_svarint(buf: &mut Vec<u8>, value: i64) {
    put_varint(buf, zigzag(value));
}

pub fn get_svarint(buf: &mut &[u8]) -> Result<i64> {
    Ok(unzigzag(get_varint(buf)?))
}

// ---------------------------------------------------------------------------
// Geometry codec
// ---------------------------------------------------------------------------

const TAG_NULL: u8 = 0;
const TAG_POINT: u8 = 1;
const TAG_POLYLINE: u8 = 2;
const TAG_POLYGON: u8 = 3;

/// Append the wire form of a geometry: a variant tag byte followed by
/// delta-coded coordinates.
pub fn put_geometry(buf: &mut Vec<u8>, geometry: &FixedGeometry) {
    match geometry {
        FixedGeometry::Null => buf.push(TAG_NULL),
        FixedGeometry::Point(p) => {
            buf.push(TAG_POINT);
            put_svarint(buf, p.x);
            put_svarint(buf, p.y);
        }
        FixedGeometry::Polyline(rings) => {
            buf.push(TAG_POLYLINE);
            put_rings(buf, rings);
        }
        FixedGeometry::Polygon(rings) => {
            buf.push(TAG_POLYGON);
            put_rings(buf, rings);
        }
    }
}

fn put_rings(buf: &mut Vec<u8>, rings: &[FixedRing]) {
    put_varint(buf, rings.len() as u64);
    let mut cursor = FixedPoint::new(0, 0);
    for ring in rings {
        put_varint(buf, ring.len() as u64);
        for &p in ring {
            put_svarint(buf, p.x - cursor.x);
            put_svarint(buf, p.y - cursor.y);
            cursor = p;
        }
    }
}

/// Decode a geometry from the front of `buf`.
///
/// An unknown tag is a malformed-feature error; a polyline ring with
/// fewer than two points or a polygon ring with fewer than four is
/// reported as malformed as well — drivers on the pack read path
/// escalate that to a corruption error for the offending key.
pub fn get_geometry(buf: &mut &[u8]) -> Result<FixedGeometry> {
    let tag = *buf.first().ok_or_else(|| Error::malformed("empty geometry"))?;
    *buf = &buf[1..];
    match tag {
        TAG_NULL => Ok(FixedGeometry::Null),
        TAG_POINT => {
            let x = get_svarint(buf)?;
            let y = get_svarint(buf)?;
            Ok(FixedGeometry::Point(FixedPoint::new(x, y)))
        }
        TAG_POLYLINE => Ok(FixedGeometry::Polyline(get_rings(buf, 2)?)),
        TAG_POLYGON => Ok(FixedGeometry::Polygon(get_rings(buf, 4)?)),
        other => Err(Error::malformed(format!("unknown geometry tag {other}"))),
    }
}

fn get_rings(buf: &mut &[u8], min_points: usize) -> Result<Vec<FixedRing>> {
    let ring_count = get_varint(buf)? as usize;
    if ring_count == 0 {
        return Err(Error::malformed("geometry with zero rings"));
    }
    let mut rings = Vec::with_capacity(ring_count);
    let mut cursor = FixedPoint::new(0, 0);
    for _ in 0..ring_count {
        let point_count = get_varint(buf)? as usize;
        if point_count < min_points {
            return Err(Error::malformed(format!(
                "ring below minimum cardinality: {point_count} < {min_points}"
            )));
        }
        let mut ring = Vec::with_capacity(point_count);
        for _ in 0..point_count {
            cursor.x += get_svarint(buf)?;
            cursor.y += get_svarint(buf)?;
            ring.push(cursor);
        }
        rings.push(ring);
    }
    Ok(rings)
}

// ---------------------------------------------------------------------------
// String tables (meta coding vec, layer names)
// ---------------------------------------------------------------------------

pub fn put_string_table(buf: &mut Vec<u8>, entries: &[String]) {
    put_varint(buf, entries.len() as u64);
    for s in entries {
        put_varint(buf, s.len() as u64);
        buf.extend_from_slice(s.as_bytes());
    }
}

pub fn get_string_table(buf: &mut &[u8]) -> Result<Vec<String>> {
    let count = get_varint(buf)? as usize;
    let mut entries = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let len = get_varint(buf)? as usize;
        if buf.len() < len {
            return Err(Error::malformed("truncated string table"));
        }
        let s = std::str::from_utf8(&buf[..len])
            .map_err(|_| Error::malformed("string table entry is not UTF-8"))?;
        entries.push(s.to_owned());
        *buf = &buf[len..];
    }
    Ok(entries)
}
