//! The feature record and its wire format.
//!
//! A feature couples a geometry with its target layer, a zoom visibility
//! range and a small ordered set of meta key/value strings. On disk, meta
//! strings are coded through the shared dictionary where possible; strings
//! the dictionary does not know are carried inline, so serialization never
//! mutates the dictionary.

use crate::fixed::FixedGeometry;
use crate::strings::StringDict;
use crate::wire::{get_geometry, get_varint, put_geometry, put_varint};
use crate::{Error, Result, INVALID_ZOOM, MAX_Z};

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: u64,
    /// Index into the layer-name table.
    pub layer: usize,
    pub min_z: u8,
    /// [`INVALID_ZOOM`] means unbounded.
    pub max_z: u8,
    /// Ordered; typically well under 32 entries.
    pub meta: Vec<(String, String)>,
    pub geometry: FixedGeometry,
}

impl Feature {
    /// Whether the feature participates in a render at zoom `z`.
    pub fn is_visible_at(&self, z: u8) -> bool {
        self.min_z <= z && (self.max_z == INVALID_ZOOM || z <= self.max_z)
    }
}

// string coding: 0 = inline (length + bytes follow), n > 0 = dict index n-1
fn put_coded_string(buf: &mut Vec<u8>, s: &str, coding: &StringDict) {
    match coding.find(s) {
        Some(idx) => put_varint(buf, u64::from(idx) + 1),
        None => {
            put_varint(buf, 0);
            put_varint(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn get_coded_string(buf: &mut &[u8], coding: &StringDict) -> Result<String> {
    let code = get_varint(buf)?;
    if code == 0 {
        let len = get_varint(buf)? as usize;
        if buf.len() < len {
            return Err(Error::malformed("truncated inline meta string"));
        }
        let s = std::str::from_utf8(&buf[..len])
            .map_err(|_| Error::malformed("meta string is not UTF-8"))?
            .to_owned();
        *buf = &buf[len..];
        Ok(s)
    } else {
        let idx = (code - 1) as u32;
        coding
            .resolve(idx)
            .map(str::to_owned)
            .ok_or_else(|| Error::malformed(format!("meta string index {idx} out of range")))
    }
}

/// Serialize a feature, coding meta strings through `coding` where known.
pub fn serialize_feature(feature: &Feature, coding: &StringDict) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    put_varint(&mut buf, feature.id);
    put_varint(&mut buf, feature.layer as u64);
    put_varint(
        &mut buf,
        (u64::from(feature.min_z) << 6) | u64::from(feature.max_z),
    );
    put_varint(&mut buf, feature.meta.len() as u64);
    for (key, value) in &feature.meta {
        put_coded_string(&mut buf, key, coding);
        put_coded_string(&mut buf, value, coding);
    }
    put_geometry(&mut buf, &feature.geometry);
    buf
}

/// Decode a feature serialized by [`serialize_feature`].
pub fn deserialize_feature(mut buf: &[u8], coding: &StringDict) -> Result<Feature> {
    let buf = &mut buf;
    let id = get_varint(buf)?;
    let layer = get_varint(buf)? as usize;
    let zoom = get_varint(buf)?;
    let min_z = ((zoom >> 6) & 0x3f) as u8;
    let max_z = (zoom & 0x3f) as u8;
    if min_z > MAX_Z || (max_z != INVALID_ZOOM && (max_z > MAX_Z || max_z < min_z)) {
        return Err(Error::malformed(format!(
            "invalid zoom range {min_z}..{max_z}"
        )));
    }

    let pair_count = get_varint(buf)? as usize;
    let mut meta = Vec::with_capacity(pair_count.min(64));
    for _ in 0..pair_count {
        let key = get_coded_string(buf, coding)?;
        let value = get_coded_string(buf, coding)?;
        meta.push((key, value));
    }

    let geometry = get_geometry(buf)?;
    Ok(Feature {
        id,
        layer,
        min_z,
        max_z,
        meta,
        geometry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FixedPoint;

    fn sample_feature() -> Feature {
        Feature {
            id: 4711,
            layer: 2,
            min_z: 8,
            max_z: INVALID_ZOOM,
            meta: vec![
                ("highway".to_owned(), "primary".to_owned()),
                ("name".to_owned(), "Ringstraße".to_owned()),
            ],
            geometry: FixedGeometry::Polyline(vec![vec![
                FixedPoint::new(1 << 20, 1 << 21),
                FixedPoint::new((1 << 20) + 500, (1 << 21) - 300),
            ]]),
        }
    }

    #[test]
    fn test_roundtrip_without_dictionary() {
        let coding = StringDict::new();
        let f = sample_feature();
        let bytes = serialize_feature(&f, &coding);
        assert_eq!(deserialize_feature(&bytes, &coding).unwrap(), f);
    }

    #[test]
    fn test_roundtrip_through_dictionary_is_smaller() {
        let f = sample_feature();
        let empty = StringDict::new();
        let mut coding = StringDict::new();
        for (k, v) in &f.meta {
            coding.intern(k);
            coding.intern(v);
        }

        let inline = serialize_feature(&f, &empty);
        let coded = serialize_feature(&f, &coding);
        assert!(coded.len() < inline.len());
        assert_eq!(deserialize_feature(&coded, &coding).unwrap(), f);
    }

    #[test]
    fn test_partial_dictionary_mixes_inline_and_coded() {
        let f = sample_feature();
        let mut coding = StringDict::new();
        coding.intern("highway");

        let bytes = serialize_feature(&f, &coding);
        assert_eq!(deserialize_feature(&bytes, &coding).unwrap(), f);
    }

    #[test]
    fn test_dictionary_index_out_of_range_is_malformed() {
        let f = sample_feature();
        let mut coding = StringDict::new();
        for (k, v) in &f.meta {
            coding.intern(k);
            coding.intern(v);
        }
        let bytes = serialize_feature(&f, &coding);

        // decoding against an empty dictionary must fail cleanly
        let empty = StringDict::new();
        assert!(matches!(
            deserialize_feature(&bytes, &empty),
            Err(Error::MalformedFeature(_))
        ));
    }

    #[test]
    fn test_zoom_range_visibility() {
        let mut f = sample_feature();
        f.min_z = 5;
        f.max_z = 12;
        assert!(!f.is_visible_at(4));
        assert!(f.is_visible_at(5));
        assert!(f.is_visible_at(12));
        assert!(!f.is_visible_at(13));

        f.max_z = INVALID_ZOOM;
        assert!(f.is_visible_at(20));
    }

    #[test]
    fn test_invalid_zoom_range_rejected() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 1); // id
        put_varint(&mut buf, 0); // layer
        put_varint(&mut buf, (15u64 << 6) | 3); // min 15 > max 3
        let coding = StringDict::new();
        assert!(deserialize_feature(&buf, &coding).is_err());
    }
}
