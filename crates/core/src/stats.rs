//! Database statistics report.
//!
//! Summarizes entry counts and payload size distributions per table, and
//! per-zoom size percentiles for prepared tiles.

use std::fmt::Write as _;

use crate::pack::PACK_HEADER_LEN;
use crate::store::{key_spatial, TileDb};
use crate::tile::tile_from_key;
use crate::{Error, Result};

fn format_num(n: f64) -> String {
    if n < 1e3 {
        format!("{n:.0}")
    } else if n < 1e6 {
        format!("{:.1}K", n / 1e3)
    } else if n < 1e9 {
        format!("{:.1}M", n / 1e6)
    } else {
        format!("{:.1}G", n / 1e9)
    }
}

fn format_bytes(n: f64) -> String {
    let kib = 1024.0;
    if n < kib {
        format!("{n:.0}B")
    } else if n < kib * kib {
        format!("{:.1}KB", n / kib)
    } else if n < kib * kib * kib {
        format!("{:.1}MB", n / (kib * kib))
    } else {
        format!("{:.2}GB", n / (kib * kib * kib))
    }
}

fn size_line(label: &str, sizes: &mut Vec<u64>) -> String {
    let sum: u64 = sizes.iter().sum();
    sizes.sort_unstable();
    let mut line = format!(
        "{label:<14} cnt: {:>8} sum: {:>10}",
        format_num(sizes.len() as f64),
        format_bytes(sum as f64)
    );
    if !sizes.is_empty() {
        let q95 = sizes[(sizes.len() * 95) / 100..].first().copied().unwrap_or(0);
        let _ = write!(
            line,
            " mean: {:>10} q95: {:>10} max: {:>10}",
            format_bytes(sum as f64 / sizes.len() as f64),
            format_bytes(q95 as f64),
            format_bytes(*sizes.last().unwrap() as f64)
        );
    }
    line
}

/// Render the statistics report.
pub fn database_stats(db: &TileDb) -> Result<String> {
    let mut raw_sizes = Vec::new();
    let mut pack_sizes = Vec::new();
    for entry in db.features().iter() {
        let (key, value) = entry?;
        if key.len() == PACK_HEADER_LEN {
            pack_sizes.push(value.len() as u64);
        } else {
            raw_sizes.push(value.len() as u64);
        }
    }

    let mut report = String::from(">> feature store:\n");
    report.push_str(&size_line("raw features", &mut raw_sizes));
    report.push('\n');
    report.push_str(&size_line("feature packs", &mut pack_sizes));
    report.push('\n');

    let Some(max_prepared) = db.max_prepared_z()? else {
        report.push_str("no tiles prepared\n");
        return Ok(report);
    };

    let mut tile_sizes: Vec<Vec<u64>> = vec![Vec::new(); usize::from(max_prepared) + 1];
    for entry in db.tiles().iter() {
        let (key, value) = entry?;
        let tile = tile_from_key(key_spatial(&key)?);
        if tile.z > max_prepared {
            return Err(Error::corrupt(
                key_spatial(&key)?,
                "tile outside prepared range",
            ));
        }
        tile_sizes[usize::from(tile.z)].push(value.len() as u64);
    }

    report.push_str(">> prepared tiles:\n");
    let mut total: u64 = raw_sizes.iter().chain(pack_sizes.iter()).sum();
    for (z, sizes) in tile_sizes.iter_mut().enumerate() {
        total += sizes.iter().sum::<u64>();
        report.push_str(&size_line(&format!("tiles[z={z:0>2}]"), sizes));
        report.push('\n');
    }
    let _ = writeln!(report, "total: {}", format_bytes(total as f64));
    Ok(report)
}
