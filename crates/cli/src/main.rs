//! Command line front end for the tile pipeline.
//!
//! This is a thin wrapper around the tilepack-core library: each
//! subcommand drives one pipeline phase against the database named by
//! `--db` (or the `TILES_DB` environment variable).

mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tilepack_core::{import, pack, prepare, render, stats, TileDb};

#[derive(Parser, Debug)]
#[command(name = "tilepack", about = "OSM vector tile pipeline", version)]
struct Args {
    /// Path to the tile database
    #[arg(long, env = "TILES_DB", default_value = "tiles.db")]
    db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import features from an OSM PBF extract
    Import {
        /// Input OSM PBF file
        #[arg(value_name = "OSM_FILE")]
        osm_file: PathBuf,
    },
    /// Rewrite raw features into feature packs
    Pack,
    /// Render and store all tiles up to a zoom level
    Prepare {
        /// Deepest zoom level to prepare
        #[arg(long, default_value = "14")]
        max_z: u8,
    },
    /// Serve tiles over HTTP
    Serve {
        /// Listen port
        #[arg(long, default_value = "8888")]
        port: u16,
    },
    /// Print database statistics
    Stats,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let db = TileDb::open(&args.db)
        .with_context(|| format!("failed to open database at {}", args.db.display()))?;

    match args.command {
        Command::Import { osm_file } => {
            let stats = import::import_osm(&db, &osm_file)
                .with_context(|| format!("failed to import {}", osm_file.display()))?;
            println!(
                "imported {} features ({} skipped)",
                stats.features, stats.skipped
            );
        }
        Command::Pack => {
            pack::pack_database(&db).context("packing failed")?;
        }
        Command::Prepare { max_z } => {
            let ctx = render::make_render_ctx(&db).context("failed to load render context")?;
            prepare::prepare_tiles(&db, &ctx, max_z).context("tile preparation failed")?;
        }
        Command::Serve { port } => {
            serve::run(db, port).context("server failed")?;
        }
        Command::Stats => {
            print!("{}", stats::database_stats(&db).context("stats failed")?);
        }
    }
    Ok(())
}
