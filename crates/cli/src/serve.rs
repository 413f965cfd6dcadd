//! HTTP tile server.
//!
//! `GET /{z}/{x}/{y}.mvt` answers with the stored tile bytes, or a fresh
//! render when the tile lies above the prepared zoom range. Responses
//! carry permissive CORS headers; render failures map to an empty 500.
//! SIGINT shuts the listener down gracefully.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tilepack_core::render::{fetch_or_render, make_render_ctx, RenderCtx};
use tilepack_core::{Tile, TileDb};
use tower_http::cors::CorsLayer;

const CONTENT_TYPE_MVT: &str = "application/vnd.mapbox-vector-tile";

struct AppState {
    db: TileDb,
    ctx: RenderCtx,
}

pub fn run(db: TileDb, port: u16) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let ctx = make_render_ctx(&db)?;
        let state = Arc::new(AppState { db, ctx });

        let app = Router::new()
            .route("/{z}/{x}/{y}", get(get_tile))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        log::info!("listening on 0.0.0.0:{port}");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                log::info!("shutting down");
            })
            .await?;
        Ok(())
    })
}

async fn get_tile(
    State(state): State<Arc<AppState>>,
    Path((z, x, y)): Path<(u8, u32, String)>,
) -> Response {
    let Some(y) = y.strip_suffix(".mvt").and_then(|s| s.parse::<u32>().ok()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let tile = match Tile::checked(x, y, z) {
        Ok(tile) => tile,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let rendered =
        tokio::task::spawn_blocking(move || fetch_or_render(&state.db, &state.ctx, tile)).await;
    match rendered {
        Ok(Ok(bytes)) => (
            [(header::CONTENT_TYPE, CONTENT_TYPE_MVT)],
            bytes.unwrap_or_default(),
        )
            .into_response(),
        Ok(Err(e)) => {
            log::error!("render failed for {}/{}/{}: {e}", tile.z, tile.x, tile.y);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            log::error!("render task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
