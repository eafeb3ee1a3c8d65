//! Admin surface: metrics scrape, registry introspection, reload trigger.
//! Runs on its own listener, away from the data plane.

use crate::state::AppState;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use warp::{Filter, Reply};

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    metrics_route(state.clone())
        .or(active_filters_route(state.clone()))
        .or(reload_route(state))
}

pub async fn run(state: Arc<AppState>) -> crate::error::Result<()> {
    let addr: SocketAddr = state
        .config
        .admin
        .addr()
        .parse()
        .map_err(|e| crate::error::ConfigError::Validation(format!("bad admin address: {e}")))?;
    info!(addr = %addr, "Admin surface listening");
    warp::serve(routes(state)).run(addr).await;
    Ok(())
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn metrics_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .map(|state: Arc<AppState>| {
            let encoder = TextEncoder::new();
            let mut buf = Vec::new();
            if let Err(e) = encoder.encode(&state.metrics.gather(), &mut buf) {
                error!(error = %e, "Could not encode metrics");
                return warp::reply::with_status(
                    String::new(),
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                )
                .into_response();
            }
            warp::reply::with_header(
                String::from_utf8_lossy(&buf).into_owned(),
                "content-type",
                encoder.format_type().to_string(),
            )
            .into_response()
        })
}

fn active_filters_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path!("active-filters")
        .and(warp::get())
        .and(with_state(state))
        .map(|state: Arc<AppState>| {
            let snapshot = state.registry.snapshot();
            let filters: Vec<_> = snapshot
                .filters
                .iter()
                .map(|entry| {
                    json!({
                        "name": entry.config.name,
                        "order": entry.config.order,
                        "path_pattern": entry.config.path_pattern,
                        "invoke_point": entry.config.invoke_point.as_str(),
                    })
                })
                .collect();
            let capabilities: Vec<_> = snapshot
                .script_capabilities
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            warp::reply::json(&json!({
                "filters": filters,
                "script_capabilities": capabilities,
            }))
        })
}

fn reload_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path!("reload")
        .and(warp::post())
        .and(with_state(state))
        .map(|state: Arc<AppState>| {
            let snapshot = state.registry.load();
            info!(
                filters = snapshot.filters.len(),
                script_capabilities = snapshot.script_capabilities.len(),
                "Registry reloaded via admin"
            );
            warp::reply::json(&json!({
                "filters": snapshot.filters.len(),
                "script_capabilities": snapshot.script_capabilities.len(),
            }))
        })
}
