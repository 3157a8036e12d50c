//! API route definitions.

use std::collections::BTreeSet;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::state::AppState;
use super::ApiError;
use crate::detect::StatusView;
use crate::storage::load_histories;
use crate::telemetry::{apply_overrides, parse_payload, Reading};

const DEFAULT_READINGS: usize = 200;
const MAX_READINGS: usize = 1000;
const DEFAULT_EVENTS: usize = 50;
const MAX_EVENTS: usize = 200;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/status", get(status))
        .route("/readings", get(readings))
        .route("/latest", get(latest_all))
        .route("/latest/{node_id}", get(latest_one))
        .route("/events", get(events))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

/// Signed upload from a node: authenticate, validate, store, then score the
/// reading against the rows that preceded it.
async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let sender = state
        .verifier
        .verify(&headers, &body)
        .map_err(|e| ApiError::Unauthorized(e.public_reason()))?;

    let received_at = Utc::now();
    let mut reading = parse_payload(&sender.node_id, &body, received_at).map_err(|e| {
        warn!(node = %sender.node_id, error = %e, "rejected ingest payload");
        ApiError::BadRequest(e.to_string())
    })?;
    apply_overrides(&mut reading, &state.config.behavior.disabled);

    let worker = state.clone();
    let row = reading.clone();
    let (id, history) = tokio::task::spawn_blocking(move || -> anyhow::Result<(i64, Vec<Reading>)> {
        let server = &worker.config.server;
        let history = worker.store.history(&row.node_id, server.history_limit)?;
        let id = worker.store.append(&row)?;
        worker.store.prune(server.max_rows)?;
        Ok((id, history))
    })
    .await
    .map_err(anyhow::Error::from)??;
    reading.id = Some(id);

    let node = state.engine.compute_node(
        &sender.node_id,
        &reading,
        &history,
        reading.kind().features(),
        received_at,
    );
    info!(
        node = %sender.node_id,
        id,
        status = %node.status,
        p = node.abnormal_probability,
        "reading ingested"
    );

    Ok(Json(json!({
        "data": { "inserted_id": id, "node": node },
        "meta": meta()
    })))
}

/// Cached status, recomputed first if older than the recompute interval.
/// Transitions since the previous call are written to the event log.
async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let view = tokio::task::spawn_blocking(move || -> anyhow::Result<StatusView> {
        let server = &state.config.server;
        state.engine.refresh_if_stale(now, || {
            load_histories(state.store.as_ref(), &server.known_nodes, server.history_limit)
        })?;
        let view = state.engine.view(now, &server.known_nodes);
        for event in state.events.observe(&view, now) {
            state.store.append_event(&event)?;
        }
        Ok(view)
    })
    .await
    .map_err(anyhow::Error::from)??;

    Ok(Json(json!({ "data": view, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    limit: Option<usize>,
    node_id: Option<String>,
}

async fn readings(
    State(state): State<AppState>,
    Query(q): Query<ReadingsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_READINGS).clamp(1, MAX_READINGS);
    let rows = tokio::task::spawn_blocking(move || match q.node_id {
        Some(node) => state.store.history(&node, limit),
        None => state.store.recent(limit),
    })
    .await
    .map_err(anyhow::Error::from)??;

    let total = rows.len();
    Ok(Json(json!({
        "data": rows,
        "meta": { "total": total, "limit": limit }
    })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    n: Option<usize>,
}

/// Most recent alert events, newest first.
async fn events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.n.unwrap_or(DEFAULT_EVENTS).clamp(1, MAX_EVENTS);
    let events = tokio::task::spawn_blocking(move || state.store.events(limit))
        .await
        .map_err(anyhow::Error::from)??;

    let total = events.len();
    Ok(Json(json!({
        "data": events,
        "meta": { "total": total, "limit": limit }
    })))
}

async fn latest_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Value>> {
        let nodes: BTreeSet<String> = state
            .store
            .node_ids()?
            .into_iter()
            .chain(state.config.server.known_nodes.iter().cloned())
            .collect();
        nodes
            .into_iter()
            .map(|node| {
                let latest = state.store.latest(&node)?;
                Ok(json!({ "node_id": node, "latest": latest }))
            })
            .collect()
    })
    .await
    .map_err(anyhow::Error::from)??;

    Ok(Json(json!({ "data": rows, "meta": meta() })))
}

async fn latest_one(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let known = state.config.server.known_nodes.contains(&node_id);
    let lookup = node_id.clone();
    let latest = tokio::task::spawn_blocking(move || state.store.latest(&lookup))
        .await
        .map_err(anyhow::Error::from)??;

    if latest.is_none() && !known {
        return Err(ApiError::NotFound(format!("unknown node_id {node_id}")));
    }
    Ok(Json(json!({
        "data": { "node_id": node_id, "latest": latest },
        "meta": meta()
    })))
}
