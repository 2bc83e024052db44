//! Client-facing HTTP API
//!
//! KV operations routed by partition plus administrative endpoints to
//! inspect members, partitions and leadership, and to remove a node
//! from the cluster.

use crate::common::{timestamp_now, Error};
use crate::gateway::router::Router;
use crate::membership::Membership;
use crate::meta::partition::MetaChange;
use crate::meta::store::MetaStore;
use crate::repl::coordinator::ReplicaRegistry;
use crate::sync::SyncEngine;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct GatewayState {
    pub node_id: String,
    pub started_at: u64,
    pub router: Arc<Router>,
    pub membership: Membership,
    pub meta: Arc<MetaStore>,
    pub registry: Arc<ReplicaRegistry>,
    pub sync: Arc<SyncEngine>,
}

pub fn create_router(state: GatewayState, max_value_bytes: usize) -> axum::Router {
    axum::Router::new()
        .route(
            "/kv/:key",
            get(get_key).put(put_key).delete(delete_key),
        )
        .route("/kv", get(scan_keys))
        .route("/status", get(status))
        .route("/admin/members", get(members))
        .route("/admin/partitions", get(partitions))
        .route("/admin/remove/:node", post(remove_node))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_value_bytes)),
        )
        .with_state(state)
}

fn error_response(e: Error) -> Response {
    (e.to_http_status(), Json(json!({ "error": e.to_string() }))).into_response()
}

async fn get_key(State(state): State<GatewayState>, Path(key): Path<String>) -> Response {
    match state.router.get(&key).await {
        Ok(Some(value)) => (StatusCode::OK, value).into_response(),
        Ok(None) => error_response(Error::NotFound(key)),
        Err(e) => error_response(e),
    }
}

async fn put_key(
    State(state): State<GatewayState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    match state.router.put(&key, body.to_vec()).await {
        Ok(offset) => (
            StatusCode::OK,
            Json(json!({ "committed": true, "offset": offset })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_key(State(state): State<GatewayState>, Path(key): Path<String>) -> Response {
    match state.router.delete(&key).await {
        Ok(offset) => (
            StatusCode::OK,
            Json(json!({ "deleted": true, "offset": offset })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ScanParams {
    #[serde(default)]
    start: String,
    #[serde(default)]
    end: String,
    #[serde(default)]
    limit: usize,
}

async fn scan_keys(
    State(state): State<GatewayState>,
    Query(params): Query<ScanParams>,
) -> Response {
    match state
        .router
        .scan(&params.start, &params.end, params.limit)
        .await
    {
        Ok(entries) => {
            let items: Vec<_> = entries
                .iter()
                .map(|(k, v)| {
                    json!({
                        "key": k,
                        "value": String::from_utf8_lossy(v),
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({ "entries": items }))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn status(State(state): State<GatewayState>) -> Response {
    let map = state.meta.read_stale();
    let view = state.membership.view();
    let roles: Vec<_> = state
        .registry
        .roles()
        .into_iter()
        .map(|(id, role, term)| {
            json!({
                "partition": id,
                "role": role.to_string(),
                "term": term,
                "leader": map.partition(id).map(|p| p.leader.clone()),
            })
        })
        .collect();
    let sessions: Vec<_> = state.sync.sessions();
    (
        StatusCode::OK,
        Json(json!({
            "node": state.node_id,
            "time": chrono::Utc::now().to_rfc3339(),
            "uptime_secs": timestamp_now().saturating_sub(state.started_at),
            "epoch": map.epoch,
            "members": view.members.len(),
            "partitions": roles,
            "sync_sessions": sessions,
        })),
    )
        .into_response()
}

async fn members(State(state): State<GatewayState>) -> Response {
    let view = state.membership.view();
    (StatusCode::OK, Json(json!({ "members": view.members }))).into_response()
}

async fn partitions(State(state): State<GatewayState>) -> Response {
    let map = state.meta.read_stale();
    (StatusCode::OK, Json(map)).into_response()
}

/// Remove a node from every replica set it occupies, substituting alive
/// members where any are available.
async fn remove_node(State(state): State<GatewayState>, Path(node): Path<String>) -> Response {
    let map = state.meta.read_stale();
    let view = state.membership.view();

    let mut substitutes = Vec::new();
    for p in map.hosted_by(&node) {
        let replacement = view
            .alive_members()
            .map(|m| m.id.clone())
            .find(|id| *id != node && !p.has_replica(id));
        substitutes.push((p.id, replacement));
    }
    if substitutes.is_empty() {
        return error_response(Error::NotFound(format!(
            "node {} hosts no partitions",
            node
        )));
    }

    match state
        .meta
        .propose(MetaChange::RemoveNode { node, substitutes })
        .await
    {
        Ok(map) => (
            StatusCode::OK,
            Json(json!({ "removed": true, "epoch": map.epoch })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
