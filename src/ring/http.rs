//! HTTP status page for the ring
//!
//! Serves a read view of the ring (JSON or an HTML table, picked from the
//! Accept header) plus two admin mutations: forgetting an instance and
//! forcing an instance state. Mutations go through the KV store with CAS
//! so concurrent lifecyclers are not clobbered.

use crate::common::{timestamp_now, Error};
use crate::kv::KvStore;
use crate::ring::model::{InstanceState, RingDesc};
use crate::ring::ring::Ring;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Shared state for the ring status handlers.
#[derive(Clone)]
pub struct RingHttpState {
    pub ring: Arc<Ring>,
    pub store: Arc<dyn KvStore<RingDesc>>,
    pub key: String,
}

#[derive(Debug, Serialize)]
struct InstanceStatus {
    id: String,
    addr: String,
    zone: String,
    state: String,
    num_tokens: usize,
    /// Fraction of the token space owned, in percent
    ownership: f64,
    heartbeat_age_secs: i64,
    read_only: bool,
    registered_timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RingAction {
    action: String,
    id: String,
    #[serde(default)]
    state: Option<InstanceState>,
}

/// Creates the status router. Mount it under a prefix such as `/ring`.
pub fn ring_status_router(
    ring: Arc<Ring>,
    store: Arc<dyn KvStore<RingDesc>>,
    key: impl Into<String>,
) -> Router {
    Router::new()
        .route("/", axum::routing::get(ring_status))
        .route("/", axum::routing::post(ring_action))
        .with_state(RingHttpState {
            ring,
            store,
            key: key.into(),
        })
}

/// Per-instance token-space ownership, in percent of the full u32 space.
fn token_ownership(desc: &RingDesc) -> BTreeMap<String, f64> {
    let owners = desc.token_owners();
    let mut ownership: BTreeMap<String, f64> = BTreeMap::new();
    if owners.is_empty() {
        return ownership;
    }
    for (i, (token, id)) in owners.iter().enumerate() {
        let prev = if i == 0 {
            owners[owners.len() - 1].0
        } else {
            owners[i - 1].0
        };
        let distance = token.wrapping_sub(prev) as u64;
        // A single-token ring owns the whole space.
        let distance = if distance == 0 && owners.len() == 1 {
            1 << 32
        } else {
            distance
        };
        *ownership.entry(id.to_string()).or_insert(0.0) += distance as f64;
    }
    for v in ownership.values_mut() {
        *v = *v * 100.0 / (1u64 << 32) as f64;
    }
    ownership
}

fn instance_statuses(ring: &Ring) -> Vec<InstanceStatus> {
    let snapshot = ring.snapshot();
    let now = timestamp_now() as i64;
    let ownership = token_ownership(&snapshot.desc);
    snapshot
        .desc
        .instances
        .values()
        .map(|i| InstanceStatus {
            id: i.id.clone(),
            addr: i.addr.clone(),
            zone: i.zone.clone(),
            state: i.state.to_string(),
            num_tokens: i.tokens.len(),
            ownership: ownership.get(&i.id).copied().unwrap_or(0.0),
            heartbeat_age_secs: now - i.timestamp as i64,
            read_only: i.read_only,
            registered_timestamp: i.registered_timestamp,
        })
        .collect()
}

async fn ring_status(State(state): State<RingHttpState>, headers: HeaderMap) -> impl IntoResponse {
    let instances = instance_statuses(&state.ring);

    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    if wants_json {
        return axum::Json(json!({
            "instances": instances,
            "zones": state.ring.zones_count(),
            "topology_version": state.ring.topology_version(),
        }))
        .into_response();
    }

    let mut rows = String::new();
    for i in &instances {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{:.2}%</td><td>{}s ago</td><td>{}</td>\
             <td><form method=\"POST\"><input type=\"hidden\" name=\"action\" value=\"forget\"/>\
             <input type=\"hidden\" name=\"id\" value=\"{}\"/>\
             <button type=\"submit\">Forget</button></form></td></tr>\n",
            i.id,
            i.addr,
            i.zone,
            i.state,
            i.num_tokens,
            i.ownership,
            i.heartbeat_age_secs,
            if i.read_only { "read-only" } else { "" },
            i.id,
        ));
    }
    Html(format!(
        "<!DOCTYPE html><html><head><title>Ring status</title></head><body>\
         <h1>Ring status</h1>\
         <table border=\"1\">\
         <tr><th>ID</th><th>Address</th><th>Zone</th><th>State</th><th>Tokens</th>\
         <th>Ownership</th><th>Heartbeat</th><th>Flags</th><th></th></tr>\n{}\
         </table></body></html>",
        rows
    ))
    .into_response()
}

async fn ring_action(
    State(state): State<RingHttpState>,
    Form(req): Form<RingAction>,
) -> impl IntoResponse {
    let result = match req.action.as_str() {
        "forget" => {
            info!(instance = %req.id, "forgetting ring instance");
            let id = req.id.clone();
            state
                .store
                .cas(
                    &state.key,
                    Box::new(move |desc: Option<RingDesc>| {
                        let mut desc = desc.ok_or(Error::EmptyRing)?;
                        if desc.remove_instance(&id).is_none() {
                            return Err(Error::InstanceNotFound(id.clone()));
                        }
                        Ok(Some(desc))
                    }),
                )
                .await
        }
        "change_state" => match req.state {
            Some(new_state) => {
                info!(instance = %req.id, state = %new_state, "changing ring instance state");
                let id = req.id.clone();
                state
                    .store
                    .cas(
                        &state.key,
                        Box::new(move |desc: Option<RingDesc>| {
                            let mut desc = desc.ok_or(Error::EmptyRing)?;
                            let instance = desc
                                .instances
                                .get_mut(&id)
                                .ok_or_else(|| Error::InstanceNotFound(id.clone()))?;
                            if !instance.state.can_transition_to(new_state) {
                                return Err(Error::InvalidStateTransition {
                                    from: instance.state.to_string(),
                                    to: new_state.to_string(),
                                });
                            }
                            instance.state = new_state;
                            instance.timestamp = timestamp_now();
                            Ok(Some(desc))
                        }),
                    )
                    .await
            }
            None => Err(Error::InvalidConfig("missing target state".into())),
        },
        other => Err(Error::InvalidConfig(format!("unknown action: {}", other))),
    };

    match result {
        Ok(()) => Redirect::to("#").into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}
