//! HTTP status page for the partition ring
//!
//! Same shape as the instance ring page: GET renders JSON or an HTML
//! table, POST applies admin actions (state change, lock/unlock) through
//! KV CAS and answers with a redirect.

use crate::common::{timestamp_now, Error};
use crate::kv::KvStore;
use crate::partition::model::{PartitionRingDesc, PartitionState};
use crate::partition::ring::PartitionRingWatcher;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct PartitionHttpState {
    pub watcher: Arc<PartitionRingWatcher>,
    pub store: Arc<dyn KvStore<PartitionRingDesc>>,
    pub key: String,
}

#[derive(Debug, Serialize)]
struct PartitionStatus {
    id: i32,
    state: String,
    state_age_secs: i64,
    locked: bool,
    num_tokens: usize,
    owners: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PartitionAction {
    action: String,
    id: i32,
    #[serde(default)]
    state: Option<PartitionState>,
}

/// Creates the partition status router. Mount under a prefix such as
/// `/partition-ring`.
pub fn partition_ring_status_router(
    watcher: Arc<PartitionRingWatcher>,
    store: Arc<dyn KvStore<PartitionRingDesc>>,
    key: impl Into<String>,
) -> Router {
    Router::new()
        .route("/", axum::routing::get(partition_status))
        .route("/", axum::routing::post(partition_action))
        .with_state(PartitionHttpState {
            watcher,
            store,
            key: key.into(),
        })
}

fn partition_statuses(desc: &PartitionRingDesc) -> Vec<PartitionStatus> {
    let now = timestamp_now() as i64;
    desc.partitions
        .values()
        .map(|p| PartitionStatus {
            id: p.id,
            state: p.state.to_string(),
            state_age_secs: now - p.state_timestamp as i64,
            locked: p.state_change_locked,
            num_tokens: p.tokens.len(),
            owners: desc
                .partition_owners(p.id)
                .into_iter()
                .map(String::from)
                .collect(),
        })
        .collect()
}

async fn partition_status(
    State(state): State<PartitionHttpState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ring = state.watcher.ring();
    let partitions = partition_statuses(ring.descriptor());

    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    if wants_json {
        return axum::Json(json!({
            "partitions": partitions,
            "owners": ring.descriptor().owners.len(),
        }))
        .into_response();
    }

    let mut rows = String::new();
    for p in &partitions {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}s ago</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            p.id,
            p.state,
            p.state_age_secs,
            if p.locked { "locked" } else { "" },
            p.num_tokens,
            p.owners.join(", "),
        ));
    }
    Html(format!(
        "<!DOCTYPE html><html><head><title>Partition ring</title></head><body>\
         <h1>Partition ring</h1>\
         <table border=\"1\">\
         <tr><th>ID</th><th>State</th><th>Since</th><th>Lock</th><th>Tokens</th><th>Owners</th></tr>\n{}\
         </table></body></html>",
        rows
    ))
    .into_response()
}

async fn partition_action(
    State(state): State<PartitionHttpState>,
    Form(req): Form<PartitionAction>,
) -> impl IntoResponse {
    let result = match req.action.as_str() {
        "change_state" => match req.state {
            Some(new_state) => {
                state
                    .store
                    .cas(
                        &state.key,
                        Box::new(move |desc: Option<PartitionRingDesc>| {
                            let mut desc = desc.ok_or(Error::PartitionNotFound(req.id))?;
                            desc.set_partition_state(req.id, new_state, timestamp_now())?;
                            Ok(Some(desc))
                        }),
                    )
                    .await
            }
            None => Err(Error::InvalidConfig("missing target state".into())),
        },
        "lock" | "unlock" => {
            let locked = req.action == "lock";
            state
                .store
                .cas(
                    &state.key,
                    Box::new(move |desc: Option<PartitionRingDesc>| {
                        let mut desc = desc.ok_or(Error::PartitionNotFound(req.id))?;
                        desc.set_partition_state_locked(req.id, locked)?;
                        Ok(Some(desc))
                    }),
                )
                .await
        }
        other => Err(Error::InvalidConfig(format!("unknown action: {}", other))),
    };

    match result {
        Ok(()) => Redirect::to("#").into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn setup() -> (Router, Arc<MemoryKvStore<PartitionRingDesc>>) {
        let store: Arc<MemoryKvStore<PartitionRingDesc>> = Arc::new(MemoryKvStore::new());
        store
            .cas(
                "partition-ring",
                Box::new(|_| {
                    let mut desc = PartitionRingDesc::new();
                    desc.add_partition(1, PartitionState::Active, 100)?;
                    desc.add_partition(2, PartitionState::Pending, 100)?;
                    desc.add_or_update_owner("i-1", 1, 100);
                    Ok(Some(desc))
                }),
            )
            .await
            .unwrap();

        let watcher = PartitionRingWatcher::new("partition-ring");
        watcher.update(store.get("partition-ring").await.unwrap().unwrap());
        let router = partition_ring_status_router(watcher, store.clone(), "partition-ring");
        (router, store)
    }

    #[tokio::test]
    async fn test_status_json() {
        let (router, _) = setup().await;

        let response = router
            .oneshot(
                Request::get("/")
                    .header("accept", "application/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let partitions = parsed["partitions"].as_array().unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0]["state"], "ACTIVE");
        assert_eq!(partitions[0]["owners"][0], "i-1");
    }

    #[tokio::test]
    async fn test_change_state() {
        let (router, store) = setup().await;

        let response = router
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("action=change_state&id=1&state=INACTIVE"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_redirection());

        let desc = store.get("partition-ring").await.unwrap().unwrap();
        assert_eq!(desc.partitions[&1].state, PartitionState::Inactive);
    }

    #[tokio::test]
    async fn test_lock_blocks_state_change() {
        let (router, store) = setup().await;

        let response = router
            .clone()
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("action=lock&id=1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        assert!(
            store
                .get("partition-ring")
                .await
                .unwrap()
                .unwrap()
                .partitions[&1]
                .state_change_locked
        );

        let response = router
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("action=change_state&id=1&state=INACTIVE"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
