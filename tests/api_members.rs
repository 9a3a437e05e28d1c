// tests/api_members.rs

//! End-to-end coverage of the `/cluster/members` HTTP surface, driving the axum
//! `Router` directly with `tower::ServiceExt::oneshot` rather than a bound listener.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use clusterd::config::Config;
use clusterd::core::member::{Member, MemberState};
use clusterd::server::{build_router, initialization};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::collections::HashSet;
use tower::ServiceExt;
use uuid::Uuid;

async fn clustered_state() -> std::sync::Arc<clusterd::core::state::ClusterDaemonState> {
    let mut config = Config::default();
    config.cluster.enabled = true;
    config.cluster.announce_address = "10.0.0.1:8443".to_string();
    initialization::setup(config).await.expect("state assembles")
}

fn peer_member(name: &str, address: &str) -> Member {
    Member {
        id: Uuid::new_v4(),
        name: name.to_string(),
        address: address.to_string(),
        state: MemberState::Created,
        roles: HashSet::new(),
        groups: ["default".to_string()].into(),
        failure_domain: None,
        architecture: 1,
        config: BTreeMap::new(),
        description: String::new(),
        last_seen_unix_ms: 0,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn join_token_request_is_rejected_when_not_clustered() {
    let state = initialization::setup(Config::default()).await.unwrap();
    let router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/cluster/members")
        .header("content-type", "application/json")
        .body(Body::from(json!({"server_name": "n2"}).to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn join_token_is_issued_and_list_members_reflects_the_local_node() {
    let state = clustered_state().await;
    let router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/cluster/members")
        .header("content-type", "application/json")
        .body(Body::from(json!({"server_name": "n2"}).to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let operation = body_json(response).await;
    assert_eq!(operation["class"], "token");

    let request = Request::builder()
        .uri("/cluster/members?recursion=1")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let members = body_json(response).await;
    let records = members.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["address"], "10.0.0.1:8443");
}

/// A remote member's name differs from its address; routing must key off the address
/// (not the name) when deciding whether this node may serve the request locally.
#[tokio::test]
async fn update_member_with_name_unequal_to_address_is_served_locally_by_the_leader() {
    let state = clustered_state().await;
    state
        .registry
        .transaction(|txn| txn.insert(peer_member("worker-1", "10.0.0.2:8443")))
        .await
        .unwrap();
    let router = build_router(state);

    let request = Request::builder()
        .method("PUT")
        .uri("/cluster/members/worker-1")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "config": {},
                "description": "updated via test",
                "roles": [],
                "groups": ["default"]
            })
            .to_string(),
        ))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["name"], "worker-1");
    assert_eq!(record["description"], "updated via test");
}

#[tokio::test]
async fn get_member_for_an_unknown_name_is_not_found() {
    let state = clustered_state().await;
    let router = build_router(state);

    let request = Request::builder()
        .uri("/cluster/members/nonexistent-member")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_member_by_its_actual_name_succeeds() {
    let state = clustered_state().await;
    let local_name = state.local_member_name.clone();
    let router = build_router(state);

    let request = Request::builder()
        .uri(format!("/cluster/members/{local_name}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(axum::http::header::ETAG));
}

#[tokio::test]
async fn evacuate_then_restore_round_trips_through_the_state_endpoint() {
    let state = clustered_state().await;
    let local_name = state.local_member_name.clone();
    let router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/cluster/members/{local_name}/state"))
        .header("content-type", "application/json")
        .body(Body::from(json!({"action": "evacuate", "mode": "auto"}).to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let operation = body_json(response).await;
    assert_eq!(operation["class"], "evacuate");

    // Give the spawned evacuation task a chance to settle before checking state.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let request = Request::builder()
        .uri(format!("/cluster/members/{local_name}/state"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert_eq!(snapshot["state"], "evacuated");
}

#[tokio::test]
async fn rename_to_an_existing_name_is_a_conflict() {
    let state = clustered_state().await;
    state
        .registry
        .transaction(|txn| txn.insert(peer_member("worker-1", "10.0.0.2:8443")))
        .await
        .unwrap();
    let local_name = state.local_member_name.clone();
    let router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/cluster/members/{local_name}"))
        .header("content-type", "application/json")
        .body(Body::from(json!({"new_name": "worker-1"}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
