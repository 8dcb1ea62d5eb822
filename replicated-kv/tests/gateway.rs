//! HTTP gateway tests against an in-process engine.
//!
//! Requests go straight into the axum router with `tower::ServiceExt`, so no
//! sockets are opened.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{Value, json};
use tower::ServiceExt;

use replicated_kv::engine::{ClusterMember, Configuration, ConsensusEngine, Role};
use replicated_kv::fsm::KvFsm;
use replicated_kv::gateway::{self, JoinResponse, LEADER_HEADER};
use replicated_kv::store::Store;
use replicated_kv::test_utils::{EngineCall, MockEngine};

struct Harness {
    engine: Arc<MockEngine>,
    router: Router,
}

impl Harness {
    fn leader() -> Self {
        let fsm = Arc::new(KvFsm::new());
        let engine = Arc::new(MockEngine::with_fsm(Arc::clone(&fsm)));
        engine
            .bootstrap_cluster(Configuration::single(ClusterMember::new(
                "n1",
                "127.0.0.1:12000",
            )))
            .unwrap();
        let store = Arc::new(Store::new("n1", fsm, Arc::clone(&engine)));
        Self {
            engine,
            router: gateway::router(store),
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    async fn put(&self, key: &str, value: &str) -> StatusCode {
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/kv/{key}"))
            .body(Body::from(value.to_string()))
            .unwrap();
        self.send(request).await.0
    }

    async fn get(&self, key: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .uri(format!("/kv/{key}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }

    async fn join(&self, body: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("POST")
            .uri("/join")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }
}

#[tokio::test]
async fn put_then_get_returns_raw_value() {
    let harness = Harness::leader();

    assert_eq!(harness.put("user1", "batman").await, StatusCode::OK);

    let (status, body) = harness.get("user1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"batman");
}

#[tokio::test]
async fn empty_value_is_not_missing() {
    let harness = Harness::leader();
    harness.put("blank", "").await;

    assert_eq!(harness.get("blank").await, (StatusCode::OK, Vec::new()));
    assert_eq!(harness.get("never-set").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn non_utf8_value_is_rejected() {
    let harness = Harness::leader();
    let request = Request::builder()
        .method("PUT")
        .uri("/kv/bin")
        .body(Body::from(vec![0xff, 0xfe]))
        .unwrap();

    let (status, _, _) = harness.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn follower_answers_misdirected_without_forwarding() {
    let harness = Harness::leader();
    harness.engine.set_role(Role::Follower);

    let request = Request::builder()
        .method("PUT")
        .uri("/kv/a")
        .body(Body::from("1"))
        .unwrap();
    let (status, headers, body) = harness.send(request).await;

    assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
    assert!(headers.get(LEADER_HEADER).is_none(), "no leader known");
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "not the leader");
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn commit_timeout_is_a_gateway_timeout() {
    let harness = Harness::leader();
    harness
        .engine
        .fail_apply(replicated_kv::engine::EngineError::Timeout);

    assert_eq!(harness.put("a", "1").await, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(harness.get("a").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_join_is_a_bad_request() {
    let harness = Harness::leader();

    for body in ["", "{", r#"{"id": "n2"}"#, r#"{"addr": "127.0.0.1:12001"}"#] {
        let (status, _) = harness.join(body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body:?}");
    }
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn blank_join_fields_are_a_bad_request() {
    let harness = Harness::leader();
    let (status, _) = harness.join(r#"{"id": "", "addr": "127.0.0.1:12001"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn join_twice_is_idempotent() {
    let harness = Harness::leader();
    let body = r#"{"id": "n2", "addr": "127.0.0.1:12001"}"#;

    let (status, first) = harness.join(body).await;
    assert_eq!(status, StatusCode::OK);
    let first: JoinResponse = serde_json::from_slice(&first).unwrap();
    assert_eq!(first, JoinResponse::Added { removed: vec![] });

    let (status, second) = harness.join(body).await;
    assert_eq!(status, StatusCode::OK);
    let second: Value = serde_json::from_slice(&second).unwrap();
    assert_eq!(second, json!({"outcome": "already_member"}));

    let adds = harness
        .engine
        .calls()
        .into_iter()
        .filter(|call| matches!(call, EngineCall::AddVoter { .. }))
        .count();
    assert_eq!(adds, 1);
}

#[tokio::test]
async fn join_on_follower_is_misdirected() {
    let harness = Harness::leader();
    harness.engine.set_role(Role::Follower);

    let (status, _) = harness
        .join(r#"{"id": "n2", "addr": "127.0.0.1:12001"}"#)
        .await;

    assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
}

#[tokio::test]
async fn status_reports_membership_and_keys() {
    let harness = Harness::leader();
    harness.put("a", "1").await;
    harness.put("b", "2").await;

    let request = Request::builder()
        .uri("/status")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = harness.send(request).await;
    let body: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_id"], "n1");
    assert_eq!(body["role"], "Leader");
    assert_eq!(body["keys"], 2);
    assert_eq!(body["configuration"]["members"][0]["address"], "127.0.0.1:12000");
}
