//! HTTP gateway in front of a [`Store`].
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/kv/:key` | Local read, 404 if the key was never set |
//! | `PUT` | `/kv/:key` | Replicated write, raw body is the value |
//! | `POST` | `/join` | Add `{"id", "addr"}` as a voter |
//! | `GET` | `/status` | Role, leader, key count and membership |
//!
//! Writes and joins only succeed on the leader. Other nodes answer
//! `421 Misdirected Request` with an `X-Raft-Leader` header naming the
//! leader when one is known; nothing is forwarded.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::{ClusterMember, ConsensusEngine, EngineError};
use crate::membership::{JoinOutcome, MembershipError};
use crate::store::{NodeStatus, Store, StoreError};

pub const LEADER_HEADER: &str = "x-raft-leader";

/// Errors as the HTTP caller sees them.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not the leader")]
    NotLeader { leader: Option<ClusterMember> },
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Conflict(String),
    #[error("key not found")]
    NotFound,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn from_engine(err: &EngineError, message: String) -> Self {
        match err {
            EngineError::NotLeader | EngineError::LeadershipLost => {
                ApiError::NotLeader { leader: None }
            }
            EngineError::Timeout => ApiError::Timeout,
            EngineError::ConfigurationChanged { .. }
            | EngineError::AlreadyBootstrapped
            | EngineError::Rejected(_) => ApiError::Conflict(message),
            EngineError::Stopped => ApiError::Internal(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotLeader { leader } => ApiError::NotLeader { leader },
            StoreError::InvalidInput(reason) => ApiError::InvalidInput(reason.to_string()),
            StoreError::Encode(_) => ApiError::Internal(message),
            StoreError::Engine(engine) => ApiError::from_engine(&engine, message),
            StoreError::Membership(MembershipError::RemoveConflict { .. }) => {
                ApiError::Conflict(message)
            }
            StoreError::Membership(membership) => {
                ApiError::from_engine(membership.engine_error(), message)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let leader = match &self {
            ApiError::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        let mut response = (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response();
        if let Some(value) = leader.and_then(|l| HeaderValue::from_str(&l.to_string()).ok()) {
            response.headers_mut().insert(LEADER_HEADER, value);
        }
        response
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinResponse {
    AlreadyMember,
    Added { removed: Vec<ClusterMember> },
}

impl From<JoinOutcome> for JoinResponse {
    fn from(outcome: JoinOutcome) -> Self {
        match outcome {
            JoinOutcome::AlreadyMember => JoinResponse::AlreadyMember,
            JoinOutcome::Added { removed } => JoinResponse::Added { removed },
        }
    }
}

pub fn router<E: ConsensusEngine + 'static>(store: Arc<Store<E>>) -> Router {
    Router::new()
        .route("/kv/:key", get(get_key::<E>).put(put_key::<E>))
        .route("/join", post(join::<E>))
        .route("/status", get(status::<E>))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Serves the gateway on `listener` until `shutdown` resolves.
pub async fn serve<E, F>(
    listener: TcpListener,
    store: Arc<Store<E>>,
    shutdown: F,
) -> anyhow::Result<()>
where
    E: ConsensusEngine + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "http gateway listening");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Runs a blocking store call off the async runtime.
async fn blocking<E, T, F>(store: Arc<Store<E>>, call: F) -> Result<T, ApiError>
where
    E: ConsensusEngine + 'static,
    T: Send + 'static,
    F: FnOnce(&Store<E>) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&store))
        .await
        .map_err(|err| ApiError::Internal(format!("store task failed: {err}")))?
        .map_err(ApiError::from)
}

async fn get_key<E: ConsensusEngine + 'static>(
    State(store): State<Arc<Store<E>>>,
    Path(key): Path<String>,
) -> Result<String, ApiError> {
    store.get(&key)?.ok_or(ApiError::NotFound)
}

async fn put_key<E: ConsensusEngine + 'static>(
    State(store): State<Arc<Store<E>>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let value = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::InvalidInput("value must be valid UTF-8".into()))?;
    blocking(store, move |store| store.set(&key, &value)).await?;
    Ok(StatusCode::OK)
}

async fn join<E: ConsensusEngine + 'static>(
    State(store): State<Arc<Store<E>>>,
    body: Bytes,
) -> Result<Json<JoinResponse>, ApiError> {
    let request: JoinRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::InvalidInput(format!("malformed join request: {err}")))?;
    let JoinRequest { id, addr } = request;

    let outcome = blocking(store, move |store| store.join(&id, &addr))
        .await
        .inspect_err(|err| warn!(error = %err, "join failed"))?;
    Ok(Json(outcome.into()))
}

async fn status<E: ConsensusEngine + 'static>(
    State(store): State<Arc<Store<E>>>,
) -> Result<Json<NodeStatus>, ApiError> {
    Ok(Json(blocking(store, |store| store.status()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_distinct_statuses() {
        let cases = [
            (EngineError::NotLeader, StatusCode::MISDIRECTED_REQUEST),
            (EngineError::LeadershipLost, StatusCode::MISDIRECTED_REQUEST),
            (EngineError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (
                EngineError::ConfigurationChanged {
                    expected: 3,
                    actual: 4,
                },
                StatusCode::CONFLICT,
            ),
            (EngineError::Stopped, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let api: ApiError = StoreError::Engine(err.clone()).into();
            assert_eq!(api.status(), expected, "{err:?}");
        }
    }

    #[test]
    fn conflicting_removal_is_a_conflict() {
        let err = StoreError::Membership(MembershipError::RemoveConflict {
            node_id: "n1".into(),
            address: "10.0.0.1:9000".into(),
            source: EngineError::Timeout,
        });
        let api = ApiError::from(err);
        assert_eq!(api.status(), StatusCode::CONFLICT);
        assert!(api.to_string().contains("10.0.0.1:9000"));
    }

    #[test]
    fn failed_add_keeps_engine_status() {
        let err = StoreError::Membership(MembershipError::AddVoter {
            node_id: "n2".into(),
            address: "10.0.0.2:9000".into(),
            source: EngineError::Timeout,
        });
        assert_eq!(ApiError::from(err).status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn not_leader_carries_leader_header() {
        let response = ApiError::NotLeader {
            leader: Some(ClusterMember::new("n1", "127.0.0.1:12000")),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
        assert_eq!(
            response.headers().get(LEADER_HEADER).unwrap(),
            "n1@127.0.0.1:12000"
        );
    }

    #[test]
    fn join_response_is_tagged() {
        let body = serde_json::to_value(JoinResponse::from(JoinOutcome::AlreadyMember)).unwrap();
        assert_eq!(body, serde_json::json!({"outcome": "already_member"}));
    }
}
