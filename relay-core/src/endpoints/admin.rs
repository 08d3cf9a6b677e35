//! Administrative surface over the concurrency counters.
//!
//! Every admin operation is a variant of the closed [`AdminAction`] enum and
//! goes through one exhaustive `handle` match, so adding an operation forces
//! every call site to account for it.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::candidates::ProviderDirectory;
use crate::concurrency::ConcurrencyTracker;
use crate::error::{Error, ErrorDetails, SaturatedEntity};
use crate::gateway_util::AppState;

#[derive(Clone, Debug)]
pub enum AdminAction {
    EndpointConcurrency { endpoint_id: String },
    KeyConcurrency { key_id: String },
    ResetConcurrency(ResetParams),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResetParams {
    pub endpoint_id: Option<String>,
    pub key_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum AdminResponse {
    ConcurrencyStatus(ConcurrencyStatusResponse),
    Message(MessageResponse),
}

#[derive(Debug, Serialize)]
pub struct ConcurrencyStatusResponse {
    pub entity: SaturatedEntity,
    pub id: String,
    pub current: u64,
    /// Configured ceiling; `None` means unlimited.
    pub max_concurrent: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl AdminAction {
    pub fn handle(
        self,
        directory: &dyn ProviderDirectory,
        tracker: &ConcurrencyTracker,
    ) -> Result<AdminResponse, Error> {
        match self {
            AdminAction::EndpointConcurrency { endpoint_id } => {
                if !directory.endpoint_exists(&endpoint_id) {
                    return Err(Error::new(ErrorDetails::EndpointNotFound { endpoint_id }));
                }
                let snapshot = tracker.current(Some(&endpoint_id), None);
                let max_concurrent = directory.endpoint_max_concurrent(&endpoint_id);
                Ok(AdminResponse::ConcurrencyStatus(ConcurrencyStatusResponse {
                    entity: SaturatedEntity::Endpoint,
                    id: endpoint_id,
                    current: snapshot.endpoint_count,
                    max_concurrent,
                }))
            }
            AdminAction::KeyConcurrency { key_id } => {
                if !directory.key_exists(&key_id) {
                    return Err(Error::new(ErrorDetails::KeyNotFound { key_id }));
                }
                let snapshot = tracker.current(None, Some(&key_id));
                let max_concurrent = directory.key_max_concurrent(&key_id);
                Ok(AdminResponse::ConcurrencyStatus(ConcurrencyStatusResponse {
                    entity: SaturatedEntity::Key,
                    id: key_id,
                    current: snapshot.key_count,
                    max_concurrent,
                }))
            }
            AdminAction::ResetConcurrency(params) => {
                if params.endpoint_id.is_none() && params.key_id.is_none() {
                    return Err(Error::new(ErrorDetails::InvalidRequest {
                        message: "reset requires `endpoint_id` and/or `key_id`".to_string(),
                    }));
                }
                if let Some(endpoint_id) = &params.endpoint_id {
                    if !directory.endpoint_exists(endpoint_id) {
                        return Err(Error::new(ErrorDetails::EndpointNotFound {
                            endpoint_id: endpoint_id.clone(),
                        }));
                    }
                }
                if let Some(key_id) = &params.key_id {
                    if !directory.key_exists(key_id) {
                        return Err(Error::new(ErrorDetails::KeyNotFound {
                            key_id: key_id.clone(),
                        }));
                    }
                }
                tracker.reset(params.endpoint_id.as_deref(), params.key_id.as_deref());
                Ok(AdminResponse::Message(MessageResponse {
                    message: "concurrency counters reset".to_string(),
                }))
            }
        }
    }
}

#[expect(clippy::unused_async)]
pub async fn endpoint_concurrency_handler(
    State(state): AppState,
    Path(endpoint_id): Path<String>,
) -> Result<Json<AdminResponse>, Error> {
    AdminAction::EndpointConcurrency { endpoint_id }
        .handle(state.directory.as_ref(), &state.tracker)
        .map(Json)
}

#[expect(clippy::unused_async)]
pub async fn key_concurrency_handler(
    State(state): AppState,
    Path(key_id): Path<String>,
) -> Result<Json<AdminResponse>, Error> {
    AdminAction::KeyConcurrency { key_id }
        .handle(state.directory.as_ref(), &state.tracker)
        .map(Json)
}

#[expect(clippy::unused_async)]
pub async fn reset_concurrency_handler(
    State(state): AppState,
    Query(params): Query<ResetParams>,
) -> Result<Json<AdminResponse>, Error> {
    AdminAction::ResetConcurrency(params)
        .handle(state.directory.as_ref(), &state.tracker)
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::Candidate;
    use crate::concurrency::EntityLimit;

    struct TwoEntryDirectory;

    impl ProviderDirectory for TwoEntryDirectory {
        fn candidates_for_model(&self, _model: &str) -> Vec<Candidate> {
            Vec::new()
        }

        fn endpoint_exists(&self, endpoint_id: &str) -> bool {
            endpoint_id == "ep-1"
        }

        fn key_exists(&self, key_id: &str) -> bool {
            key_id == "key-1"
        }

        fn endpoint_max_concurrent(&self, endpoint_id: &str) -> Option<u64> {
            (endpoint_id == "ep-1").then_some(8)
        }
    }

    #[test]
    fn test_endpoint_status_reflects_live_counter() {
        let tracker = ConcurrencyTracker::new();
        let _held = tracker
            .acquire(Some(EntityLimit::new("ep-1", None)), None)
            .unwrap();

        let response = AdminAction::EndpointConcurrency {
            endpoint_id: "ep-1".to_string(),
        }
        .handle(&TwoEntryDirectory, &tracker)
        .unwrap();
        match response {
            AdminResponse::ConcurrencyStatus(status) => {
                assert_eq!(status.current, 1);
                assert_eq!(status.entity, SaturatedEntity::Endpoint);
                assert_eq!(status.max_concurrent, Some(8));
            }
            AdminResponse::Message(_) => panic!("expected a status response"),
        }
    }

    #[test]
    fn test_unknown_ids_map_to_not_found() {
        let tracker = ConcurrencyTracker::new();
        let err = AdminAction::EndpointConcurrency {
            endpoint_id: "nope".to_string(),
        }
        .handle(&TwoEntryDirectory, &tracker)
        .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);

        let err = AdminAction::KeyConcurrency {
            key_id: "nope".to_string(),
        }
        .handle(&TwoEntryDirectory, &tracker)
        .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_reset_requires_a_target_and_zeroes_counters() {
        let tracker = ConcurrencyTracker::new();
        let err = AdminAction::ResetConcurrency(ResetParams::default())
            .handle(&TwoEntryDirectory, &tracker)
            .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::BAD_REQUEST);

        let _held = tracker
            .acquire(None, Some(EntityLimit::new("key-1", None)))
            .unwrap();
        assert_eq!(tracker.current(None, Some("key-1")).key_count, 1);

        let response = AdminAction::ResetConcurrency(ResetParams {
            endpoint_id: None,
            key_id: Some("key-1".to_string()),
        })
        .handle(&TwoEntryDirectory, &tracker)
        .unwrap();
        assert!(matches!(response, AdminResponse::Message(_)));
        assert_eq!(tracker.current(None, Some("key-1")).key_count, 0);
    }
}
