//! Per-attempt bookkeeping for one upstream call.
//!
//! An [`AttemptContext`] accumulates everything observed while talking to a
//! single candidate: token usage, collected text, parsed stream events, and
//! the terminal status. On failover the context is reset rather than
//! replaced, so the requested model and dialect survive while all
//! candidate-scoped state is wiped.

use http::{HeaderMap, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::candidates::{ApiDialect, Candidate};
use crate::usage::{Usage, UsageUpdate};

#[derive(Debug)]
pub struct AttemptContext {
    /// The model name the client asked for. Survives retries.
    pub model: String,
    /// The wire dialect the client spoke to us. Survives retries.
    pub dialect: ApiDialect,

    pub attempt_id: Uuid,
    pub provider_name: Option<String>,
    pub provider_id: Option<String>,
    pub endpoint_id: Option<String>,
    pub key_id: Option<String>,
    /// Dialect spoken to the bound candidate (may differ from `dialect`).
    pub provider_dialect: Option<ApiDialect>,
    /// Upstream model name after per-provider mapping.
    pub mapped_model: Option<String>,

    pub usage: Usage,
    pub collected_text: String,
    pub status_code: StatusCode,
    pub error_message: Option<String>,
    pub has_completion: bool,
    pub response_headers: HeaderMap,
    pub request_body: Option<Value>,
    /// Events that carried payload data (text or usage).
    pub data_count: u64,
    /// All events received, including keep-alives.
    pub event_count: u64,
    pub parsed_events: Vec<Value>,
}

impl AttemptContext {
    pub fn new(model: impl Into<String>, dialect: ApiDialect) -> Self {
        Self {
            model: model.into(),
            dialect,
            attempt_id: Uuid::now_v7(),
            provider_name: None,
            provider_id: None,
            endpoint_id: None,
            key_id: None,
            provider_dialect: None,
            mapped_model: None,
            usage: Usage::default(),
            collected_text: String::new(),
            status_code: StatusCode::OK,
            error_message: None,
            has_completion: false,
            response_headers: HeaderMap::new(),
            request_body: None,
            data_count: 0,
            event_count: 0,
            parsed_events: Vec::new(),
        }
    }

    /// Wipes all candidate-scoped state ahead of the next failover attempt.
    /// Only the requested model and client dialect carry over; a fresh
    /// attempt id is issued.
    pub fn reset_for_retry(&mut self) {
        let model = std::mem::take(&mut self.model);
        let dialect = self.dialect;
        *self = Self::new(model, dialect);
    }

    /// Records which candidate this attempt is talking to.
    pub fn bind_candidate(&mut self, candidate: &Candidate) {
        self.provider_name = Some(candidate.provider_name.clone());
        self.provider_id = Some(candidate.provider_id.clone());
        self.endpoint_id = Some(candidate.endpoint_id.clone());
        self.key_id = Some(candidate.key_id.clone());
        self.provider_dialect = Some(candidate.dialect);
        self.mapped_model = Some(candidate.mapped_model.clone());
    }

    /// Merges a usage report into the running counters. Providers re-send
    /// usage across stream events with fields that flip between real values
    /// and zero, so an incoming value only lands if it is nonzero or the
    /// stored counter is still zero. A real count is never overwritten by a
    /// later zero.
    pub fn update_usage(&mut self, update: UsageUpdate) {
        fn merge(current: &mut u64, incoming: Option<u64>) {
            if let Some(value) = incoming {
                if value > 0 || *current == 0 {
                    *current = value;
                }
            }
        }
        merge(&mut self.usage.input_tokens, update.input_tokens);
        merge(&mut self.usage.output_tokens, update.output_tokens);
        merge(&mut self.usage.cached_tokens, update.cached_tokens);
        merge(
            &mut self.usage.cache_creation_tokens,
            update.cache_creation_tokens,
        );
    }

    /// Marks the attempt failed with the upstream (or synthesized) status.
    pub fn mark_failed(&mut self, status_code: StatusCode, message: impl Into<String>) {
        self.status_code = status_code;
        self.error_message = Some(message.into());
    }

    pub fn is_success(&self) -> bool {
        self.status_code.as_u16() < 400
    }

    /// Assembles the aggregated (non-SSE) response body from the events
    /// collected while draining a stream.
    pub fn build_response_body(&self, latency_ms: u64) -> Value {
        json!({
            "chunks": self.parsed_events,
            "metadata": {
                "stream": true,
                "total_chunks": self.event_count,
                "data_count": self.data_count,
                "has_completion": self.has_completion,
                "response_time_ms": latency_ms,
            },
        })
    }

    /// One-line outcome summary, logged when the request completes.
    pub fn log_summary(&self, request_id: Uuid, latency_ms: u64) {
        let outcome = if self.is_success() { "OK" } else { "FAIL" };
        let id = request_id.simple().to_string();
        let short_id = id.get(..8).unwrap_or(&id);
        tracing::info!(
            "[{outcome}] {short_id} | {} | {} | {latency_ms}ms | in:{} out:{}",
            self.model,
            self.provider_name.as_deref().unwrap_or("-"),
            self.usage.input_tokens,
            self.usage.output_tokens,
        );
    }
}
