//! Token-usage accounting and the terminal usage record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::attempt::AttemptContext;
use crate::candidates::ApiDialect;
use crate::error::Error;

/// Token counters for one attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A (possibly partial) usage report from one upstream response or stream
/// event. `None` means the upstream did not mention the counter at all;
/// `Some(0)` means it reported zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageUpdate {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub cache_creation_tokens: Option<u64>,
}

impl UsageUpdate {
    pub fn is_empty(&self) -> bool {
        *self == UsageUpdate::default()
    }
}

/// Extracts cache-creation tokens from a Claude-style `usage` object,
/// handling both field layouts upstream has shipped: the split 5-minute /
/// 1-hour fields, and the older aggregate `cache_creation_input_tokens`.
/// The split fields win whenever they sum to a nonzero value.
pub fn extract_cache_creation_tokens(usage: &Value) -> u64 {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let split_total = field("claude_cache_creation_5_m_tokens")
        .saturating_add(field("claude_cache_creation_1_h_tokens"));
    if split_total > 0 {
        split_total
    } else {
        field("cache_creation_input_tokens")
    }
}

/// Terminal accounting snapshot for one client request: whichever attempt
/// produced the outcome returned to the client (or the last one tried, if
/// all failed). Produced exactly once per request and handed to the
/// [`UsageSink`].
#[derive(Clone, Debug, Serialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub model: String,
    pub dialect: ApiDialect,
    pub provider_name: Option<String>,
    pub provider_id: Option<String>,
    pub endpoint_id: Option<String>,
    pub key_id: Option<String>,
    pub mapped_model: Option<String>,
    pub usage: Usage,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub latency_ms: u64,
    pub stream: bool,
    pub event_count: u64,
    pub has_completion: bool,
    pub created_at: DateTime<Utc>,
}

/// Builds the terminal usage record from the attempt that decided the
/// request's outcome.
pub fn reconcile(
    attempt: &AttemptContext,
    request_id: Uuid,
    latency_ms: u64,
    stream: bool,
) -> UsageRecord {
    UsageRecord {
        request_id,
        model: attempt.model.clone(),
        dialect: attempt.dialect,
        provider_name: attempt.provider_name.clone(),
        provider_id: attempt.provider_id.clone(),
        endpoint_id: attempt.endpoint_id.clone(),
        key_id: attempt.key_id.clone(),
        mapped_model: attempt.mapped_model.clone(),
        usage: attempt.usage,
        status_code: attempt.status_code.as_u16(),
        error_message: attempt.error_message.clone(),
        latency_ms,
        stream,
        event_count: attempt.event_count,
        has_completion: attempt.has_completion,
        created_at: Utc::now(),
    }
}

/// Persistence collaborator: appends one usage/audit record per completed
/// client request. Storage schema is the collaborator's concern.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), Error>;
}

/// Sink that emits records to the log stream. Used when no persistence
/// backend is configured.
#[derive(Debug, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), Error> {
        tracing::info!(
            request_id = %record.request_id,
            model = %record.model,
            provider = record.provider_name.as_deref().unwrap_or("unknown"),
            status = record.status_code,
            input_tokens = record.usage.input_tokens,
            output_tokens = record.usage.output_tokens,
            latency_ms = record.latency_ms,
            "usage record"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_creation_prefers_split_fields() {
        let usage = json!({
            "claude_cache_creation_5_m_tokens": 30,
            "claude_cache_creation_1_h_tokens": 12,
            "cache_creation_input_tokens": 999,
        });
        assert_eq!(extract_cache_creation_tokens(&usage), 42);
    }

    #[test]
    fn test_cache_creation_falls_back_to_legacy_aggregate() {
        let usage = json!({
            "claude_cache_creation_5_m_tokens": 0,
            "cache_creation_input_tokens": 17,
        });
        assert_eq!(extract_cache_creation_tokens(&usage), 17);
        assert_eq!(extract_cache_creation_tokens(&json!({})), 0);
    }

    #[test]
    fn test_reconcile_copies_attempt_state() {
        let mut attempt = AttemptContext::new("claude-sonnet-4", ApiDialect::Anthropic);
        attempt.update_usage(UsageUpdate {
            input_tokens: Some(100),
            output_tokens: Some(25),
            ..Default::default()
        });
        attempt.has_completion = true;
        attempt.event_count = 7;

        let request_id = Uuid::now_v7();
        let record = reconcile(&attempt, request_id, 1234, true);
        assert_eq!(record.request_id, request_id);
        assert_eq!(record.usage.input_tokens, 100);
        assert_eq!(record.usage.output_tokens, 25);
        assert_eq!(record.usage.total_tokens(), 125);
        assert_eq!(record.status_code, 200);
        assert_eq!(record.latency_ms, 1234);
        assert!(record.stream);
        assert!(record.has_completion);
        assert_eq!(record.event_count, 7);
    }
}
