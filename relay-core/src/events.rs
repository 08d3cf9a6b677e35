//! Dialect-specific parsing of upstream responses and stream events.
//!
//! Each dialect reports text and token usage in its own shape. These parsers
//! normalize a single SSE event (or a complete unary response body) into the
//! text delta, usage update, and completion signal the attempt context
//! accumulates. Unknown event shapes are tolerated: they count as events but
//! contribute no data.

use serde_json::Value;

use crate::candidates::ApiDialect;
use crate::usage::{extract_cache_creation_tokens, UsageUpdate};

/// Normalized view of one stream event.
#[derive(Clone, Debug, Default)]
pub struct ParsedEvent {
    pub text: Option<String>,
    pub usage: UsageUpdate,
    /// Terminal event for this dialect (message_stop / finish_reason / etc.).
    pub is_completion: bool,
}

impl ParsedEvent {
    /// Whether the event carried payload worth counting as data.
    pub fn has_data(&self) -> bool {
        self.text.is_some() || !self.usage.is_empty() || self.is_completion
    }
}

/// Parses one SSE event body for the given dialect.
pub fn parse_event(dialect: ApiDialect, event: &Value) -> ParsedEvent {
    match dialect {
        ApiDialect::Anthropic => parse_anthropic_event(event),
        ApiDialect::OpenAi => parse_openai_event(event),
        ApiDialect::Gemini => parse_gemini_event(event),
    }
}

/// Extracts the usage update from a complete unary response body.
pub fn usage_from_response(dialect: ApiDialect, body: &Value) -> UsageUpdate {
    match dialect {
        ApiDialect::Anthropic => body.get("usage").map(anthropic_usage).unwrap_or_default(),
        ApiDialect::OpenAi => body.get("usage").map(openai_usage).unwrap_or_default(),
        ApiDialect::Gemini => body
            .get("usageMetadata")
            .map(gemini_usage)
            .unwrap_or_default(),
    }
}

/// Extracts the assistant text from a complete unary response body.
pub fn text_from_response(dialect: ApiDialect, body: &Value) -> String {
    match dialect {
        ApiDialect::Anthropic => body
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default(),
        ApiDialect::OpenAi => body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        ApiDialect::Gemini => gemini_candidate_text(body).unwrap_or_default(),
    }
}

fn parse_anthropic_event(event: &Value) -> ParsedEvent {
    let mut parsed = ParsedEvent::default();
    match event.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            if let Some(usage) = event.pointer("/message/usage") {
                parsed.usage = anthropic_usage(usage);
            }
        }
        Some("content_block_delta") => {
            if let Some(text) = event.pointer("/delta/text").and_then(Value::as_str) {
                parsed.text = Some(text.to_string());
            }
        }
        Some("message_delta") => {
            if let Some(usage) = event.get("usage") {
                parsed.usage = anthropic_usage(usage);
            }
        }
        Some("message_stop") => {
            parsed.is_completion = true;
        }
        _ => {}
    }
    parsed
}

fn anthropic_usage(usage: &Value) -> UsageUpdate {
    UsageUpdate {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
        cached_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_u64),
        cache_creation_tokens: Some(extract_cache_creation_tokens(usage)),
    }
}

fn parse_openai_event(event: &Value) -> ParsedEvent {
    let mut parsed = ParsedEvent::default();
    let choice = &event["choices"][0];
    if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
        parsed.text = Some(text.to_string());
    }
    if choice.get("finish_reason").is_some_and(|r| !r.is_null()) {
        parsed.is_completion = true;
    }
    // Usage arrives on the final chunk (stream_options.include_usage).
    if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
        parsed.usage = openai_usage(usage);
    }
    parsed
}

fn openai_usage(usage: &Value) -> UsageUpdate {
    UsageUpdate {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        cached_tokens: usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64),
        cache_creation_tokens: None,
    }
}

fn parse_gemini_event(event: &Value) -> ParsedEvent {
    let mut parsed = ParsedEvent::default();
    if let Some(text) = gemini_candidate_text(event) {
        parsed.text = Some(text);
    }
    if event
        .pointer("/candidates/0/finishReason")
        .is_some_and(|r| !r.is_null())
    {
        parsed.is_completion = true;
    }
    if let Some(usage) = event.get("usageMetadata") {
        parsed.usage = gemini_usage(usage);
    }
    parsed
}

fn gemini_candidate_text(body: &Value) -> Option<String> {
    let parts = body
        .pointer("/candidates/0/content/parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

fn gemini_usage(usage: &Value) -> UsageUpdate {
    UsageUpdate {
        input_tokens: usage.get("promptTokenCount").and_then(Value::as_u64),
        output_tokens: usage.get("candidatesTokenCount").and_then(Value::as_u64),
        cached_tokens: usage
            .get("cachedContentTokenCount")
            .and_then(Value::as_u64),
        cache_creation_tokens: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anthropic_stream_lifecycle() {
        let start = parse_event(
            ApiDialect::Anthropic,
            &json!({
                "type": "message_start",
                "message": {"usage": {"input_tokens": 88, "output_tokens": 1}}
            }),
        );
        assert_eq!(start.usage.input_tokens, Some(88));
        assert!(start.has_data());
        assert!(!start.is_completion);

        let delta = parse_event(
            ApiDialect::Anthropic,
            &json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hi"}}),
        );
        assert_eq!(delta.text.as_deref(), Some("Hi"));

        let finish = parse_event(
            ApiDialect::Anthropic,
            &json!({"type": "message_delta", "usage": {"output_tokens": 42}}),
        );
        assert_eq!(finish.usage.output_tokens, Some(42));

        let stop = parse_event(ApiDialect::Anthropic, &json!({"type": "message_stop"}));
        assert!(stop.is_completion);

        let ping = parse_event(ApiDialect::Anthropic, &json!({"type": "ping"}));
        assert!(!ping.has_data());
    }

    #[test]
    fn test_openai_delta_and_final_usage_chunk() {
        let delta = parse_event(
            ApiDialect::OpenAi,
            &json!({"choices": [{"delta": {"content": "Hello"}, "finish_reason": null}]}),
        );
        assert_eq!(delta.text.as_deref(), Some("Hello"));
        assert!(!delta.is_completion);

        let last = parse_event(
            ApiDialect::OpenAi,
            &json!({
                "choices": [{"delta": {}, "finish_reason": "stop"}],
                "usage": {
                    "prompt_tokens": 20,
                    "completion_tokens": 9,
                    "prompt_tokens_details": {"cached_tokens": 16}
                }
            }),
        );
        assert!(last.is_completion);
        assert_eq!(last.usage.input_tokens, Some(20));
        assert_eq!(last.usage.output_tokens, Some(9));
        assert_eq!(last.usage.cached_tokens, Some(16));
    }

    #[test]
    fn test_gemini_event_parsing() {
        let chunk = parse_event(
            ApiDialect::Gemini,
            &json!({
                "candidates": [{
                    "content": {"parts": [{"text": "Bon"}, {"text": "jour"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 12,
                    "candidatesTokenCount": 3,
                    "cachedContentTokenCount": 4
                }
            }),
        );
        assert_eq!(chunk.text.as_deref(), Some("Bonjour"));
        assert!(chunk.is_completion);
        assert_eq!(chunk.usage.input_tokens, Some(12));
        assert_eq!(chunk.usage.output_tokens, Some(3));
        assert_eq!(chunk.usage.cached_tokens, Some(4));
    }

    #[test]
    fn test_unary_extraction_per_dialect() {
        let anthropic = json!({
            "content": [{"type": "text", "text": "Hey "}, {"type": "text", "text": "there"}],
            "usage": {"input_tokens": 5, "output_tokens": 2, "cache_read_input_tokens": 1}
        });
        assert_eq!(
            text_from_response(ApiDialect::Anthropic, &anthropic),
            "Hey there"
        );
        let usage = usage_from_response(ApiDialect::Anthropic, &anthropic);
        assert_eq!(usage.input_tokens, Some(5));
        assert_eq!(usage.cached_tokens, Some(1));

        let openai = json!({
            "choices": [{"message": {"content": "ok"}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 1}
        });
        assert_eq!(text_from_response(ApiDialect::OpenAi, &openai), "ok");
        assert_eq!(
            usage_from_response(ApiDialect::OpenAi, &openai).input_tokens,
            Some(7)
        );

        let gemini = json!({
            "candidates": [{"content": {"parts": [{"text": "salut"}]}}],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
        });
        assert_eq!(text_from_response(ApiDialect::Gemini, &gemini), "salut");
        assert_eq!(
            usage_from_response(ApiDialect::Gemini, &gemini).output_tokens,
            Some(2)
        );
    }
}
