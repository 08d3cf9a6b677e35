//! Upstream HTTP plumbing: the shared reqwest client and the per-dialect
//! request shapes.
//!
//! The dispatcher talks to upstreams through the [`ModelClient`] trait so
//! tests can substitute scripted responses; [`RelayHttpClient`] is the real
//! implementation. Attempt timeouts are enforced by the dispatcher, so the
//! client's own read timeout is a generous backstop for long generations.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};
use reqwest_eventsource::{Event, RequestBuilderExt};
use secrecy::ExposeSecret;
use serde_json::Value;
use url::Url;

use crate::candidates::{ApiDialect, Candidate};
use crate::error::{Error, ErrorDetails};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Connection-pool settings for the shared upstream client.
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub proxy: Option<Url>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
            pool_max_idle_per_host: 20,
            proxy: None,
        }
    }
}

/// One fully-resolved upstream request: the candidate to call and the
/// (dialect-native) request body to send.
#[derive(Clone, Debug)]
pub struct UpstreamCall {
    pub candidate: Candidate,
    pub body: Value,
}

/// A complete non-streaming upstream response.
#[derive(Clone, Debug)]
pub struct UnaryResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value, Error>> + Send>>;

/// Boundary between the dispatcher and the network.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_unary(&self, call: &UpstreamCall) -> Result<UnaryResponse, Error>;

    /// Opens an SSE stream. The returned future resolves once the upstream
    /// has accepted the request; event bodies arrive on the stream.
    async fn call_streaming(&self, call: &UpstreamCall) -> Result<EventStream, Error>;
}

#[derive(Clone, Debug)]
pub struct RelayHttpClient {
    client: reqwest::Client,
}

impl RelayHttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.clone()).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid proxy URL: {e}"),
                })
            })?);
        }
        Ok(Self {
            client: builder.build().map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to build HTTP client: {e}"),
                })
            })?,
        })
    }

    fn build_request(
        &self,
        call: &UpstreamCall,
        streaming: bool,
    ) -> Result<reqwest::RequestBuilder, Error> {
        let candidate = &call.candidate;
        let url = request_url(candidate, streaming)?;
        let body = prepare_body(call, streaming);

        let mut request = self.client.post(url);
        request = match candidate.dialect {
            ApiDialect::Anthropic => request
                .header("x-api-key", candidate.secret.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
            ApiDialect::OpenAi => request.bearer_auth(candidate.secret.expose_secret()),
            ApiDialect::Gemini => {
                request.header("x-goog-api-key", candidate.secret.expose_secret())
            }
        };
        Ok(request.json(&body))
    }
}

/// The dialect-specific path for this call, joined onto the endpoint's base
/// URL. Gemini carries the model name in the path and streams via `alt=sse`.
fn request_url(candidate: &Candidate, streaming: bool) -> Result<Url, Error> {
    let mut url = candidate.base_url.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|()| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Endpoint `{}` base URL cannot be a base",
                    candidate.endpoint_id
                ),
            })
        })?;
        segments.pop_if_empty();
        match candidate.dialect {
            ApiDialect::Anthropic => {
                segments.extend(["v1", "messages"]);
            }
            ApiDialect::OpenAi => {
                segments.extend(["v1", "chat", "completions"]);
            }
            ApiDialect::Gemini => {
                let method = if streaming {
                    "streamGenerateContent"
                } else {
                    "generateContent"
                };
                let model_segment = format!("{}:{method}", candidate.mapped_model);
                segments.extend(["v1beta", "models", model_segment.as_str()]);
            }
        }
    }
    if streaming && candidate.dialect == ApiDialect::Gemini {
        url.query_pairs_mut().append_pair("alt", "sse");
    }
    Ok(url)
}

/// Rewrites the client body for the target candidate: the mapped model name
/// lands in the body (except Gemini, where it rides in the path) and the
/// stream flags match how we are actually calling.
fn prepare_body(call: &UpstreamCall, streaming: bool) -> Value {
    let mut body = call.body.clone();
    match call.candidate.dialect {
        ApiDialect::Anthropic => {
            body["model"] = Value::from(call.candidate.mapped_model.clone());
            body["stream"] = Value::from(streaming);
        }
        ApiDialect::OpenAi => {
            body["model"] = Value::from(call.candidate.mapped_model.clone());
            body["stream"] = Value::from(streaming);
            if streaming {
                // Without this the final chunk omits token usage.
                body["stream_options"] = serde_json::json!({"include_usage": true});
            }
        }
        ApiDialect::Gemini => {
            if let Some(map) = body.as_object_mut() {
                map.remove("model");
                map.remove("stream");
            }
        }
    }
    body
}

fn transport_error(provider_name: &str, e: &reqwest::Error) -> Error {
    Error::new(ErrorDetails::InferenceClient {
        status_code: e.status(),
        message: e.to_string(),
        provider_name: provider_name.to_string(),
        raw_response: None,
    })
}

#[async_trait]
impl ModelClient for RelayHttpClient {
    async fn call_unary(&self, call: &UpstreamCall) -> Result<UnaryResponse, Error> {
        let provider_name = call.candidate.provider_name.clone();
        let response = self
            .build_request(call, false)?
            .send()
            .await
            .map_err(|e| transport_error(&provider_name, &e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&provider_name, &e))?;

        if status.is_client_error() || status.is_server_error() {
            return Err(Error::new(ErrorDetails::InferenceClient {
                status_code: Some(status),
                message: format!("Upstream returned {status}"),
                provider_name,
                raw_response: Some(text),
            }));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            Error::new(ErrorDetails::InferenceClient {
                status_code: Some(status),
                message: format!("Upstream returned malformed JSON: {e}"),
                provider_name,
                raw_response: Some(text),
            })
        })?;

        Ok(UnaryResponse {
            status,
            headers,
            body,
        })
    }

    async fn call_streaming(&self, call: &UpstreamCall) -> Result<EventStream, Error> {
        let provider_name = call.candidate.provider_name.clone();
        let mut event_source = self
            .build_request(call, true)?
            .eventsource()
            .map_err(|e| {
                Error::new(ErrorDetails::InferenceClient {
                    status_code: None,
                    message: format!("Failed to open event source: {e}"),
                    provider_name: provider_name.clone(),
                    raw_response: None,
                })
            })?;

        // reqwest-eventsource reconnects on its own; the dispatcher owns
        // failover, so the stream ends at the first fault instead.
        let stream = async_stream::stream! {
            while let Some(item) = event_source.next().await {
                match item {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) => {
                        if message.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<Value>(&message.data) {
                            Ok(value) => yield Ok(value),
                            Err(e) => {
                                yield Err(Error::new(ErrorDetails::StreamError {
                                    provider_name: provider_name.clone(),
                                    message: format!("Malformed event payload: {e}"),
                                }));
                                break;
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let raw_response = response.text().await.ok();
                        yield Err(Error::new(ErrorDetails::InferenceClient {
                            status_code: Some(status),
                            message: format!("Upstream returned {status}"),
                            provider_name: provider_name.clone(),
                            raw_response,
                        }));
                        break;
                    }
                    Err(other) => {
                        yield Err(Error::new(ErrorDetails::StreamError {
                            provider_name: provider_name.clone(),
                            message: other.to_string(),
                        }));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn candidate(dialect: ApiDialect, base_url: &str) -> Candidate {
        Candidate {
            provider_id: "p1".to_string(),
            provider_name: "acme".to_string(),
            dialect,
            endpoint_id: "ep-1".to_string(),
            base_url: base_url.parse().unwrap(),
            endpoint_max_concurrent: None,
            key_id: "key-1".to_string(),
            secret: SecretString::from("sk-test"),
            key_max_concurrent: None,
            mapped_model: "model-x".to_string(),
        }
    }

    #[test]
    fn test_request_url_per_dialect() {
        let url = request_url(&candidate(ApiDialect::Anthropic, "https://api.acme.com"), false)
            .unwrap();
        assert_eq!(url.as_str(), "https://api.acme.com/v1/messages");

        // A base URL with a path prefix keeps the prefix.
        let url = request_url(
            &candidate(ApiDialect::OpenAi, "https://api.acme.com/proxy/"),
            true,
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.acme.com/proxy/v1/chat/completions");

        let url =
            request_url(&candidate(ApiDialect::Gemini, "https://gen.acme.com"), true).unwrap();
        assert_eq!(
            url.as_str(),
            "https://gen.acme.com/v1beta/models/model-x:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_prepare_body_rewrites_model_and_stream_flags() {
        let call = UpstreamCall {
            candidate: candidate(ApiDialect::OpenAi, "https://api.acme.com"),
            body: serde_json::json!({"model": "requested", "messages": []}),
        };
        let body = prepare_body(&call, true);
        assert_eq!(body["model"], "model-x");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let body = prepare_body(&call, false);
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());

        let call = UpstreamCall {
            candidate: candidate(ApiDialect::Gemini, "https://gen.acme.com"),
            body: serde_json::json!({"model": "requested", "contents": [], "stream": true}),
        };
        let body = prepare_body(&call, true);
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert!(body.get("contents").is_some());
    }

    #[tokio::test]
    async fn test_unary_maps_upstream_failure_to_inference_client_error() {
        use axum::routing::post;

        let app = axum::Router::new().route(
            "/v1/messages",
            post(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    r#"{"error": "overloaded"}"#,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = RelayHttpClient::new(&HttpClientConfig::default()).unwrap();
        let call = UpstreamCall {
            candidate: candidate(ApiDialect::Anthropic, &format!("http://{addr}")),
            body: serde_json::json!({"messages": []}),
        };
        let err = client.call_unary(&call).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unary_success_returns_parsed_body_and_headers() {
        use axum::routing::post;

        let app = axum::Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    [("x-request-id", "req-123")],
                    axum::Json(serde_json::json!({"choices": []})),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = RelayHttpClient::new(&HttpClientConfig::default()).unwrap();
        let call = UpstreamCall {
            candidate: candidate(ApiDialect::OpenAi, &format!("http://{addr}")),
            body: serde_json::json!({"messages": []}),
        };
        let response = client.call_unary(&call).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, serde_json::json!({"choices": []}));
        assert_eq!(
            response.headers.get("x-request-id").map(|v| v.as_bytes()),
            Some(&b"req-123"[..])
        );
    }
}
