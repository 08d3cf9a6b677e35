//! Inference routes: one per client dialect, all funneled into the
//! dispatcher. The gateway does not translate between dialects; it tags the
//! request with the dialect it arrived in and forwards the JSON body to a
//! candidate speaking the same dialect.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::candidates::ApiDialect;
use crate::dispatch::ClientRequest;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};

/// `POST /v1/messages` (Claude-style).
pub async fn messages_handler(
    State(state): AppState,
    Json(body): Json<Value>,
) -> Result<Response, Error> {
    let model = required_model(&body)?;
    let stream = body["stream"].as_bool().unwrap_or(false);
    serve(state, ApiDialect::Anthropic, model, stream, body).await
}

/// `POST /v1/chat/completions` (OpenAI-style).
pub async fn chat_completions_handler(
    State(state): AppState,
    Json(body): Json<Value>,
) -> Result<Response, Error> {
    let model = required_model(&body)?;
    let stream = body["stream"].as_bool().unwrap_or(false);
    serve(state, ApiDialect::OpenAi, model, stream, body).await
}

/// `POST /v1beta/models/{model}:generateContent` and
/// `:streamGenerateContent` (Gemini-style). The model and the method ride in
/// one path segment separated by a colon.
pub async fn generate_content_handler(
    State(state): AppState,
    Path(model_and_method): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, Error> {
    let (model, method) = model_and_method.split_once(':').ok_or_else(|| {
        Error::new(ErrorDetails::InvalidRequest {
            message: format!("Expected `model:method` in path, got `{model_and_method}`"),
        })
    })?;
    let stream = match method {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("Unknown method `{other}`"),
            }));
        }
    };
    serve(state, ApiDialect::Gemini, model.to_string(), stream, body).await
}

fn required_model(body: &Value) -> Result<String, Error> {
    body["model"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "Missing or non-string `model` field".to_string(),
            })
        })
}

async fn serve(
    state: AppStateData,
    dialect: ApiDialect,
    model: String,
    stream: bool,
    body: Value,
) -> Result<Response, Error> {
    let request = ClientRequest {
        request_id: Uuid::now_v7(),
        model,
        dialect,
        body,
    };
    if stream {
        let events = state.dispatcher.dispatch_stream(request).await?;
        let sse = events.map(|item| {
            Ok::<Event, Infallible>(match item {
                Ok(value) => {
                    // Claude-style streams name their events; pass the name
                    // through so clients see the upstream framing.
                    let event = Event::default().data(value.to_string());
                    match value["type"].as_str() {
                        Some(name) => event.event(name),
                        None => event,
                    }
                }
                Err(error) => Event::default()
                    .event("error")
                    .data(serde_json::json!({"error": error.to_string()}).to_string()),
            })
        });
        Ok(Sse::new(sse).keep_alive(KeepAlive::default()).into_response())
    } else {
        let response = state.dispatcher.dispatch(request).await?;
        Ok((response.status, Json(response.body)).into_response())
    }
}
