//! The dispatch loop: admission, upstream attempt, and failover.
//!
//! One client request walks the ordered candidate list. Each attempt first
//! reserves concurrency slots for its endpoint and key; a denied admission
//! skips the candidate without consuming retry budget. An upstream attempt
//! that fails retryably advances to the next candidate until the budget is
//! spent; a terminal failure (4xx other than 408/429) stops the loop
//! immediately. Exactly one usage record is written per request, for the
//! attempt that decided the outcome.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::time::timeout;
use uuid::Uuid;

use crate::attempt::AttemptContext;
use crate::candidates::{ApiDialect, Candidate, ProviderDirectory};
use crate::concurrency::{AdmissionPermit, ConcurrencyTracker, EntityLimit};
use crate::error::{Error, ErrorDetails};
use crate::events::parse_event;
use crate::http::{EventStream, ModelClient, UnaryResponse, UpstreamCall};
use crate::usage::{reconcile, UsageSink};

/// Synthesized status for a client that went away mid-stream.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Clone, Copy, Debug)]
pub struct DispatchOptions {
    /// Upstream attempts per request. Admission denials do not count.
    pub max_attempts: usize,
    /// Per-attempt ceiling: full response time for unary calls, time to the
    /// first stream event for streaming calls.
    pub attempt_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

/// One inbound request, already authenticated and parsed.
#[derive(Clone, Debug)]
pub struct ClientRequest {
    pub request_id: Uuid,
    pub model: String,
    pub dialect: ApiDialect,
    pub body: Value,
}

pub struct Dispatcher {
    directory: Arc<dyn ProviderDirectory>,
    tracker: ConcurrencyTracker,
    client: Arc<dyn ModelClient>,
    sink: Arc<dyn UsageSink>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn ProviderDirectory>,
        tracker: ConcurrencyTracker,
        client: Arc<dyn ModelClient>,
        sink: Arc<dyn UsageSink>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            directory,
            tracker,
            client,
            sink,
            options,
        }
    }

    pub fn tracker(&self) -> &ConcurrencyTracker {
        &self.tracker
    }

    fn acquire_slots(&self, candidate: &Candidate) -> Result<AdmissionPermit, Error> {
        self.tracker.acquire(
            Some(EntityLimit::new(
                &candidate.endpoint_id,
                candidate.endpoint_max_concurrent,
            )),
            Some(EntityLimit::new(
                &candidate.key_id,
                candidate.key_max_concurrent,
            )),
        )
    }

    async fn write_record(&self, attempt: &AttemptContext, request: &ClientRequest, started: tokio::time::Instant, stream: bool) {
        let latency_ms = started.elapsed().as_millis() as u64;
        attempt.log_summary(request.request_id, latency_ms);
        let record = reconcile(attempt, request.request_id, latency_ms, stream);
        // Sink failures are logged at construction and never fail the request.
        self.sink.record_usage(record).await.ok();
    }

    /// Serves a non-streaming request, failing over across candidates.
    #[tracing::instrument(skip_all, fields(request_id = %request.request_id, model = %request.model, stream = false))]
    pub async fn dispatch(&self, request: ClientRequest) -> Result<UnaryResponse, Error> {
        let started = tokio::time::Instant::now();
        let candidates = self.directory.candidates_for_model(&request.model);
        let mut attempt = AttemptContext::new(request.model.clone(), request.dialect);

        if candidates.is_empty() {
            let error = no_eligible_provider(&request.model);
            attempt.mark_failed(error.status_code(), error.to_string());
            self.write_record(&attempt, &request, started, false).await;
            return Err(error);
        }

        let mut provider_errors = IndexMap::new();
        let mut attempts_used = 0;

        for candidate in &candidates {
            if attempts_used >= self.options.max_attempts {
                break;
            }
            let permit = match self.acquire_slots(candidate) {
                Ok(permit) => permit,
                Err(error) => {
                    // Saturated candidate: skip without burning budget.
                    provider_errors.insert(candidate_label(candidate), error);
                    continue;
                }
            };
            attempts_used += 1;
            if attempt.provider_name.is_some() {
                attempt.reset_for_retry();
            }
            attempt.bind_candidate(candidate);
            attempt.request_body = Some(request.body.clone());

            let call = UpstreamCall {
                candidate: candidate.clone(),
                body: request.body.clone(),
            };
            let outcome = match timeout(self.options.attempt_timeout, self.client.call_unary(&call))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::new(ErrorDetails::InferenceTimeout {
                    provider_name: candidate.provider_name.clone(),
                    timeout: self.options.attempt_timeout,
                    streaming: false,
                })),
            };
            drop(permit);

            match outcome {
                Ok(response) => {
                    attempt.status_code = response.status;
                    attempt.response_headers = response.headers.clone();
                    attempt.update_usage(crate::events::usage_from_response(
                        candidate.dialect,
                        &response.body,
                    ));
                    attempt.collected_text =
                        crate::events::text_from_response(candidate.dialect, &response.body);
                    attempt.has_completion = true;
                    self.write_record(&attempt, &request, started, false).await;
                    return Ok(response);
                }
                Err(error) => {
                    attempt.mark_failed(
                        failure_status(&error),
                        error.to_string(),
                    );
                    let terminal = !error.is_retryable();
                    provider_errors.insert(candidate_label(candidate), error.clone());
                    if terminal {
                        self.write_record(&attempt, &request, started, false).await;
                        return Err(error);
                    }
                }
            }
        }

        let error = if attempts_used == 0 {
            // Every candidate was over its concurrency ceiling.
            no_eligible_provider(&request.model)
        } else {
            Error::new(ErrorDetails::ProvidersExhausted { provider_errors })
        };
        attempt.mark_failed(
            failure_status(&error),
            error.to_string(),
        );
        self.write_record(&attempt, &request, started, false).await;
        Err(error)
    }

    /// Serves a streaming request. Failover is only possible until the first
    /// upstream event: once a candidate has produced one, the response is
    /// committed to it and any later fault ends the stream. The returned
    /// stream owns the admission permit and writes the usage record when it
    /// is dropped, whether it ran to completion or the client went away.
    #[tracing::instrument(skip_all, fields(request_id = %request.request_id, model = %request.model, stream = true))]
    pub async fn dispatch_stream(&self, request: ClientRequest) -> Result<EventStream, Error> {
        let started = tokio::time::Instant::now();
        let candidates = self.directory.candidates_for_model(&request.model);
        let mut attempt = AttemptContext::new(request.model.clone(), request.dialect);

        if candidates.is_empty() {
            let error = no_eligible_provider(&request.model);
            attempt.mark_failed(error.status_code(), error.to_string());
            self.write_record(&attempt, &request, started, true).await;
            return Err(error);
        }

        let mut provider_errors = IndexMap::new();
        let mut attempts_used = 0;

        for candidate in &candidates {
            if attempts_used >= self.options.max_attempts {
                break;
            }
            let permit = match self.acquire_slots(candidate) {
                Ok(permit) => permit,
                Err(error) => {
                    provider_errors.insert(candidate_label(candidate), error);
                    continue;
                }
            };
            attempts_used += 1;
            if attempt.provider_name.is_some() {
                attempt.reset_for_retry();
            }
            attempt.bind_candidate(candidate);
            attempt.request_body = Some(request.body.clone());

            let call = UpstreamCall {
                candidate: candidate.clone(),
                body: request.body.clone(),
            };
            let first = match self.open_stream(&call, candidate).await {
                Ok(opened) => opened,
                Err(error) => {
                    drop(permit);
                    attempt.mark_failed(
                        failure_status(&error),
                        error.to_string(),
                    );
                    let terminal = !error.is_retryable();
                    provider_errors.insert(candidate_label(candidate), error.clone());
                    if terminal {
                        self.write_record(&attempt, &request, started, true).await;
                        return Err(error);
                    }
                    continue;
                }
            };

            // First event in hand: commit to this candidate.
            let (first_event, rest) = first;
            let finalizer = StreamFinalizer {
                attempt: std::mem::replace(
                    &mut attempt,
                    AttemptContext::new(String::new(), request.dialect),
                ),
                request_id: request.request_id,
                started,
                sink: self.sink.clone(),
                _permit: permit,
                finished: false,
            };
            return Ok(committed_stream(first_event, rest, finalizer));
        }

        let error = if attempts_used == 0 {
            no_eligible_provider(&request.model)
        } else {
            Error::new(ErrorDetails::ProvidersExhausted { provider_errors })
        };
        attempt.mark_failed(
            failure_status(&error),
            error.to_string(),
        );
        self.write_record(&attempt, &request, started, true).await;
        Err(error)
    }

    /// Opens the upstream stream and waits for its first event, both under
    /// the attempt timeout. Any fault before the first event is reported as
    /// an attempt failure so the caller can fail over.
    async fn open_stream(
        &self,
        call: &UpstreamCall,
        candidate: &Candidate,
    ) -> Result<(Value, EventStream), Error> {
        use futures::StreamExt;

        let first_event = timeout(self.options.attempt_timeout, async {
            let mut stream = self.client.call_streaming(call).await?;
            match stream.next().await {
                Some(Ok(event)) => Ok((event, stream)),
                Some(Err(error)) => Err(error),
                None => Err(Error::new(ErrorDetails::StreamError {
                    provider_name: candidate.provider_name.clone(),
                    message: "stream ended before the first event".to_string(),
                })),
            }
        })
        .await;

        match first_event {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::InferenceTimeout {
                provider_name: candidate.provider_name.clone(),
                timeout: self.options.attempt_timeout,
                streaming: true,
            })),
        }
    }
}

fn no_eligible_provider(model: &str) -> Error {
    Error::new(ErrorDetails::NoEligibleProvider {
        model: model.to_string(),
    })
}

/// The status to account a failed attempt under: the upstream's own status
/// when one exists, otherwise the status the error maps to.
fn failure_status(error: &Error) -> http::StatusCode {
    error
        .underlying_status_code()
        .unwrap_or_else(|| error.status_code())
}

fn candidate_label(candidate: &Candidate) -> String {
    format!(
        "{}/{}/{}",
        candidate.provider_name, candidate.endpoint_id, candidate.key_id
    )
}

/// Accompanies a committed stream to its end. Observes every event for
/// accounting, and on drop writes the usage record exactly once: with the
/// accumulated state if the stream finished, or with a synthesized
/// client-closed status if the consumer went away first. Holds the admission
/// permit so the slot is occupied for exactly the stream's lifetime.
struct StreamFinalizer {
    attempt: AttemptContext,
    request_id: Uuid,
    started: tokio::time::Instant,
    sink: Arc<dyn UsageSink>,
    _permit: AdmissionPermit,
    finished: bool,
}

impl StreamFinalizer {
    fn observe(&mut self, event: &Value) {
        self.attempt.event_count += 1;
        self.attempt.parsed_events.push(event.clone());
        let parsed = parse_event(
            self.attempt.provider_dialect.unwrap_or(self.attempt.dialect),
            event,
        );
        if parsed.has_data() {
            self.attempt.data_count += 1;
        }
        if let Some(text) = &parsed.text {
            self.attempt.collected_text.push_str(text);
        }
        self.attempt.update_usage(parsed.usage);
        if parsed.is_completion {
            self.attempt.has_completion = true;
        }
    }

    fn fail(&mut self, error: &Error) {
        self.attempt.mark_failed(failure_status(error), error.to_string());
    }

    fn finish(&mut self) {
        self.finished = true;
        self.write_record();
    }

    fn write_record(&mut self) {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        self.attempt.log_summary(self.request_id, latency_ms);
        let record = reconcile(&self.attempt, self.request_id, latency_ms, true);
        let sink = self.sink.clone();
        // Drop may fire outside a runtime during shutdown; the record is
        // then lost to the sink but still logged above.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                sink.record_usage(record).await.ok();
            });
        }
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        if !self.finished {
            self.attempt.mark_failed(
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "client disconnected before the stream completed",
            );
            self.write_record();
        }
    }
}

/// The client-facing stream for a committed candidate: replays the first
/// event, then forwards the rest, feeding the finalizer along the way. Ends
/// at the first upstream fault (no failover after commit).
fn committed_stream(
    first_event: Value,
    rest: EventStream,
    mut finalizer: StreamFinalizer,
) -> EventStream {
    use futures::StreamExt;

    Box::pin(async_stream::stream! {
        finalizer.observe(&first_event);
        yield Ok(first_event);
        let mut rest = rest;
        while let Some(item) = rest.next().await {
            match item {
                Ok(event) => {
                    finalizer.observe(&event);
                    yield Ok(event);
                }
                Err(error) => {
                    finalizer.fail(&error);
                    yield Err(error);
                    break;
                }
            }
        }
        finalizer.finish();
    })
}
