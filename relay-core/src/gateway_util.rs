//! Shared state for the axum gateway.

use std::sync::Arc;

use axum::extract::State;

use crate::candidates::{ProviderDirectory, StaticDirectory};
use crate::concurrency::ConcurrencyTracker;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::http::RelayHttpClient;
use crate::rate_limiting::IpRateLimiter;
use crate::usage::{TracingUsageSink, UsageSink};

#[derive(Clone)]
pub struct AppStateData {
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: ConcurrencyTracker,
    pub directory: Arc<dyn ProviderDirectory>,
    pub rate_limiter: Arc<IpRateLimiter>,
}

pub type AppState = State<AppStateData>;

impl AppStateData {
    /// Builds the full collaborator graph from a loaded config. Everything
    /// is constructed and injected here; nothing is global.
    pub fn new(config: Config) -> Result<Self, Error> {
        let options = config.dispatch_options();
        let client = Arc::new(RelayHttpClient::new(&config.http_client_config())?);
        let rate_limiter = Arc::new(IpRateLimiter::new(config.action_limits()));
        let tracker = ConcurrencyTracker::new();
        let directory: Arc<dyn ProviderDirectory> =
            Arc::new(StaticDirectory::new(config.providers));
        let sink: Arc<dyn UsageSink> = Arc::new(TracingUsageSink);
        let dispatcher = Arc::new(Dispatcher::new(
            directory.clone(),
            tracker.clone(),
            client,
            sink,
            options,
        ));
        Ok(Self {
            dispatcher,
            tracker,
            directory,
            rate_limiter,
        })
    }
}
