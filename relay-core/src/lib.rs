//! Core engine for the relay gateway: admission control, candidate
//! selection, failover dispatch, and usage accounting, plus the axum
//! endpoint handlers the gateway binary wires up.

pub mod attempt;
pub mod candidates;
pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod gateway_util;
pub mod http;
pub mod observability;
pub mod rate_limiting;
pub mod usage;

pub use candidates::{ApiDialect, Candidate, ProviderDirectory, StaticDirectory};
pub use concurrency::{AdmissionPermit, ConcurrencyTracker, EntityLimit};
pub use config::Config;
pub use dispatch::{ClientRequest, Dispatcher, DispatchOptions};
pub use error::{Error, ErrorDetails};
pub use usage::{Usage, UsageRecord, UsageSink};
