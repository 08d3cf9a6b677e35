//! Fixed-window request quotas per client IP and action.
//!
//! Each sensitive action (login, registration, verification) carries a
//! statically configured (window, max requests) pair. Buckets live behind a
//! single mutex so the increment-and-check is atomic: two concurrent
//! requests can never both observe `count == max - 1` and both be admitted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, ErrorDetails};

/// Client-facing actions subject to per-IP quotas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    Login,
    Register,
    VerifySend,
    VerifyCheck,
}

impl RateLimitAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitAction::Login => "login",
            RateLimitAction::Register => "register",
            RateLimitAction::VerifySend => "verify_send",
            RateLimitAction::VerifyCheck => "verify_check",
        }
    }
}

impl FromStr for RateLimitAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(RateLimitAction::Login),
            "register" => Ok(RateLimitAction::Register),
            "verify_send" => Ok(RateLimitAction::VerifySend),
            "verify_check" => Ok(RateLimitAction::VerifyCheck),
            _ => Err(Error::new(ErrorDetails::UnknownRateLimitAction {
                action: s.to_string(),
            })),
        }
    }
}

/// Quota for one action: `max_requests` per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl ActionLimit {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_seconds),
        }
    }
}

/// The defaults observed in production for each action.
pub fn default_action_limits() -> HashMap<RateLimitAction, ActionLimit> {
    HashMap::from([
        (RateLimitAction::Login, ActionLimit::new(5, 60)),
        (RateLimitAction::Register, ActionLimit::new(3, 60)),
        (RateLimitAction::VerifySend, ActionLimit::new(3, 60)),
        (RateLimitAction::VerifyCheck, ActionLimit::new(10, 60)),
    ])
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_ends: Instant,
}

/// Outcome of one rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_after_seconds: u64,
}

/// Fixed-window limiter keyed by (client IP, action).
#[derive(Debug)]
pub struct IpRateLimiter {
    limits: HashMap<RateLimitAction, ActionLimit>,
    buckets: Mutex<HashMap<(IpAddr, RateLimitAction), Bucket>>,
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new(default_action_limits())
    }
}

impl IpRateLimiter {
    pub fn new(limits: HashMap<RateLimitAction, ActionLimit>) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically counts this request against the client's window and
    /// reports whether it is admitted, how many requests remain, and (when
    /// denied) how long until the window resets.
    pub fn check(&self, client_ip: IpAddr, action: RateLimitAction) -> RateLimitDecision {
        let Some(limit) = self.limits.get(&action).copied() else {
            // No configured quota for this action means no limit.
            return RateLimitDecision {
                allowed: true,
                remaining: u32::MAX,
                reset_after_seconds: 0,
            };
        };

        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry((client_ip, action))
            .or_insert_with(|| Bucket {
                count: 0,
                window_ends: now + limit.window,
            });

        if bucket.window_ends <= now {
            // Window expired: start a fresh one with this request counted.
            bucket.count = 1;
            bucket.window_ends = now + limit.window;
            return RateLimitDecision {
                allowed: true,
                remaining: limit.max_requests.saturating_sub(1),
                reset_after_seconds: limit.window.as_secs(),
            };
        }

        let reset_after_seconds = bucket.window_ends.duration_since(now).as_secs().max(1);
        if bucket.count < limit.max_requests {
            bucket.count += 1;
            RateLimitDecision {
                allowed: true,
                remaining: limit.max_requests - bucket.count,
                reset_after_seconds,
            }
        } else {
            tracing::debug!(
                "Rate limit hit for {client_ip} on `{}`; resets in {reset_after_seconds}s",
                action.as_str()
            );
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after_seconds,
            }
        }
    }

    /// Like [`check`](Self::check), but maps a denial into the error
    /// taxonomy for handlers that reject directly.
    pub fn enforce(
        &self,
        client_ip: IpAddr,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, Error> {
        let decision = self.check(client_ip, action);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(Error::new(ErrorDetails::RateLimitExceeded {
                action: action.as_str().to_string(),
                retry_after_seconds: decision.reset_after_seconds,
            }))
        }
    }

    /// Drops buckets whose window has ended, bounding table growth.
    pub fn prune_expired(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.retain(|_, bucket| bucket.window_ends > now);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
