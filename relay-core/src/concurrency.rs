//! Concurrency admission control for upstream endpoints and keys.
//!
//! Every upstream attempt reserves a slot against the target endpoint's and
//! key's configured ceilings before the call starts, and returns it when the
//! call ends. Both ceilings are checked inside a single critical section
//! before either counter is incremented, so a denied admission never leaves
//! a partial increment behind, and two racing `acquire` calls can never both
//! claim the last slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::error::{Error, ErrorDetails, SaturatedEntity};

/// An entity (endpoint or key) participating in an admission check.
/// A ceiling of `None` or `Some(0)` means unlimited.
#[derive(Clone, Copy, Debug)]
pub struct EntityLimit<'a> {
    pub id: &'a str,
    pub max_concurrent: Option<u64>,
}

impl<'a> EntityLimit<'a> {
    pub fn new(id: &'a str, max_concurrent: Option<u64>) -> Self {
        Self {
            id,
            max_concurrent,
        }
    }

    fn ceiling(self) -> Option<u64> {
        match self.max_concurrent {
            Some(0) | None => None,
            Some(n) => Some(n),
        }
    }
}

#[derive(Debug, Default)]
struct CounterTables {
    endpoints: HashMap<String, u64>,
    keys: HashMap<String, u64>,
}

/// Point-in-time view of the live counters for one endpoint/key pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConcurrencySnapshot {
    pub endpoint_count: u64,
    pub key_count: u64,
}

/// Tracks in-flight upstream requests per endpoint id and per key id.
///
/// Explicitly constructed and injected into the dispatcher; cheap to clone
/// (all clones share the same counters).
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyTracker {
    inner: Arc<Mutex<CounterTables>>,
}

impl ConcurrencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks both ceilings and, if both pass, increments both
    /// counters. On denial nothing is mutated and the error names the
    /// saturated entity.
    pub fn acquire(
        &self,
        endpoint: Option<EntityLimit<'_>>,
        key: Option<EntityLimit<'_>>,
    ) -> Result<AdmissionPermit, Error> {
        let mut tables = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(endpoint) = &endpoint {
            if let Some(limit) = endpoint.ceiling() {
                let current = tables.endpoints.get(endpoint.id).copied().unwrap_or(0);
                if current >= limit {
                    return Err(Error::new(ErrorDetails::AdmissionDenied {
                        entity: SaturatedEntity::Endpoint,
                        id: endpoint.id.to_string(),
                        current,
                        limit,
                    }));
                }
            }
        }
        if let Some(key) = &key {
            if let Some(limit) = key.ceiling() {
                let current = tables.keys.get(key.id).copied().unwrap_or(0);
                if current >= limit {
                    return Err(Error::new(ErrorDetails::AdmissionDenied {
                        entity: SaturatedEntity::Key,
                        id: key.id.to_string(),
                        current,
                        limit,
                    }));
                }
            }
        }

        // Both checks passed; commit both increments under the same lock.
        if let Some(endpoint) = &endpoint {
            *tables.endpoints.entry(endpoint.id.to_string()).or_insert(0) += 1;
        }
        if let Some(key) = &key {
            *tables.keys.entry(key.id.to_string()).or_insert(0) += 1;
        }
        drop(tables);

        Ok(AdmissionPermit {
            tracker: self.clone(),
            endpoint_id: endpoint.map(|e| e.id.to_string()),
            key_id: key.map(|k| k.id.to_string()),
        })
    }

    /// Best-effort read of the live counters. May be briefly stale under
    /// concurrent mutation; for observability only, never for admission.
    pub fn current(&self, endpoint_id: Option<&str>, key_id: Option<&str>) -> ConcurrencySnapshot {
        let tables = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        ConcurrencySnapshot {
            endpoint_count: endpoint_id
                .and_then(|id| tables.endpoints.get(id).copied())
                .unwrap_or(0),
            key_count: key_id
                .and_then(|id| tables.keys.get(id).copied())
                .unwrap_or(0),
        }
    }

    /// Forcibly zeroes the named counters. Administrative repair for drift
    /// after abnormal termination; never called on the request path.
    pub fn reset(&self, endpoint_id: Option<&str>, key_id: Option<&str>) {
        let mut tables = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = endpoint_id {
            tables.endpoints.remove(id);
            tracing::info!("Reset concurrency counter for endpoint `{id}`");
        }
        if let Some(id) = key_id {
            tables.keys.remove(id);
            tracing::info!("Reset concurrency counter for key `{id}`");
        }
    }

    /// Decrements the named counters, clamped at zero. Entries that reach
    /// zero are removed to keep the tables bounded by live traffic.
    fn release(&self, endpoint_id: Option<&str>, key_id: Option<&str>) {
        let mut tables = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = endpoint_id {
            decrement_clamped(&mut tables.endpoints, id);
        }
        if let Some(id) = key_id {
            decrement_clamped(&mut tables.keys, id);
        }
    }
}

fn decrement_clamped(table: &mut HashMap<String, u64>, id: &str) {
    match table.get_mut(id) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            table.remove(id);
        }
        None => {
            // Release after a reset (or a double release). Clamp at zero.
            tracing::warn!("Release for `{id}` with no live counter; clamping at zero");
        }
    }
}

/// Proof of admission for one upstream attempt. Returns both slots exactly
/// once when dropped, on every exit path of the call between acquire and
/// release (success, upstream error, timeout, cancellation).
#[derive(Debug)]
#[must_use]
pub struct AdmissionPermit {
    tracker: ConcurrencyTracker,
    endpoint_id: Option<String>,
    key_id: Option<String>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.tracker
            .release(self.endpoint_id.as_deref(), self.key_id.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::task::JoinSet;

    fn endpoint(id: &str, max: Option<u64>) -> Option<EntityLimit<'_>> {
        Some(EntityLimit::new(id, max))
    }

    #[test]
    fn test_acquire_within_ceiling_and_release_on_drop() {
        let tracker = ConcurrencyTracker::new();
        let permit = tracker
            .acquire(endpoint("ep-1", Some(2)), endpoint("key-1", Some(2)))
            .unwrap();
        assert_eq!(
            tracker.current(Some("ep-1"), Some("key-1")),
            ConcurrencySnapshot {
                endpoint_count: 1,
                key_count: 1,
            }
        );
        drop(permit);
        assert_eq!(
            tracker.current(Some("ep-1"), Some("key-1")),
            ConcurrencySnapshot::default()
        );
    }

    #[test]
    fn test_denial_names_saturated_entity_and_mutates_nothing() {
        let tracker = ConcurrencyTracker::new();
        let _held = tracker
            .acquire(endpoint("ep-1", Some(1)), endpoint("key-1", None))
            .unwrap();
        let denied = tracker
            .acquire(endpoint("ep-1", Some(1)), endpoint("key-2", Some(5)))
            .unwrap_err();
        assert!(denied.is_admission_denied());
        // The key counter must not have been touched by the denied acquire.
        assert_eq!(tracker.current(None, Some("key-2")).key_count, 0);
        assert_eq!(tracker.current(Some("ep-1"), None).endpoint_count, 1);
    }

    #[test]
    fn test_key_denial_does_not_leak_endpoint_increment() {
        let tracker = ConcurrencyTracker::new();
        let _held = tracker
            .acquire(endpoint("ep-1", None), endpoint("key-1", Some(1)))
            .unwrap();
        // Endpoint is unlimited but the key is saturated: the endpoint
        // counter must stay at 1 (no increment committed on denial).
        let denied = tracker
            .acquire(endpoint("ep-1", None), endpoint("key-1", Some(1)))
            .unwrap_err();
        assert!(denied.is_admission_denied());
        assert_eq!(tracker.current(Some("ep-1"), None).endpoint_count, 1);
    }

    #[test]
    fn test_zero_ceiling_means_unlimited() {
        let tracker = ConcurrencyTracker::new();
        let permits: Vec<_> = (0..32)
            .map(|_| {
                tracker
                    .acquire(endpoint("ep-1", Some(0)), endpoint("key-1", None))
                    .unwrap()
            })
            .collect();
        assert_eq!(tracker.current(Some("ep-1"), None).endpoint_count, 32);
        drop(permits);
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let tracker = ConcurrencyTracker::new();
        let permit = tracker.acquire(endpoint("ep-1", Some(4)), None).unwrap();
        // Administrative reset while a permit is outstanding, then the
        // permit's release fires; the counter must not underflow.
        tracker.reset(Some("ep-1"), None);
        drop(permit);
        assert_eq!(tracker.current(Some("ep-1"), None).endpoint_count, 0);
        tracker.release(Some("ep-1"), Some("key-never-acquired"));
        assert_eq!(
            tracker.current(Some("ep-1"), Some("key-never-acquired")),
            ConcurrencySnapshot::default()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_admission_exactness_under_contention() {
        // For a ceiling of N, N+1 concurrent acquires admit exactly N.
        const CEILING: u64 = 8;
        let tracker = ConcurrencyTracker::new();
        let admitted = Arc::new(AtomicU64::new(0));
        let denied = Arc::new(AtomicU64::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..=CEILING {
            let tracker = tracker.clone();
            let admitted = admitted.clone();
            let denied = denied.clone();
            tasks.spawn(async move {
                match tracker.acquire(
                    Some(EntityLimit::new("ep-1", Some(CEILING))),
                    Some(EntityLimit::new("key-1", None)),
                ) {
                    Ok(permit) => {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        // Hold the slot until every task has raced.
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        drop(permit);
                    }
                    Err(e) => {
                        assert!(e.is_admission_denied());
                        denied.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
        tasks.join_all().await;

        assert_eq!(admitted.load(Ordering::SeqCst), CEILING);
        assert_eq!(denied.load(Ordering::SeqCst), 1);
        // All permits dropped: counters drained back to zero.
        assert_eq!(tracker.current(Some("ep-1"), None).endpoint_count, 0);
    }
}
