use std::sync::Arc;

use anyhow::{Context, Result};
use apollo_contracts::clock::Clock;
use apollo_contracts::episodes::paths::RATE_LIMITS;
use apollo_contracts::rate_limit::{
    admit_dual, admit_single, Admission, DualAdmission, DualWindowRecord, WindowCounter,
    WindowLimit,
};
use apollo_contracts::stores::DocumentStore;
use serde_json::Value;

/// Admission control over counter documents in `rateLimits`. Every decision
/// is one store transaction, so concurrent callers on the same key never
/// admit past the threshold.
#[derive(Clone)]
pub struct RateLimiter {
    documents: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(documents: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { documents, clock }
    }

    /// `key` must already be a one-way hash of the caller identity.
    pub fn admit(&self, key: &str, limit: WindowLimit) -> Result<Admission> {
        let now = self.clock.now();
        let mut decision = None;
        self.documents
            .transact(RATE_LIMITS, key, &mut |current: Option<&Value>| {
                let record = current.and_then(|doc| serde_json::from_value::<WindowCounter>(doc.clone()).ok());
                let (admission, next) = admit_single(record, limit, now);
                decision = Some(admission);
                next.map(serde_json::to_value)
                    .transpose()
                    .context("rate limit record serialization failed")
            })
            .with_context(|| format!("rate limit transaction failed for {key}"))?;
        decision.context("rate limit transaction produced no decision")
    }

    pub fn admit_dual(
        &self,
        key: &str,
        minute: WindowLimit,
        day: WindowLimit,
    ) -> Result<DualAdmission> {
        let now = self.clock.now();
        let mut decision = None;
        self.documents
            .transact(RATE_LIMITS, key, &mut |current: Option<&Value>| {
                let record = current
                    .and_then(|doc| serde_json::from_value::<DualWindowRecord>(doc.clone()).ok());
                let (admission, next) = admit_dual(record, minute, day, now);
                decision = Some(admission);
                next.map(serde_json::to_value)
                    .transpose()
                    .context("rate limit record serialization failed")
            })
            .with_context(|| format!("rate limit transaction failed for {key}"))?;
        decision.context("rate limit transaction produced no decision")
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use apollo_contracts::clock::ManualClock;
    use apollo_contracts::rate_limit::LimitWindow;
    use apollo_contracts::stores::MemoryDocumentStore;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::*;

    fn limiter() -> (RateLimiter, Arc<ManualClock>, Arc<MemoryDocumentStore>) {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_750_000_000, 0).unwrap(),
        ));
        let documents = Arc::new(MemoryDocumentStore::new());
        (
            RateLimiter::new(documents.clone(), clock.clone()),
            clock,
            documents,
        )
    }

    #[test]
    fn single_window_boundary_and_reset() -> anyhow::Result<()> {
        let (limiter, clock, documents) = limiter();
        let limit = WindowLimit::per_minute(5);
        for _ in 0..5 {
            assert!(limiter.admit("k", limit)?.allowed);
            clock.advance(Duration::seconds(1));
        }
        let denied = limiter.admit("k", limit)?;
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds.unwrap_or(0) > 0);
        assert_eq!(
            documents.get(RATE_LIMITS, "k")?.map(|doc| doc["count"].clone()),
            Some(json!(5))
        );

        clock.advance(Duration::seconds(61));
        let after = limiter.admit("k", limit)?;
        assert!(after.allowed);
        assert_eq!(after.remaining, 4);
        Ok(())
    }

    #[test]
    fn concurrent_callers_never_double_admit() -> anyhow::Result<()> {
        let (limiter, _clock, _documents) = limiter();
        let limit = WindowLimit::per_minute(10);
        let admitted = thread::scope(|scope| {
            let handles = (0..32)
                .map(|_| {
                    let limiter = limiter.clone();
                    scope.spawn(move || limiter.admit("shared", limit).map(|a| a.allowed))
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .collect::<Result<Vec<_>>>()
        })?;
        assert_eq!(admitted.iter().filter(|allowed| **allowed).count(), 10);
        Ok(())
    }

    #[test]
    fn dual_window_minute_then_day() -> anyhow::Result<()> {
        let (limiter, clock, _documents) = limiter();
        let minute = WindowLimit::per_minute(3);
        let day = WindowLimit::per_day(30);
        for _ in 0..3 {
            assert!(limiter.admit_dual("anon", minute, day)?.allowed);
        }
        clock.advance(Duration::seconds(20));
        let fourth = limiter.admit_dual("anon", minute, day)?;
        assert!(!fourth.allowed);
        assert_eq!(fourth.error_type, Some(LimitWindow::Minute));
        assert_eq!(fourth.retry_after_seconds, Some(40));

        clock.advance(Duration::seconds(45));
        let fifth = limiter.admit_dual("anon", minute, day)?;
        assert!(fifth.allowed);
        assert_eq!(fifth.remaining_minute, 2);
        assert_eq!(fifth.remaining_day, 26);
        Ok(())
    }

    #[test]
    fn unreadable_record_starts_fresh() -> anyhow::Result<()> {
        let (limiter, _clock, documents) = limiter();
        documents.set(RATE_LIMITS, "odd", json!({"unexpected": true}))?;
        let admission = limiter.admit("odd", WindowLimit::per_minute(2))?;
        assert!(admission.allowed);
        assert_eq!(admission.remaining, 1);
        Ok(())
    }
}
