//! Bounded holding area for raw officer feedback
//!
//! Decouples submission (synchronous, low latency) from training (batched,
//! asynchronous). Records are keyed by `(case_id, prediction_id, officer_id)`;
//! a resubmission replaces the previous record.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use rlhf_core::{FeedbackId, FeedbackKey, FeedbackRecord};

use crate::config::FeedbackConfig;
use crate::reward::RewardSignal;

/// A retained record together with the reward it produced
#[derive(Debug, Clone)]
pub struct StoredFeedback {
    pub record: FeedbackRecord,
    pub reward: RewardSignal,
}

/// Result of a `submit` call
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub reward: RewardSignal,
    /// An earlier record with the same key was replaced
    pub replaced: bool,
    /// Key evicted to make room, if the store was full
    pub evicted: Option<FeedbackKey>,
}

/// Store counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackStoreStats {
    pub count: usize,
    pub capacity: usize,
    pub total_submitted: u64,
    pub total_replaced: u64,
    pub total_evicted: u64,
    pub total_expired: u64,
}

pub struct FeedbackStore {
    records: HashMap<FeedbackKey, StoredFeedback>,
    by_age: BTreeMap<(DateTime<Utc>, FeedbackId), FeedbackKey>,
    capacity: usize,
    staleness: Duration,
    stats: FeedbackStoreStats,
}

impl FeedbackStore {
    pub fn new(capacity: usize, staleness_days: i64) -> Self {
        Self {
            records: HashMap::with_capacity(capacity.min(1024)),
            by_age: BTreeMap::new(),
            capacity: capacity.max(1),
            staleness: Duration::days(staleness_days),
            stats: FeedbackStoreStats {
                capacity: capacity.max(1),
                ..FeedbackStoreStats::default()
            },
        }
    }

    pub fn from_config(config: &FeedbackConfig) -> Self {
        Self::new(config.feedback_buffer_size, config.feedback_staleness_days)
    }

    /// Upsert a record with its precomputed reward.
    ///
    /// A new key arriving at capacity first evicts the oldest record by
    /// `submitted_at`. Replacing an existing key never evicts.
    pub fn submit(&mut self, record: FeedbackRecord, reward: RewardSignal) -> SubmitOutcome {
        let key = record.key();
        let mut evicted = None;

        let replaced = match self.records.remove(&key) {
            Some(previous) => {
                self.by_age
                    .remove(&(previous.record.submitted_at, previous.record.id));
                self.stats.total_replaced += 1;
                true
            }
            None => {
                if self.records.len() >= self.capacity {
                    evicted = self.evict_oldest();
                }
                false
            }
        };

        self.by_age
            .insert((record.submitted_at, record.id), key.clone());
        self.records.insert(key, StoredFeedback { record, reward });
        self.stats.total_submitted += 1;

        SubmitOutcome {
            reward,
            replaced,
            evicted,
        }
    }

    fn evict_oldest(&mut self) -> Option<FeedbackKey> {
        let (_, key) = self.by_age.pop_first()?;
        self.records.remove(&key);
        self.stats.total_evicted += 1;
        debug!(key = %key, "Evicted oldest feedback record at capacity");
        Some(key)
    }

    /// Remove every record older than the staleness window. Returns how many were removed.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;

        while let Some((_, key)) = self.by_age.first_key_value() {
            let expired = match self.records.get(key) {
                Some(stored) => self.is_stale(&stored.record, now),
                None => true,
            };
            if !expired {
                break;
            }
            if let Some((_, key)) = self.by_age.pop_first() {
                if self.records.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }

        self.stats.total_expired += removed as u64;
        removed
    }

    /// Whether a record has logically expired at `now`
    pub fn is_stale(&self, record: &FeedbackRecord, now: DateTime<Utc>) -> bool {
        record.submitted_at < now - self.staleness
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &FeedbackKey) -> Option<&StoredFeedback> {
        self.records.get(key)
    }

    pub fn stats(&self) -> FeedbackStoreStats {
        FeedbackStoreStats {
            count: self.records.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlhf_core::{InterventionResult, PredictionAccuracy};

    fn record(case: &str, officer: &str, submitted_at: DateTime<Utc>) -> FeedbackRecord {
        FeedbackRecord::new(
            FeedbackKey::new(case, "pred-1", officer),
            PredictionAccuracy::Nearby,
            InterventionResult::Apprehension,
        )
        .with_submitted_at(submitted_at)
    }

    #[test]
    fn test_resubmission_replaces() {
        let mut store = FeedbackStore::new(10, 30);
        let now = Utc::now();

        let first = store.submit(record("c1", "o1", now), RewardSignal::Scalar(1.0));
        assert!(!first.replaced);
        assert_eq!(store.count(), 1);

        let second = store.submit(record("c1", "o1", now), RewardSignal::Scalar(2.0));
        assert!(second.replaced);
        assert_eq!(store.count(), 1);

        let key = FeedbackKey::new("c1", "pred-1", "o1");
        assert_eq!(store.get(&key).unwrap().reward.value(), 2.0);
        assert_eq!(store.stats().total_replaced, 1);
    }

    #[test]
    fn test_different_officers_are_distinct() {
        let mut store = FeedbackStore::new(10, 30);
        let now = Utc::now();
        store.submit(record("c1", "o1", now), RewardSignal::Scalar(1.0));
        store.submit(record("c1", "o2", now), RewardSignal::Scalar(1.0));
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest_by_submission_time() {
        let mut store = FeedbackStore::new(3, 30);
        let now = Utc::now();

        // Inserted out of chronological order on purpose
        store.submit(record("c2", "o", now - Duration::hours(2)), RewardSignal::Scalar(0.0));
        store.submit(record("c1", "o", now - Duration::hours(3)), RewardSignal::Scalar(0.0));
        store.submit(record("c3", "o", now - Duration::hours(1)), RewardSignal::Scalar(0.0));

        let outcome = store.submit(record("c4", "o", now), RewardSignal::Scalar(0.0));
        assert_eq!(store.count(), 3);
        assert_eq!(outcome.evicted.unwrap().case_id, "c1");
        assert!(store.get(&FeedbackKey::new("c1", "pred-1", "o")).is_none());
    }

    #[test]
    fn test_replacement_at_capacity_does_not_evict() {
        let mut store = FeedbackStore::new(2, 30);
        let now = Utc::now();
        store.submit(record("c1", "o", now), RewardSignal::Scalar(0.0));
        store.submit(record("c2", "o", now), RewardSignal::Scalar(0.0));

        let outcome = store.submit(record("c1", "o", now), RewardSignal::Scalar(1.0));
        assert!(outcome.evicted.is_none());
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_sweep_stale() {
        let mut store = FeedbackStore::new(10, 7);
        let now = Utc::now();
        store.submit(record("old", "o", now - Duration::days(10)), RewardSignal::Scalar(0.0));
        store.submit(record("older", "o", now - Duration::days(30)), RewardSignal::Scalar(0.0));
        store.submit(record("fresh", "o", now - Duration::days(1)), RewardSignal::Scalar(0.0));

        assert_eq!(store.sweep_stale(now), 2);
        assert_eq!(store.count(), 1);
        assert_eq!(store.stats().total_expired, 2);
        assert_eq!(store.sweep_stale(now), 0);
    }

    #[test]
    fn test_sweep_removes_exactly_the_stale_records() {
        let mut store = FeedbackStore::new(10, 7);
        let now = Utc::now();
        let ages = [("a", 2), ("b", 9), ("c", 6), ("d", 40), ("e", 0)];
        for (case, days) in ages {
            store.submit(record(case, "o", now - Duration::days(days)), RewardSignal::Scalar(0.0));
        }
        let stale: Vec<_> = ages
            .iter()
            .filter(|(case, _)| {
                let stored = store.get(&FeedbackKey::new(*case, "pred-1", "o")).unwrap();
                store.is_stale(&stored.record, now)
            })
            .map(|(case, _)| *case)
            .collect();
        assert_eq!(stale, vec!["b", "d"]);

        assert_eq!(store.sweep_stale(now), stale.len());
        for (case, _) in ages {
            let key = FeedbackKey::new(case, "pred-1", "o");
            assert_eq!(store.get(&key).is_none(), stale.contains(&case), "{case}");
        }
    }

    #[test]
    fn test_is_stale() {
        let store = FeedbackStore::new(10, 7);
        let now = Utc::now();
        assert!(store.is_stale(&record("c", "o", now - Duration::days(8)), now));
        assert!(!store.is_stale(&record("c", "o", now - Duration::days(6)), now));
    }
}
