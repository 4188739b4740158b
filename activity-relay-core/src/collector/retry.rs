//! Per-batch failure bookkeeping
//!
//! Counts consecutive delivery failures per [`BatchFingerprint`] and decides
//! when a batch stops being tracked. Reaching the limit never deletes events:
//! they stay queued and keep being attempted, but the retired fingerprint is
//! no longer counted. A later success deletes them as usual and clears the
//! retired mark.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::BatchFingerprint;

/// What the tracker concluded from one outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Delivered; any record for the fingerprint was cleared
    Cleared,
    /// Failed, will be retried next cycle
    WillRetry { attempt: u32, limit: u32 },
    /// Failed `limit` times; record dropped, events left in the store
    PermanentlyFailed { attempts: u32 },
    /// Failed again after the fingerprint was retired; not counted
    Untracked,
}

/// Retired fingerprints remembered at most
const MAX_RETIRED: usize = 256;

/// Failure counts keyed by batch fingerprint
#[derive(Debug)]
pub struct RetryTracker {
    limit: u32,
    attempts: HashMap<BatchFingerprint, u32>,
    retired: HashSet<BatchFingerprint>,
    retired_order: VecDeque<BatchFingerprint>,
}

impl RetryTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            attempts: HashMap::new(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn record_success(&mut self, fingerprint: &BatchFingerprint) -> RetryVerdict {
        self.attempts.remove(fingerprint);
        if self.retired.remove(fingerprint) {
            self.retired_order.retain(|f| f != fingerprint);
        }
        RetryVerdict::Cleared
    }

    pub fn record_failure(&mut self, fingerprint: &BatchFingerprint) -> RetryVerdict {
        if self.retired.contains(fingerprint) {
            return RetryVerdict::Untracked;
        }

        let attempt = self.attempts.get(fingerprint).copied().unwrap_or(0) + 1;

        if attempt >= self.limit {
            self.attempts.remove(fingerprint);
            self.retire(fingerprint.clone());
            return RetryVerdict::PermanentlyFailed { attempts: attempt };
        }

        self.attempts.insert(fingerprint.clone(), attempt);
        RetryVerdict::WillRetry {
            attempt,
            limit: self.limit,
        }
    }

    fn retire(&mut self, fingerprint: BatchFingerprint) {
        if self.retired_order.len() >= MAX_RETIRED {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(fingerprint.clone());
        self.retired_order.push_back(fingerprint);
    }

    pub fn is_retired(&self, fingerprint: &BatchFingerprint) -> bool {
        self.retired.contains(fingerprint)
    }

    /// Current failure count for a fingerprint (0 when untracked)
    pub fn attempts(&self, fingerprint: &BatchFingerprint) -> u32 {
        self.attempts.get(fingerprint).copied().unwrap_or(0)
    }

    /// Number of fingerprints currently tracked
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}
