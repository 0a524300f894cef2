//! Fault policy: retry and skip budgets
//!
//! | Error kind | Disposition |
//! |---|---|
//! | Transient infrastructure (I/O timeout, lock contention, commit timeout) | Retry, bounded by `max_retry_attempts` |
//! | Validation / business-rule violation | Skip, consumes the skip budget, never retried |
//! | Source failure, unclassified error | Abort the job regardless of the skip budget |

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, ErrorKind};

/// What to do with a failed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Skip,
    Abort,
}

/// Decision taken after a chunk-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFailureAction {
    /// Re-execute the chunk from `Collecting`; `attempt` is 1-based
    RetryChunk { attempt: u32 },
    /// Roll the chunk back and count every record in it as skipped
    SkipChunk,
    /// Fail the job
    AbortJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    pub max_retry_attempts: u32,
    pub skip_limit: u64,
    pub fault_tolerant: bool,
    pub retry_backoff: Duration,
}

impl FaultPolicy {
    pub fn new(max_retry_attempts: u32, skip_limit: u64, fault_tolerant: bool) -> Self {
        Self {
            max_retry_attempts,
            skip_limit,
            fault_tolerant,
            retry_backoff: Duration::ZERO,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn classify(&self, err: &BatchError) -> Disposition {
        match err.kind() {
            ErrorKind::Transient => Disposition::Retry,
            ErrorKind::Validation => Disposition::Skip,
            ErrorKind::Source | ErrorKind::Unknown => Disposition::Abort,
        }
    }

    /// Decide what happens to chunk `sequence` after `err`
    ///
    /// Exhausted retries degrade to a skip; a non-fault-tolerant job aborts
    /// wherever a fault-tolerant one would skip.
    pub fn on_chunk_failure(
        &self,
        state: &mut FaultState,
        sequence: u64,
        err: &BatchError,
    ) -> ChunkFailureAction {
        let wants_skip = match self.classify(err) {
            Disposition::Abort => return ChunkFailureAction::AbortJob,
            Disposition::Retry => {
                if state.retries_for(sequence) < self.max_retry_attempts {
                    let attempt = state.record_retry(sequence);
                    return ChunkFailureAction::RetryChunk { attempt };
                }
                true
            },
            Disposition::Skip => true,
        };

        if wants_skip && self.fault_tolerant {
            ChunkFailureAction::SkipChunk
        } else {
            ChunkFailureAction::AbortJob
        }
    }

    /// Exponential backoff before retry `attempt` (1-based), capped at 32x
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        self.retry_backoff.saturating_mul(factor)
    }

    /// Whether `skips` total skips breach the budget
    pub fn exceeds_skip_limit(&self, skips: u64) -> bool {
        skips > self.skip_limit
    }
}

/// Per-execution fault counters, owned by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultState {
    retry_count_by_chunk: HashMap<u64, u32>,
    skip_count_total: u64,
    retries_total: u64,
}

impl FaultState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retries_for(&self, sequence: u64) -> u32 {
        self.retry_count_by_chunk.get(&sequence).copied().unwrap_or(0)
    }

    fn record_retry(&mut self, sequence: u64) -> u32 {
        let count = self.retry_count_by_chunk.entry(sequence).or_insert(0);
        *count += 1;
        self.retries_total += 1;
        *count
    }

    /// Chunk finished (committed or rolled back); its retry counter resets
    pub fn reset_chunk(&mut self, sequence: u64) {
        self.retry_count_by_chunk.remove(&sequence);
    }

    pub fn record_skips(&mut self, count: u64) -> u64 {
        self.skip_count_total += count;
        self.skip_count_total
    }

    pub fn skip_count_total(&self) -> u64 {
        self.skip_count_total
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_total
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_retries_until_budget_then_skips() {
        let policy = FaultPolicy::new(2, 10, true);
        let mut state = FaultState::new();
        let err = BatchError::Transient("deadlock".into());

        assert_eq!(
            policy.on_chunk_failure(&mut state, 1, &err),
            ChunkFailureAction::RetryChunk { attempt: 1 }
        );
        assert_eq!(
            policy.on_chunk_failure(&mut state, 1, &err),
            ChunkFailureAction::RetryChunk { attempt: 2 }
        );
        assert_eq!(policy.on_chunk_failure(&mut state, 1, &err), ChunkFailureAction::SkipChunk);
        assert_eq!(state.retries_for(1), 2);

        state.reset_chunk(1);
        assert_eq!(state.retries_for(1), 0);
        assert_eq!(state.retries_total(), 2);
    }

    #[test]
    fn test_validation_is_never_retried() {
        let policy = FaultPolicy::new(5, 10, true);
        let mut state = FaultState::new();
        let err = BatchError::Validation("constraint".into());
        assert_eq!(policy.on_chunk_failure(&mut state, 3, &err), ChunkFailureAction::SkipChunk);
        assert_eq!(state.retries_for(3), 0);
    }

    #[test]
    fn test_unknown_aborts_regardless_of_budget() {
        let policy = FaultPolicy::new(5, 1_000, true);
        let mut state = FaultState::new();
        let err = BatchError::Unknown("null pointer".into());
        assert_eq!(policy.on_chunk_failure(&mut state, 1, &err), ChunkFailureAction::AbortJob);
    }

    #[test]
    fn test_non_fault_tolerant_aborts_instead_of_skipping() {
        let policy = FaultPolicy::new(0, 10, false);
        let mut state = FaultState::new();
        let err = BatchError::Transient("timeout".into());
        assert_eq!(policy.on_chunk_failure(&mut state, 1, &err), ChunkFailureAction::AbortJob);
    }

    #[test]
    fn test_skip_limit_is_strictly_greater() {
        let policy = FaultPolicy::new(0, 2, true);
        let mut state = FaultState::new();
        assert!(!policy.exceeds_skip_limit(state.record_skips(2)));
        assert!(policy.exceeds_skip_limit(state.record_skips(1)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = FaultPolicy::new(3, 0, true).with_retry_backoff(Duration::from_millis(10));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(320));
    }
}
