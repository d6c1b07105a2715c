//! Deduplicating batched number journal.
//!
//! The journal owns the uniqueness index, the pending write batch and the
//! append destination. [`Journal::record`] classifies one candidate line and
//! schedules first-seen numbers for persistence; [`Journal::flush`] appends
//! the pending batch to the destination. Acceptance counters feed the
//! periodic [`ActivityReport`].

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::mem;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Reserved control line that shuts down the whole service.
pub const TERMINATE_SEQUENCE: &str = "terminate";

/// Outcome of recording a well-formed candidate number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First sighting, scheduled for the next flush.
    Accepted,
    /// Already journaled since process start.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("not an exact nine decimal digit number")]
    MalformedNumber,
    #[error("terminate sequence received")]
    TerminateRequested,
}

/// Periodic activity snapshot: deltas since the previous report plus the
/// cumulative unique count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityReport {
    pub unique: u64,
    pub duplicates: u64,
    pub unique_total: u64,
}

impl fmt::Display for ActivityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Received {} unique numbers, {} duplicates. Unique total: {}",
            self.unique, self.duplicates, self.unique_total
        )
    }
}

#[derive(Default)]
struct PendingState {
    index: HashSet<String>,
    batch: Vec<String>,
}

#[derive(Default)]
struct Counters {
    unique: AtomicU64,
    duplicates: AtomicU64,
    unique_reported: AtomicU64,
    duplicates_reported: AtomicU64,
}

pub struct Journal {
    pending: StdMutex<PendingState>,
    destination: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    counters: Counters,
}

impl Journal {
    /// Wrap an already-open append destination. The destination is written
    /// only by [`Journal::flush`].
    pub fn new<W>(destination: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            pending: StdMutex::new(PendingState::default()),
            destination: Mutex::new(Box::new(destination)),
            counters: Counters::default(),
        }
    }

    /// Classify one candidate line and schedule it for persistence if it is
    /// a first-seen nine digit number.
    ///
    /// The terminate check runs before validation, so the control line is
    /// reported as [`RecordError::TerminateRequested`] regardless of prior
    /// state. Leading zeros are insignificant for uniqueness: all variants
    /// stripping to the same key share one acceptance. The duplicate check
    /// and the batch append run under one critical section, so two
    /// connections racing on the same number can never both be accepted.
    pub fn record(&self, candidate: &str) -> Result<RecordOutcome, RecordError> {
        if candidate == TERMINATE_SEQUENCE {
            return Err(RecordError::TerminateRequested);
        }
        if candidate.len() != 9 || !candidate.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RecordError::MalformedNumber);
        }

        // An all-zero number strips to the empty key, a valid distinct key.
        let key = candidate.trim_start_matches('0');
        let duplicate = {
            let mut pending = lock_pending(&self.pending);
            if pending.index.contains(key) {
                true
            } else {
                pending.index.insert(key.to_owned());
                pending.batch.push(candidate.to_owned());
                false
            }
        };

        if duplicate {
            self.counters.duplicates.fetch_add(1, Ordering::Release);
            Ok(RecordOutcome::Duplicate)
        } else {
            self.counters.unique.fetch_add(1, Ordering::Release);
            Ok(RecordOutcome::Accepted)
        }
    }

    /// Append the pending batch to the destination and clear it.
    ///
    /// Returns the number of entries written. The destination lock is taken
    /// before the batch is swapped out, so concurrent flushes cannot commit
    /// batches out of acceptance order. On a write error the swapped-out
    /// batch is gone; the caller decides whether that is fatal. Flushing
    /// never touches the uniqueness index.
    pub async fn flush(&self) -> Result<usize, io::Error> {
        let mut destination = self.destination.lock().await;
        let batch = mem::take(&mut lock_pending(&self.pending).batch);
        if batch.is_empty() {
            return Ok(0);
        }

        let mut payload = batch.join("\n");
        payload.push('\n');
        destination.write_all(payload.as_bytes()).await?;
        destination.flush().await?;
        Ok(batch.len())
    }

    /// Deltas since the previous report plus the cumulative unique count.
    /// Resets the deltas. Never blocks [`Journal::record`] callers.
    pub fn report(&self) -> ActivityReport {
        let unique_total = self.counters.unique.load(Ordering::Acquire);
        let duplicates_total = self.counters.duplicates.load(Ordering::Acquire);
        ActivityReport {
            unique: unique_total
                - self
                    .counters
                    .unique_reported
                    .swap(unique_total, Ordering::AcqRel),
            duplicates: duplicates_total
                - self
                    .counters
                    .duplicates_reported
                    .swap(duplicates_total, Ordering::AcqRel),
            unique_total,
        }
    }

    pub fn unique_total(&self) -> u64 {
        self.counters.unique.load(Ordering::Acquire)
    }

    pub fn duplicate_total(&self) -> u64 {
        self.counters.duplicates.load(Ordering::Acquire)
    }
}

/// A poisoned lock only means another handler panicked mid-record; the index
/// and batch are still structurally sound.
fn lock_pending(pending: &StdMutex<PendingState>) -> MutexGuard<'_, PendingState> {
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::task::JoinSet;

    use super::*;

    fn sink_journal() -> Journal {
        Journal::new(tokio::io::sink())
    }

    fn file_journal() -> (Journal, std::path::PathBuf, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let destination = tokio::fs::File::from_std(file.reopen().unwrap());
        (Journal::new(destination), path, file)
    }

    #[test]
    fn rejects_lines_that_are_not_nine_digits() {
        let journal = sink_journal();

        for candidate in ["", "12345678", "1234567890", "12345678a", "123 45678", "Aca2321"] {
            assert_eq!(
                journal.record(candidate),
                Err(RecordError::MalformedNumber),
                "candidate {candidate:?}"
            );
        }
        assert_eq!(journal.unique_total(), 0);
        assert_eq!(journal.duplicate_total(), 0);
    }

    #[test]
    fn malformed_input_leaves_no_trace() {
        let journal = sink_journal();

        let _ = journal.record("not-a-number");
        assert_eq!(journal.record("123456789"), Ok(RecordOutcome::Accepted));
    }

    #[test]
    fn first_sighting_accepted_then_duplicate() {
        let journal = sink_journal();

        assert_eq!(journal.record("123456789"), Ok(RecordOutcome::Accepted));
        assert_eq!(journal.record("123456789"), Ok(RecordOutcome::Duplicate));
        assert_eq!(journal.unique_total(), 1);
        assert_eq!(journal.duplicate_total(), 1);
    }

    #[test]
    fn leading_zeros_do_not_make_a_number_unique() {
        let journal = sink_journal();

        assert_eq!(journal.record("000123456"), Ok(RecordOutcome::Accepted));
        assert_eq!(journal.record("000123456"), Ok(RecordOutcome::Duplicate));
        // Different digits past the stripped zeros are a different number.
        assert_eq!(journal.record("123456000"), Ok(RecordOutcome::Accepted));
    }

    #[test]
    fn all_zero_number_is_a_valid_distinct_key() {
        let journal = sink_journal();

        assert_eq!(journal.record("000000000"), Ok(RecordOutcome::Accepted));
        assert_eq!(journal.record("000000000"), Ok(RecordOutcome::Duplicate));
        assert_eq!(journal.record("000000001"), Ok(RecordOutcome::Accepted));
    }

    #[test]
    fn terminate_always_fails_regardless_of_prior_state() {
        let journal = sink_journal();

        assert_eq!(journal.record("terminate"), Err(RecordError::TerminateRequested));
        let _ = journal.record("123456789");
        assert_eq!(journal.record("terminate"), Err(RecordError::TerminateRequested));
        assert_eq!(journal.unique_total(), 1);
    }

    #[tokio::test]
    async fn flush_appends_numbers_as_received_in_acceptance_order() {
        let (journal, path, _guard) = file_journal();

        journal.record("123456789").unwrap();
        journal.record("123456789").unwrap();
        journal.record("012345678").unwrap();

        assert_eq!(journal.flush().await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "123456789\n012345678\n");
    }

    #[tokio::test]
    async fn flush_clears_the_batch_but_not_the_index() {
        let (journal, path, _guard) = file_journal();

        journal.record("555555555").unwrap();
        assert_eq!(journal.flush().await.unwrap(), 1);
        assert_eq!(journal.flush().await.unwrap(), 0);

        // Still a duplicate after the flush; exactly one line persisted.
        assert_eq!(journal.record("555555555"), Ok(RecordOutcome::Duplicate));
        assert_eq!(journal.flush().await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "555555555\n");
    }

    #[tokio::test]
    async fn flush_on_empty_batch_writes_nothing() {
        let (journal, path, _guard) = file_journal();

        assert_eq!(journal.flush().await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn concurrent_same_number_is_accepted_exactly_once() {
        let journal = Arc::new(sink_journal());
        let mut tasks = JoinSet::new();
        for _ in 0..16 {
            let journal = Arc::clone(&journal);
            tasks.spawn(async move { journal.record("424242424") });
        }

        let mut accepted = 0;
        let mut duplicates = 0;
        while let Some(outcome) = tasks.join_next().await {
            match outcome.unwrap().unwrap() {
                RecordOutcome::Accepted => accepted += 1,
                RecordOutcome::Duplicate => duplicates += 1,
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(duplicates, 15);
    }

    #[test]
    fn report_returns_deltas_and_resets_them() {
        let journal = sink_journal();

        journal.record("111111111").unwrap();
        journal.record("222222222").unwrap();
        journal.record("111111111").unwrap();

        let first = journal.report();
        assert_eq!(first.unique, 2);
        assert_eq!(first.duplicates, 1);
        assert_eq!(first.unique_total, 2);

        journal.record("333333333").unwrap();
        let second = journal.report();
        assert_eq!(second.unique, 1);
        assert_eq!(second.duplicates, 0);
        assert_eq!(second.unique_total, 3);
    }

    #[test]
    fn report_display_format() {
        let report = ActivityReport {
            unique: 50,
            duplicates: 2,
            unique_total: 567,
        };
        assert_eq!(
            report.to_string(),
            "Received 50 unique numbers, 2 duplicates. Unique total: 567"
        );
    }
}
