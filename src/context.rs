//! Shared execution state for one pipeline run.
//!
//! A run's workers communicate termination and failure exclusively through
//! [`SharedProgress`]: producers count down a latch when their input is
//! exhausted, every published batch bumps a signed in-flight counter that
//! consumers decrement, and the first error from any thread lands in a
//! write-once failure slot. The orchestrator owns the only wait loop.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::error::TransferError;
use crate::sync::CountDownLatch;

/// Write-once slot holding the first failure observed by any worker.
#[derive(Default)]
pub struct FailureSlot {
    slot: OnceLock<TransferError>,
}

impl FailureSlot {
    /// Record a failure. Only the first one is kept; later failures are
    /// logged and dropped, since they are almost always cascade noise.
    pub fn fail(&self, err: TransferError) {
        if let Err(err) = self.slot.set(err) {
            warn!(error = %err, "secondary failure after pipeline already failed");
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }

    #[must_use]
    pub fn get(&self) -> Option<&TransferError> {
        self.slot.get()
    }

    /// Extract the recorded failure, if any. Only callable once every
    /// worker has released its handle on the shared context.
    pub fn take(&mut self) -> Option<TransferError> {
        self.slot.take()
    }
}

/// Progress bookkeeping shared by every worker of one run.
pub struct SharedProgress {
    failure: FailureSlot,
    /// Batches published minus batches drained. Signed so an observer that
    /// sees a consumer's decrement before the matching increment cannot
    /// wrap the count.
    emitted: AtomicI64,
    producers_done: CountDownLatch,
}

impl SharedProgress {
    #[must_use]
    pub fn new(producer_count: usize) -> Self {
        Self {
            failure: FailureSlot::default(),
            emitted: AtomicI64::new(0),
            producers_done: CountDownLatch::new(producer_count),
        }
    }

    #[must_use]
    pub fn failure(&self) -> &FailureSlot {
        &self.failure
    }

    #[must_use]
    pub fn producers_done(&self) -> &CountDownLatch {
        &self.producers_done
    }

    /// A batch was published to the ring.
    pub fn note_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::SeqCst);
    }

    /// A batch was consumed from the ring.
    pub fn note_drained(&self) {
        self.emitted.fetch_sub(1, Ordering::SeqCst);
    }

    /// Undo a `note_emitted` whose publish never happened.
    pub fn retract_emitted(&self) {
        self.emitted.fetch_sub(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Wait until all producers finished *and* every emitted batch has been
    /// drained, or until a failure is recorded. Returns `true` on clean
    /// completion, `false` when the run failed.
    ///
    /// Both conditions are required: an empty ring alone does not mean the
    /// producers are done, and a zeroed latch alone leaves tail batches in
    /// the ring.
    pub fn wait_for_finish(&self, latch_poll: Duration, drain_poll: Duration) -> bool {
        while !self.producers_done.wait_timeout(latch_poll) {
            if self.failure.is_set() {
                return false;
            }
        }
        while self.in_flight() > 0 {
            if self.failure.is_set() {
                return false;
            }
            std::thread::sleep(drain_poll);
        }
        !self.failure.is_set()
    }

    /// Consume the context and surface the recorded failure.
    pub fn into_failure(mut self) -> Option<TransferError> {
        self.failure.take()
    }
}

/// Value snapshot handed to each file-reader producer.
#[derive(Clone, Copy, Debug)]
pub struct ProducerContext {
    pub block_size: usize,
    pub batch_size: usize,
    pub charset: crate::config::Charset,
    pub with_header: bool,
}

/// Value snapshot handed to each consumer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsumerContext {
    pub read_only: bool,
    pub insert_ignore: bool,
    /// Per-consumer batch pacing budget; `None` disables throttling.
    pub batch_rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn failure_slot_keeps_first_error() {
        let slot = FailureSlot::default();
        slot.fail(TransferError::config("first"));
        slot.fail(TransferError::config("second"));
        let kept = slot.get().unwrap();
        assert!(kept.to_string().contains("first"));
    }

    #[test]
    fn wait_for_finish_requires_latch_and_counter() {
        let progress = Arc::new(SharedProgress::new(1));
        progress.note_emitted();
        progress.note_emitted();
        std::thread::scope(|scope| {
            let worker = Arc::clone(&progress);
            scope.spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                worker.note_drained();
                worker.note_drained();
                worker.producers_done().count_down();
            });
            assert!(progress.wait_for_finish(
                Duration::from_millis(5),
                Duration::from_millis(5)
            ));
        });
        assert_eq!(progress.in_flight(), 0);
    }

    #[test]
    fn wait_for_finish_returns_promptly_on_failure() {
        let progress = SharedProgress::new(1);
        progress.note_emitted();
        progress.failure().fail(TransferError::database("gone"));
        assert!(!progress.wait_for_finish(
            Duration::from_millis(5),
            Duration::from_millis(5)
        ));
    }
}
