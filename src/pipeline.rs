//! Bounded multi-producer/multi-consumer handoff ring and worker pool.
//!
//! The ring is an arena of pre-allocated event slots indexed by sequence
//! modulo capacity. Each slot carries a stamp that arbitrates the protocol:
//! a slot whose stamp equals a producer's claimed position is free to fill;
//! stamp = position + 1 marks it published; stamp = position + capacity
//! hands it back to the next lap of producers. Events are recycled in
//! place, so a full run allocates `capacity` events once.
//!
//! Producers block (with backoff) when the ring is full; consumers poll
//! with the same backoff and bail out when the ring is halted or the run
//! has failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::debug;

use crate::context::SharedProgress;
use crate::error::{Result, TransferError};
use crate::sync::Backoff;

/// Publish failed because the ring was halted while the producer waited
/// for a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted;

struct Slot<E> {
    stamp: AtomicU64,
    value: Mutex<E>,
}

/// Bounded MPMC ring buffer over pre-allocated events.
pub struct RingBuffer<E> {
    slots: Box<[Slot<E>]>,
    mask: u64,
    enqueue_pos: AtomicU64,
    dequeue_pos: AtomicU64,
    halted: AtomicBool,
}

impl<E> RingBuffer<E> {
    /// Build a ring of at least `capacity` slots (rounded up to a power of
    /// two), each initialized by `factory`.
    pub fn with_capacity(capacity: usize, mut factory: impl FnMut() -> E) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let slots: Vec<Slot<E>> = (0..cap)
            .map(|i| Slot {
                stamp: AtomicU64::new(i as u64),
                value: Mutex::new(factory()),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: (cap - 1) as u64,
            enqueue_pos: AtomicU64::new(0),
            dequeue_pos: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Wake blocked producers; subsequent publishes fail with [`Halted`].
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.enqueue_pos.load(Ordering::SeqCst);
        let tail = self.dequeue_pos.load(Ordering::SeqCst);
        head.saturating_sub(tail) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, pos: u64) -> &Slot<E> {
        &self.slots[(pos & self.mask) as usize]
    }

    /// Claim the next slot, let `fill` overwrite its event in place, and
    /// publish it. Blocks while the ring is full.
    pub fn publish(&self, fill: impl FnOnce(&mut E)) -> Result<(), Halted> {
        let mut backoff = Backoff::new();
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let stamp = slot.stamp.load(Ordering::Acquire);
            let lag = stamp as i64 - pos as i64;
            if lag == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Stamp protocol guarantees exclusive access here;
                        // the lock is uncontended.
                        fill(&mut slot.value.lock().unwrap());
                        slot.stamp.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if lag < 0 {
                // Ring full: the slot is still a full lap behind.
                if self.is_halted() {
                    return Err(Halted);
                }
                backoff.wait();
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Take the next published event if one is available and run `process`
    /// on it, then release the slot back to producers.
    pub fn try_consume<R>(&self, process: impl FnOnce(&mut E) -> R) -> Option<R> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let stamp = slot.stamp.load(Ordering::Acquire);
            let lag = stamp as i64 - (pos + 1) as i64;
            if lag == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let result = process(&mut slot.value.lock().unwrap());
                        slot.stamp
                            .store(pos + self.capacity() as u64, Ordering::Release);
                        return Some(result);
                    }
                    Err(actual) => pos = actual,
                }
            } else if lag < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

/// Per-thread event handler run by a [`WorkerPool`].
pub trait WorkHandler<E>: Send {
    /// Handle one event. An error stops the whole run.
    fn on_event(&mut self, event: &mut E) -> Result<()>;

    /// Called once after the pool drains, even on failure. Flush point.
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<E> WorkHandler<E> for Box<dyn WorkHandler<E>> {
    fn on_event(&mut self, event: &mut E) -> Result<()> {
        (**self).on_event(event)
    }

    fn on_shutdown(&mut self) -> Result<()> {
        (**self).on_shutdown()
    }
}

/// A fixed pool of consumer threads polling one ring.
pub struct WorkerPool<E> {
    ring: Arc<RingBuffer<E>>,
    handles: Vec<JoinHandle<()>>,
}

impl<E: Send + 'static> WorkerPool<E> {
    /// Spawn one thread per handler. Threads exit when the ring is halted
    /// and empty, or as soon as a failure is recorded.
    pub fn start<H: WorkHandler<E> + 'static>(
        ring: Arc<RingBuffer<E>>,
        handlers: Vec<H>,
        shared: Arc<SharedProgress>,
    ) -> Self {
        let handles = handlers
            .into_iter()
            .enumerate()
            .map(|(index, mut handler)| {
                let ring = Arc::clone(&ring);
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("consumer-{index}"))
                    .spawn(move || {
                        let mut backoff = Backoff::new();
                        loop {
                            let outcome = ring.try_consume(|event| handler.on_event(event));
                            match outcome {
                                Some(result) => {
                                    shared.note_drained();
                                    backoff = Backoff::new();
                                    if let Err(err) = result {
                                        shared.failure().fail(err);
                                        break;
                                    }
                                    if shared.failure().is_set() {
                                        break;
                                    }
                                }
                                None => {
                                    if ring.is_halted() || shared.failure().is_set() {
                                        break;
                                    }
                                    backoff.wait();
                                }
                            }
                        }
                        if shared.failure().is_set() {
                            // Unblock producers stuck on a full ring.
                            ring.halt();
                        }
                        if let Err(err) = handler.on_shutdown() {
                            shared.failure().fail(err);
                        }
                        debug!(worker = index, "consumer exited");
                    })
                    .expect("failed to spawn consumer thread")
            })
            .collect();
        Self { ring, handles }
    }

    /// Halt the ring and join every consumer.
    pub fn drain_and_halt(self) {
        self.ring.halt();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Publish with in-flight accounting: the emitted counter is bumped before
/// the publish so a consumer can never drain a batch the orchestrator has
/// not yet counted.
pub fn publish_counted<E>(
    ring: &RingBuffer<E>,
    shared: &SharedProgress,
    fill: impl FnOnce(&mut E),
) -> Result<(), Halted> {
    shared.note_emitted();
    match ring.publish(fill) {
        Ok(()) => Ok(()),
        Err(Halted) => {
            shared.retract_emitted();
            Err(Halted)
        }
    }
}

/// Error reported by a producer whose publish was cut short by a halt.
#[must_use]
pub fn halted_as_error() -> TransferError {
    TransferError::config("pipeline halted before all data was published")
}
