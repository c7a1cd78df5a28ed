//! Small synchronization primitives shared by the pipeline workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};

/// A latch counted down once per producer; the orchestrator waits on it
/// with a bounded timeout so it can re-check the shared failure slot.
pub struct CountDownLatch {
    remaining: Mutex<usize>,
    zeroed: Condvar,
}

impl CountDownLatch {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zeroed: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.zeroed.notify_all();
            }
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.zeroed.wait(remaining).unwrap();
        }
    }

    /// Wait up to `timeout`; returns `true` once the count has reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, result) = self.zeroed.wait_timeout(remaining, left).unwrap();
            remaining = guard;
            if result.timed_out() && *remaining > 0 {
                return false;
            }
        }
        true
    }

    #[must_use]
    pub fn current(&self) -> usize {
        *self.remaining.lock().unwrap()
    }
}

/// An atomic counter that wraps around a fixed bound; used to round-robin
/// leftover fragments across output files.
pub struct CyclicCounter {
    next: AtomicUsize,
    bound: usize,
}

impl CyclicCounter {
    /// # Panics
    ///
    /// Panics if `bound` is zero.
    #[must_use]
    pub fn new(bound: usize) -> Self {
        assert!(bound > 0, "cyclic counter bound must be positive");
        Self {
            next: AtomicUsize::new(0),
            bound,
        }
    }

    pub fn next(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.bound
    }
}

/// A fair counting semaphore gating how many shard producers may query
/// concurrently. Built on a bounded channel so waiters are served FIFO.
pub struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    /// # Panics
    ///
    /// Panics if `permits` is zero.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "semaphore needs at least one permit");
        let (tx, rx) = bounded(permits);
        Self { tx, rx }
    }

    /// Block until a permit is available.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        // Channel capacity equals the permit count; send blocks while all
        // permits are out.
        self.tx.send(()).expect("semaphore channel closed");
        SemaphoreGuard { sem: self }
    }
}

/// Releases its permit on drop.
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let _ = self.sem.rx.recv();
    }
}

/// A token-bucket pacer. One acquire corresponds to one batch; the permit
/// rate is the per-consumer, per-batch budget derived from the global
/// rows/sec target.
pub struct RateLimiter {
    interval: Duration,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    /// `permits_per_sec` at or below zero disables pacing entirely.
    #[must_use]
    pub fn new(permits_per_sec: f64) -> Self {
        let interval = if permits_per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / permits_per_sec)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Block until the next permit is due.
    pub fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let wait_until = {
            let mut next_free = self.next_free.lock().unwrap();
            let now = Instant::now();
            let due = (*next_free).max(now);
            *next_free = due + self.interval;
            due
        };
        let now = Instant::now();
        if wait_until > now {
            std::thread::sleep(wait_until - now);
        }
    }
}

/// Incremental backoff for the ring's claim loops: spin briefly, then
/// yield, then sleep in millisecond steps.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn wait(&mut self) {
        match self.step {
            0..=6 => {
                for _ in 0..(1u32 << self.step) {
                    std::hint::spin_loop();
                }
            }
            7..=16 => std::thread::yield_now(),
            _ => std::thread::sleep(Duration::from_millis(1)),
        }
        self.step = self.step.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn latch_counts_to_zero_across_threads() {
        let latch = Arc::new(CountDownLatch::new(3));
        for _ in 0..3 {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || latch.count_down());
        }
        latch.wait();
        assert_eq!(latch.current(), 0);
    }

    #[test]
    fn latch_wait_timeout_reports_pending() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn cyclic_counter_wraps() {
        let counter = CyclicCounter::new(3);
        let seen: Vec<usize> = (0..7).map(|_| counter.next()).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn semaphore_limits_concurrency() {
        let sem = Arc::new(Semaphore::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let sem = Arc::clone(&sem);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(std::thread::spawn(move || {
                let _guard = sem.acquire();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn rate_limiter_spaces_permits() {
        let limiter = RateLimiter::new(100.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire();
        }
        // Five permits at 100/sec need at least ~40ms after the first.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
