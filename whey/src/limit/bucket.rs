//! Token bucket with a bounded waiter queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::Error;

/// Slop for float token arithmetic, so that a sleep computed from a deficit
/// counts as having covered it.
const TOKEN_EPSILON: f64 = 1e-9;

/// Tuning for a single [`TokenBucket`].
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Bucket capacity, in tokens.
    pub max_burst_size: u64,
    /// Refill rate, in tokens per second.
    pub flow_rate: f64,
    /// Upper bound on a single grant handed to a queued waiter. Defaults to
    /// the burst size, and is clamped to it.
    pub max_queue_grant_size: Option<u64>,
    /// Upper bound on the sum of tokens queued for. `None` means the queue
    /// is unbounded.
    pub max_queue_size: Option<u64>,
}

/// The outcome of an acquire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Whether the full requested amount was granted.
    pub done: bool,
    /// Tokens actually granted. For [`TokenBucket::acquire`] this is zero or
    /// the full requested amount; [`TokenBucket::acquire_up_to`] may return
    /// less than requested (clamped by `max_queue_grant_size`).
    pub granted: u64,
    /// How long the caller waited.
    pub wait: Duration,
}

impl Grant {
    fn denied(wait: Duration) -> Self {
        Self {
            done: false,
            granted: 0,
            wait,
        }
    }

    /// Whether the request was denied outright.
    pub fn is_denied(&self) -> bool {
        !self.done && self.granted == 0
    }
}

/// A leaky-bucket rate limiter primitive.
///
/// Tokens refill lazily at `flow_rate` per second up to `max_burst_size`.
/// Requests that cannot be satisfied immediately enter a FIFO queue bounded
/// by `max_queue_size`; waiters are granted strictly in arrival order, so a
/// request never overtakes an earlier one even when the bucket briefly has
/// enough tokens for it.
///
/// Time is tokio's clock, which test code can pause and step.
pub struct TokenBucket {
    max_burst_size: f64,
    flow_rate: f64,
    max_queue_grant_size: f64,
    max_queue_size: Option<f64>,
    next_waiter_id: AtomicU64,
    deny_notify: Notify,
    inner: Mutex<Inner>,
}

struct Inner {
    available: f64,
    last_refill: Instant,
    queued: f64,
    waiters: VecDeque<Waiter>,
    denying: bool,
}

struct Waiter {
    id: u64,
    wanted: f64,
    tx: Option<oneshot::Sender<Wake>>,
}

enum Wake {
    Promoted,
    Denied,
}

impl TokenBucket {
    /// Creates a bucket from validated tuning.
    pub fn new(config: BucketConfig) -> Result<Self, Error> {
        if config.max_burst_size == 0 {
            return Err(Error::config("token bucket: maxBurstSize must be positive"));
        }
        if !config.flow_rate.is_finite() || config.flow_rate <= 0.0 {
            return Err(Error::config("token bucket: flowRate must be positive"));
        }
        let max_burst_size = config.max_burst_size as f64;
        let max_queue_grant_size = config
            .max_queue_grant_size
            .map(|size| (size as f64).min(max_burst_size))
            .unwrap_or(max_burst_size);
        if max_queue_grant_size <= 0.0 {
            return Err(Error::config(
                "token bucket: maxQueueGrantSize must be positive",
            ));
        }
        Ok(Self {
            max_burst_size,
            flow_rate: config.flow_rate,
            max_queue_grant_size,
            max_queue_size: config.max_queue_size.map(|size| size as f64),
            next_waiter_id: AtomicU64::new(0),
            deny_notify: Notify::new(),
            inner: Mutex::new(Inner {
                available: max_burst_size,
                last_refill: Instant::now(),
                queued: 0.0,
                waiters: VecDeque::new(),
                denying: false,
            }),
        })
    }

    /// Requests `amount` tokens, waiting in FIFO order if necessary.
    ///
    /// The grant is all-or-nothing: either the full amount or a denial.
    /// Denials happen when `amount` exceeds the burst size, when the wait
    /// queue is full, or after [`deny_all`](Self::deny_all).
    pub async fn acquire(&self, amount: u64) -> Grant {
        self.acquire_inner(amount, false).await
    }

    /// Requests up to `amount` tokens, accepting a partial grant.
    ///
    /// A queued waiter is granted at most `max_queue_grant_size` tokens in
    /// one turn; the remainder is the caller's to re-request, which re-enters
    /// the queue at the tail. This mode exists for the data bucket, where a
    /// large write is throttled in chunks rather than stalling everyone
    /// behind it.
    pub async fn acquire_up_to(&self, amount: u64) -> Grant {
        self.acquire_inner(amount, true).await
    }

    /// Terminates all current and future waits with a denial.
    pub fn deny_all(&self) {
        let mut inner = self.lock();
        inner.denying = true;
        inner.queued = 0.0;
        for mut waiter in inner.waiters.drain(..) {
            if let Some(tx) = waiter.tx.take() {
                let _ = tx.send(Wake::Denied);
            }
        }
        drop(inner);
        self.deny_notify.notify_waiters();
    }

    /// Tokens available at this instant, after a lazy refill.
    pub fn available(&self) -> u64 {
        let mut inner = self.lock();
        self.refill(&mut inner);
        inner.available as u64
    }

    /// Sum of tokens currently queued for.
    pub fn queued(&self) -> u64 {
        self.lock().queued as u64
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, inner: &mut Inner) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(inner.last_refill);
        inner.available =
            (inner.available + elapsed.as_secs_f64() * self.flow_rate).min(self.max_burst_size);
        inner.last_refill = now;
    }

    async fn acquire_inner(&self, amount: u64, partial: bool) -> Grant {
        let started = Instant::now();
        if amount == 0 {
            return Grant {
                done: true,
                granted: 0,
                wait: Duration::ZERO,
            };
        }
        let wanted = amount as f64;
        // Tokens that must be on hand before this waiter's turn completes.
        let target = if partial {
            wanted.min(self.max_queue_grant_size)
        } else {
            wanted
        };

        let (id, rx) = {
            let mut inner = self.lock();
            self.refill(&mut inner);
            if inner.denying {
                return Grant::denied(started.elapsed());
            }
            if inner.waiters.is_empty() && inner.available + TOKEN_EPSILON >= target {
                inner.available = (inner.available - target).max(0.0);
                return Grant {
                    done: target == wanted,
                    granted: target as u64,
                    wait: Duration::ZERO,
                };
            }
            if !partial && wanted > self.max_burst_size {
                // Can never be satisfied whole.
                return Grant::denied(started.elapsed());
            }
            if let Some(max_queue_size) = self.max_queue_size {
                if inner.queued + wanted > max_queue_size + TOKEN_EPSILON {
                    return Grant::denied(started.elapsed());
                }
            }
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            inner.queued += wanted;
            inner.waiters.push_back(Waiter {
                id,
                wanted,
                tx: Some(tx),
            });
            if inner.waiters.len() == 1 {
                promote_front(&mut inner);
            }
            (id, rx)
        };

        let mut guard = QueueGuard {
            bucket: self,
            id,
            armed: true,
        };

        match rx.await {
            Ok(Wake::Promoted) => {}
            Ok(Wake::Denied) | Err(_) => {
                // deny_all (or a defensive pop) already removed the entry.
                guard.armed = false;
                return Grant::denied(started.elapsed());
            }
        }

        // Head of the queue: sleep out the deficit, re-checking on each wake.
        loop {
            let deadline = {
                let mut inner = self.lock();
                if inner.denying {
                    guard.armed = false;
                    return Grant::denied(started.elapsed());
                }
                self.refill(&mut inner);
                if inner.available + TOKEN_EPSILON >= target {
                    inner.available = (inner.available - target).max(0.0);
                    inner.queued = (inner.queued - wanted).max(0.0);
                    inner.waiters.pop_front();
                    promote_front(&mut inner);
                    guard.armed = false;
                    return Grant {
                        done: target == wanted,
                        granted: target as u64,
                        wait: started.elapsed(),
                    };
                }
                let deficit = target - inner.available;
                Instant::now() + Duration::from_secs_f64(deficit / self.flow_rate + TOKEN_EPSILON)
            };

            let denied = self.deny_notify.notified();
            tokio::pin!(denied);
            denied.as_mut().enable();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = &mut denied => {}
            }
        }
    }

    fn abandon(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(index) = inner.waiters.iter().position(|waiter| waiter.id == id) {
            let waiter = inner.waiters.remove(index);
            if let Some(waiter) = waiter {
                inner.queued = (inner.queued - waiter.wanted).max(0.0);
            }
            if index == 0 {
                promote_front(&mut inner);
            }
        }
    }
}

/// Wakes the front waiter, skipping any whose caller has gone away.
fn promote_front(inner: &mut Inner) {
    while let Some(front) = inner.waiters.front_mut() {
        let Some(tx) = front.tx.take() else {
            // Already the active head.
            return;
        };
        if tx.send(Wake::Promoted).is_ok() {
            return;
        }
        let wanted = front.wanted;
        inner.waiters.pop_front();
        inner.queued = (inner.queued - wanted).max(0.0);
    }
}

struct QueueGuard<'a> {
    bucket: &'a TokenBucket,
    id: u64,
    armed: bool,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.abandon(self.id);
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TokenBucket")
            .field("max_burst_size", &self.max_burst_size)
            .field("flow_rate", &self.flow_rate)
            .field("available", &inner.available)
            .field("queued", &inner.queued)
            .field("waiters", &inner.waiters.len())
            .field("denying", &inner.denying)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bucket(config: BucketConfig) -> Arc<TokenBucket> {
        Arc::new(TokenBucket::new(config).unwrap())
    }

    #[test]
    fn rejects_bad_tuning() {
        assert!(TokenBucket::new(BucketConfig {
            max_burst_size: 0,
            flow_rate: 1.0,
            max_queue_grant_size: None,
            max_queue_size: None,
        })
        .is_err());
        assert!(TokenBucket::new(BucketConfig {
            max_burst_size: 10,
            flow_rate: 0.0,
            max_queue_grant_size: None,
            max_queue_size: None,
        })
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_satisfied_immediately() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 20,
            flow_rate: 5.0,
            max_queue_grant_size: None,
            max_queue_size: Some(100),
        });
        for _ in 0..20 {
            let grant = bucket.acquire(1).await;
            assert!(grant.done);
            assert_eq!(grant.wait, Duration::ZERO);
        }
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_first_request_waits_a_refill_interval() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 20,
            flow_rate: 5.0,
            max_queue_grant_size: None,
            max_queue_size: Some(100),
        });
        for _ in 0..20 {
            assert!(bucket.acquire(1).await.done);
        }
        let grant = bucket.acquire(1).await;
        assert!(grant.done);
        // One token at 5/s is 200ms away.
        assert!(grant.wait >= Duration::from_millis(195), "waited {:?}", grant.wait);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_beyond_queue_capacity_is_denied() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 20,
            flow_rate: 5.0,
            max_queue_grant_size: None,
            max_queue_size: Some(100),
        });

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..130 {
            let bucket = bucket.clone();
            tasks.spawn(async move { bucket.acquire(1).await });
        }

        let mut immediate = 0;
        let mut waited = 0;
        let mut denied = 0;
        while let Some(grant) = tasks.join_next().await {
            let grant = grant.unwrap();
            if grant.is_denied() {
                denied += 1;
            } else if grant.wait == Duration::ZERO {
                immediate += 1;
            } else {
                waited += 1;
            }
        }
        assert_eq!(immediate, 20);
        assert_eq!(waited, 100);
        assert_eq!(denied, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_complete_in_fifo_order() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 1,
            flow_rate: 10.0,
            max_queue_grant_size: None,
            max_queue_size: Some(100),
        });
        assert!(bucket.acquire(1).await.done);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..5u32 {
            let bucket = bucket.clone();
            let order = order.clone();
            tasks.spawn(async move {
                bucket.acquire(1).await;
                order.lock().unwrap().push(n);
            });
            // Give each task a chance to enqueue before the next spawns.
            tokio::task::yield_now().await;
        }
        while tasks.join_next().await.is_some() {}
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn available_never_exceeds_burst() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 10,
            flow_rate: 1000.0,
            max_queue_grant_size: None,
            max_queue_size: None,
        });
        assert!(bucket.acquire(10).await.done);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_full_request_is_denied() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 10,
            flow_rate: 1.0,
            max_queue_grant_size: None,
            max_queue_size: None,
        });
        assert!(bucket.acquire(11).await.is_denied());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_grants_are_clamped() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 100,
            flow_rate: 100.0,
            max_queue_grant_size: Some(30),
            max_queue_size: None,
        });
        let grant = bucket.acquire_up_to(80).await;
        assert!(!grant.done);
        assert_eq!(grant.granted, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn deny_all_wakes_every_waiter() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 1,
            flow_rate: 0.001,
            max_queue_grant_size: None,
            max_queue_size: Some(100),
        });
        assert!(bucket.acquire(1).await.done);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let bucket = bucket.clone();
            tasks.spawn(async move { bucket.acquire(1).await });
        }
        tokio::task::yield_now().await;
        bucket.deny_all();

        while let Some(grant) = tasks.join_next().await {
            assert!(grant.unwrap().is_denied());
        }
        assert!(bucket.acquire(1).await.is_denied());
        assert_eq!(bucket.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_head_does_not_stall_the_queue() {
        let bucket = bucket(BucketConfig {
            max_burst_size: 1,
            flow_rate: 10.0,
            max_queue_grant_size: None,
            max_queue_size: Some(100),
        });
        assert!(bucket.acquire(1).await.done);

        let head = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire(1).await })
        };
        tokio::task::yield_now().await;
        let follower = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire(1).await })
        };
        tokio::task::yield_now().await;

        head.abort();
        let grant = follower.await.unwrap();
        assert!(grant.done);
    }
}
