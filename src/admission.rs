//! Concurrency admission: a process-wide ceiling and a per-user ceiling,
//! plus a per-user submission quota consulted once per job.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::{AdmissionConfig, QuotaConfig};

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    #[error("over_capacity")]
    OverCapacity,
    #[error("user_quota")]
    UserQuota,
    #[error("quota_exceeded")]
    QuotaExceeded,
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    per_user: HashMap<String, usize>,
}

struct Inner {
    max_total: usize,
    max_per_user: usize,
    acquire_timeout: Duration,
    counters: Mutex<Counters>,
    released: Notify,
    next_ticket: AtomicU64,
}

impl Inner {
    fn try_take(&self, user: &str) -> Result<bool, Rejection> {
        let mut counters = self.counters.lock();
        let mine = counters.per_user.get(user).copied().unwrap_or(0);
        if mine >= self.max_per_user {
            return Err(Rejection::UserQuota);
        }
        if counters.total >= self.max_total {
            return Ok(false);
        }
        counters.total += 1;
        *counters.per_user.entry(user.to_string()).or_insert(0) += 1;
        Ok(true)
    }

    fn give_back(&self, user: &str) {
        {
            let mut counters = self.counters.lock();
            counters.total = counters.total.saturating_sub(1);
            if let Some(count) = counters.per_user.get_mut(user) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counters.per_user.remove(user);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub active: usize,
    pub max_concurrent_jobs: usize,
    pub per_user: HashMap<String, usize>,
}

/// Hands out [`AdmissionTicket`]s within both ceilings.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_total: config.max_concurrent_jobs,
                max_per_user: config.max_jobs_per_user,
                acquire_timeout: config.acquire_timeout(),
                counters: Mutex::new(Counters::default()),
                released: Notify::new(),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// Takes a slot for `user`.
    ///
    /// A full per-user ceiling is refused immediately. A full process-wide
    /// ceiling waits up to the configured timeout for a release.
    pub async fn acquire(&self, user: &str) -> Result<AdmissionTicket, Rejection> {
        let deadline = tokio::time::Instant::now() + self.inner.acquire_timeout;
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed.
            released.as_mut().enable();

            if self.inner.try_take(user)? {
                return Ok(self.ticket(user));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                debug!(user, "admission wait timed out");
                return Err(Rejection::OverCapacity);
            }
            if tokio::time::timeout(remaining, released).await.is_err() {
                // One last look: a release may have raced the deadline.
                if self.inner.try_take(user)? {
                    return Ok(self.ticket(user));
                }
                return Err(Rejection::OverCapacity);
            }
        }
    }

    /// Non-waiting variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self, user: &str) -> Result<AdmissionTicket, Rejection> {
        if self.inner.try_take(user)? {
            Ok(self.ticket(user))
        } else {
            Err(Rejection::OverCapacity)
        }
    }

    /// Explicit release. Dropping the ticket does the same.
    pub fn release(&self, ticket: AdmissionTicket) {
        drop(ticket);
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let counters = self.inner.counters.lock();
        AdmissionSnapshot {
            active: counters.total,
            max_concurrent_jobs: self.inner.max_total,
            per_user: counters.per_user.clone(),
        }
    }

    fn ticket(&self, user: &str) -> AdmissionTicket {
        let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        debug!(ticket = id, user, "admission ticket issued");
        AdmissionTicket {
            id,
            user: user.to_string(),
            inner: self.inner.clone(),
        }
    }
}

/// A held slot. Released exactly once, when dropped.
pub struct AdmissionTicket {
    id: u64,
    user: String,
    inner: Arc<Inner>,
}

impl AdmissionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

impl fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("id", &self.id)
            .field("user", &self.user)
            .finish()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        debug!(ticket = self.id, user = %self.user, "admission ticket released");
        self.inner.give_back(&self.user);
    }
}

/// Per-user submission quota beyond raw concurrency.
pub trait QuotaPolicy: Send + Sync {
    /// Counts one submission for `user`, or refuses it.
    fn try_consume(&self, user: &str) -> Result<(), Rejection>;
}

pub struct UnlimitedQuota;

impl QuotaPolicy for UnlimitedQuota {
    fn try_consume(&self, _user: &str) -> Result<(), Rejection> {
        Ok(())
    }
}

/// At most `max_jobs` submissions per user in any sliding `window`.
pub struct WindowedQuota {
    max_jobs: usize,
    window: Duration,
    history: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl WindowedQuota {
    pub fn new(max_jobs: usize, window: Duration) -> Self {
        Self {
            max_jobs,
            window,
            history: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.history.lock().len()
    }
}

impl QuotaPolicy for WindowedQuota {
    fn try_consume(&self, user: &str) -> Result<(), Rejection> {
        let now = Instant::now();
        let mut history = self.history.lock();
        // Users whose window has fully expired are forgotten.
        history.retain(|_, seen| {
            while seen
                .front()
                .is_some_and(|at| now.duration_since(*at) >= self.window)
            {
                seen.pop_front();
            }
            !seen.is_empty()
        });
        let used = history.get(user).map_or(0, VecDeque::len);
        if used >= self.max_jobs {
            return Err(Rejection::QuotaExceeded);
        }
        history.entry(user.to_string()).or_default().push_back(now);
        Ok(())
    }
}

/// Builds the quota policy described by `[quota]`.
pub fn quota_from_config(config: &QuotaConfig) -> Arc<dyn QuotaPolicy> {
    match config.max_jobs_per_window {
        Some(max) => Arc::new(WindowedQuota::new(
            max as usize,
            Duration::from_secs(config.window_secs),
        )),
        None => Arc::new(UnlimitedQuota),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(total: usize, per_user: usize, timeout_ms: u64) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            max_concurrent_jobs: total,
            max_jobs_per_user: per_user,
            acquire_timeout_ms: timeout_ms,
        })
    }

    #[tokio::test]
    async fn tickets_count_against_both_ceilings() {
        let admission = controller(4, 2, 0);
        let a1 = admission.acquire("alice").await.unwrap();
        let _a2 = admission.acquire("alice").await.unwrap();
        assert_eq!(admission.acquire("alice").await.unwrap_err(), Rejection::UserQuota);

        let _b1 = admission.acquire("bob").await.unwrap();
        let snapshot = admission.snapshot();
        assert_eq!(snapshot.active, 3);
        assert_eq!(snapshot.per_user["alice"], 2);

        admission.release(a1);
        assert_eq!(admission.snapshot().active, 2);
        assert!(admission.try_acquire("alice").is_ok());
    }

    #[tokio::test]
    async fn per_user_ceiling_is_refused_without_waiting() {
        let admission = controller(10, 1, 60_000);
        let _held = admission.acquire("alice").await.unwrap();
        let started = Instant::now();
        assert_eq!(admission.acquire("alice").await.unwrap_err(), Rejection::UserQuota);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_timeout_rejects_immediately_when_full() {
        let admission = controller(1, 1, 0);
        let _held = admission.acquire("alice").await.unwrap();
        assert_eq!(admission.acquire("bob").await.unwrap_err(), Rejection::OverCapacity);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_admitted_when_a_slot_frees_up() {
        let admission = controller(1, 1, 5_000);
        let held = admission.acquire("alice").await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire("bob").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        let ticket = waiter.await.unwrap().unwrap();
        assert_eq!(ticket.user(), "bob");
        assert_eq!(admission.snapshot().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gives_up_at_the_deadline() {
        let admission = controller(1, 1, 200);
        let _held = admission.acquire("alice").await.unwrap();
        assert_eq!(admission.acquire("bob").await.unwrap_err(), Rejection::OverCapacity);
        assert_eq!(admission.snapshot().active, 1);
    }

    #[tokio::test]
    async fn dropping_tickets_releases_exactly_once() {
        let admission = controller(8, 8, 0);
        let tickets: Vec<_> = (0..8)
            .map(|i| admission.try_acquire(&format!("user{}", i % 3)).unwrap())
            .collect();
        assert_eq!(admission.snapshot().active, 8);
        drop(tickets);
        let snapshot = admission.snapshot();
        assert_eq!(snapshot.active, 0);
        assert!(snapshot.per_user.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_holds_nothing() {
        let admission = controller(1, 1, 10_000);
        let _held = admission.acquire("alice").await.unwrap();
        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire("bob").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(admission.snapshot().active, 1);
        assert!(!admission.snapshot().per_user.contains_key("bob"));
    }

    #[test]
    fn windowed_quota_limits_submissions_per_user() {
        let quota = WindowedQuota::new(2, Duration::from_secs(3600));
        assert!(quota.try_consume("alice").is_ok());
        assert!(quota.try_consume("alice").is_ok());
        assert_eq!(quota.try_consume("alice"), Err(Rejection::QuotaExceeded));
        assert!(quota.try_consume("bob").is_ok());
    }

    #[test]
    fn expired_submissions_leave_the_window() {
        let quota = WindowedQuota::new(1, Duration::ZERO);
        assert!(quota.try_consume("alice").is_ok());
        assert!(quota.try_consume("alice").is_ok());
    }

    #[test]
    fn windowed_quota_forgets_users_with_nothing_in_the_window() {
        let quota = WindowedQuota::new(1, Duration::ZERO);
        for user in ["alice", "bob", "carol"] {
            assert!(quota.try_consume(user).is_ok());
        }
        assert_eq!(quota.tracked_users(), 1);

        let closed = WindowedQuota::new(0, Duration::from_secs(3600));
        assert_eq!(closed.try_consume("dave"), Err(Rejection::QuotaExceeded));
        assert_eq!(closed.tracked_users(), 0);
    }

    #[test]
    fn rejection_displays_snake_case() {
        assert_eq!(Rejection::OverCapacity.to_string(), "over_capacity");
        assert_eq!(Rejection::UserQuota.to_string(), "user_quota");
        assert_eq!(Rejection::QuotaExceeded.to_string(), "quota_exceeded");
    }
}
