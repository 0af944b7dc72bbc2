//! Token-bucket rate limiter with sliding-window tracking (§4.3).
//!
//! Two rolling 60-second windows — one counting requests, one summing declared token weights
//! — gate how many calls a provider id may accept per minute. The fast path records directly
//! when capacity is available; the slow path parks the caller on a priority-ordered waiter
//! queue drained by a periodic background tick, grounded on the `DashMap`-backed singleton
//! pattern in `http_client_pool.rs` but replacing the pool's plain mutex with an explicit
//! waiter list so queued callers can be cancelled.

use crate::cloudllm::cancellation::AbortSignal;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::interval;

/// Caller-declared priority for queued `acquire` calls (§4.3: "high<normal<low, stable within
/// priority").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

#[derive(Debug)]
pub enum AcquireError {
    Cancelled,
    Destroyed,
}

struct WindowEvent {
    at: Instant,
    weight: u64,
}

struct Waiter {
    tokens: u64,
    priority: Priority,
    sequence: u64,
    responder: oneshot::Sender<Result<(), AcquireError>>,
}

struct State {
    requests: VecDeque<WindowEvent>,
    tokens: VecDeque<WindowEvent>,
    waiters: Vec<Waiter>,
    next_sequence: u64,
    destroyed: bool,
}

impl State {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
            waiters: Vec::new(),
            next_sequence: 0,
            destroyed: false,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while matches!(self.requests.front(), Some(e) if now.duration_since(e.at) >= window) {
            self.requests.pop_front();
        }
        while matches!(self.tokens.front(), Some(e) if now.duration_since(e.at) >= window) {
            self.tokens.pop_front();
        }
    }

    fn token_sum(&self) -> u64 {
        self.tokens.iter().map(|e| e.weight).sum()
    }
}

/// Per-provider token-bucket limiter (§4.3). `requests_per_minute` and `tokens_per_minute`
/// bound the two rolling windows; `acquire` suspends the caller when capacity is unavailable
/// rather than busy-waiting (§5).
pub struct RateLimiter {
    requests_per_minute: u64,
    tokens_per_minute: u64,
    window: Duration,
    state: Mutex<State>,
}

const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

impl RateLimiter {
    pub fn new(requests_per_minute: u64, tokens_per_minute: u64) -> std::sync::Arc<Self> {
        let limiter = std::sync::Arc::new(Self {
            requests_per_minute,
            tokens_per_minute,
            window: Duration::from_secs(60),
            state: Mutex::new(State::new()),
        });
        let weak = std::sync::Arc::downgrade(&limiter);
        tokio::spawn(async move {
            let mut ticker = interval(DRAIN_INTERVAL);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(limiter) => limiter.drain(),
                    None => return,
                }
            }
        });
        limiter
    }

    /// `true` iff granting `tokens` more would stay within both windows.
    pub fn has_capacity(&self, tokens: u64) -> bool {
        let mut guard = self.state.lock().unwrap();
        let now = Instant::now();
        guard.prune(now, self.window);
        (guard.requests.len() as u64) < self.requests_per_minute
            && guard.token_sum() + tokens <= self.tokens_per_minute
    }

    fn record(guard: &mut State, now: Instant, tokens: u64) {
        guard.requests.push_back(WindowEvent { at: now, weight: 1 });
        guard.tokens.push_back(WindowEvent { at: now, weight: tokens });
    }

    /// Acquire capacity for `tokens` tokens at the given `priority`, suspending the caller if
    /// the fast path is unavailable (§4.3). Cancels with [`AcquireError::Cancelled`] if
    /// `signal` fires first.
    pub async fn acquire(&self, tokens: u64, priority: Priority, signal: &AbortSignal) -> Result<(), AcquireError> {
        {
            let mut guard = self.state.lock().unwrap();
            if guard.destroyed {
                return Err(AcquireError::Destroyed);
            }
            let now = Instant::now();
            guard.prune(now, self.window);
            if (guard.requests.len() as u64) < self.requests_per_minute
                && guard.token_sum() + tokens <= self.tokens_per_minute
            {
                Self::record(&mut guard, now, tokens);
                log::debug!("rate limiter: fast-path grant of {tokens} tokens");
                return Ok(());
            }
        }

        log::warn!("rate limiter: queuing request for {tokens} tokens at priority {priority:?}");
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.state.lock().unwrap();
            let sequence = guard.next_sequence;
            guard.next_sequence += 1;
            let waiter = Waiter {
                tokens,
                priority,
                sequence,
                responder: tx,
            };
            let pos = guard
                .waiters
                .iter()
                .position(|w| (w.priority, w.sequence) > (waiter.priority, waiter.sequence))
                .unwrap_or(guard.waiters.len());
            guard.waiters.insert(pos, waiter);
        }

        tokio::select! {
            result = rx => result.unwrap_or(Err(AcquireError::Destroyed)),
            _ = signal.cancelled() => Err(AcquireError::Cancelled),
        }
    }

    /// Drain step: grant capacity to queued waiters in priority order while it remains
    /// available (§4.3).
    fn drain(&self) {
        let mut guard = self.state.lock().unwrap();
        if guard.destroyed || guard.waiters.is_empty() {
            return;
        }
        let now = Instant::now();
        guard.prune(now, self.window);
        loop {
            let Some(head) = guard.waiters.first() else {
                break;
            };
            let has_capacity = (guard.requests.len() as u64) < self.requests_per_minute
                && guard.token_sum() + head.tokens <= self.tokens_per_minute;
            if !has_capacity {
                break;
            }
            let waiter = guard.waiters.remove(0);
            Self::record(&mut guard, now, waiter.tokens);
            let _ = waiter.responder.send(Ok(()));
        }
    }

    /// Drop both windows and reject every queued waiter (§4.3).
    pub fn reset(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.requests.clear();
        guard.tokens.clear();
        for waiter in guard.waiters.drain(..) {
            let _ = waiter.responder.send(Err(AcquireError::Destroyed));
        }
    }

    /// Reject every queued waiter and disable further use (§4.3).
    pub fn destroy(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.destroyed = true;
        for waiter in guard.waiters.drain(..) {
            let _ = waiter.responder.send(Err(AcquireError::Destroyed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_path_grants_within_capacity() {
        let limiter = RateLimiter::new(10, 1_000);
        let signal = AbortSignal::never();
        for _ in 0..10 {
            limiter.acquire(10, Priority::Normal, &signal).await.unwrap();
        }
        assert!(!limiter.has_capacity(1));
    }

    #[tokio::test]
    async fn acquire_observes_cancellation() {
        let limiter = RateLimiter::new(1, 10);
        let signal = AbortSignal::never();
        limiter.acquire(10, Priority::Normal, &signal).await.unwrap();

        let controller = crate::cloudllm::cancellation::AbortController::new();
        let cancel_signal = controller.signal();
        controller.abort();
        let result = limiter.acquire(10, Priority::Normal, &cancel_signal).await;
        assert!(matches!(result, Err(AcquireError::Cancelled)));
    }

    #[test]
    fn reset_clears_windows() {
        let limiter_arc = RateLimiter::new(1, 10);
        {
            let mut guard = limiter_arc.state.lock().unwrap();
            guard.requests.push_back(WindowEvent { at: Instant::now(), weight: 1 });
        }
        limiter_arc.reset();
        assert!(limiter_arc.has_capacity(10));
    }

    #[test]
    fn priority_ordering_is_stable() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }
}
