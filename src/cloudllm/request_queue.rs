//! Priority-ordered concurrency gate (§4.4), independent of the rate limiter (§4.3).
//!
//! Bounds how many async operations (typically provider streams, via
//! [`crate::cloudllm::retry_stream::RetryableStream`]) run at once. Pending items are ordered
//! by priority, each admitted item gets its own [`AbortSignal`] plus a timeout timer wired to
//! that same signal, and a `status` field on every item gates completion so a cancelled or
//! timed-out item can never also resolve successfully (§4.4 invariant).

use crate::cloudllm::cancellation::{AbortController, AbortSignal};
use crate::cloudllm::rate_limiter::Priority;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Active,
    Completed,
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
pub enum QueueError {
    Cancelled,
    TimedOut,
}

pub type Task<T> = Box<dyn FnOnce(AbortSignal) -> BoxFuture<'static, T> + Send>;

struct PendingEntry<T> {
    id: u64,
    priority: Priority,
    sequence: u64,
    timeout_ms: u64,
    task: Task<T>,
    responder: oneshot::Sender<Result<T, QueueError>>,
    status: Arc<Mutex<Status>>,
}

struct ActiveEntry {
    controller: AbortController,
    status: Arc<Mutex<Status>>,
}

struct State<T> {
    pending: Vec<PendingEntry<T>>,
    active: HashMap<u64, ActiveEntry>,
    next_id: u64,
    next_sequence: u64,
}

impl<T> State<T> {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            active: HashMap::new(),
            next_id: 0,
            next_sequence: 0,
        }
    }
}

/// A handle to one enqueued item (§4.4: `{id, promise, cancel()}`).
pub struct QueueHandle<T> {
    pub id: u64,
    receiver: oneshot::Receiver<Result<T, QueueError>>,
    status: Arc<Mutex<Status>>,
    controller_slot: Arc<Mutex<Option<AbortController>>>,
}

impl<T> QueueHandle<T> {
    pub async fn wait(self) -> Result<T, QueueError> {
        self.receiver.await.unwrap_or(Err(QueueError::Cancelled))
    }

    /// Cancel a pending item (removed, rejected) or abort an active one's signal — the task
    /// closure is responsible for observing the signal and returning promptly (§4.4).
    pub fn cancel(&self) {
        let mut status = self.status.lock().unwrap();
        if *status == Status::Pending || *status == Status::Active {
            *status = Status::Cancelled;
        }
        drop(status);
        if let Some(controller) = self.controller_slot.lock().unwrap().as_ref() {
            controller.abort();
        }
    }
}

/// The concurrency gate itself (§4.4). `T` is the task's output type; a queue is typed per
/// call site, matching how each provider stream already has a known item shape.
pub struct RequestQueue<T> {
    concurrency: usize,
    default_timeout_ms: u64,
    state: Mutex<State<T>>,
    drain_notify: Notify,
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(concurrency: usize, default_timeout_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            concurrency,
            default_timeout_ms,
            state: Mutex::new(State::new()),
            drain_notify: Notify::new(),
        })
    }

    /// Enqueue `task`; returns a [`QueueHandle`] whose `wait()` resolves once the task
    /// completes, is cancelled, or times out.
    pub fn enqueue(self: &Arc<Self>, task: Task<T>, priority: Priority, timeout_ms: Option<u64>) -> QueueHandle<T> {
        let (tx, rx) = oneshot::channel();
        let status = Arc::new(Mutex::new(Status::Pending));
        let controller_slot = Arc::new(Mutex::new(None));
        let id;
        {
            let mut guard = self.state.lock().unwrap();
            id = guard.next_id;
            guard.next_id += 1;
            let sequence = guard.next_sequence;
            guard.next_sequence += 1;
            let entry = PendingEntry {
                id,
                priority,
                sequence,
                timeout_ms: timeout_ms.unwrap_or(self.default_timeout_ms),
                task,
                responder: tx,
                status: status.clone(),
            };
            let pos = guard
                .pending
                .iter()
                .position(|e| (e.priority, e.sequence) > (entry.priority, entry.sequence))
                .unwrap_or(guard.pending.len());
            guard.pending.insert(pos, entry);
        }
        log::debug!("request queue: enqueued item {id}");
        self.dispatch();
        QueueHandle {
            id,
            receiver: rx,
            status,
            controller_slot,
        }
    }

    /// Try to admit pending items while under the concurrency cap.
    fn dispatch(self: &Arc<Self>) {
        loop {
            let entry_opt = {
                let mut guard = self.state.lock().unwrap();
                if guard.active.len() >= self.concurrency || guard.pending.is_empty() {
                    None
                } else {
                    // Skip entries already cancelled while pending.
                    let pos = guard.pending.iter().position(|e| *e.status.lock().unwrap() != Status::Cancelled);
                    pos.map(|p| guard.pending.remove(p))
                }
            };
            let Some(entry) = entry_opt else { break };
            {
                let mut s = entry.status.lock().unwrap();
                if *s == Status::Cancelled {
                    continue;
                }
                *s = Status::Active;
            }
            let controller = AbortController::new();
            {
                let mut guard = self.state.lock().unwrap();
                guard.active.insert(
                    entry.id,
                    ActiveEntry {
                        controller: controller.clone(),
                        status: entry.status.clone(),
                    },
                );
            }
            self.run_entry(entry, controller);
        }
    }

    fn run_entry(self: &Arc<Self>, entry: PendingEntry<T>, controller: AbortController) {
        let queue = Arc::clone(self);
        let PendingEntry {
            id,
            timeout_ms,
            task,
            responder,
            status,
            ..
        } = entry;
        let signal = controller.signal();
        tokio::spawn(async move {
            let timeout_signal = signal.clone();
            let timeout_controller = controller.clone();
            let timeout_handle = tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                        timeout_controller.abort();
                    }
                    _ = timeout_signal.cancelled() => {}
                }
            });

            let output = task(signal.clone()).await;
            timeout_handle.abort();

            let mut s = status.lock().unwrap();
            let final_status = if *s == Status::Cancelled {
                Status::Cancelled
            } else if signal.is_aborted() {
                Status::TimedOut
            } else {
                Status::Completed
            };
            *s = final_status;
            drop(s);

            match final_status {
                Status::Completed => {
                    let _ = responder.send(Ok(output));
                }
                Status::Cancelled => {
                    let _ = responder.send(Err(QueueError::Cancelled));
                }
                Status::TimedOut => {
                    let _ = responder.send(Err(QueueError::TimedOut));
                }
                Status::Pending | Status::Active => unreachable!(),
            }

            {
                let mut guard = queue.state.lock().unwrap();
                guard.active.remove(&id);
            }
            queue.drain_notify.notify_waiters();
            queue.dispatch();
        });
    }

    /// Reject everything — pending items immediately, active items by aborting their signal
    /// (§4.4: "force-rejected — any subsequent resolution is ignored").
    pub fn cancel_all(&self) {
        let mut guard = self.state.lock().unwrap();
        for entry in guard.pending.drain(..) {
            *entry.status.lock().unwrap() = Status::Cancelled;
            let _ = entry.responder.send(Err(QueueError::Cancelled));
        }
        for (_, active) in guard.active.iter() {
            *active.status.lock().unwrap() = Status::Cancelled;
            active.controller.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Resolves once `pending == 0 && active == 0` (§4.4).
    pub async fn drain(self: &Arc<Self>) {
        loop {
            if self.pending_count() == 0 && self.active_count() == 0 {
                return;
            }
            self.drain_notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_task(value: u32, sleep_ms: u64) -> Task<u32> {
        Box::new(move |_signal| Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            value
        }))
    }

    #[tokio::test]
    async fn respects_concurrency_cap() {
        let queue: Arc<RequestQueue<u32>> = RequestQueue::new(1, 5_000);
        let h1 = queue.enqueue(make_task(1, 50), Priority::Normal, None);
        let h2 = queue.enqueue(make_task(2, 1), Priority::Normal, None);
        assert_eq!(queue.active_count(), 1);
        assert_eq!(h1.wait().await.unwrap(), 1);
        assert_eq!(h2.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_pending_item_rejects_it() {
        let queue: Arc<RequestQueue<u32>> = RequestQueue::new(1, 5_000);
        let _blocker = queue.enqueue(make_task(1, 200), Priority::Normal, None);
        let pending = queue.enqueue(make_task(2, 1), Priority::Normal, None);
        pending.cancel();
        let result = pending.wait().await;
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }

    #[tokio::test]
    async fn drain_resolves_once_empty() {
        let queue: Arc<RequestQueue<u32>> = RequestQueue::new(2, 5_000);
        let h = queue.enqueue(make_task(1, 1), Priority::Normal, None);
        h.wait().await.unwrap();
        queue.drain().await;
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn timeout_rejects_item() {
        let queue: Arc<RequestQueue<u32>> = RequestQueue::new(1, 10);
        let task: Task<u32> = Box::new(|signal| Box::pin(async move {
            signal.cancelled().await;
            0
        }));
        let handle = queue.enqueue(task, Priority::Normal, Some(10));
        let result = handle.wait().await;
        assert!(matches!(result, Err(QueueError::TimedOut)));
    }
}
