//! CommHub: the inter-agent communication bus (§4.9).
//!
//! Topic-scoped subscriptions, direct send, broadcast, request/reply correlation, ACL-guarded
//! shared regions, barriers, and result collectors. Grounded on `resource_protocol.rs`'s
//! capability-gated shared-state shape (ACL checks ahead of mutation) combined with
//! `request_queue.rs`'s oneshot-per-waiter pattern for anything that resolves later than the
//! call that created it (requests, barrier arrivals, collector waits).

use crate::cloudllm::rate_limiter::Priority;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone)]
pub enum CommHubError {
    Timeout,
    NoSubscriber { to: String, topic: String },
    UnknownRegion { name: String },
    AclDenied { name: String, agent_id: String },
    UnknownBarrier { name: String },
    UnknownCollector { id: String },
    Destroyed,
}

impl fmt::Display for CommHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommHubError::Timeout => write!(f, "operation timed out"),
            CommHubError::NoSubscriber { to, topic } => write!(f, "no subscriber for ({to}, {topic})"),
            CommHubError::UnknownRegion { name } => write!(f, "no shared region named {name}"),
            CommHubError::AclDenied { name, agent_id } => write!(f, "{agent_id} is not in the ACL for region {name}"),
            CommHubError::UnknownBarrier { name } => write!(f, "no barrier named {name}"),
            CommHubError::UnknownCollector { id } => write!(f, "no collector with id {id}"),
            CommHubError::Destroyed => write!(f, "hub has been destroyed"),
        }
    }
}

impl std::error::Error for CommHubError {}

/// A message on the bus (§3 Envelope).
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    pub from: String,
    pub to: String,
    pub topic: String,
    pub payload: Value,
    pub priority: Priority,
    pub correlation_id: Option<String>,
}

pub const BROADCAST_TARGET: &str = "*broadcast";

/// Receives envelopes delivered to a subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, envelope: &Envelope);
}

/// An ACL-guarded key/value map (§3 SharedRegion).
struct SharedRegion {
    #[allow(dead_code)]
    owner_id: String,
    acl: HashSet<String>,
    data: HashMap<String, Value>,
}

struct Barrier {
    participants: HashSet<String>,
    arrived: HashSet<String>,
    waiters: Vec<oneshot::Sender<()>>,
}

struct Collector {
    expected: usize,
    results: HashMap<String, Value>,
    waiters: Vec<oneshot::Sender<HashMap<String, Value>>>,
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<(String, String), Arc<dyn Subscriber>>,
    pending_requests: HashMap<String, oneshot::Sender<Envelope>>,
    regions: HashMap<String, SharedRegion>,
    barriers: HashMap<String, Barrier>,
    collectors: HashMap<String, Collector>,
    destroyed: bool,
}

/// The CommHub (§4.9).
pub struct CommHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
}

impl Default for CommHub {
    fn default() -> Self {
        Self::new()
    }
}

impl CommHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }

    /// Register `handler` for `(agent_id, topic)`, replacing any prior subscription with the
    /// same key. Returns a token that can be passed to [`CommHub::unsubscribe`].
    pub async fn subscribe(&self, agent_id: impl Into<String>, topic: impl Into<String>, handler: Arc<dyn Subscriber>) -> (String, String) {
        let agent_id = agent_id.into();
        let topic = topic.into();
        let mut state = self.state.lock().await;
        state.subscribers.insert((agent_id.clone(), topic.clone()), handler);
        (agent_id, topic)
    }

    pub async fn unsubscribe(&self, key: &(String, String)) -> bool {
        self.state.lock().await.subscribers.remove(key).is_some()
    }

    fn build_envelope(&self, from: &str, to: &str, topic: &str, payload: Value, priority: Priority, correlation_id: Option<String>) -> Envelope {
        Envelope {
            id: self.fresh_id("env"),
            from: from.to_string(),
            to: to.to_string(),
            topic: topic.to_string(),
            payload,
            priority,
            correlation_id,
        }
    }

    /// Synchronous delivery to the single subscriber `(to, topic)` if present (§4.9).
    pub async fn send(&self, from: &str, to: &str, topic: &str, payload: Value, priority: Priority) -> Result<(), CommHubError> {
        let envelope = self.build_envelope(from, to, topic, payload, priority, None);
        let handler = {
            let state = self.state.lock().await;
            if state.destroyed {
                return Err(CommHubError::Destroyed);
            }
            state.subscribers.get(&(to.to_string(), topic.to_string())).cloned()
        };
        match handler {
            Some(handler) => {
                handler.handle(&envelope).await;
                Ok(())
            }
            None => Err(CommHubError::NoSubscriber { to: to.to_string(), topic: topic.to_string() }),
        }
    }

    /// Deliver to every subscriber of `topic` except `from` (§4.9).
    pub async fn broadcast(&self, from: &str, topic: &str, payload: Value, priority: Priority) -> usize {
        let envelope = self.build_envelope(from, BROADCAST_TARGET, topic, payload, priority, None);
        let targets: Vec<Arc<dyn Subscriber>> = {
            let state = self.state.lock().await;
            state
                .subscribers
                .iter()
                .filter(|((agent_id, sub_topic), _)| sub_topic == topic && agent_id != from)
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in &targets {
            handler.handle(&envelope).await;
        }
        targets.len()
    }

    /// Send with a fresh correlation id, resolving once [`CommHub::reply`] is called with the
    /// same id, or rejecting on timeout (§4.9).
    pub async fn request(&self, to: &str, topic: &str, payload: Value, from: &str, timeout_ms: u64) -> Result<Envelope, CommHubError> {
        let correlation_id = self.fresh_id("corr");
        let envelope = self.build_envelope(from, to, topic, payload, Priority::Normal, Some(correlation_id.clone()));
        let (tx, rx) = oneshot::channel();
        let handler = {
            let mut state = self.state.lock().await;
            if state.destroyed {
                return Err(CommHubError::Destroyed);
            }
            state.pending_requests.insert(correlation_id.clone(), tx);
            state.subscribers.get(&(to.to_string(), topic.to_string())).cloned()
        };
        let Some(handler) = handler else {
            self.state.lock().await.pending_requests.remove(&correlation_id);
            return Err(CommHubError::NoSubscriber { to: to.to_string(), topic: topic.to_string() });
        };
        handler.handle(&envelope).await;
        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.state.lock().await.pending_requests.remove(&correlation_id);
                Err(CommHubError::Timeout)
            }
        }
    }

    /// Complete the pending [`CommHub::request`] matching `correlation_id`.
    pub async fn reply(&self, correlation_id: &str, from: &str, topic: &str, payload: Value) -> bool {
        let tx = self.state.lock().await.pending_requests.remove(correlation_id);
        match tx {
            Some(tx) => {
                let envelope = self.build_envelope(from, "*requester", topic, payload, Priority::Normal, Some(correlation_id.to_string()));
                tx.send(envelope).is_ok()
            }
            None => false,
        }
    }

    pub async fn create_region(&self, name: impl Into<String>, owner: impl Into<String>, acl: Vec<String>) {
        let name = name.into();
        let owner_id = owner.into();
        let mut acl_set: HashSet<String> = acl.into_iter().collect();
        acl_set.insert(owner_id.clone());
        self.state.lock().await.regions.insert(
            name,
            SharedRegion { owner_id, acl: acl_set, data: HashMap::new() },
        );
    }

    pub async fn read(&self, name: &str, key: &str) -> Result<Option<Value>, CommHubError> {
        let state = self.state.lock().await;
        let region = state.regions.get(name).ok_or_else(|| CommHubError::UnknownRegion { name: name.to_string() })?;
        Ok(region.data.get(key).cloned())
    }

    pub async fn write(&self, name: &str, key: &str, value: Value, writer_id: &str) -> Result<(), CommHubError> {
        let mut state = self.state.lock().await;
        let region = state.regions.get_mut(name).ok_or_else(|| CommHubError::UnknownRegion { name: name.to_string() })?;
        if !region.acl.contains(writer_id) {
            return Err(CommHubError::AclDenied { name: name.to_string(), agent_id: writer_id.to_string() });
        }
        region.data.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn create_barrier(&self, name: impl Into<String>, participants: Vec<String>) {
        self.state.lock().await.barriers.insert(
            name.into(),
            Barrier { participants: participants.into_iter().collect(), arrived: HashSet::new(), waiters: Vec::new() },
        );
    }

    /// Resolves once every participant has called this for `name` (§4.9).
    pub async fn arrive_at_barrier(&self, name: &str, agent_id: &str) -> Result<(), CommHubError> {
        let rx = {
            let mut state = self.state.lock().await;
            let barrier = state.barriers.get_mut(name).ok_or_else(|| CommHubError::UnknownBarrier { name: name.to_string() })?;
            barrier.arrived.insert(agent_id.to_string());
            if barrier.arrived.is_superset(&barrier.participants) {
                for waiter in barrier.waiters.drain(..) {
                    let _ = waiter.send(());
                }
                None
            } else {
                let (tx, rx) = oneshot::channel();
                barrier.waiters.push(tx);
                Some(rx)
            }
        };
        match rx {
            Some(rx) => rx.await.map_err(|_| CommHubError::Destroyed),
            None => Ok(()),
        }
    }

    pub async fn create_collector(&self, expected: usize) -> String {
        let id = self.fresh_id("collector");
        self.state.lock().await.collectors.insert(id.clone(), Collector { expected, results: HashMap::new(), waiters: Vec::new() });
        id
    }

    pub async fn submit_result(&self, id: &str, from: &str, value: Value) -> Result<(), CommHubError> {
        let mut state = self.state.lock().await;
        let collector = state.collectors.get_mut(id).ok_or_else(|| CommHubError::UnknownCollector { id: id.to_string() })?;
        collector.results.insert(from.to_string(), value);
        if collector.results.len() >= collector.expected {
            let results = collector.results.clone();
            for waiter in collector.waiters.drain(..) {
                let _ = waiter.send(results.clone());
            }
        }
        Ok(())
    }

    /// Resolves with every submitted result once `expected` submissions have arrived, or
    /// rejects on timeout (§4.9).
    pub async fn wait_for_all(&self, id: &str, timeout_ms: u64) -> Result<HashMap<String, Value>, CommHubError> {
        let rx = {
            let mut state = self.state.lock().await;
            let collector = state.collectors.get_mut(id).ok_or_else(|| CommHubError::UnknownCollector { id: id.to_string() })?;
            if collector.results.len() >= collector.expected {
                return Ok(collector.results.clone());
            }
            let (tx, rx) = oneshot::channel();
            collector.waiters.push(tx);
            rx
        };
        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(results)) => Ok(results),
            _ => Err(CommHubError::Timeout),
        }
    }

    /// Cancels every pending request, barrier, and collector by dropping their senders, which
    /// rejects the awaiting futures (§4.9).
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        state.destroyed = true;
        state.pending_requests.clear();
        state.barriers.clear();
        state.collectors.clear();
        state.subscribers.clear();
        state.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingSubscriber {
        received: Arc<TokioMutex<Vec<Envelope>>>,
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn handle(&self, envelope: &Envelope) {
            self.received.lock().await.push(envelope.clone());
        }
    }

    struct ReplyingSubscriber {
        hub: Arc<CommHub>,
    }

    #[async_trait]
    impl Subscriber for ReplyingSubscriber {
        async fn handle(&self, envelope: &Envelope) {
            if let Some(correlation_id) = &envelope.correlation_id {
                self.hub.reply(correlation_id, &envelope.to, &envelope.topic, serde_json::json!({"ack": true})).await;
            }
        }
    }

    #[tokio::test]
    async fn send_delivers_only_to_matching_subscriber() {
        let hub = CommHub::new();
        let received = Arc::new(TokioMutex::new(Vec::new()));
        hub.subscribe("worker", "jobs", Arc::new(RecordingSubscriber { received: received.clone() })).await;
        hub.send("root", "worker", "jobs", serde_json::json!({"n": 1}), Priority::Normal).await.unwrap();
        assert_eq!(received.lock().await.len(), 1);

        let err = hub.send("root", "nobody", "jobs", serde_json::json!({}), Priority::Normal).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let hub = CommHub::new();
        let a = Arc::new(TokioMutex::new(Vec::new()));
        let b = Arc::new(TokioMutex::new(Vec::new()));
        hub.subscribe("a", "news", Arc::new(RecordingSubscriber { received: a.clone() })).await;
        hub.subscribe("b", "news", Arc::new(RecordingSubscriber { received: b.clone() })).await;
        let delivered = hub.broadcast("a", "news", serde_json::json!({}), Priority::Low).await;
        assert_eq!(delivered, 1);
        assert!(a.lock().await.is_empty());
        assert_eq!(b.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn request_resolves_on_reply() {
        let hub = Arc::new(CommHub::new());
        hub.subscribe("worker", "ping", Arc::new(ReplyingSubscriber { hub: hub.clone() })).await;
        let envelope = hub.request("worker", "ping", serde_json::json!({}), "root", 1_000).await.unwrap();
        assert_eq!(envelope.payload, serde_json::json!({"ack": true}));
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let hub = CommHub::new();
        struct SilentSubscriber;
        #[async_trait]
        impl Subscriber for SilentSubscriber {
            async fn handle(&self, _envelope: &Envelope) {}
        }
        hub.subscribe("worker", "ping", Arc::new(SilentSubscriber)).await;
        let result = hub.request("worker", "ping", serde_json::json!({}), "root", 20).await;
        assert!(matches!(result, Err(CommHubError::Timeout)));
    }

    #[tokio::test]
    async fn shared_region_write_enforces_acl() {
        let hub = CommHub::new();
        hub.create_region("scratch", "owner", vec!["writer".to_string()]).await;
        assert!(hub.write("scratch", "k", serde_json::json!(1), "writer").await.is_ok());
        assert!(hub.write("scratch", "k", serde_json::json!(2), "intruder").await.is_err());
        assert_eq!(hub.read("scratch", "k").await.unwrap(), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn barrier_resolves_only_after_all_arrive() {
        let hub = Arc::new(CommHub::new());
        hub.create_barrier("sync", vec!["a".to_string(), "b".to_string()]).await;
        let hub2 = hub.clone();
        let handle = tokio::spawn(async move { hub2.arrive_at_barrier("sync", "a").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        hub.arrive_at_barrier("sync", "b").await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn collector_waits_for_expected_count() {
        let hub = Arc::new(CommHub::new());
        let id = hub.create_collector(2).await;
        hub.submit_result(&id, "a", serde_json::json!(1)).await.unwrap();
        let hub2 = hub.clone();
        let id2 = id.clone();
        let handle = tokio::spawn(async move { hub2.wait_for_all(&id2, 1_000).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.submit_result(&id, "b", serde_json::json!(2)).await.unwrap();
        let results = handle.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn destroy_rejects_pending_collector_waits() {
        let hub = Arc::new(CommHub::new());
        let id = hub.create_collector(2).await;
        let hub2 = hub.clone();
        let id2 = id.clone();
        let handle = tokio::spawn(async move { hub2.wait_for_all(&id2, 5_000).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.destroy().await;
        let result = handle.await.unwrap();
        assert!(result.is_err());
    }
}
