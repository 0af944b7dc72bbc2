//! KaalaBrahma: the liveness supervisor (§4.8).
//!
//! Holds only heartbeat records, never `Agent` references — mirroring §3's ownership summary
//! ("the supervisor holds only heartbeat records"). A periodic or on-demand sweep promotes
//! stale agents and reaps dead ones; `kill_agent`/`heal_agent` walk the `parent_id` chain
//! stored in each record to verify the ancestor relationship rather than touching the tree
//! itself. Grounded on `orchestration.rs`'s callback-list status-notification pattern,
//! generalized from a flat request/response log into a liveness state machine.

use crate::cloudllm::event::{EventHandler, SupervisorEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatStatus {
    Alive,
    Stale,
    Dead,
    Killed,
}

impl HeartbeatStatus {
    fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Alive => "alive",
            HeartbeatStatus::Stale => "stale",
            HeartbeatStatus::Dead => "dead",
            HeartbeatStatus::Killed => "killed",
        }
    }
}

/// A liveness record (§3 Heartbeat).
#[derive(Debug, Clone)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub purpose: String,
    pub last_beat: Instant,
    pub started_at: Instant,
    pub status: HeartbeatStatus,
    pub turn_count: u64,
    pub token_usage: u64,
    pub token_budget: u64,
    pub stuck_reason: Option<String>,
}

impl AgentHeartbeat {
    pub fn new(agent_id: impl Into<String>, parent_id: Option<String>, depth: u32, purpose: impl Into<String>, token_budget: u64) -> Self {
        let now = Instant::now();
        Self {
            agent_id: agent_id.into(),
            parent_id,
            depth,
            purpose: purpose.into(),
            last_beat: now,
            started_at: now,
            status: HeartbeatStatus::Alive,
            turn_count: 0,
            token_usage: 0,
            token_budget,
            stuck_reason: None,
        }
    }
}

/// A partial update merged into an existing record by `record_heartbeat` (§4.8).
#[derive(Debug, Clone, Default)]
pub struct HeartbeatPatch {
    pub turn_count: Option<u64>,
    pub token_usage: Option<u64>,
    pub token_budget: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct KillResult {
    pub success: bool,
    pub reason: Option<String>,
    pub killed_ids: Vec<String>,
    pub cascade_count: usize,
    pub freed_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub agent_id: String,
    pub status: HeartbeatStatus,
    pub depth: u32,
    pub child_count: usize,
    pub descendant_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TreeHealth {
    pub by_status: HashMap<&'static str, usize>,
    pub max_depth: u32,
    pub highest_token_usage: u64,
    pub snapshots: Vec<HealthSnapshot>,
}

/// Supervisor configuration (§4.8).
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    pub dead_threshold: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(30),
            dead_threshold: Duration::from_secs(120),
        }
    }
}

/// The KaalaBrahma supervisor (§4.8).
pub struct KaalaBrahma {
    config: SupervisorConfig,
    registry: RwLock<HashMap<String, AgentHeartbeat>>,
    callbacks: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl KaalaBrahma {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_callback(&self, handler: Arc<dyn EventHandler>) {
        self.callbacks.write().await.push(handler);
    }

    async fn notify(&self, agent_id: &str, old_status: &str, new_status: &str, reason: Option<String>) {
        let event = SupervisorEvent {
            agent_id: agent_id.to_string(),
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
            reason,
        };
        for callback in self.callbacks.read().await.iter() {
            callback.on_supervisor_event(&event).await;
        }
    }

    pub async fn register_agent(&self, hb: AgentHeartbeat) {
        log::debug!("supervisor: registering heartbeat for {}", hb.agent_id);
        self.registry.write().await.insert(hb.agent_id.clone(), hb);
    }

    /// Update `last_beat` and merge any patched counters (§4.8).
    pub async fn record_heartbeat(&self, id: &str, patch: Option<HeartbeatPatch>) -> bool {
        let mut guard = self.registry.write().await;
        let Some(record) = guard.get_mut(id) else {
            return false;
        };
        record.last_beat = Instant::now();
        if let Some(patch) = patch {
            if let Some(v) = patch.turn_count {
                record.turn_count = v;
            }
            if let Some(v) = patch.token_usage {
                record.token_usage = v;
            }
            if let Some(v) = patch.token_budget {
                record.token_budget = v;
            }
        }
        true
    }

    /// Mark an agent stale with an explicit reason (§4.8).
    pub async fn report_stuck(&self, id: &str, reason: Option<String>) -> bool {
        let old_status;
        {
            let mut guard = self.registry.write().await;
            let Some(record) = guard.get_mut(id) else {
                return false;
            };
            old_status = record.status.as_str();
            record.status = HeartbeatStatus::Stale;
            record.stuck_reason = reason.clone();
        }
        self.notify(id, old_status, HeartbeatStatus::Stale.as_str(), reason).await;
        true
    }

    /// Sweep every record: reap dead ones, promote stale ones (§4.8). Any liveness-dependent
    /// access should call this first.
    pub async fn heal_tree(&self) {
        let now = Instant::now();
        let mut to_reap = Vec::new();
        let mut to_stale = Vec::new();
        {
            let mut guard = self.registry.write().await;
            for (id, record) in guard.iter_mut() {
                let age = now.duration_since(record.last_beat);
                if age >= self.config.dead_threshold {
                    to_reap.push(id.clone());
                } else if age >= self.config.stale_threshold && record.status == HeartbeatStatus::Alive {
                    record.status = HeartbeatStatus::Stale;
                    to_stale.push(id.clone());
                }
            }
            for id in &to_reap {
                guard.remove(id);
            }
        }
        for id in &to_stale {
            self.notify(id, HeartbeatStatus::Alive.as_str(), HeartbeatStatus::Stale.as_str(), None).await;
        }
        for id in &to_reap {
            self.notify(id, HeartbeatStatus::Alive.as_str(), HeartbeatStatus::Dead.as_str(), Some("deadThreshold exceeded".into()))
                .await;
        }
    }

    async fn is_ancestor(&self, requester: &str, target: &str) -> bool {
        let guard = self.registry.read().await;
        let mut current = guard.get(target).and_then(|r| r.parent_id.clone());
        while let Some(id) = current {
            if id == requester {
                return true;
            }
            current = guard.get(&id).and_then(|r| r.parent_id.clone());
        }
        false
    }

    async fn subtree_ids(&self, root: &str) -> Vec<String> {
        let guard = self.registry.read().await;
        let mut result = vec![root.to_string()];
        loop {
            let mut grew = false;
            let known: Vec<String> = result.clone();
            for (id, record) in guard.iter() {
                if result.contains(id) {
                    continue;
                }
                if let Some(parent_id) = &record.parent_id {
                    if known.contains(parent_id) {
                        result.push(id.clone());
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }
        result
    }

    /// Kill `target` and its entire subtree, iff `requester` is an ancestor (§4.8).
    pub async fn kill_agent(&self, requester: &str, target: &str) -> KillResult {
        if !self.is_ancestor(requester, target).await {
            return KillResult {
                success: false,
                reason: Some("not an ancestor".to_string()),
                killed_ids: Vec::new(),
                cascade_count: 0,
                freed_tokens: 0,
            };
        }

        let subtree = self.subtree_ids(target).await;
        let mut freed_tokens: u64 = 0;
        {
            let mut guard = self.registry.write().await;
            for id in &subtree {
                if let Some(record) = guard.get(id) {
                    freed_tokens += record.token_budget.saturating_sub(record.token_usage);
                }
            }
            for id in &subtree {
                guard.remove(id);
            }
        }
        for id in &subtree {
            self.notify(id, "alive", HeartbeatStatus::Killed.as_str(), None).await;
        }
        KillResult {
            success: true,
            reason: None,
            cascade_count: subtree.len(),
            killed_ids: subtree,
            freed_tokens,
        }
    }

    /// Heal `target` (stale/dead → alive) iff `requester` is an ancestor (§4.8).
    pub async fn heal_agent(&self, requester: &str, target: &str) -> bool {
        if !self.is_ancestor(requester, target).await {
            return false;
        }
        let old_status;
        {
            let mut guard = self.registry.write().await;
            let Some(record) = guard.get_mut(target) else {
                return false;
            };
            if record.status != HeartbeatStatus::Stale && record.status != HeartbeatStatus::Dead {
                return false;
            }
            old_status = record.status.as_str();
            record.status = HeartbeatStatus::Alive;
            record.stuck_reason = None;
            record.last_beat = Instant::now();
        }
        self.notify(target, old_status, HeartbeatStatus::Alive.as_str(), None).await;
        true
    }

    /// Totals by status, max depth, highest usage, and per-node snapshots (§4.8).
    pub async fn get_tree_health(&self) -> TreeHealth {
        let guard = self.registry.read().await;
        let mut health = TreeHealth::default();
        for record in guard.values() {
            *health.by_status.entry(record.status.as_str()).or_insert(0) += 1;
            health.max_depth = health.max_depth.max(record.depth);
            health.highest_token_usage = health.highest_token_usage.max(record.token_usage);
        }
        for record in guard.values() {
            let child_count = guard.values().filter(|r| r.parent_id.as_deref() == Some(record.agent_id.as_str())).count();
            let descendant_count = self.subtree_ids(&record.agent_id).await.len().saturating_sub(1);
            health.snapshots.push(HealthSnapshot {
                agent_id: record.agent_id.clone(),
                status: record.status,
                depth: record.depth,
                child_count,
                descendant_count,
            });
        }
        health
    }

    pub fn config(&self) -> SupervisorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heal_tree_promotes_stale_then_reaps_dead() {
        let supervisor = KaalaBrahma::new(SupervisorConfig {
            heartbeat_interval: Duration::from_millis(1),
            stale_threshold: Duration::from_millis(5),
            dead_threshold: Duration::from_millis(15),
        });
        supervisor.register_agent(AgentHeartbeat::new("a1", None, 0, "root", 1000)).await;
        tokio::time::sleep(Duration::from_millis(8)).await;
        supervisor.heal_tree().await;
        {
            let guard = supervisor.registry.read().await;
            assert_eq!(guard.get("a1").unwrap().status, HeartbeatStatus::Stale);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        supervisor.heal_tree().await;
        assert!(supervisor.registry.read().await.get("a1").is_none());
    }

    #[tokio::test]
    async fn kill_agent_requires_ancestor() {
        let supervisor = KaalaBrahma::new(SupervisorConfig::default());
        supervisor.register_agent(AgentHeartbeat::new("root", None, 0, "root", 100)).await;
        supervisor.register_agent(AgentHeartbeat::new("child", Some("root".into()), 1, "child", 50)).await;
        let result = supervisor.kill_agent("child", "root").await;
        assert!(!result.success);

        let result = supervisor.kill_agent("root", "child").await;
        assert!(result.success);
        assert_eq!(result.killed_ids, vec!["child".to_string()]);
    }

    #[tokio::test]
    async fn kill_agent_cascades_and_sums_freed_tokens() {
        let supervisor = KaalaBrahma::new(SupervisorConfig::default());
        supervisor.register_agent(AgentHeartbeat::new("root", None, 0, "root", 100)).await;
        supervisor.register_agent(AgentHeartbeat::new("mid", Some("root".into()), 1, "mid", 100)).await;
        supervisor.register_agent(AgentHeartbeat::new("leaf", Some("mid".into()), 2, "leaf", 50)).await;
        supervisor
            .record_heartbeat("mid", Some(HeartbeatPatch { token_usage: Some(40), ..Default::default() }))
            .await;
        let result = supervisor.kill_agent("root", "mid").await;
        assert!(result.success);
        assert_eq!(result.cascade_count, 2);
        assert_eq!(result.freed_tokens, 60 + 50);
        assert!(supervisor.registry.read().await.get("leaf").is_none());
    }

    #[tokio::test]
    async fn heal_agent_requires_stale_or_dead() {
        let supervisor = KaalaBrahma::new(SupervisorConfig::default());
        supervisor.register_agent(AgentHeartbeat::new("root", None, 0, "root", 100)).await;
        supervisor.register_agent(AgentHeartbeat::new("child", Some("root".into()), 1, "child", 50)).await;
        assert!(!supervisor.heal_agent("root", "child").await);
        supervisor.report_stuck("child", Some("no response".into())).await;
        assert!(supervisor.heal_agent("root", "child").await);
    }

    #[tokio::test]
    async fn tree_health_reports_child_and_descendant_counts() {
        let supervisor = KaalaBrahma::new(SupervisorConfig::default());
        supervisor.register_agent(AgentHeartbeat::new("root", None, 0, "root", 100)).await;
        supervisor.register_agent(AgentHeartbeat::new("child", Some("root".into()), 1, "child", 50)).await;
        supervisor.register_agent(AgentHeartbeat::new("grandchild", Some("child".into()), 2, "gc", 50)).await;
        let health = supervisor.get_tree_health().await;
        let root_snapshot = health.snapshots.iter().find(|s| s.agent_id == "root").unwrap();
        assert_eq!(root_snapshot.child_count, 1);
        assert_eq!(root_snapshot.descendant_count, 2);
    }
}
