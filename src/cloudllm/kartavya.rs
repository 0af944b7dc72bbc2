//! Kartavya: the auto-execution engine (§4.10).
//!
//! Promotes an observed tendency (a *Vasana*) into a proposed rule (*NiyamaProposal*) and,
//! on approval, into an active *Kartavya* — a standing duty evaluated against live triggers
//! (cron, event, threshold, pattern) subject to a cooldown and an hourly execution cap.
//! Persistence is grounded on `rusqlite::Connection` used directly rather than behind an
//! extra trait object, since the spec's duck-typed `{prepare, exec}` shape is exactly what
//! `rusqlite::Connection` already provides.

use crate::cloudllm::config::ResourceCeilings;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Kartavya-subsystem error taxonomy (§7, §10.2): hand-rolled, no `thiserror`.
#[derive(Debug, Clone)]
pub enum KartavyaError {
    ConfidenceTooLow { confidence: f64, threshold: f64 },
    ActiveCapExceeded { max_active: u32 },
    UnknownProposal { id: String },
    UnknownKartavya { id: String },
    ProposalNotPending { id: String },
    InvalidTransition { id: String, from: &'static str, to: &'static str },
}

impl fmt::Display for KartavyaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KartavyaError::ConfidenceTooLow { confidence, threshold } => {
                write!(f, "confidence {confidence} below proposal threshold {threshold}")
            }
            KartavyaError::ActiveCapExceeded { max_active } => {
                write!(f, "active kartavya count already at hard cap {max_active}")
            }
            KartavyaError::UnknownProposal { id } => write!(f, "no niyama proposal with id {id}"),
            KartavyaError::UnknownKartavya { id } => write!(f, "no kartavya with id {id}"),
            KartavyaError::ProposalNotPending { id } => write!(f, "proposal {id} is not pending"),
            KartavyaError::InvalidTransition { id, from, to } => {
                write!(f, "kartavya {id} cannot transition from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for KartavyaError {}

/// The four trigger kinds a Kartavya can be evaluated against (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Cron,
    Event,
    Threshold,
    Pattern,
}

/// A trigger: what kind, what condition string, and the cooldown gating re-firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub condition: String,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KartavyaStatus {
    Active,
    Paused,
    Failed,
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

/// A pending rule awaiting user consent (§3 NiyamaProposal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NiyamaProposal {
    pub id: String,
    pub vasana_id: String,
    pub trigger: Trigger,
    pub action: Value,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

/// An observed tendency fed to [`KartavyaEngine::auto_promote`].
#[derive(Debug, Clone)]
pub struct Vasana {
    pub id: String,
    pub strength: f64,
    pub predictive_accuracy: f64,
    pub trigger: Trigger,
    pub action: Value,
    pub evidence: Vec<String>,
}

/// An active duty (§3 Kartavya).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kartavya {
    pub id: String,
    pub trigger: Trigger,
    pub action: Value,
    pub confidence: f64,
    pub status: KartavyaStatus,
    pub total_executions: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_fired: Option<DateTime<Utc>>,
    pub last_executed: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip, default)]
    execution_log: Vec<DateTime<Utc>>,
}

/// Inputs to one [`KartavyaEngine::evaluate_triggers`] sweep (§4.10).
pub struct TriggerContext<'a> {
    pub now: DateTime<Utc>,
    pub events: &'a [String],
    pub metrics: &'a HashMap<String, f64>,
    pub patterns: &'a [String],
}

/// Parse a 5-field cron expression (`minute hour dayOfMonth month dayOfWeek`) and test it
/// against `now`. Supports `*`, exact integers, and `*/N` step values per field (§4.10, §6
/// scenario S6). Malformed expressions never match (§7 "trigger-evaluation" recovery policy).
pub fn matches_cron(expr: &str, now: DateTime<Utc>) -> bool {
    use chrono::{Datelike, Timelike};

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    let actual = [
        now.minute() as i64,
        now.hour() as i64,
        now.day() as i64,
        now.month() as i64,
        now.weekday().num_days_from_sunday() as i64,
    ];
    fields.iter().zip(actual.iter()).all(|(field, value)| field_matches(field, *value))
}

fn field_matches(field: &str, value: i64) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<i64>().map(|n| n > 0 && value % n == 0).unwrap_or(false);
    }
    field.parse::<i64>().map(|n| n == value).unwrap_or(false)
}

/// Parse `"name OP value"` with `OP ∈ {>, <, >=, <=, ==}` and compare against `metrics[name]`.
fn matches_threshold(condition: &str, metrics: &HashMap<String, f64>) -> bool {
    let ops: &[&str] = &[">=", "<=", "==", ">", "<"];
    for op in ops {
        if let Some(idx) = condition.find(op) {
            let name = condition[..idx].trim();
            let rhs = condition[idx + op.len()..].trim();
            let Ok(rhs) = rhs.parse::<f64>() else { return false };
            let Some(&lhs) = metrics.get(name) else { return false };
            return match *op {
                ">=" => lhs >= rhs,
                "<=" => lhs <= rhs,
                "==" => (lhs - rhs).abs() < f64::EPSILON,
                ">" => lhs > rhs,
                "<" => lhs < rhs,
                _ => unreachable!(),
            };
        }
    }
    false
}

/// Interpret `condition` as a regex against every candidate in `patterns`; fall back to a
/// substring match if the regex fails to compile (§4.10).
fn matches_pattern(condition: &str, patterns: &[String]) -> bool {
    match Regex::new(condition) {
        Ok(re) => patterns.iter().any(|p| re.is_match(p)),
        Err(_) => patterns.iter().any(|p| p.contains(condition)),
    }
}

struct EngineState {
    kartavyas: HashMap<String, Kartavya>,
    proposals: HashMap<String, NiyamaProposal>,
    next_id: u64,
}

/// The Kartavya engine (§4.10). User-supplied ceilings are clamped to the hard caps at
/// construction, matching `ResourceCeilings::clamp`'s convention elsewhere in the crate.
pub struct KartavyaEngine {
    ceilings: ResourceCeilings,
    min_confidence_for_proposal: f64,
    auto_approve_threshold: f64,
    state: RwLock<EngineState>,
}

impl KartavyaEngine {
    pub fn new(ceilings: ResourceCeilings, min_confidence_for_proposal: f64, auto_approve_threshold: f64) -> Self {
        Self {
            ceilings: ResourceCeilings::default().clamp(ceilings),
            min_confidence_for_proposal,
            auto_approve_threshold,
            state: RwLock::new(EngineState {
                kartavyas: HashMap::new(),
                proposals: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    fn fresh_id(state: &mut EngineState, prefix: &str) -> String {
        let n = state.next_id;
        state.next_id += 1;
        format!("{prefix}-{n}")
    }

    fn active_count(state: &EngineState) -> usize {
        state.kartavyas.values().filter(|k| k.status == KartavyaStatus::Active).count()
    }

    /// Submit a proposal; rejected at the confidence gate before it is ever stored (§4.10).
    pub async fn propose_niyama(
        &self,
        vasana_id: impl Into<String>,
        trigger: Trigger,
        action: Value,
        confidence: f64,
        evidence: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<String, KartavyaError> {
        if confidence < self.min_confidence_for_proposal {
            return Err(KartavyaError::ConfidenceTooLow { confidence, threshold: self.min_confidence_for_proposal });
        }
        let mut state = self.state.write().await;
        let id = Self::fresh_id(&mut state, "niyama");
        state.proposals.insert(
            id.clone(),
            NiyamaProposal {
                id: id.clone(),
                vasana_id: vasana_id.into(),
                trigger,
                action,
                confidence,
                evidence,
                status: ProposalStatus::Pending,
                created_at: now,
            },
        );
        log::info!("kartavya: proposed {id} (confidence {confidence:.2})");
        Ok(id)
    }

    /// Approve a pending proposal, enforcing the active-count ceiling, and construct the
    /// live Kartavya with a deep copy of the proposal's trigger and action (§4.10).
    pub async fn approve_niyama(&self, proposal_id: &str, now: DateTime<Utc>) -> Result<String, KartavyaError> {
        let mut state = self.state.write().await;
        let proposal = state
            .proposals
            .get(proposal_id)
            .ok_or_else(|| KartavyaError::UnknownProposal { id: proposal_id.to_string() })?;
        if proposal.status != ProposalStatus::Pending {
            return Err(KartavyaError::ProposalNotPending { id: proposal_id.to_string() });
        }
        if Self::active_count(&state) >= self.ceilings.kartavya_max_active as usize {
            return Err(KartavyaError::ActiveCapExceeded { max_active: self.ceilings.kartavya_max_active });
        }
        let proposal = proposal.clone();
        let kartavya_id = Self::fresh_id(&mut state, "kartavya");
        state.kartavyas.insert(
            kartavya_id.clone(),
            Kartavya {
                id: kartavya_id.clone(),
                trigger: Trigger {
                    cooldown_ms: proposal.trigger.cooldown_ms.max(self.ceilings.kartavya_min_cooldown_ms),
                    ..proposal.trigger.clone()
                },
                action: proposal.action.clone(),
                confidence: proposal.confidence,
                status: KartavyaStatus::Active,
                total_executions: 0,
                failure_count: 0,
                created_at: now,
                last_fired: None,
                last_executed: None,
                updated_at: now,
                execution_log: Vec::new(),
            },
        );
        if let Some(p) = state.proposals.get_mut(proposal_id) {
            p.status = ProposalStatus::Approved;
        }
        log::info!("kartavya: approved proposal {proposal_id} -> active kartavya {kartavya_id}");
        Ok(kartavya_id)
    }

    pub async fn reject_niyama(&self, proposal_id: &str) -> Result<(), KartavyaError> {
        let mut state = self.state.write().await;
        let proposal = state
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| KartavyaError::UnknownProposal { id: proposal_id.to_string() })?;
        if proposal.status != ProposalStatus::Pending {
            return Err(KartavyaError::ProposalNotPending { id: proposal_id.to_string() });
        }
        proposal.status = ProposalStatus::Rejected;
        Ok(())
    }

    /// Accept every vasana whose `strength × predictiveAccuracy ≥ autoApproveThreshold` and
    /// immediately approve it, skipping the manual propose→approve round trip (§4.10).
    /// Vasanas that would exceed the active cap are logged and skipped rather than failing
    /// the whole batch.
    pub async fn auto_promote(&self, vasanas: Vec<Vasana>, now: DateTime<Utc>) -> Vec<String> {
        let mut promoted = Vec::new();
        for vasana in vasanas {
            let score = vasana.strength * vasana.predictive_accuracy;
            if score < self.auto_approve_threshold {
                continue;
            }
            let proposal_id = match self
                .propose_niyama(vasana.id.clone(), vasana.trigger, vasana.action, score, vasana.evidence, now)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("kartavya: auto-promote failed to propose {}: {e}", vasana.id);
                    continue;
                }
            };
            match self.approve_niyama(&proposal_id, now).await {
                Ok(id) => promoted.push(id),
                Err(e) => log::warn!("kartavya: auto-promote could not approve {proposal_id}: {e}"),
            }
        }
        promoted
    }

    /// Sweep every active kartavya against `ctx`, pruning execution logs to the trailing
    /// hour, enforcing the hourly cap and per-kartavya cooldown, then matching the trigger
    /// (§4.10). Returns the ids ready to fire.
    pub async fn evaluate_triggers(&self, ctx: &TriggerContext<'_>) -> Vec<String> {
        let mut state = self.state.write().await;
        let hour_ago = ctx.now - ChronoDuration::hours(1);
        let max_per_hour = self.ceilings.kartavya_max_executions_per_hour as usize;
        let mut ready = Vec::new();
        for kartavya in state.kartavyas.values_mut() {
            if kartavya.status != KartavyaStatus::Active {
                continue;
            }
            kartavya.execution_log.retain(|t| *t >= hour_ago);
            if kartavya.execution_log.len() >= max_per_hour {
                continue;
            }
            if let Some(last_fired) = kartavya.last_fired {
                if ctx.now - last_fired < ChronoDuration::milliseconds(kartavya.trigger.cooldown_ms as i64) {
                    continue;
                }
            }
            let matched = match kartavya.trigger.kind {
                TriggerKind::Cron => matches_cron(&kartavya.trigger.condition, ctx.now),
                TriggerKind::Event => ctx.events.iter().any(|e| e == &kartavya.trigger.condition),
                TriggerKind::Threshold => matches_threshold(&kartavya.trigger.condition, ctx.metrics),
                TriggerKind::Pattern => matches_pattern(&kartavya.trigger.condition, ctx.patterns),
            };
            if matched {
                ready.push(kartavya.id.clone());
            }
        }
        ready
    }

    /// Record the outcome of firing `id`, nudging confidence and possibly auto-failing the
    /// kartavya once it has a majority-failure track record over at least 5 executions
    /// (§4.10).
    pub async fn record_execution(&self, id: &str, success: bool, now: DateTime<Utc>) -> Result<(), KartavyaError> {
        let mut state = self.state.write().await;
        let kartavya = state.kartavyas.get_mut(id).ok_or_else(|| KartavyaError::UnknownKartavya { id: id.to_string() })?;
        kartavya.total_executions += 1;
        if success {
            kartavya.confidence = (kartavya.confidence + 0.01).min(1.0);
        } else {
            kartavya.failure_count += 1;
            kartavya.confidence = (kartavya.confidence - 0.05).max(0.0);
        }
        kartavya.last_fired = Some(now);
        kartavya.last_executed = Some(now);
        kartavya.updated_at = now;
        kartavya.execution_log.push(now);

        if kartavya.total_executions >= 5 && (kartavya.failure_count as f64 / kartavya.total_executions as f64) > 0.5 {
            log::warn!("kartavya: {id} auto-failed after {} executions ({} failures)", kartavya.total_executions, kartavya.failure_count);
            kartavya.status = KartavyaStatus::Failed;
        }
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<(), KartavyaError> {
        self.transition(id, KartavyaStatus::Active, KartavyaStatus::Paused).await
    }

    pub async fn resume(&self, id: &str) -> Result<(), KartavyaError> {
        self.transition(id, KartavyaStatus::Paused, KartavyaStatus::Active).await
    }

    /// Retire from any non-retired status (§3 Kartavya lifecycle).
    pub async fn retire(&self, id: &str) -> Result<(), KartavyaError> {
        let mut state = self.state.write().await;
        let kartavya = state.kartavyas.get_mut(id).ok_or_else(|| KartavyaError::UnknownKartavya { id: id.to_string() })?;
        if kartavya.status == KartavyaStatus::Retired {
            return Err(KartavyaError::InvalidTransition { id: id.to_string(), from: "retired", to: "retired" });
        }
        kartavya.status = KartavyaStatus::Retired;
        Ok(())
    }

    async fn transition(&self, id: &str, from: KartavyaStatus, to: KartavyaStatus) -> Result<(), KartavyaError> {
        let mut state = self.state.write().await;
        let kartavya = state.kartavyas.get_mut(id).ok_or_else(|| KartavyaError::UnknownKartavya { id: id.to_string() })?;
        if kartavya.status != from {
            return Err(KartavyaError::InvalidTransition {
                id: id.to_string(),
                from: status_name(kartavya.status),
                to: status_name(to),
            });
        }
        kartavya.status = to;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Kartavya> {
        self.state.read().await.kartavyas.get(id).cloned()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.state.read().await.kartavyas.values().filter(|k| k.status == KartavyaStatus::Active).map(|k| k.id.clone()).collect()
    }

    /// Create the backing tables if missing, then upsert every in-memory kartavya and
    /// proposal, with trigger/action/evidence stored as JSON columns (§4.10, §6).
    pub async fn persist(&self, conn: &rusqlite::Connection) -> Result<(), crate::cloudllm::error::PersistenceError> {
        let to_err = |op: &str, e: rusqlite::Error| crate::cloudllm::error::PersistenceError {
            operation: op.to_string(),
            message: e.to_string(),
        };
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kartavyas (
                id TEXT PRIMARY KEY, trigger_json TEXT NOT NULL, action_json TEXT NOT NULL,
                confidence REAL NOT NULL, status TEXT NOT NULL, total_executions INTEGER NOT NULL,
                failure_count INTEGER NOT NULL, created_at TEXT NOT NULL, last_fired TEXT,
                last_executed TEXT, updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS niyama_proposals (
                id TEXT PRIMARY KEY, vasana_id TEXT NOT NULL, trigger_json TEXT NOT NULL,
                action_json TEXT NOT NULL, confidence REAL NOT NULL, evidence_json TEXT NOT NULL,
                status TEXT NOT NULL, created_at TEXT NOT NULL
            );",
        )
        .map_err(|e| to_err("create tables", e))?;

        let state = self.state.read().await;
        for k in state.kartavyas.values() {
            conn.execute(
                "INSERT INTO kartavyas (id, trigger_json, action_json, confidence, status, total_executions, failure_count, created_at, last_fired, last_executed, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET trigger_json=excluded.trigger_json, action_json=excluded.action_json,
                    confidence=excluded.confidence, status=excluded.status, total_executions=excluded.total_executions,
                    failure_count=excluded.failure_count, last_fired=excluded.last_fired, last_executed=excluded.last_executed,
                    updated_at=excluded.updated_at",
                rusqlite::params![
                    k.id,
                    serde_json::to_string(&k.trigger).unwrap_or_default(),
                    k.action.to_string(),
                    k.confidence,
                    status_name(k.status),
                    k.total_executions as i64,
                    k.failure_count as i64,
                    k.created_at.to_rfc3339(),
                    k.last_fired.map(|t| t.to_rfc3339()),
                    k.last_executed.map(|t| t.to_rfc3339()),
                    k.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| to_err("upsert kartavya", e))?;
        }
        for p in state.proposals.values() {
            conn.execute(
                "INSERT INTO niyama_proposals (id, vasana_id, trigger_json, action_json, confidence, evidence_json, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET status=excluded.status",
                rusqlite::params![
                    p.id,
                    p.vasana_id,
                    serde_json::to_string(&p.trigger).unwrap_or_default(),
                    p.action.to_string(),
                    p.confidence,
                    serde_json::to_string(&p.evidence).unwrap_or_default(),
                    proposal_status_name(p.status),
                    p.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| to_err("upsert proposal", e))?;
        }
        Ok(())
    }

    /// Clear in-memory state and reload both tables; rows that fail to parse are skipped
    /// silently and logged, per §7's persistence recovery policy.
    pub async fn restore(&self, conn: &rusqlite::Connection) -> Result<(), crate::cloudllm::error::PersistenceError> {
        let to_err = |op: &str, e: rusqlite::Error| crate::cloudllm::error::PersistenceError {
            operation: op.to_string(),
            message: e.to_string(),
        };
        let mut state = self.state.write().await;
        state.kartavyas.clear();
        state.proposals.clear();

        let mut stmt = conn
            .prepare("SELECT id, trigger_json, action_json, confidence, status, total_executions, failure_count, created_at, last_fired, last_executed, updated_at FROM kartavyas")
            .map_err(|e| to_err("prepare kartavyas", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                ))
            })
            .map_err(|e| to_err("query kartavyas", e))?;
        for row in rows {
            let Ok((id, trigger_json, action_json, confidence, status, total, failures, created_at, last_fired, last_executed, updated_at)) = row else {
                log::warn!("kartavya: skipping unreadable row while restoring kartavyas");
                continue;
            };
            let (Some(trigger), Some(action), Some(status), Some(created_at), Some(updated_at)) = (
                serde_json::from_str::<Trigger>(&trigger_json).ok(),
                serde_json::from_str::<Value>(&action_json).ok(),
                parse_status(&status),
                DateTime::parse_from_rfc3339(&created_at).ok().map(|t| t.with_timezone(&Utc)),
                DateTime::parse_from_rfc3339(&updated_at).ok().map(|t| t.with_timezone(&Utc)),
            ) else {
                log::warn!("kartavya: skipping row {id} that failed to parse while restoring kartavyas");
                continue;
            };
            state.kartavyas.insert(
                id.clone(),
                Kartavya {
                    id,
                    trigger,
                    action,
                    confidence,
                    status,
                    total_executions: total as u64,
                    failure_count: failures as u64,
                    created_at,
                    last_fired: last_fired.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&Utc)),
                    last_executed: last_executed.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&Utc)),
                    updated_at,
                    execution_log: Vec::new(),
                },
            );
        }

        let mut stmt = conn
            .prepare("SELECT id, vasana_id, trigger_json, action_json, confidence, evidence_json, status, created_at FROM niyama_proposals")
            .map_err(|e| to_err("prepare proposals", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(|e| to_err("query proposals", e))?;
        for row in rows {
            let Ok((id, vasana_id, trigger_json, action_json, confidence, evidence_json, status, created_at)) = row else {
                log::warn!("kartavya: skipping unreadable row while restoring proposals");
                continue;
            };
            let (Some(trigger), Some(action), Some(evidence), Some(status), Some(created_at)) = (
                serde_json::from_str::<Trigger>(&trigger_json).ok(),
                serde_json::from_str::<Value>(&action_json).ok(),
                serde_json::from_str::<Vec<String>>(&evidence_json).ok(),
                parse_proposal_status(&status),
                DateTime::parse_from_rfc3339(&created_at).ok().map(|t| t.with_timezone(&Utc)),
            ) else {
                log::warn!("kartavya: skipping proposal {id} that failed to parse while restoring");
                continue;
            };
            state.proposals.insert(id.clone(), NiyamaProposal { id, vasana_id, trigger, action, confidence, evidence, status, created_at });
        }
        Ok(())
    }
}

fn status_name(status: KartavyaStatus) -> &'static str {
    match status {
        KartavyaStatus::Active => "active",
        KartavyaStatus::Paused => "paused",
        KartavyaStatus::Failed => "failed",
        KartavyaStatus::Retired => "retired",
    }
}

fn parse_status(s: &str) -> Option<KartavyaStatus> {
    match s {
        "active" => Some(KartavyaStatus::Active),
        "paused" => Some(KartavyaStatus::Paused),
        "failed" => Some(KartavyaStatus::Failed),
        "retired" => Some(KartavyaStatus::Retired),
        _ => None,
    }
}

fn proposal_status_name(status: ProposalStatus) -> &'static str {
    match status {
        ProposalStatus::Pending => "pending",
        ProposalStatus::Approved => "approved",
        ProposalStatus::Rejected => "rejected",
    }
}

fn parse_proposal_status(s: &str) -> Option<ProposalStatus> {
    match s {
        "pending" => Some(ProposalStatus::Pending),
        "approved" => Some(ProposalStatus::Approved),
        "rejected" => Some(ProposalStatus::Rejected),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trigger(kind: TriggerKind, condition: &str, cooldown_ms: u64) -> Trigger {
        Trigger { kind, condition: condition.to_string(), cooldown_ms }
    }

    #[test]
    fn cron_matches_step_expression() {
        let hit = Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap();
        let miss = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 0).unwrap();
        assert!(matches_cron("*/5 * * * *", hit));
        assert!(!matches_cron("*/5 * * * *", miss));
    }

    #[test]
    fn cron_rejects_malformed_expression() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap();
        assert!(!matches_cron("not a cron", now));
    }

    #[test]
    fn threshold_parses_operator_and_compares() {
        let mut metrics = HashMap::new();
        metrics.insert("cpu".to_string(), 87.0);
        assert!(matches_threshold("cpu >= 80", &metrics));
        assert!(!matches_threshold("cpu < 80", &metrics));
    }

    #[tokio::test]
    async fn propose_rejects_below_confidence_threshold() {
        let engine = KartavyaEngine::new(ResourceCeilings::default(), 0.7, 0.9);
        let now = Utc::now();
        let result = engine
            .propose_niyama("v1", trigger(TriggerKind::Event, "low_disk", 10_000), serde_json::json!({}), 0.5, vec![], now)
            .await;
        assert!(matches!(result, Err(KartavyaError::ConfidenceTooLow { .. })));
    }

    #[tokio::test]
    async fn approve_activates_and_enforces_cooldown_floor() {
        let engine = KartavyaEngine::new(ResourceCeilings::default(), 0.5, 0.9);
        let now = Utc::now();
        let proposal_id = engine
            .propose_niyama("v1", trigger(TriggerKind::Event, "low_disk", 500), serde_json::json!({}), 0.8, vec![], now)
            .await
            .unwrap();
        let kartavya_id = engine.approve_niyama(&proposal_id, now).await.unwrap();
        let kartavya = engine.get(&kartavya_id).await.unwrap();
        assert_eq!(kartavya.status, KartavyaStatus::Active);
        assert_eq!(kartavya.trigger.cooldown_ms, 10_000);
    }

    #[tokio::test]
    async fn evaluate_triggers_respects_cooldown() {
        let engine = KartavyaEngine::new(ResourceCeilings::default(), 0.5, 0.9);
        let now = Utc::now();
        let proposal_id = engine
            .propose_niyama("v1", trigger(TriggerKind::Event, "low_disk", 60_000), serde_json::json!({}), 0.8, vec![], now)
            .await
            .unwrap();
        let kartavya_id = engine.approve_niyama(&proposal_id, now).await.unwrap();
        engine.record_execution(&kartavya_id, true, now - ChronoDuration::seconds(30)).await.unwrap();

        let metrics = HashMap::new();
        let events = vec!["low_disk".to_string()];
        let ready = engine.evaluate_triggers(&TriggerContext { now, events: &events, metrics: &metrics, patterns: &[] }).await;
        assert!(ready.is_empty());

        let later = now + ChronoDuration::seconds(40);
        let ready = engine.evaluate_triggers(&TriggerContext { now: later, events: &events, metrics: &metrics, patterns: &[] }).await;
        assert_eq!(ready, vec![kartavya_id]);
    }

    #[tokio::test]
    async fn record_execution_auto_fails_on_majority_failure() {
        let engine = KartavyaEngine::new(ResourceCeilings::default(), 0.5, 0.9);
        let now = Utc::now();
        let proposal_id = engine
            .propose_niyama("v1", trigger(TriggerKind::Event, "low_disk", 0), serde_json::json!({}), 0.8, vec![], now)
            .await
            .unwrap();
        let kartavya_id = engine.approve_niyama(&proposal_id, now).await.unwrap();
        for i in 0..5u32 {
            let success = i < 2;
            engine.record_execution(&kartavya_id, success, now + ChronoDuration::seconds(i as i64)).await.unwrap();
        }
        let kartavya = engine.get(&kartavya_id).await.unwrap();
        assert_eq!(kartavya.status, KartavyaStatus::Failed);
    }

    #[tokio::test]
    async fn active_cap_exceeded_rejects_approval() {
        let ceilings = ResourceCeilings { kartavya_max_active: 1, ..ResourceCeilings::default() };
        let engine = KartavyaEngine::new(ceilings, 0.5, 0.9);
        let now = Utc::now();
        let p1 = engine.propose_niyama("v1", trigger(TriggerKind::Event, "a", 0), serde_json::json!({}), 0.8, vec![], now).await.unwrap();
        engine.approve_niyama(&p1, now).await.unwrap();
        let p2 = engine.propose_niyama("v2", trigger(TriggerKind::Event, "b", 0), serde_json::json!({}), 0.8, vec![], now).await.unwrap();
        let result = engine.approve_niyama(&p2, now).await;
        assert!(matches!(result, Err(KartavyaError::ActiveCapExceeded { .. })));
    }

    #[tokio::test]
    async fn auto_promote_skips_items_below_threshold() {
        let engine = KartavyaEngine::new(ResourceCeilings::default(), 0.5, 0.9);
        let now = Utc::now();
        let weak = Vasana {
            id: "weak".into(),
            strength: 0.5,
            predictive_accuracy: 0.5,
            trigger: trigger(TriggerKind::Event, "x", 0),
            action: serde_json::json!({}),
            evidence: vec![],
        };
        let strong = Vasana {
            id: "strong".into(),
            strength: 0.95,
            predictive_accuracy: 0.95,
            trigger: trigger(TriggerKind::Event, "y", 0),
            action: serde_json::json!({}),
            evidence: vec![],
        };
        let promoted = engine.auto_promote(vec![weak, strong], now).await;
        assert_eq!(promoted.len(), 1);
    }

    #[tokio::test]
    async fn persist_then_restore_round_trips() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let engine = KartavyaEngine::new(ResourceCeilings::default(), 0.5, 0.9);
        let now = Utc::now();
        let proposal_id = engine
            .propose_niyama("v1", trigger(TriggerKind::Threshold, "cpu >= 90", 10_000), serde_json::json!({"kind": "alert"}), 0.8, vec!["evidence".into()], now)
            .await
            .unwrap();
        let kartavya_id = engine.approve_niyama(&proposal_id, now).await.unwrap();
        engine.persist(&conn).await.unwrap();

        let restored = KartavyaEngine::new(ResourceCeilings::default(), 0.5, 0.9);
        restored.restore(&conn).await.unwrap();
        let kartavya = restored.get(&kartavya_id).await.unwrap();
        assert_eq!(kartavya.trigger.condition, "cpu >= 90");
        assert_eq!(kartavya.action, serde_json::json!({"kind": "alert"}));
    }
}
