//! Adaptive scorer and MMR re-ranker (§4.11), one of three auxiliary algorithms specified as
//! contracts for the memory collaborator. Maintains a Beta posterior per scoring component
//! and blends its sampled weights with maximal-marginal-relevance re-ranking so the final
//! ordering trades off raw score against diversity.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand_distr::{Distribution, Gamma};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The three components an [`AdaptiveScorer`] blends (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreComponent {
    Cosine,
    PageRank,
    TextMatch,
}

const COMPONENTS: [ScoreComponent; 3] = [ScoreComponent::Cosine, ScoreComponent::PageRank, ScoreComponent::TextMatch];
const FIXED_WEIGHTS: [f64; 3] = [0.6, 0.25, 0.15];

struct FeedbackLog {
    history: Vec<(DateTime<Utc>, bool)>,
}

/// Maintains Beta(α,β) posteriors per [`ScoreComponent`], falling back to fixed weights until
/// enough feedback has accumulated (§4.11).
pub struct AdaptiveScorer {
    half_life: ChronoDuration,
    min_adaptive_feedback: usize,
    feedback: RwLock<HashMap<ScoreComponent, FeedbackLog>>,
}

impl AdaptiveScorer {
    pub fn new(half_life: ChronoDuration, min_adaptive_feedback: usize) -> Self {
        let mut feedback = HashMap::new();
        for component in COMPONENTS {
            feedback.insert(component, FeedbackLog { history: Vec::new() });
        }
        Self {
            half_life,
            min_adaptive_feedback,
            feedback: RwLock::new(feedback),
        }
    }

    /// Record whether a retrieval scored highly by `component` was accepted by the caller.
    pub async fn record_feedback(&self, component: ScoreComponent, accepted: bool, at: DateTime<Utc>) {
        let mut guard = self.feedback.write().await;
        guard.entry(component).or_insert_with(|| FeedbackLog { history: Vec::new() }).history.push((at, accepted));
    }

    /// `α_eff = 1 + Σ exp(−λ·Δt)·accepted`, `β_eff = 1 + Σ exp(−λ·Δt)·rejected`,
    /// `λ = ln2/halfLife` (§4.11).
    async fn beta_params(&self, component: ScoreComponent, now: DateTime<Utc>) -> (f64, f64) {
        let lambda = std::f64::consts::LN_2 / self.half_life.num_milliseconds().max(1) as f64;
        let guard = self.feedback.read().await;
        let mut alpha = 1.0;
        let mut beta = 1.0;
        if let Some(log) = guard.get(&component) {
            for (at, accepted) in &log.history {
                let dt_ms = (now - *at).num_milliseconds().max(0) as f64;
                let decay = (-lambda * dt_ms).exp();
                if *accepted {
                    alpha += decay;
                } else {
                    beta += decay;
                }
            }
        }
        (alpha, beta)
    }

    async fn total_feedback_count(&self) -> usize {
        self.feedback.read().await.values().map(|l| l.history.len()).sum()
    }

    /// Before `min_adaptive_feedback` observations, returns fixed weights
    /// `(0.6, 0.25, 0.15)`; thereafter samples each component's weight from its Beta
    /// posterior via a Gamma-ratio and normalizes the three samples to sum to 1 (§4.11).
    pub async fn current_weights(&self, now: DateTime<Utc>) -> [f64; 3] {
        if self.total_feedback_count().await < self.min_adaptive_feedback {
            return FIXED_WEIGHTS;
        }
        let mut rng = rand::thread_rng();
        let mut samples = [0.0; 3];
        for (i, component) in COMPONENTS.iter().enumerate() {
            let (alpha, beta) = self.beta_params(*component, now).await;
            let ga = Gamma::new(alpha, 1.0).map(|g| g.sample(&mut rng)).unwrap_or(alpha);
            let gb = Gamma::new(beta, 1.0).map(|g| g.sample(&mut rng)).unwrap_or(beta);
            samples[i] = ga / (ga + gb).max(1e-12);
        }
        let sum: f64 = samples.iter().sum();
        if sum <= 0.0 {
            return FIXED_WEIGHTS;
        }
        [samples[0] / sum, samples[1] / sum, samples[2] / sum]
    }
}

/// A candidate result carrying both its raw component scores and, if present, an embedding
/// for similarity (§4.11 "sim uses embeddings if available else score-vector cosine").
#[derive(Debug, Clone)]
pub struct ScoredDoc {
    pub id: String,
    pub score: f64,
    pub component_scores: [f64; 3],
    pub embedding: Option<Vec<f64>>,
}

pub fn composite_score(weights: [f64; 3], component_scores: [f64; 3]) -> f64 {
    weights[0] * component_scores[0] + weights[1] * component_scores[1] + weights[2] * component_scores[2]
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn similarity(a: &ScoredDoc, b: &ScoredDoc) -> f64 {
    match (&a.embedding, &b.embedding) {
        (Some(x), Some(y)) => cosine(x, y),
        _ => cosine(&a.component_scores, &b.component_scores),
    }
}

/// Greedy maximal-marginal-relevance selection: `MMR(d) = λ·score(d) − (1−λ)·max_{d'∈S} sim(d,
/// d')` (§4.11).
pub fn mmr_rerank(candidates: Vec<ScoredDoc>, lambda: f64, top_k: usize) -> Vec<ScoredDoc> {
    let mut remaining = candidates;
    let mut selected: Vec<ScoredDoc> = Vec::new();
    while !remaining.is_empty() && selected.len() < top_k {
        let mut best_idx = 0;
        let mut best_value = f64::NEG_INFINITY;
        for (i, candidate) in remaining.iter().enumerate() {
            let max_sim = selected.iter().map(|s| similarity(candidate, s)).fold(0.0_f64, f64::max);
            let value = lambda * candidate.score - (1.0 - lambda) * max_sim;
            if value > best_value {
                best_value = value;
                best_idx = i;
            }
        }
        selected.push(remaining.remove(best_idx));
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, score: f64, components: [f64; 3]) -> ScoredDoc {
        ScoredDoc { id: id.to_string(), score, component_scores: components, embedding: None }
    }

    #[tokio::test]
    async fn weights_are_fixed_before_enough_feedback() {
        let scorer = AdaptiveScorer::new(ChronoDuration::hours(1), 10);
        let now = Utc::now();
        scorer.record_feedback(ScoreComponent::Cosine, true, now).await;
        let weights = scorer.current_weights(now).await;
        assert_eq!(weights, FIXED_WEIGHTS);
    }

    #[tokio::test]
    async fn weights_normalize_to_one_after_enough_feedback() {
        let scorer = AdaptiveScorer::new(ChronoDuration::hours(1), 2);
        let now = Utc::now();
        scorer.record_feedback(ScoreComponent::Cosine, true, now).await;
        scorer.record_feedback(ScoreComponent::PageRank, false, now).await;
        let weights = scorer.current_weights(now).await;
        let sum: f64 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9, "weights should sum to 1, got {weights:?}");
        assert!(weights.iter().all(|w| *w >= 0.0));
    }

    #[test]
    fn mmr_prefers_diverse_docs_over_redundant_high_scorers() {
        let near_duplicate_a = doc("a", 1.0, [1.0, 0.0, 0.0]);
        let near_duplicate_b = doc("b", 0.99, [1.0, 0.0, 0.0]);
        let diverse = doc("c", 0.8, [0.0, 1.0, 0.0]);
        let selected = mmr_rerank(vec![near_duplicate_a, near_duplicate_b, diverse], 0.5, 2);
        let ids: Vec<&str> = selected.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids[0], "a");
        assert_eq!(ids[1], "c");
    }

    #[test]
    fn composite_score_is_weighted_sum() {
        let score = composite_score([0.6, 0.25, 0.15], [1.0, 1.0, 1.0]);
        assert!((score - 1.0).abs() < 1e-9);
    }
}
