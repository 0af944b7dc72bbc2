//! mHC token budget allocator (§4.11), the second auxiliary algorithm specified as a contract
//! for the memory collaborator: given scored context chunks and a total token budget, builds
//! an affinity matrix, relaxes it to (approximately) doubly stochastic via an accelerated
//! Sinkhorn-Knopp iteration, then allocates the budget proportionally with exact integer
//! conservation.

use std::collections::HashMap;

/// One candidate chunk competing for a share of the token budget (§4.11).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    /// Normalized recency, higher = more recent, expected in `[0, 1]`.
    pub recency: f64,
    /// Normalized relevance to the current query, expected in `[0, 1]`.
    pub relevance: f64,
    /// Normalized importance/salience, expected in `[0, 1]`.
    pub importance: f64,
    pub topic: String,
}

/// `A_ij = 0.30·min(r_i,r_j) + 0.30·(v_i·v_j) + 0.25·max(m_i,m_j) + 0.15·[topic_i=topic_j]·0.5`
/// (§4.11).
fn affinity_matrix(chunks: &[Chunk]) -> Vec<Vec<f64>> {
    let n = chunks.len();
    let mut a = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            let same_topic = chunks[i].topic == chunks[j].topic;
            a[i][j] = 0.30 * chunks[i].recency.min(chunks[j].recency)
                + 0.30 * (chunks[i].relevance * chunks[j].relevance)
                + 0.25 * chunks[i].importance.max(chunks[j].importance)
                + 0.15 * if same_topic { 0.5 } else { 0.0 };
        }
    }
    a
}

/// Adaptive ε schedule: halves every 10 iterations from `1e-2`, floored at `1e-6` (§4.11).
fn adaptive_epsilon(iteration: usize) -> f64 {
    let halvings = (iteration.saturating_sub(1)) / 10;
    (1e-2 / 2f64.powi(halvings as i32)).max(1e-6)
}

/// Accelerated Sinkhorn-Knopp in log domain with Nesterov momentum `(k−1)/(k+2)` (§4.11).
/// Returns the relaxed (approximately doubly stochastic) matrix; exact double stochasticity
/// is not guaranteed within `max_iterations`, which is acceptable since the allocator only
/// uses the resulting row sums as a proportionality signal, not as a hard constraint.
pub fn sinkhorn_knopp(affinity: &[Vec<f64>], max_iterations: usize) -> Vec<Vec<f64>> {
    let n = affinity.len();
    if n == 0 {
        return Vec::new();
    }
    const FLOOR: f64 = 1e-12;
    let mut u = vec![0.0_f64; n];
    let mut v = vec![0.0_f64; n];
    let mut u_prev = u.clone();
    let mut v_prev = v.clone();

    for k in 1..=max_iterations {
        let eps = adaptive_epsilon(k);
        let momentum = (k as f64 - 1.0) / (k as f64 + 2.0);

        let mut new_u = vec![0.0_f64; n];
        for i in 0..n {
            let row_sum: f64 = (0..n).map(|j| affinity[i][j].max(FLOOR) * v[j].exp()).sum();
            new_u[i] = -row_sum.max(FLOOR).ln();
        }
        let accel_u: Vec<f64> = (0..n).map(|i| new_u[i] + momentum * (u[i] - u_prev[i])).collect();
        u_prev = u;
        u = accel_u;

        let mut new_v = vec![0.0_f64; n];
        for j in 0..n {
            let col_sum: f64 = (0..n).map(|i| affinity[i][j].max(FLOOR) * u[i].exp()).sum();
            new_v[j] = -col_sum.max(FLOOR).ln();
        }
        let accel_v: Vec<f64> = (0..n).map(|j| new_v[j] + momentum * (v[j] - v_prev[j])).collect();
        v_prev = v;
        v = accel_v;

        let max_delta = (0..n)
            .map(|i| (u[i] - u_prev[i]).abs())
            .fold(0.0_f64, f64::max)
            .max((0..n).map(|j| (v[j] - v_prev[j]).abs()).fold(0.0_f64, f64::max));
        if max_delta < eps {
            break;
        }
    }

    let mut scaled = vec![vec![0.0_f64; n]; n];
    for i in 0..n {
        for j in 0..n {
            scaled[i][j] = u[i].exp() * affinity[i][j] * v[j].exp();
        }
    }
    scaled
}

/// `composite = 0.35·recency + 0.35·relevance + 0.30·importance` (§4.11).
fn composite_score(chunk: &Chunk) -> f64 {
    0.35 * chunk.recency + 0.35 * chunk.relevance + 0.30 * chunk.importance
}

/// Allocate `total_budget` tokens across `chunks` proportionally to `row_sum × composite
/// score`, flooring to integers and distributing the remainder to the highest composites
/// first. `Σ allocations == total_budget` exactly for any input (§8 "mHC conservation").
pub fn allocate_budget(chunks: &[Chunk], total_budget: u64) -> HashMap<String, u64> {
    let n = chunks.len();
    if n == 0 || total_budget == 0 {
        return chunks.iter().map(|c| (c.id.clone(), 0)).collect();
    }

    let affinity = affinity_matrix(chunks);
    let scaled = sinkhorn_knopp(&affinity, 100);
    let row_sums: Vec<f64> = (0..n).map(|i| scaled[i].iter().sum()).collect();
    let composites: Vec<f64> = chunks.iter().map(composite_score).collect();
    let raw: Vec<f64> = (0..n).map(|i| row_sums[i] * composites[i]).collect();
    let raw_sum: f64 = raw.iter().sum();

    let shares: Vec<f64> = if raw_sum > 0.0 {
        raw.iter().map(|r| r / raw_sum).collect()
    } else {
        vec![1.0 / n as f64; n]
    };
    let exact: Vec<f64> = shares.iter().map(|s| s * total_budget as f64).collect();
    let mut floors: Vec<u64> = exact.iter().map(|e| e.floor() as u64).collect();
    let distributed: u64 = floors.iter().sum();
    let mut remainder = total_budget.saturating_sub(distributed);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let frac_a = exact[a] - exact[a].floor();
        let frac_b = exact[b] - exact[b].floor();
        frac_b
            .partial_cmp(&frac_a)
            .unwrap()
            .then_with(|| composites[b].partial_cmp(&composites[a]).unwrap())
    });
    for &idx in &order {
        if remainder == 0 {
            break;
        }
        floors[idx] += 1;
        remainder -= 1;
    }

    chunks.iter().zip(floors).map(|(c, f)| (c.id.clone(), f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, recency: f64, relevance: f64, importance: f64, topic: &str) -> Chunk {
        Chunk { id: id.to_string(), recency, relevance, importance, topic: topic.to_string() }
    }

    #[test]
    fn allocation_conserves_total_budget_exactly() {
        let chunks = vec![
            chunk("a", 0.9, 0.8, 0.7, "topic-a"),
            chunk("b", 0.2, 0.3, 0.1, "topic-b"),
            chunk("c", 0.5, 0.5, 0.5, "topic-a"),
        ];
        let allocation = allocate_budget(&chunks, 1000);
        let total: u64 = allocation.values().sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn allocation_conserves_budget_with_odd_remainder() {
        let chunks = vec![chunk("a", 0.9, 0.9, 0.9, "t"), chunk("b", 0.1, 0.1, 0.1, "t"), chunk("c", 0.5, 0.5, 0.5, "t")];
        let allocation = allocate_budget(&chunks, 97);
        let total: u64 = allocation.values().sum();
        assert_eq!(total, 97);
    }

    #[test]
    fn higher_composite_chunk_receives_more_budget() {
        let chunks = vec![chunk("strong", 0.95, 0.95, 0.95, "t"), chunk("weak", 0.05, 0.05, 0.05, "u")];
        let allocation = allocate_budget(&chunks, 100);
        assert!(allocation["strong"] > allocation["weak"]);
    }

    #[test]
    fn empty_chunk_list_allocates_nothing() {
        let allocation = allocate_budget(&[], 500);
        assert!(allocation.is_empty());
    }

    #[test]
    fn sinkhorn_output_rows_are_finite_and_nonnegative() {
        let chunks = vec![chunk("a", 0.5, 0.5, 0.5, "t"), chunk("b", 0.4, 0.6, 0.3, "t")];
        let affinity = affinity_matrix(&chunks);
        let scaled = sinkhorn_knopp(&affinity, 50);
        for row in &scaled {
            for &value in row {
                assert!(value.is_finite());
                assert!(value >= 0.0);
            }
        }
    }
}
