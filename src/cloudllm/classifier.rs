//! Pravritti (task-type) and Vichara (complexity) classifiers (§4.5).
//!
//! Both classifiers share the same shape: a layered table of weighted signals, each a
//! predicate over the last user message's text, word count, and tool presence. A signal
//! contributes its weight to exactly one outcome label; the label with the highest weighted
//! sum wins, and confidence is derived from how decisively it won relative to that label's
//! total possible weight. Deterministic and LLM-free, grounded on the keyword-table shape of
//! `context_strategy.rs`'s novelty scoring, generalized from a single scalar score into a
//! labeled signal table.

use crate::cloudllm::context::AgentContext;

/// Closed set of task types (§4.5 Pravritti).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Heartbeat,
    Smalltalk,
    Search,
    Memory,
    FileOp,
    ApiCall,
    Compaction,
    Embedding,
    CodeGen,
    Chat,
    Summarize,
    Translate,
    ToolExec,
    Reasoning,
    Vision,
}

impl TaskType {
    pub const ALL: [TaskType; 15] = [
        TaskType::Heartbeat,
        TaskType::Smalltalk,
        TaskType::Search,
        TaskType::Memory,
        TaskType::FileOp,
        TaskType::ApiCall,
        TaskType::Compaction,
        TaskType::Embedding,
        TaskType::CodeGen,
        TaskType::Chat,
        TaskType::Summarize,
        TaskType::Translate,
        TaskType::ToolExec,
        TaskType::Reasoning,
        TaskType::Vision,
    ];
}

/// Closed set of complexity tiers (§4.5 Vichara), ordered trivial..expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Complexity {
    Trivial,
    Simple,
    Medium,
    Complex,
    Expert,
}

impl Complexity {
    pub const ALL: [Complexity; 5] = [
        Complexity::Trivial,
        Complexity::Simple,
        Complexity::Medium,
        Complexity::Complex,
        Complexity::Expert,
    ];
}

/// The three signal inputs every predicate may examine (§4.5).
pub struct ClassifierInput {
    pub text: String,
    pub word_count: usize,
    pub has_tools: bool,
}

impl ClassifierInput {
    pub fn from_context(context: &AgentContext, has_tools: bool) -> Self {
        let text = context.last_user_text().unwrap_or_default();
        let word_count = context.last_user_word_count();
        Self {
            text: text.to_lowercase(),
            word_count,
            has_tools,
        }
    }
}

struct Signal<L> {
    label: L,
    weight: f64,
    predicate: fn(&ClassifierInput) -> bool,
}

/// A classification outcome with a confidence score (§3 "each with confidence").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult<L> {
    pub label: L,
    pub confidence: f64,
}

/// Aggregate weighted signal matches per label, pick the highest-scoring label, and derive
/// confidence as `1 - |score - center| / width`, clamped to `[0.5, 1.0]` (§4.5).
fn classify<L: Copy + PartialEq>(signals: &[Signal<L>], input: &ClassifierInput, default: L) -> ClassificationResult<L> {
    let mut totals: Vec<(L, f64, f64)> = Vec::new(); // (label, matched_weight, total_possible_weight)
    for signal in signals {
        let entry = totals.iter_mut().find(|(l, _, _)| *l == signal.label);
        let matched = if (signal.predicate)(input) { signal.weight } else { 0.0 };
        match entry {
            Some((_, score, possible)) => {
                *score += matched;
                *possible += signal.weight;
            }
            None => totals.push((signal.label, matched, signal.weight)),
        }
    }

    let best = totals
        .iter()
        .filter(|(_, score, _)| *score > 0.0)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    match best {
        Some((label, score, possible)) => {
            let center = possible / 2.0;
            let width = possible.max(1.0);
            let confidence = (1.0 - (score - center).abs() / width).clamp(0.5, 1.0);
            ClassificationResult { label: *label, confidence }
        }
        None => ClassificationResult { label: default, confidence: 0.5 },
    }
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

fn pravritti_signals() -> Vec<Signal<TaskType>> {
    vec![
        Signal { label: TaskType::Heartbeat, weight: 3.0, predicate: |i| contains_any(&i.text, &["ping", "heartbeat", "are you there", "still there"]) },
        Signal { label: TaskType::Smalltalk, weight: 2.0, predicate: |i| contains_any(&i.text, &["hello", "hi there", "how are you", "thanks", "thank you"]) },
        Signal { label: TaskType::Smalltalk, weight: 1.0, predicate: |i| i.word_count < 5 },
        Signal { label: TaskType::Search, weight: 3.0, predicate: |i| contains_any(&i.text, &["search for", "look up", "find information", "google"]) },
        Signal { label: TaskType::Memory, weight: 3.0, predicate: |i| contains_any(&i.text, &["remember that", "recall", "my name is", "don't forget"]) },
        Signal { label: TaskType::FileOp, weight: 3.0, predicate: |i| contains_any(&i.text, &["read the file", "write to file", "directory", "file path"]) },
        Signal { label: TaskType::ApiCall, weight: 3.0, predicate: |i| contains_any(&i.text, &["api", "endpoint", "http request", "curl"]) },
        Signal { label: TaskType::Compaction, weight: 3.0, predicate: |i| contains_any(&i.text, &["compact the conversation", "condense history", "summarize the conversation"]) },
        Signal { label: TaskType::Embedding, weight: 3.0, predicate: |i| contains_any(&i.text, &["embed", "embedding", "vector representation"]) },
        Signal { label: TaskType::CodeGen, weight: 3.0, predicate: |i| contains_any(&i.text, &["write code", "implement a function", "refactor", "fix this bug"]) },
        Signal { label: TaskType::CodeGen, weight: 1.0, predicate: |i| i.has_tools },
        Signal { label: TaskType::Chat, weight: 1.0, predicate: |i| i.word_count >= 5 && i.word_count < 30 },
        Signal { label: TaskType::Summarize, weight: 3.0, predicate: |i| contains_any(&i.text, &["summarize", "tl;dr", "give me a summary"]) },
        Signal { label: TaskType::Translate, weight: 3.0, predicate: |i| contains_any(&i.text, &["translate", "in spanish", "to french", "in japanese"]) },
        Signal { label: TaskType::ToolExec, weight: 2.0, predicate: |i| i.has_tools },
        Signal { label: TaskType::ToolExec, weight: 2.0, predicate: |i| contains_any(&i.text, &["run the tool", "execute the", "invoke"]) },
        Signal { label: TaskType::Reasoning, weight: 3.0, predicate: |i| contains_any(&i.text, &["why does", "explain why", "prove that", "step by step", "reason through"]) },
        Signal { label: TaskType::Vision, weight: 3.0, predicate: |i| contains_any(&i.text, &["image", "picture", "photo", "screenshot"]) },
    ]
}

fn vichara_signals() -> Vec<Signal<Complexity>> {
    vec![
        Signal { label: Complexity::Trivial, weight: 3.0, predicate: |i| contains_any(&i.text, &["hi", "hello", "thanks", "ok", "okay", "got it"]) },
        Signal { label: Complexity::Trivial, weight: 1.0, predicate: |i| i.word_count <= 3 },
        Signal { label: Complexity::Simple, weight: 2.0, predicate: |i| i.word_count > 3 && i.word_count <= 10 },
        Signal { label: Complexity::Simple, weight: 1.0, predicate: |i| i.text.trim_end().ends_with('?') && i.word_count <= 15 },
        Signal { label: Complexity::Medium, weight: 1.5, predicate: |i| i.word_count > 10 && i.word_count <= 40 },
        Signal { label: Complexity::Complex, weight: 2.0, predicate: |i| contains_any(&i.text, &["function", "class", "algorithm", "refactor", "debug"]) },
        Signal { label: Complexity::Complex, weight: 2.0, predicate: |i| contains_any(&i.text, &["first", "then", "finally", "also", "after that"]) },
        Signal { label: Complexity::Complex, weight: 1.5, predicate: |i| contains_any(&i.text, &["analyze", "architecture", "design a system", "trade-off"]) },
        Signal { label: Complexity::Complex, weight: 1.0, predicate: |i| i.word_count > 40 },
        Signal { label: Complexity::Expert, weight: 3.0, predicate: |i| contains_any(&i.text, &["distributed systems", "formal proof", "cryptographic", "concurrency model", "consensus protocol"]) },
        Signal { label: Complexity::Expert, weight: 1.0, predicate: |i| i.has_tools && i.word_count > 40 },
    ]
}

/// Run the Pravritti (task-type) classifier over the agent's current context (§4.5).
pub fn classify_task_type(context: &AgentContext, has_tools: bool) -> ClassificationResult<TaskType> {
    let input = ClassifierInput::from_context(context, has_tools);
    classify(&pravritti_signals(), &input, TaskType::Chat)
}

/// Run the Vichara (complexity) classifier over the agent's current context (§4.5).
pub fn classify_complexity(context: &AgentContext, has_tools: bool) -> ClassificationResult<Complexity> {
    let input = ClassifierInput::from_context(context, has_tools);
    classify(&vichara_signals(), &input, Complexity::Medium)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::context::Message;

    fn ctx_with(text: &str) -> AgentContext {
        let mut ctx = AgentContext::new();
        ctx.append(Message::user(text));
        ctx
    }

    #[test]
    fn greeting_classifies_as_smalltalk_and_trivial() {
        let ctx = ctx_with("hello");
        let task = classify_task_type(&ctx, false);
        assert_eq!(task.label, TaskType::Smalltalk);
        let complexity = classify_complexity(&ctx, false);
        assert_eq!(complexity.label, Complexity::Trivial);
    }

    #[test]
    fn confidence_is_clamped_to_range() {
        let ctx = ctx_with("hello there, how are you doing today my friend");
        let task = classify_task_type(&ctx, false);
        assert!(task.confidence >= 0.5 && task.confidence <= 1.0);
    }

    #[test]
    fn code_request_classifies_as_code_gen_and_complex() {
        let ctx = ctx_with("please refactor this function and fix this bug in the algorithm");
        let task = classify_task_type(&ctx, false);
        assert_eq!(task.label, TaskType::CodeGen);
        let complexity = classify_complexity(&ctx, false);
        assert_eq!(complexity.label, Complexity::Complex);
    }

    #[test]
    fn expert_domain_markers_trigger_expert_tier() {
        let ctx = ctx_with("design a consensus protocol for a distributed systems cluster with formal proof of safety");
        let complexity = classify_complexity(&ctx, false);
        assert_eq!(complexity.label, Complexity::Expert);
    }

    #[test]
    fn reasoning_request_detected() {
        let ctx = ctx_with("explain why the algorithm converges, step by step");
        let task = classify_task_type(&ctx, false);
        assert_eq!(task.label, TaskType::Reasoning);
    }
}
