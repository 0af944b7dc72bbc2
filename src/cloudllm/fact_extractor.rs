//! FactExtractor (§4.11), the third auxiliary algorithm specified as a contract for the memory
//! collaborator: mines durable facts about a user from free text, first via ranked regex
//! patterns per category, then via an embedding-similarity fallback for anything the patterns
//! miss, deduplicating so repeated extraction over the same text is idempotent.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;

/// The categories a mined [`Fact`] can belong to (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Identity,
    Location,
    Work,
    Preference,
    Relationship,
    Instruction,
    Personal,
}

impl Category {
    const ALL: [Category; 7] = [
        Category::Identity,
        Category::Location,
        Category::Work,
        Category::Preference,
        Category::Relationship,
        Category::Instruction,
        Category::Personal,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Category::Identity => "identity",
            Category::Location => "location",
            Category::Work => "work",
            Category::Preference => "preference",
            Category::Relationship => "relationship",
            Category::Instruction => "instruction",
            Category::Personal => "personal",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a [`Fact`] was mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    Pattern,
    Embedding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub category: Category,
    pub fact: String,
    pub confidence: f64,
    pub method: ExtractionMethod,
}

/// Embeds text into a fixed-dimensional vector for the similarity fallback. Implementations
/// wrap whatever model the surrounding application already uses; none is bundled here (§4.11
/// "vector-embedding fallback").
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Vec<f64>;
}

struct PatternRule {
    category: Category,
    regex: Regex,
    confidence: f64,
}

fn pattern_rules() -> Vec<PatternRule> {
    let rule = |category: Category, pattern: &str, confidence: f64| PatternRule {
        category,
        regex: Regex::new(pattern).expect("fact extractor pattern must compile"),
        confidence,
    };
    vec![
        rule(Category::Identity, r"(?i)\bmy name is ([A-Z][\w' -]{1,60})", 0.95),
        rule(Category::Identity, r"(?i)\bi'?m called ([A-Z][\w' -]{1,60})", 0.85),
        rule(Category::Location, r"(?i)\bi live in ([\w' -]{2,60})", 0.9),
        rule(Category::Location, r"(?i)\bi'?m (?:based|located) in ([\w' -]{2,60})", 0.85),
        rule(Category::Work, r"(?i)\bi work (?:at|for) ([\w' .&-]{2,60})", 0.9),
        rule(Category::Work, r"(?i)\bi'?m an? ([\w' -]{2,40}) at ([\w' .&-]{2,60})", 0.85),
        rule(Category::Preference, r"(?i)\bi (?:prefer|like|love) ([\w' -]{2,60})", 0.75),
        rule(Category::Preference, r"(?i)\bi (?:hate|dislike|can'?t stand) ([\w' -]{2,60})", 0.75),
        rule(Category::Relationship, r"(?i)\bmy (wife|husband|partner|son|daughter|mother|father|sister|brother|friend) (?:is|'s name is) ([\w' -]{2,60})", 0.9),
        rule(Category::Instruction, r"(?i)\b(?:always|never) ([\w' -]{2,80})", 0.8),
        rule(Category::Instruction, r"(?i)\bplease (?:remember to|make sure to) ([\w' -]{2,80})", 0.85),
        rule(Category::Personal, r"(?i)\bi'?m (\d{1,3}) years old", 0.9),
        rule(Category::Personal, r"(?i)\bmy birthday is ([\w' ,-]{2,40})", 0.9),
    ]
}

/// Mines [`Fact`]s from text via ranked regex patterns, falling back to embedding similarity
/// against a set of reference category descriptions when no pattern matches, and deduplicating
/// so repeated calls on the same text never double-insert a fact (§4.11, §8 "idempotence").
pub struct FactExtractor {
    rules: Vec<PatternRule>,
    embedder: Option<Box<dyn Embedder>>,
    category_anchors: Vec<(Category, String)>,
    similarity_threshold: f64,
    embedding_confidence_cap: f64,
}

impl FactExtractor {
    pub fn new() -> Self {
        Self {
            rules: pattern_rules(),
            embedder: None,
            category_anchors: default_anchors(),
            similarity_threshold: 0.65,
            embedding_confidence_cap: 0.85,
        }
    }

    pub fn with_embedder(mut self, embedder: Box<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Extract facts from `text`, merging with `existing` and deduplicating by
    /// `(category, normalized fact prefix)` so the combined result is idempotent under repeated
    /// extraction over the same input (§4.11, §8).
    pub async fn extract(&self, text: &str, existing: &[Fact]) -> Vec<Fact> {
        let mut seen: HashSet<(Category, String)> =
            existing.iter().map(|f| (f.category, normalize_prefix(&f.fact))).collect();
        let mut out: Vec<Fact> = existing.to_vec();

        for rule in &self.rules {
            for captures in rule.regex.captures_iter(text) {
                let fact_text = captures
                    .iter()
                    .skip(1)
                    .filter_map(|m| m.map(|m| m.as_str().trim().to_string()))
                    .collect::<Vec<_>>()
                    .join(" ");
                if fact_text.is_empty() {
                    continue;
                }
                let key = (rule.category, normalize_prefix(&fact_text));
                if seen.insert(key) {
                    out.push(Fact {
                        category: rule.category,
                        fact: fact_text,
                        confidence: rule.confidence,
                        method: ExtractionMethod::Pattern,
                    });
                }
            }
        }

        if let Some(embedder) = &self.embedder {
            let sentences = split_sentences(text);
            for sentence in sentences {
                if sentence.trim().len() < 8 {
                    continue;
                }
                let embedding = embedder.embed(&sentence).await;
                let mut best: Option<(Category, f64)> = None;
                for (category, anchor) in &self.category_anchors {
                    let anchor_embedding = embedder.embed(anchor).await;
                    let sim = cosine(&embedding, &anchor_embedding);
                    if best.map(|(_, s)| sim > s).unwrap_or(true) {
                        best = Some((*category, sim));
                    }
                }
                if let Some((category, sim)) = best {
                    if sim >= self.similarity_threshold {
                        let key = (category, normalize_prefix(&sentence));
                        if seen.insert(key) {
                            out.push(Fact {
                                category,
                                fact: sentence.trim().to_string(),
                                confidence: sim.min(self.embedding_confidence_cap),
                                method: ExtractionMethod::Embedding,
                            });
                        }
                    }
                }
            }
        }

        out
    }
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn default_anchors() -> Vec<(Category, String)> {
    Category::ALL
        .iter()
        .map(|c| {
            let anchor = match c {
                Category::Identity => "a statement about who someone is or what they are named",
                Category::Location => "a statement about where someone lives or is based",
                Category::Work => "a statement about someone's job, employer, or occupation",
                Category::Preference => "a statement about something someone likes or dislikes",
                Category::Relationship => "a statement about a family member or friend",
                Category::Instruction => "a standing instruction about how to behave",
                Category::Personal => "a statement about someone's age or personal details",
            };
            (*c, anchor.to_string())
        })
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '\n', '!', '?'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_prefix(fact: &str) -> String {
    let lower = fact.to_lowercase();
    let trimmed: String = lower.chars().filter(|c| c.is_alphanumeric() || c.is_whitespace()).collect();
    trimmed.split_whitespace().take(8).collect::<Vec<_>>().join(" ")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pattern_extracts_name_and_location() {
        let extractor = FactExtractor::new();
        let facts = extractor.extract("My name is Alice. I live in Austin.", &[]).await;
        assert!(facts.iter().any(|f| f.category == Category::Identity && f.fact.contains("Alice")));
        assert!(facts.iter().any(|f| f.category == Category::Location && f.fact.contains("Austin")));
    }

    #[tokio::test]
    async fn extraction_is_idempotent_over_repeated_calls() {
        let extractor = FactExtractor::new();
        let first = extractor.extract("My name is Alice.", &[]).await;
        let second = extractor.extract("My name is Alice.", &first).await;
        assert_eq!(first.len(), second.len());
    }

    #[tokio::test]
    async fn dedup_is_case_insensitive_by_category_and_prefix() {
        let extractor = FactExtractor::new();
        let first = extractor.extract("My name is Alice.", &[]).await;
        let second = extractor.extract("my name is alice.", &first).await;
        assert_eq!(first.len(), second.len());
    }

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> Vec<f64> {
            let lower = text.to_lowercase();
            vec![
                if lower.contains("employer") || lower.contains("job") || lower.contains("company") { 1.0 } else { 0.0 },
                if lower.contains("jobs") || lower.contains("occupation") || lower.contains("employer") { 1.0 } else { 0.0 },
            ]
        }
    }

    #[tokio::test]
    async fn embedding_fallback_fires_when_no_pattern_matches() {
        let extractor = FactExtractor::new().with_embedder(Box::new(FakeEmbedder));
        let facts = extractor.extract("My employer pays me every other Friday", &[]).await;
        assert!(facts.iter().any(|f| f.method == ExtractionMethod::Embedding));
    }

    #[test]
    fn confidence_is_capped_for_embedding_matches() {
        let extractor = FactExtractor::new();
        assert!(extractor.embedding_confidence_cap <= 0.85);
    }
}
