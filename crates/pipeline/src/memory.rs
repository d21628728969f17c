//! Memory tiers, records, the [`MemoryStore`] port and relevance ranking.
//!
//! Memory is an optimization layer: callers log memory failures and carry on.
//! Only the artifact sink is authoritative for pipeline progress.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MemoryKey, RunId, Timestamp};

// ---------------------------------------------------------------------------
// Scopes and records
// ---------------------------------------------------------------------------

/// The tier a record lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tier", content = "run", rename_all = "snake_case")]
pub enum MemoryScope {
    /// Visible only within one run; released when the run ends.
    ShortTerm(RunId),
    /// Global, accumulates across runs.
    LongTerm,
    /// Global registry keyed by entity name.
    Entity,
}

impl MemoryScope {
    /// Returns `true` for the tiers that outlive a run.
    pub fn is_global(&self) -> bool {
        !matches!(self, MemoryScope::ShortTerm(_))
    }

    /// Short label for logs and prompts.
    pub fn label(&self) -> &'static str {
        match self {
            MemoryScope::ShortTerm(_) => "short-term",
            MemoryScope::LongTerm => "long-term",
            MemoryScope::Entity => "entity",
        }
    }
}

/// The value half of a `remember` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryValue {
    /// Stored text.
    pub text: String,
    /// Retrieval tags (stage id, artifact name, entity kind, …).
    pub tags: Vec<String>,
}

impl MemoryValue {
    /// A value with tags.
    pub fn tagged<I, S>(text: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text: text.into(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&str> for MemoryValue {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            tags: Vec::new(),
        }
    }
}

impl From<String> for MemoryValue {
    fn from(text: String) -> Self {
        Self {
            text,
            tags: Vec::new(),
        }
    }
}

/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Tier the record lives in.
    pub scope: MemoryScope,
    /// Key within the tier.
    pub key: MemoryKey,
    /// Stored text.
    pub value: String,
    /// Retrieval tags.
    pub tags: Vec<String>,
    /// Time of the latest upsert.
    pub recorded_at: Timestamp,
}

impl MemoryRecord {
    /// Builds a record stamped with the current time.
    pub fn new(scope: MemoryScope, key: MemoryKey, value: MemoryValue) -> Self {
        Self {
            scope,
            key,
            value: value.text,
            tags: value.tags,
            recorded_at: Timestamp::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Memory store failure. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MemoryError {
    /// The durable backing file could not be written or read.
    #[error("Memory persistence failed: {0}")]
    Persistence(String),

    /// Stored data could not be decoded.
    #[error("Memory data is corrupt: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Three-tier memory shared by stages and runs.
///
/// Implementations must isolate short-term records per run and serialize
/// writes to the global tiers so concurrent runs never lose updates.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Upserts a record. Global-tier writes are durable across runs.
    async fn remember(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
        value: MemoryValue,
    ) -> Result<(), MemoryError>;

    /// Exact-key retrieval; `Ok(None)` when the key is absent.
    async fn recall(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
    ) -> Result<Option<MemoryRecord>, MemoryError>;

    /// Top-`k` records of `scope` most relevant to `query`, best first.
    async fn recall_relevant(
        &self,
        scope: &MemoryScope,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// Releases every short-term record of `run_id`. Idempotent.
    async fn clear_short_term(&self, run_id: &RunId) -> Result<(), MemoryError>;
}

// ---------------------------------------------------------------------------
// Relevance
// ---------------------------------------------------------------------------

/// Scores a record against a tokenized query. Higher is more relevant; `0.0`
/// means irrelevant and the record is not returned.
pub trait RelevanceScorer: Send + Sync {
    /// Scores `record` for `terms` (lower-cased query tokens).
    fn score(&self, terms: &[String], record: &MemoryRecord) -> f64;
}

/// Term-overlap scorer: a match in the key or a tag weighs three times a
/// match in the value text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapScorer;

impl RelevanceScorer for TermOverlapScorer {
    fn score(&self, terms: &[String], record: &MemoryRecord) -> f64 {
        if terms.is_empty() {
            return 0.0;
        }
        let mut labels = tokenize(record.key.as_str());
        for tag in &record.tags {
            labels.extend(tokenize(tag));
        }
        let body = tokenize(&record.value);

        terms
            .iter()
            .map(|term| {
                if labels.contains(term) {
                    3.0
                } else if body.contains(term) {
                    1.0
                } else {
                    0.0
                }
            })
            .sum()
    }
}

/// Splits text into lower-case alphanumeric terms of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Ranks `records` by relevance to `query` and keeps the best `k`.
///
/// Ties are broken by recency (newer first), then by key for determinism.
pub fn rank_relevant(
    records: impl IntoIterator<Item = MemoryRecord>,
    query: &str,
    k: usize,
    scorer: &dyn RelevanceScorer,
) -> Vec<MemoryRecord> {
    if k == 0 {
        return Vec::new();
    }
    let terms = tokenize(query);
    let mut scored: Vec<(f64, MemoryRecord)> = records
        .into_iter()
        .map(|r| (scorer.score(&terms, &r), r))
        .filter(|(score, _)| *score > 0.0)
        .collect();
    scored.sort_by(|(sa, ra), (sb, rb)| {
        sb.total_cmp(sa)
            .then_with(|| rb.recorded_at.cmp(&ra.recorded_at))
            .then_with(|| ra.key.cmp(&rb.key))
    });
    scored.into_iter().take(k).map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str, tags: &[&str]) -> MemoryRecord {
        MemoryRecord::new(
            MemoryScope::LongTerm,
            MemoryKey::new(key).unwrap(),
            MemoryValue::tagged(value, tags.iter().copied()),
        )
    }

    #[test]
    fn tokenize_lowercases_and_dedups() {
        assert_eq!(
            tokenize("Account account, deposit() a"),
            vec!["account".to_string(), "deposit".to_string()]
        );
    }

    #[test]
    fn key_and_tag_matches_outrank_body_matches() {
        let records = vec![
            record("notes", "talks about the account module", &[]),
            record("account", "class definition", &["entity"]),
            record("unrelated", "nothing here", &[]),
        ];
        let ranked = rank_relevant(records, "account", 5, &TermOverlapScorer);
        let keys: Vec<&str> = ranked.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["account", "notes"]);
    }

    #[test]
    fn rank_respects_k() {
        let records = (0..10).map(|i| record(&format!("design-{i}"), "design", &[]));
        assert_eq!(rank_relevant(records, "design", 3, &TermOverlapScorer).len(), 3);
        assert!(rank_relevant(vec![record("a", "b", &[])], "a", 0, &TermOverlapScorer).is_empty());
    }

    #[test]
    fn scope_labels_and_globality() {
        let run = MemoryScope::ShortTerm(RunId::new("r").unwrap());
        assert!(!run.is_global());
        assert!(MemoryScope::Entity.is_global());
        assert_eq!(MemoryScope::LongTerm.label(), "long-term");
    }
}
