//! Shared value types for the pipeline domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants and participate in domain computations.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ArtifactName, StageId};

// ---------------------------------------------------------------------------
// Token accounting
// ---------------------------------------------------------------------------

/// Number of tokens consumed in an LLM API call.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TokenCount(u64);

impl TokenCount {
    /// Creates a [`TokenCount`] from a raw integer.
    pub fn new(count: u64) -> Self {
        Self(count)
    }

    /// Returns the underlying integer value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if this count is zero.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for TokenCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add for TokenCount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for TokenCount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

/// Prompt and completion token counts reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the assembled prompt.
    pub input: TokenCount,
    /// Tokens in the generated completion.
    pub output: TokenCount,
}

impl TokenUsage {
    /// Creates a usage record from raw counts.
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input: TokenCount::new(input),
            output: TokenCount::new(output),
        }
    }

    /// Input plus output tokens.
    pub fn total(self) -> TokenCount {
        self.input + self.output
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// The shape a stage promises for one of its declared outputs.
///
/// Model output is validated against the shape before the artifact is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ArtifactShape {
    /// Free-form, non-empty text (Markdown documents, review notes).
    Text,
    /// Source code. A fenced block is unwrapped when present.
    Code {
        /// Language tag used for the fence and for sandbox execution.
        language: Option<String>,
    },
    /// A JSON document (object, array or scalar).
    Json,
}

impl ArtifactShape {
    /// Short label used in prompts and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactShape::Text => "text",
            ArtifactShape::Code { .. } => "code",
            ArtifactShape::Json => "json",
        }
    }
}

/// The payload of an [`Artifact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArtifactContent {
    /// Text or code.
    Text(String),
    /// Structured findings.
    Json(serde_json::Value),
}

impl ArtifactContent {
    /// Renders the payload as text; JSON is pretty-printed.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            ArtifactContent::Text(text) => Cow::Borrowed(text),
            ArtifactContent::Json(value) => Cow::Owned(
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
            ),
        }
    }
}

impl From<&str> for ArtifactContent {
    fn from(value: &str) -> Self {
        ArtifactContent::Text(value.to_string())
    }
}

impl From<String> for ArtifactContent {
    fn from(value: String) -> Self {
        ArtifactContent::Text(value)
    }
}

/// Produced content tagged with its producing stage, name and version.
///
/// Artifacts are immutable once written. Regenerating an artifact produces a
/// new version in the sink; the earlier versions stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact name; unique within a run.
    pub name: ArtifactName,
    /// Stage that produced the artifact.
    pub stage: StageId,
    /// Version assigned by the artifact sink, starting at 1.
    pub version: u32,
    /// Payload.
    pub content: ArtifactContent,
    /// When the content was produced.
    pub created_at: Timestamp,
}

impl Artifact {
    /// Creates a first-version artifact stamped with the current time.
    pub fn new(name: ArtifactName, stage: StageId, content: impl Into<ArtifactContent>) -> Self {
        Self {
            name,
            stage,
            version: 1,
            content: content.into(),
            created_at: Timestamp::now(),
        }
    }

    /// Returns a copy carrying the given version number.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Returns `true` if both artifacts carry the same payload.
    pub fn same_content(&self, other: &Artifact) -> bool {
        self.content == other.content
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
