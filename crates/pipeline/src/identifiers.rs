//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! a [`StageId`] with a [`BackendId`] even though both are strings under the
//! hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: configuration names
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a stage by its configured name within a pipeline graph.
    ///
    /// Stage names are unique per pipeline and defined in `.stagecraft/pipeline.toml`
    /// (or in the built-in engineering-team pipeline).
    StageId
}

string_id! {
    /// Identifies a configured LLM backend (`[[backends]] id = "..."`).
    BackendId
}

string_id! {
    /// Identifies a named pipeline configuration (e.g. `"engineering-team"`).
    PipelineName
}

string_id! {
    /// Key of a [`crate::MemoryRecord`] within its scope.
    ///
    /// Artifact mirrors use the artifact name; entity records use the entity name.
    MemoryKey
}

// ---------------------------------------------------------------------------
// Identifiers: runs
// ---------------------------------------------------------------------------

/// Identifies a single pipeline run.
///
/// Supplied by the caller of the run trigger or generated with
/// [`RunId::generate`]. Propagated through spans so all activity from a single
/// run can be correlated, and used as the directory name for the run's
/// artifacts, so it must be a single plain path segment. Deserialization
/// applies the same rule as [`RunId::new`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Creates a run identifier, returning `None` if the value is empty or is
    /// not usable as a single directory name.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let v = value.into();
        if is_path_segment(&v) {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Generates a new random run identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value.clone()).ok_or_else(|| format!("invalid run id '{value}'"))
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// True when `v` names exactly one directory entry: non-empty, not `.`/`..`,
/// no separators or NUL, no surrounding whitespace.
fn is_path_segment(v: &str) -> bool {
    !(v.is_empty()
        || v == "."
        || v == ".."
        || v.contains(['/', '\\', '\0'])
        || v.trim() != v)
}

// ---------------------------------------------------------------------------
// Identifiers: artifacts
// ---------------------------------------------------------------------------

/// The name of an artifact produced by a stage (e.g. `"design.md"`, `"module"`).
///
/// Artifact names double as context keys and as file names in the artifact sink,
/// so they must not contain path separators or be `.`/`..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactName(String);

impl ArtifactName {
    /// Creates a new artifact name, returning `None` if the value is empty or
    /// would escape its run directory.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let v = value.into();
        if is_path_segment(&v) {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
