//! Artifact sink port.
//!
//! The sink is the authoritative record of a run's output. Writes are durable
//! and versioned: identical content is a no-op, new content is a new version.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Artifact, ArtifactName, RunId};

/// Where a written artifact version lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    /// Owning run.
    pub run_id: RunId,
    /// Artifact name.
    pub name: ArtifactName,
    /// Version number, starting at 1.
    pub version: u32,
    /// Implementation-specific address (file path, `memory://…`).
    pub uri: String,
}

/// Artifact storage failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ArtifactError {
    /// No artifact (or version) under this name.
    #[error("Artifact '{name}' not found in run '{run_id}'")]
    NotFound {
        /// Run searched.
        run_id: RunId,
        /// Name searched.
        name: ArtifactName,
    },

    /// A run context entry already exists under this name.
    #[error("Artifact '{name}' was already written in run '{run_id}'")]
    AlreadyWritten {
        /// Run holding the artifact.
        run_id: RunId,
        /// Contested name.
        name: ArtifactName,
    },

    /// The underlying storage failed.
    #[error("Artifact storage error: {0}")]
    Storage(String),
}

/// Durable, versioned artifact storage.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Writes `artifact` under `run_id`.
    ///
    /// If the latest stored version has identical content, nothing is written
    /// and that version's location is returned. Only the latest version is
    /// compared: content that matches an older version is stored again under
    /// the next number.
    async fn write(&self, run_id: &RunId, artifact: &Artifact)
        -> Result<ArtifactLocation, ArtifactError>;

    /// Reads the latest version of `name`.
    async fn read(&self, run_id: &RunId, name: &ArtifactName) -> Result<Artifact, ArtifactError>;

    /// Reads a specific version of `name`.
    async fn read_version(
        &self,
        run_id: &RunId,
        name: &ArtifactName,
        version: u32,
    ) -> Result<Artifact, ArtifactError>;

    /// Latest location of every artifact in the run, in name order.
    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactLocation>, ArtifactError>;
}
