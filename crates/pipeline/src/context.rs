//! Run-scoped, append-only artifact context.

use std::collections::BTreeMap;

use crate::{Artifact, ArtifactError, ArtifactName, RunId, Timestamp};

/// Artifacts committed so far in one run, keyed by name.
///
/// Owned by exactly one run. Entries can be added but never replaced, so a
/// later stage always sees the literal output an earlier stage committed.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: RunId,
    created_at: Timestamp,
    entries: BTreeMap<ArtifactName, Artifact>,
}

impl RunContext {
    /// Creates an empty context for `run_id`.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            created_at: Timestamp::now(),
            entries: BTreeMap::new(),
        }
    }

    /// The owning run.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// When the run was created.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Adds an artifact.
    ///
    /// # Errors
    ///
    /// [`ArtifactError::AlreadyWritten`] if the name is already present.
    pub fn insert(&mut self, artifact: Artifact) -> Result<(), ArtifactError> {
        if self.entries.contains_key(&artifact.name) {
            return Err(ArtifactError::AlreadyWritten {
                run_id: self.run_id.clone(),
                name: artifact.name,
            });
        }
        self.entries.insert(artifact.name.clone(), artifact);
        Ok(())
    }

    /// Looks up an artifact by name.
    pub fn get(&self, name: &ArtifactName) -> Option<&Artifact> {
        self.entries.get(name)
    }

    /// Returns `true` if an artifact with this name has been committed.
    pub fn contains(&self, name: &ArtifactName) -> bool {
        self.entries.contains_key(name)
    }

    /// All committed artifacts in name order.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.entries.values()
    }

    /// Number of committed artifacts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StageId;

    fn artifact(name: &str, text: &str) -> Artifact {
        Artifact::new(
            ArtifactName::new(name).unwrap(),
            StageId::new("spec").unwrap(),
            text,
        )
    }

    #[test]
    fn entries_are_write_once() {
        let mut ctx = RunContext::new(RunId::new("r1").unwrap());
        ctx.insert(artifact("requirements", "R")).unwrap();

        let err = ctx.insert(artifact("requirements", "R2")).unwrap_err();
        assert!(matches!(err, ArtifactError::AlreadyWritten { .. }));
        let kept = ctx.get(&ArtifactName::new("requirements").unwrap()).unwrap();
        assert_eq!(kept.content.as_text(), "R");
        assert_eq!(ctx.len(), 1);
    }
}
