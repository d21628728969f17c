//! [`MemoryStore`] implementations.
//!
//! Both stores keep all three tiers in one [`MemoryTables`] value behind a
//! `tokio` lock. [`FileMemoryStore`] additionally snapshots the global tiers
//! (long-term and entity) to a JSON file after every global write; short-term
//! records are never persisted.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::{
    rank_relevant, MemoryError, MemoryKey, MemoryRecord, MemoryScope, MemoryStore, MemoryValue,
    RelevanceScorer, RunId, TermOverlapScorer,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

/// Snapshot format version written by [`FileMemoryStore`].
const SNAPSHOT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Shared tables
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryTables {
    short_term: HashMap<RunId, BTreeMap<MemoryKey, MemoryRecord>>,
    long_term: BTreeMap<MemoryKey, MemoryRecord>,
    entity: BTreeMap<MemoryKey, MemoryRecord>,
}

impl MemoryTables {
    fn tier(&self, scope: &MemoryScope) -> Option<&BTreeMap<MemoryKey, MemoryRecord>> {
        match scope {
            MemoryScope::ShortTerm(run_id) => self.short_term.get(run_id),
            MemoryScope::LongTerm => Some(&self.long_term),
            MemoryScope::Entity => Some(&self.entity),
        }
    }

    fn tier_mut(&mut self, scope: &MemoryScope) -> &mut BTreeMap<MemoryKey, MemoryRecord> {
        match scope {
            MemoryScope::ShortTerm(run_id) => self.short_term.entry(run_id.clone()).or_default(),
            MemoryScope::LongTerm => &mut self.long_term,
            MemoryScope::Entity => &mut self.entity,
        }
    }

    fn upsert(&mut self, scope: &MemoryScope, key: &MemoryKey, value: MemoryValue) {
        let record = MemoryRecord::new(scope.clone(), key.clone(), value);
        self.tier_mut(scope).insert(key.clone(), record);
    }

    fn get(&self, scope: &MemoryScope, key: &MemoryKey) -> Option<MemoryRecord> {
        self.tier(scope).and_then(|t| t.get(key)).cloned()
    }

    fn relevant(
        &self,
        scope: &MemoryScope,
        query: &str,
        k: usize,
        scorer: &dyn RelevanceScorer,
    ) -> Vec<MemoryRecord> {
        match self.tier(scope) {
            Some(tier) => rank_relevant(tier.values().cloned(), query, k, scorer),
            None => Vec::new(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            long_term: self.long_term.values().cloned().collect(),
            entity: self.entity.values().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local memory. Global tiers live as long as the store.
pub struct InMemoryMemoryStore {
    tables: RwLock<MemoryTables>,
    scorer: Box<dyn RelevanceScorer>,
}

impl InMemoryMemoryStore {
    /// Creates an empty store ranked by [`TermOverlapScorer`].
    pub fn new() -> Self {
        Self::with_scorer(TermOverlapScorer)
    }

    /// Creates an empty store with a custom relevance scorer.
    pub fn with_scorer(scorer: impl RelevanceScorer + 'static) -> Self {
        Self {
            tables: RwLock::new(MemoryTables::default()),
            scorer: Box::new(scorer),
        }
    }

    /// Number of runs that currently hold short-term records.
    pub async fn active_runs(&self) -> usize {
        self.tables.read().await.short_term.len()
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn remember(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
        value: MemoryValue,
    ) -> Result<(), MemoryError> {
        self.tables.write().await.upsert(scope, key, value);
        Ok(())
    }

    async fn recall(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
    ) -> Result<Option<MemoryRecord>, MemoryError> {
        Ok(self.tables.read().await.get(scope, key))
    }

    async fn recall_relevant(
        &self,
        scope: &MemoryScope,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self
            .tables
            .read()
            .await
            .relevant(scope, query, k, self.scorer.as_ref()))
    }

    async fn clear_short_term(&self, run_id: &RunId) -> Result<(), MemoryError> {
        self.tables.write().await.short_term.remove(run_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(default)]
    long_term: Vec<MemoryRecord>,
    #[serde(default)]
    entity: Vec<MemoryRecord>,
}

/// Memory whose global tiers survive process restarts.
///
/// Global writes are serialized through a single writer lock and persisted by
/// writing a temporary file next to the snapshot and renaming it into place,
/// so a crash never leaves a half-written snapshot.
pub struct FileMemoryStore {
    path: PathBuf,
    tables: RwLock<MemoryTables>,
    writer: Mutex<()>,
    scorer: Box<dyn RelevanceScorer>,
}

impl FileMemoryStore {
    /// Opens the snapshot at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Corrupt`] if the file exists but cannot be parsed, and
    /// [`MemoryError::Persistence`] if it cannot be read.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        let mut tables = MemoryTables::default();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| MemoryError::Corrupt(format!("{}: {e}", path.display())))?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(MemoryError::Corrupt(format!(
                        "{}: unsupported snapshot version {}",
                        path.display(),
                        snapshot.version
                    )));
                }
                for record in snapshot.long_term {
                    tables.long_term.insert(record.key.clone(), record);
                }
                for record in snapshot.entity {
                    tables.entity.insert(record.key.clone(), record);
                }
                info!(
                    long_term = tables.long_term.len(),
                    entity = tables.entity.len(),
                    "memory snapshot loaded"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no memory snapshot yet, starting empty");
            }
            Err(e) => {
                return Err(MemoryError::Persistence(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        }

        Ok(Self {
            path,
            tables: RwLock::new(tables),
            writer: Mutex::new(()),
            scorer: Box::new(TermOverlapScorer),
        })
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), MemoryError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| MemoryError::Persistence(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MemoryError::Persistence(format!("{}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| MemoryError::Persistence(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| MemoryError::Persistence(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn remember(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
        value: MemoryValue,
    ) -> Result<(), MemoryError> {
        if !scope.is_global() {
            self.tables.write().await.upsert(scope, key, value);
            return Ok(());
        }

        // Held across update and rename so snapshots land in write order.
        let _writer = self.writer.lock().await;
        let snapshot = {
            let mut tables = self.tables.write().await;
            tables.upsert(scope, key, value);
            tables.snapshot()
        };
        self.persist(&snapshot).await?;
        debug!(tier = scope.label(), key = %key, "memory persisted");
        Ok(())
    }

    async fn recall(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
    ) -> Result<Option<MemoryRecord>, MemoryError> {
        Ok(self.tables.read().await.get(scope, key))
    }

    async fn recall_relevant(
        &self,
        scope: &MemoryScope,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self
            .tables
            .read()
            .await
            .relevant(scope, query, k, self.scorer.as_ref()))
    }

    async fn clear_short_term(&self, run_id: &RunId) -> Result<(), MemoryError> {
        self.tables.write().await.short_term.remove(run_id);
        Ok(())
    }
}
