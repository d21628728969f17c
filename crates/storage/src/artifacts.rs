//! [`ArtifactSink`] implementations.
//!
//! Versions are immutable and numbered from 1. Writing content identical to the
//! latest version is a no-op that returns the latest location, which keeps a
//! resumed or replayed stage from producing spurious versions. Older versions
//! are not consulted, so reverting to earlier content mints a new version.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::{Artifact, ArtifactError, ArtifactLocation, ArtifactName, ArtifactSink, RunId};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};

/// Directory under a run that holds every version as JSON.
const VERSIONS_DIR: &str = "versions";

/// Directory under a run that holds the latest version of each artifact as a plain file.
const LATEST_DIR: &str = "latest";

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

type RunArtifacts = BTreeMap<ArtifactName, Vec<Artifact>>;

/// Process-local sink, used for tests and dry runs.
#[derive(Default)]
pub struct InMemoryArtifactSink {
    runs: RwLock<HashMap<RunId, RunArtifacts>>,
}

impl InMemoryArtifactSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored versions across all runs.
    pub async fn version_count(&self) -> usize {
        self.runs
            .read()
            .await
            .values()
            .flat_map(|run| run.values())
            .map(Vec::len)
            .sum()
    }
}

fn memory_location(run_id: &RunId, artifact: &Artifact) -> ArtifactLocation {
    ArtifactLocation {
        run_id: run_id.clone(),
        name: artifact.name.clone(),
        version: artifact.version,
        uri: format!("memory://{run_id}/{}/v{}", artifact.name, artifact.version),
    }
}

fn not_found(run_id: &RunId, name: &ArtifactName) -> ArtifactError {
    ArtifactError::NotFound {
        run_id: run_id.clone(),
        name: name.clone(),
    }
}

#[async_trait]
impl ArtifactSink for InMemoryArtifactSink {
    async fn write(
        &self,
        run_id: &RunId,
        artifact: &Artifact,
    ) -> Result<ArtifactLocation, ArtifactError> {
        let mut runs = self.runs.write().await;
        let versions = runs
            .entry(run_id.clone())
            .or_default()
            .entry(artifact.name.clone())
            .or_default();

        if let Some(latest) = versions.last() {
            if latest.same_content(artifact) {
                return Ok(memory_location(run_id, latest));
            }
        }
        let stored = artifact.clone().with_version(versions.len() as u32 + 1);
        let location = memory_location(run_id, &stored);
        versions.push(stored);
        Ok(location)
    }

    async fn read(&self, run_id: &RunId, name: &ArtifactName) -> Result<Artifact, ArtifactError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .and_then(|run| run.get(name))
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| not_found(run_id, name))
    }

    async fn read_version(
        &self,
        run_id: &RunId,
        name: &ArtifactName,
        version: u32,
    ) -> Result<Artifact, ArtifactError> {
        let index = (version as usize)
            .checked_sub(1)
            .ok_or_else(|| not_found(run_id, name))?;
        self.runs
            .read()
            .await
            .get(run_id)
            .and_then(|run| run.get(name))
            .and_then(|versions| versions.get(index))
            .cloned()
            .ok_or_else(|| not_found(run_id, name))
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactLocation>, ArtifactError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .map(|run| {
                run.values()
                    .filter_map(|versions| versions.last())
                    .map(|latest| memory_location(run_id, latest))
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Filesystem sink
// ---------------------------------------------------------------------------

/// Durable sink rooted at a directory.
///
/// Layout per run:
///
/// ```text
/// <root>/<run>/versions/<name>/v<N>.json   every version, as serialized Artifact
/// <root>/<run>/latest/<name>               latest content as a plain file
/// ```
///
/// All writes go through one writer lock; files are written to a temporary
/// name and renamed into place.
pub struct FsArtifactSink {
    root: PathBuf,
    writer: Mutex<()>,
}

impl FsArtifactSink {
    /// Creates a sink rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writer: Mutex::new(()),
        }
    }

    /// The sink's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the exported plain file for the latest version of `name`.
    pub fn latest_path(&self, run_id: &RunId, name: &ArtifactName) -> PathBuf {
        self.root
            .join(run_id.as_str())
            .join(LATEST_DIR)
            .join(name.as_str())
    }

    fn versions_dir(&self, run_id: &RunId, name: &ArtifactName) -> PathBuf {
        self.root
            .join(run_id.as_str())
            .join(VERSIONS_DIR)
            .join(name.as_str())
    }

    fn version_path(&self, run_id: &RunId, name: &ArtifactName, version: u32) -> PathBuf {
        self.versions_dir(run_id, name).join(format!("v{version}.json"))
    }

    fn location(&self, run_id: &RunId, name: &ArtifactName, version: u32) -> ArtifactLocation {
        ArtifactLocation {
            run_id: run_id.clone(),
            name: name.clone(),
            version,
            uri: self.version_path(run_id, name, version).display().to_string(),
        }
    }

    /// Highest stored version of `name`, or `None` if nothing is stored.
    async fn latest_version(
        &self,
        run_id: &RunId,
        name: &ArtifactName,
    ) -> Result<Option<u32>, ArtifactError> {
        let dir = self.versions_dir(run_id, name);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(&dir, e)),
        };

        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error(&dir, e))?
        {
            let file_name = entry.file_name();
            let parsed = file_name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(version) = parsed {
                latest = latest.max(Some(version));
            }
        }
        Ok(latest)
    }

    async fn load(&self, path: &Path) -> Result<Artifact, ArtifactError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| storage_error(path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ArtifactError::Storage(format!("{}: {e}", path.display())))
    }
}

fn storage_error(path: &Path, err: std::io::Error) -> ArtifactError {
    ArtifactError::Storage(format!("{}: {err}", path.display()))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| storage_error(parent, e))?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| storage_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| storage_error(path, e))
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    #[instrument(skip_all, fields(run_id = %run_id, artifact = %artifact.name))]
    async fn write(
        &self,
        run_id: &RunId,
        artifact: &Artifact,
    ) -> Result<ArtifactLocation, ArtifactError> {
        let _writer = self.writer.lock().await;

        let latest = self.latest_version(run_id, &artifact.name).await?;
        if let Some(version) = latest {
            let current = self
                .load(&self.version_path(run_id, &artifact.name, version))
                .await?;
            if current.same_content(artifact) {
                debug!(version, "content unchanged, no new version");
                return Ok(self.location(run_id, &artifact.name, version));
            }
        }

        let version = latest.unwrap_or(0) + 1;
        let stored = artifact.clone().with_version(version);
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| ArtifactError::Storage(e.to_string()))?;
        write_atomic(&self.version_path(run_id, &stored.name, version), &json).await?;
        write_atomic(
            &self.latest_path(run_id, &stored.name),
            stored.content.as_text().as_bytes(),
        )
        .await?;

        debug!(version, "artifact version written");
        Ok(self.location(run_id, &stored.name, version))
    }

    async fn read(&self, run_id: &RunId, name: &ArtifactName) -> Result<Artifact, ArtifactError> {
        let version = self
            .latest_version(run_id, name)
            .await?
            .ok_or_else(|| not_found(run_id, name))?;
        self.load(&self.version_path(run_id, name, version)).await
    }

    async fn read_version(
        &self,
        run_id: &RunId,
        name: &ArtifactName,
        version: u32,
    ) -> Result<Artifact, ArtifactError> {
        let path = self.version_path(run_id, name, version);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => self.load(&path).await,
            Ok(false) => Err(not_found(run_id, name)),
            Err(e) => Err(storage_error(&path, e)),
        }
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactLocation>, ArtifactError> {
        let dir = self.root.join(run_id.as_str()).join(VERSIONS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error(&dir, e))?
        {
            if let Some(name) = entry.file_name().to_str().and_then(|n| ArtifactName::new(n)) {
                names.push(name);
            }
        }
        names.sort();

        let mut locations = Vec::with_capacity(names.len());
        for name in names {
            if let Some(version) = self.latest_version(run_id, &name).await? {
                locations.push(self.location(run_id, &name, version));
            }
        }
        Ok(locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::StageId;

    fn artifact(name: &str, content: &str) -> Artifact {
        Artifact::new(
            ArtifactName::new(name).unwrap(),
            StageId::new("stage").unwrap(),
            content,
        )
    }

    fn run(r: &str) -> RunId {
        RunId::new(r).unwrap()
    }

    async fn exercise_versioning(sink: &dyn ArtifactSink) {
        let r = run("r1");
        let first = sink.write(&r, &artifact("design.md", "v1")).await.unwrap();
        let again = sink.write(&r, &artifact("design.md", "v1")).await.unwrap();
        let second = sink.write(&r, &artifact("design.md", "v2")).await.unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(again, first);
        assert_eq!(second.version, 2);

        let name = ArtifactName::new("design.md").unwrap();
        let latest = sink.read(&r, &name).await.unwrap();
        assert_eq!(latest.content.as_text(), "v2");
        assert_eq!(latest.version, 2);
        let old = sink.read_version(&r, &name, 1).await.unwrap();
        assert_eq!(old.content.as_text(), "v1");
        assert!(matches!(
            sink.read_version(&r, &name, 3).await,
            Err(ArtifactError::NotFound { .. })
        ));
    }

    async fn exercise_listing(sink: &dyn ArtifactSink) {
        let r = run("r2");
        sink.write(&r, &artifact("review.md", "OK")).await.unwrap();
        sink.write(&r, &artifact("module", "M")).await.unwrap();
        sink.write(&run("other"), &artifact("zzz", "Z")).await.unwrap();

        let names: Vec<String> = sink
            .list(&r)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.name.to_string())
            .collect();
        assert_eq!(names, vec!["module", "review.md"]);
        assert!(sink.list(&run("missing")).await.unwrap().is_empty());
        assert!(matches!(
            sink.read(&run("missing"), &ArtifactName::new("module").unwrap())
                .await,
            Err(ArtifactError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn in_memory_sink_versions_content() {
        exercise_versioning(&InMemoryArtifactSink::new()).await;
    }

    #[tokio::test]
    async fn in_memory_sink_lists_per_run() {
        let sink = InMemoryArtifactSink::new();
        exercise_listing(&sink).await;
        assert_eq!(sink.version_count().await, 3);
    }

    #[tokio::test]
    async fn fs_sink_versions_content() {
        let dir = tempfile::tempdir().unwrap();
        exercise_versioning(&FsArtifactSink::new(dir.path())).await;
    }

    #[tokio::test]
    async fn fs_sink_lists_per_run() {
        let dir = tempfile::tempdir().unwrap();
        exercise_listing(&FsArtifactSink::new(dir.path())).await;
    }

    #[tokio::test]
    async fn fs_sink_exports_latest_as_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path());
        let r = run("r3");
        sink.write(&r, &artifact("accounts.py", "class Account: pass\n"))
            .await
            .unwrap();
        sink.write(&r, &artifact("accounts.py", "class Account:\n    balance = 0\n"))
            .await
            .unwrap();

        let exported = std::fs::read_to_string(
            sink.latest_path(&r, &ArtifactName::new("accounts.py").unwrap()),
        )
        .unwrap();
        assert_eq!(exported, "class Account:\n    balance = 0\n");
    }

    async fn exercise_reverted_content(sink: &dyn ArtifactSink) {
        let r = run("r5");
        let name = ArtifactName::new("design.md").unwrap();
        sink.write(&r, &artifact("design.md", "first")).await.unwrap();
        sink.write(&r, &artifact("design.md", "second")).await.unwrap();
        let reverted = sink.write(&r, &artifact("design.md", "first")).await.unwrap();

        assert_eq!(reverted.version, 3);
        assert_eq!(sink.read(&r, &name).await.unwrap().content.as_text(), "first");
        assert_eq!(
            sink.read_version(&r, &name, 1).await.unwrap().content.as_text(),
            "first"
        );
    }

    #[tokio::test]
    async fn reverted_content_becomes_a_new_version() {
        exercise_reverted_content(&InMemoryArtifactSink::new()).await;
        let dir = tempfile::tempdir().unwrap();
        exercise_reverted_content(&FsArtifactSink::new(dir.path())).await;
    }

    #[tokio::test]
    async fn fs_sink_keeps_every_file_under_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let sink = FsArtifactSink::new(&root);

        for escaping in ["../escape", "/tmp/escape", "..", "a/../../b"] {
            assert!(RunId::new(escaping).is_none(), "{escaping:?} should be rejected");
        }
        let location = sink.write(&run("r6"), &artifact("design.md", "d")).await.unwrap();

        assert!(std::path::Path::new(&location.uri).starts_with(&root));
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("root")]);
    }

    #[tokio::test]
    async fn fs_sink_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        FsArtifactSink::new(dir.path())
            .write(&run("r4"), &artifact("README.md", "docs"))
            .await
            .unwrap();

        let reopened = FsArtifactSink::new(dir.path());
        let location = reopened
            .write(&run("r4"), &artifact("README.md", "docs"))
            .await
            .unwrap();
        assert_eq!(location.version, 1);
    }
}
