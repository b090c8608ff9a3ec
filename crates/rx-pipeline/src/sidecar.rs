//! On-disk companion file holding result versions next to a source.
//!
//! Every source gets at most one `<stem>.rsext.json` in its directory. All
//! tools share it, each owning one section keyed by [`ToolKind`]. Sections
//! are replaced whole (last write wins); removing the last section deletes
//! the file.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rx_core::{Error, Result, ToolKind, VersionId};
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Current sidecar layout.
pub const SIDECAR_FORMAT: u32 = 1;

/// Suffix appended to the source stem.
pub const SIDECAR_SUFFIX: &str = ".rsext.json";

fn current_format() -> u32 {
    SIDECAR_FORMAT
}

/// Contents of a sidecar file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarData {
    #[serde(default = "current_format")]
    pub format: u32,
    #[serde(default)]
    pub tools: BTreeMap<ToolKind, ToolSection>,
}

impl Default for SidecarData {
    fn default() -> Self {
        Self {
            format: SIDECAR_FORMAT,
            tools: BTreeMap::new(),
        }
    }
}

/// One tool's persisted state for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSection {
    #[serde(default)]
    pub versions: Vec<Version>,
    #[serde(default)]
    pub active_version_id: Option<VersionId>,
    /// Parameters of the most recent run.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Reusable intermediate files (e.g. transcoded audio proxies), keyed by
    /// purpose. Paths may have vanished since they were written.
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    pub updated_at: DateTime<Utc>,
}

/// `<dir>/<stem>.rsext.json` for a source at `<dir>/<stem>.<ext>`.
pub fn sidecar_path(source: &Path) -> PathBuf {
    let parent = source.parent().unwrap_or_else(|| Path::new("."));
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".into());
    parent.join(format!("{stem}{SIDECAR_SUFFIX}"))
}

/// Replace (or with `None`, drop) `tool`'s section in `existing`.
///
/// Returns `None` when no section remains.
pub fn apply_section(
    existing: Option<SidecarData>,
    tool: ToolKind,
    section: Option<ToolSection>,
) -> Option<SidecarData> {
    let mut data = existing.unwrap_or_default();
    match section {
        Some(section) => {
            data.tools.insert(tool, section);
        }
        None => {
            data.tools.remove(&tool);
        }
    }
    data.format = SIDECAR_FORMAT;
    (!data.tools.is_empty()).then_some(data)
}

/// Persistence of [`SidecarData`] per source path.
#[async_trait]
pub trait SidecarStore: Send + Sync {
    /// Read the sidecar for `source`, `None` if there is none.
    async fn load(&self, source: &Path) -> Result<Option<SidecarData>>;

    /// Write the whole sidecar for `source`.
    async fn save(&self, source: &Path, data: &SidecarData) -> Result<()>;

    /// Remove the sidecar for `source`; a missing file is not an error.
    async fn delete(&self, source: &Path) -> Result<()>;

    /// Replace one tool's section, leaving other tools' sections intact.
    async fn write_section(
        &self,
        source: &Path,
        tool: ToolKind,
        section: Option<ToolSection>,
    ) -> Result<()> {
        let existing = self.load(source).await?;
        match apply_section(existing, tool, section) {
            Some(data) => self.save(source, &data).await,
            None => self.delete(source).await,
        }
    }
}

/// [`SidecarStore`] writing JSON files beside each source.
#[derive(Debug, Default)]
pub struct JsonSidecarStore {
    // Serializes read-modify-write cycles across tools sharing one file.
    lock: tokio::sync::Mutex<()>,
}

impl JsonSidecarStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SidecarStore for JsonSidecarStore {
    async fn load(&self, source: &Path) -> Result<Option<SidecarData>> {
        let path = sidecar_path(source);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::persistence(format!("failed to parse {}: {e}", path.display())))
    }

    async fn save(&self, source: &Path, data: &SidecarData) -> Result<()> {
        let path = sidecar_path(source);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let json = serde_json::to_vec_pretty(data)
            .map_err(|e| Error::persistence(format!("failed to encode sidecar: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            Error::persistence(format!("failed to create temp file in {}: {e}", dir.display()))
        })?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::persistence(format!("failed to write sidecar: {e}")))?;
        tmp.persist(&path).map_err(|e| {
            Error::persistence(format!("failed to replace {}: {}", path.display(), e.error))
        })?;

        tracing::debug!(path = %path.display(), "sidecar written");
        Ok(())
    }

    async fn delete(&self, source: &Path) -> Result<()> {
        let path = sidecar_path(source);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::persistence(format!(
                "failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_section(
        &self,
        source: &Path,
        tool: ToolKind,
        section: Option<ToolSection>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let existing = self.load(source).await?;
        match apply_section(existing, tool, section) {
            Some(data) => self.save(source, &data).await,
            None => self.delete(source).await,
        }
    }
}

/// [`SidecarStore`] kept in memory, for runs that must not touch the
/// directories of their sources.
#[derive(Debug, Default)]
pub struct MemorySidecarStore {
    files: parking_lot::Mutex<std::collections::HashMap<PathBuf, SidecarData>>,
}

impl MemorySidecarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sources with a stored sidecar.
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

#[async_trait]
impl SidecarStore for MemorySidecarStore {
    async fn load(&self, source: &Path) -> Result<Option<SidecarData>> {
        Ok(self.files.lock().get(&sidecar_path(source)).cloned())
    }

    async fn save(&self, source: &Path, data: &SidecarData) -> Result<()> {
        self.files.lock().insert(sidecar_path(source), data.clone());
        Ok(())
    }

    async fn delete(&self, source: &Path) -> Result<()> {
        self.files.lock().remove(&sidecar_path(source));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(config: serde_json::Value) -> ToolSection {
        ToolSection {
            versions: Vec::new(),
            active_version_id: None,
            config,
            artifacts: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn path_uses_media_stem() {
        let path = sidecar_path(Path::new("/tmp/example.file.mkv"));
        assert_eq!(path, Path::new("/tmp/example.file.rsext.json"));
    }

    #[test]
    fn apply_section_drops_empty_file() {
        let data = apply_section(None, ToolKind::Ocr, Some(section(serde_json::json!({}))));
        let data = data.unwrap();
        assert!(data.tools.contains_key(&ToolKind::Ocr));
        assert!(apply_section(Some(data), ToolKind::Ocr, None).is_none());
    }

    #[tokio::test]
    async fn sections_of_different_tools_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mkv");
        std::fs::write(&source, b"video").unwrap();
        let store = JsonSidecarStore::new();

        store
            .write_section(&source, ToolKind::Transcription, Some(section(serde_json::json!({"model": "a"}))))
            .await
            .unwrap();
        store
            .write_section(&source, ToolKind::Translation, Some(section(serde_json::json!({"batch_count": 2}))))
            .await
            .unwrap();

        let data = store.load(&source).await.unwrap().unwrap();
        assert_eq!(data.tools.len(), 2);
        assert_eq!(data.tools[&ToolKind::Transcription].config["model"], "a");

        store
            .write_section(&source, ToolKind::Transcription, None)
            .await
            .unwrap();
        let data = store.load(&source).await.unwrap().unwrap();
        assert_eq!(data.tools.len(), 1);

        store
            .write_section(&source, ToolKind::Translation, None)
            .await
            .unwrap();
        assert!(!dir.path().join("movie.rsext.json").exists());
        assert!(store.load(&source).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_sidecar_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mkv");
        std::fs::write(dir.path().join("movie.rsext.json"), b"{oops").unwrap();
        let err = JsonSidecarStore::new().load(&source).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[tokio::test]
    async fn save_into_missing_directory_fails() {
        let source = Path::new("/definitely/not/here/movie.mkv");
        let err = JsonSidecarStore::new()
            .save(source, &SidecarData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[tokio::test]
    async fn saving_identical_data_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.srt");
        let store = JsonSidecarStore::new();
        let mut data = SidecarData::default();
        data.tools
            .insert(ToolKind::Translation, section(serde_json::json!({"x": 1})));

        store.save(&source, &data).await.unwrap();
        let first = std::fs::read(sidecar_path(&source)).unwrap();
        store.save(&source, &data).await.unwrap();
        let second = std::fs::read(sidecar_path(&source)).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn memory_store_tracks_sections() {
        let store = MemorySidecarStore::new();
        let source = Path::new("/m/show.mkv");
        store
            .write_section(source, ToolKind::Ocr, Some(section(serde_json::json!({}))))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        store.write_section(source, ToolKind::Ocr, None).await.unwrap();
        assert!(store.is_empty());
    }
}
