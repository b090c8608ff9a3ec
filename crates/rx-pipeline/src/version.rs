//! Versioned result history per job, mirrored to the sidecar.
//!
//! Versions are appended in creation order and never reordered. Writes to
//! disk replace the tool's whole section, so persisting is idempotent and a
//! failed write leaves the in-memory history authoritative.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rx_core::events::{EventBus, EventPayload};
use rx_core::{Error, JobId, Result, RunId, ToolKind, VersionId};
use serde::{Deserialize, Serialize};

use crate::sidecar::{SidecarStore, ToolSection};

/// Whether a version holds the full result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOutcome {
    Complete,
    /// Output hit a size or token limit; kept for inspection.
    Truncated,
}

/// Cost of producing a version, as reported by the external service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetrics {
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub duration_ms: Option<u64>,
}

fn loaded_from_disk() -> bool {
    true
}

/// One result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    /// 1-based position in creation order; never reused within a job.
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    /// Parameters the run used.
    pub config_snapshot: serde_json::Value,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub usage: Option<UsageMetrics>,
    pub outcome: VersionOutcome,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    /// Whether the sidecar holds this exact content.
    #[serde(skip_serializing, default = "loaded_from_disk")]
    pub persisted: bool,
}

/// Everything needed to append a version.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub run_id: Option<RunId>,
    pub config_snapshot: serde_json::Value,
    pub payload: serde_json::Value,
    /// Label derived from the model or service, if any.
    pub name_hint: Option<String>,
    pub usage: Option<UsageMetrics>,
    pub outcome: VersionOutcome,
}

#[derive(Debug, Default)]
struct History {
    source: PathBuf,
    versions: Vec<Version>,
    active: Option<VersionId>,
    next_sequence: u32,
    last_created: Option<DateTime<Utc>>,
    config: serde_json::Value,
    artifacts: BTreeMap<String, PathBuf>,
}

impl History {
    fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            next_sequence: 1,
            ..Self::default()
        }
    }

    fn to_section(&self) -> Option<ToolSection> {
        if self.versions.is_empty() && self.artifacts.is_empty() {
            return None;
        }
        Some(ToolSection {
            versions: self.versions.clone(),
            active_version_id: self.active,
            config: self.config.clone(),
            artifacts: self.artifacts.clone(),
            updated_at: Utc::now(),
        })
    }
}

/// Result versions of every job of one tool.
pub struct VersionStore {
    tool: ToolKind,
    sidecar: Arc<dyn SidecarStore>,
    events: Arc<EventBus>,
    inner: RwLock<HashMap<JobId, History>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl VersionStore {
    pub fn new(tool: ToolKind, sidecar: Arc<dyn SidecarStore>, events: Arc<EventBus>) -> Self {
        Self {
            tool,
            sidecar,
            events,
            inner: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start tracking `job_id`, restoring earlier versions from the sidecar.
    ///
    /// An unreadable sidecar is logged and treated as empty. Returns the
    /// number of versions restored.
    pub async fn load(&self, job_id: JobId, source: &Path) -> usize {
        let mut history = History::new(source);

        match self.sidecar.load(source).await {
            Ok(Some(mut data)) => {
                if let Some(section) = data.tools.remove(&self.tool) {
                    history.next_sequence = section
                        .versions
                        .iter()
                        .map(|v| v.sequence)
                        .max()
                        .unwrap_or(0)
                        + 1;
                    history.last_created = section.versions.iter().map(|v| v.created_at).max();
                    history.active = section
                        .active_version_id
                        .filter(|id| section.versions.iter().any(|v| v.id == *id));
                    history.versions = section.versions;
                    history.config = section.config;
                    history.artifacts = section.artifacts;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(tool = %self.tool, job_id = %job_id, "ignoring unreadable sidecar: {e}");
            }
        }

        let count = history.versions.len();
        self.inner.write().insert(job_id, history);
        count
    }

    /// Append a version for `job_id`.
    ///
    /// A complete version becomes active. A truncated one becomes active
    /// only when the job has no active version yet.
    pub fn create_version(&self, job_id: JobId, new: NewVersion) -> Result<Version> {
        let (version, active) = {
            let mut inner = self.inner.write();
            let history = inner
                .get_mut(&job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;

            let now = Utc::now();
            let created_at = match history.last_created {
                Some(last) if now <= last => last + chrono::Duration::microseconds(1),
                _ => now,
            };
            let sequence = history.next_sequence;
            let name = match new.name_hint.as_deref().filter(|h| !h.trim().is_empty()) {
                Some(hint) => format!("{} (v{sequence})", hint.trim()),
                None => format!("Version {sequence}"),
            };

            let version = Version {
                id: VersionId::new(),
                name,
                sequence,
                created_at,
                run_id: new.run_id,
                config_snapshot: new.config_snapshot.clone(),
                payload: new.payload,
                usage: new.usage,
                outcome: new.outcome,
                edited_at: None,
                persisted: false,
            };

            history.next_sequence += 1;
            history.last_created = Some(created_at);
            history.config = new.config_snapshot;
            if new.outcome == VersionOutcome::Complete || history.active.is_none() {
                history.active = Some(version.id);
            }
            history.versions.push(version.clone());
            (version, history.active)
        };

        tracing::info!(
            tool = %self.tool,
            job_id = %job_id,
            version = %version.name,
            outcome = ?version.outcome,
            "version created"
        );
        self.announce(job_id, active);
        Ok(version)
    }

    /// Write the job's history to the sidecar.
    ///
    /// Never fails: a write error is logged, announced as
    /// [`EventPayload::PersistFailed`], and leaves unsaved versions with
    /// `persisted = false`.
    pub async fn persist(&self, job_id: JobId) -> bool {
        let _guard = self.write_lock.lock().await;

        let Some((source, section, written)) = self.snapshot(job_id) else {
            return false;
        };

        match self.sidecar.write_section(&source, self.tool, section).await {
            Ok(()) => {
                let mut inner = self.inner.write();
                if let Some(history) = inner.get_mut(&job_id) {
                    for v in history.versions.iter_mut() {
                        if written.get(&v.id) == Some(&v.edited_at) {
                            v.persisted = true;
                        }
                    }
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    tool = %self.tool,
                    job_id = %job_id,
                    path = %source.display(),
                    "failed to persist versions: {e}"
                );
                self.events.broadcast(
                    self.tool,
                    EventPayload::PersistFailed {
                        job_id,
                        error: e.to_string(),
                    },
                );
                false
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn snapshot(
        &self,
        job_id: JobId,
    ) -> Option<(
        PathBuf,
        Option<ToolSection>,
        HashMap<VersionId, Option<DateTime<Utc>>>,
    )> {
        let inner = self.inner.read();
        let history = inner.get(&job_id)?;
        let written = history
            .versions
            .iter()
            .map(|v| (v.id, v.edited_at))
            .collect();
        Some((history.source.clone(), history.to_section(), written))
    }

    /// Remove a version. If it was active, the most recent remaining
    /// version becomes active (or none). Returns the new active id.
    pub async fn delete_version(
        &self,
        job_id: JobId,
        version_id: VersionId,
    ) -> Result<Option<VersionId>> {
        let active = {
            let mut inner = self.inner.write();
            let history = inner
                .get_mut(&job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            let pos = history
                .versions
                .iter()
                .position(|v| v.id == version_id)
                .ok_or_else(|| Error::not_found("version", version_id))?;
            history.versions.remove(pos);
            if history.active == Some(version_id) {
                history.active = history.versions.last().map(|v| v.id);
            }
            history.active
        };

        self.announce(job_id, active);
        self.persist(job_id).await;
        Ok(active)
    }

    /// Make `version_id` the active version.
    pub async fn set_active(&self, job_id: JobId, version_id: VersionId) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let history = inner
                .get_mut(&job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            if !history.versions.iter().any(|v| v.id == version_id) {
                return Err(Error::not_found("version", version_id));
            }
            history.active = Some(version_id);
        }
        self.announce(job_id, Some(version_id));
        self.persist(job_id).await;
        Ok(())
    }

    /// Replace a version's payload in memory. The caller schedules the
    /// write (see [`EditDebouncer`](crate::EditDebouncer)).
    pub fn edit_payload(
        &self,
        job_id: JobId,
        version_id: VersionId,
        payload: serde_json::Value,
    ) -> Result<Version> {
        let mut inner = self.inner.write();
        let history = inner
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;
        let last_edit = history.versions.iter().filter_map(|v| v.edited_at).max();
        let version = history
            .versions
            .iter_mut()
            .find(|v| v.id == version_id)
            .ok_or_else(|| Error::not_found("version", version_id))?;

        let now = Utc::now();
        let edited_at = match version.edited_at.into_iter().chain(last_edit).max() {
            Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
            _ => now,
        };
        version.payload = payload;
        version.edited_at = Some(edited_at);
        version.persisted = false;
        Ok(version.clone())
    }

    /// Versions of `job_id` in creation order.
    pub fn versions(&self, job_id: JobId) -> Vec<Version> {
        self.inner
            .read()
            .get(&job_id)
            .map(|h| h.versions.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, job_id: JobId, version_id: VersionId) -> Option<Version> {
        self.inner
            .read()
            .get(&job_id)?
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .cloned()
    }

    pub fn active_version_id(&self, job_id: JobId) -> Option<VersionId> {
        self.inner.read().get(&job_id)?.active
    }

    pub fn active_version(&self, job_id: JobId) -> Option<Version> {
        let inner = self.inner.read();
        let history = inner.get(&job_id)?;
        let active = history.active?;
        history.versions.iter().find(|v| v.id == active).cloned()
    }

    /// Cached intermediate files that still exist. Vanished entries are
    /// dropped from memory.
    pub fn cached_artifacts(&self, job_id: JobId) -> BTreeMap<String, PathBuf> {
        let mut inner = self.inner.write();
        let Some(history) = inner.get_mut(&job_id) else {
            return BTreeMap::new();
        };
        history.artifacts.retain(|key, path| {
            let exists = path.is_file();
            if !exists {
                tracing::debug!(job_id = %job_id, key = %key, path = %path.display(), "cached artifact vanished");
            }
            exists
        });
        history.artifacts.clone()
    }

    /// Remember intermediate files for reuse by later runs.
    pub fn record_artifacts(&self, job_id: JobId, artifacts: BTreeMap<String, PathBuf>) {
        if artifacts.is_empty() {
            return;
        }
        if let Some(history) = self.inner.write().get_mut(&job_id) {
            history.artifacts.extend(artifacts);
        }
    }

    /// Delete every version of `job_id` and its sidecar section.
    pub async fn clear(&self, job_id: JobId) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let history = inner
                .get_mut(&job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            history.versions.clear();
            history.active = None;
        }
        self.announce(job_id, None);
        self.persist(job_id).await;
        Ok(())
    }

    /// Stop tracking `job_id` in memory; the sidecar is left alone.
    pub fn forget(&self, job_id: JobId) {
        self.inner.write().remove(&job_id);
    }

    fn announce(&self, job_id: JobId, active_version_id: Option<VersionId>) {
        self.events.broadcast(
            self.tool,
            EventPayload::VersionsChanged {
                job_id,
                active_version_id,
            },
        );
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore")
            .field("tool", &self.tool)
            .field("jobs", &self.inner.read().len())
            .finish_non_exhaustive()
    }
}
