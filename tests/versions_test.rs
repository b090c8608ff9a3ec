//! Version history: truncation and retry, deletion, and sidecar persistence.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use assert_matches::assert_matches;
use common::{FailingSidecar, LimitedTranslator, Pace, PacedExecutor};
use rx_core::events::EventPayload;
use rx_core::{Error, FailureKind, JobStatus};
use rx_pipeline::sidecar::sidecar_path;
use rx_pipeline::{JsonSidecarStore, SidecarStore, TranslationExecutor, VersionOutcome};

// ---------------------------------------------------------------------------
// Truncation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn truncated_translation_is_kept_and_retry_adds_a_complete_version() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(2, dir.path());
    let translator = LimitedTranslator::new(3);
    let session = common::session(
        TranslationExecutor::new(translator.clone(), &config.translation),
        common::memory_sidecar(),
        &config,
    );
    let srt = common::write_srt(dir.path(), "episode.srt", 5);
    let job = session.add(&srt, serde_json::Value::Null).await.unwrap();

    let summary = session.run_pending().await;
    assert_eq!(summary.failed, 1);

    let failed = session.job(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    let failure = failed.error.unwrap();
    assert_eq!(failure.kind, FailureKind::Truncated);
    assert!(failure.message.contains("3 of 5 lines"));
    assert!(failure.message.contains("more batches"));

    let truncated = session.versions(job.id);
    assert_eq!(truncated.len(), 1);
    assert_eq!(truncated[0].outcome, VersionOutcome::Truncated);
    assert_eq!(truncated[0].payload["translated_lines"], 3);
    assert_eq!(truncated[0].name, "test-model (v1)");
    // Nothing better exists yet, so the partial result is shown.
    assert_eq!(session.active_version(job.id).unwrap().id, truncated[0].id);
    let first_run = truncated[0].run_id.unwrap();

    let status = session.retry_with_more_batches(job.id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(*translator.requests.lock(), vec![5, 3, 2]);

    let versions = session.versions(job.id);
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].outcome, VersionOutcome::Truncated);
    let complete = &versions[1];
    assert_eq!(complete.outcome, VersionOutcome::Complete);
    assert_eq!(complete.name, "test-model (v2)");
    assert_eq!(complete.config_snapshot["batch_count"], 2);
    assert_eq!(complete.payload["translated_lines"], 5);
    assert_ne!(complete.run_id.unwrap(), first_run);
    assert_eq!(session.active_version(job.id).unwrap().id, complete.id);
    assert!(session.job(job.id).unwrap().error.is_none());
}

#[tokio::test]
async fn batch_count_cannot_grow_past_the_maximum() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(1, dir.path());
    config.translation.max_batch_count = 2;
    let session = common::session(
        TranslationExecutor::new(LimitedTranslator::new(1), &config.translation),
        common::memory_sidecar(),
        &config,
    );
    let srt = common::write_srt(dir.path(), "episode.srt", 4);
    let job = session.add(&srt, serde_json::Value::Null).await.unwrap();
    session.run_pending().await;

    assert_eq!(
        session.retry_with_more_batches(job.id).await.unwrap(),
        JobStatus::Error
    );
    assert_matches!(
        session.retry_with_more_batches(job.id).await,
        Err(Error::Validation(_))
    );
    // Both truncated runs are kept.
    assert_eq!(session.versions(job.id).len(), 2);
}

// ---------------------------------------------------------------------------
// Active version bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleting_the_active_version_falls_back_to_the_newest() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let session = common::session(
        PacedExecutor::new(Pace::Sleep(1), dir.path()),
        common::memory_sidecar(),
        &config,
    );
    let job = session.add(dir.path().join("movie.mkv"), serde_json::Value::Null).await.unwrap();
    session.run_pending().await;
    session.retry(job.id, serde_json::Value::Null).await.unwrap();
    session.retry(job.id, serde_json::Value::Null).await.unwrap();

    let ids: Vec<_> = session.versions(job.id).iter().map(|v| v.id).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(session.active_version(job.id).unwrap().id, ids[2]);

    // Deleting an inactive version leaves the active one alone.
    session.set_active(job.id, ids[0]).await.unwrap();
    assert_eq!(session.delete_version(job.id, ids[1]).await.unwrap(), Some(ids[0]));

    assert_eq!(session.delete_version(job.id, ids[0]).await.unwrap(), Some(ids[2]));
    assert_eq!(session.delete_version(job.id, ids[2]).await.unwrap(), None);
    assert!(session.active_version(job.id).is_none());
    assert_matches!(
        session.delete_version(job.id, ids[2]).await,
        Err(Error::NotFound { .. })
    );

    // Sequence numbers are not reused.
    session.retry(job.id, serde_json::Value::Null).await.unwrap();
    let next = session.active_version(job.id).unwrap();
    assert_eq!(next.sequence, 4);
    assert_eq!(next.name, "Version 4");
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persist_failure_keeps_the_version_usable() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let sidecar = Arc::new(FailingSidecar::default());
    let session = common::session(
        PacedExecutor::new(Pace::Sleep(1), dir.path()),
        sidecar.clone(),
        &config,
    );
    let job = session.add(dir.path().join("movie.mkv"), serde_json::Value::Null).await.unwrap();

    let summary = session.run_pending().await;

    assert_eq!(summary.completed, 1);
    assert_eq!(session.job(job.id).unwrap().status, JobStatus::Completed);
    let version = session.active_version(job.id).unwrap();
    assert!(!version.persisted);
    assert!(sidecar.attempts.load(Ordering::SeqCst) >= 1);
    assert!(session
        .recent_events(50)
        .iter()
        .any(|e| matches!(&e.payload, EventPayload::PersistFailed { job_id, .. } if *job_id == job.id)));

    let edited = session
        .edit_version(job.id, version.id, serde_json::json!({"file": "renamed.mkv"}))
        .unwrap();
    assert!(edited.edited_at.is_some());
    assert!(!edited.persisted);
    session.flush().await;
    assert_eq!(
        session.active_version(job.id).unwrap().payload["file"],
        "renamed.mkv"
    );
}

#[tokio::test]
async fn a_file_cannot_be_queued_twice() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let source = dir.path().join("movie.mkv");
    std::fs::write(&source, b"not really a movie").unwrap();
    let session = common::session(
        PacedExecutor::new(Pace::Sleep(1), dir.path()),
        Arc::new(JsonSidecarStore::new()),
        &config,
    );
    let job = session.add(&source, serde_json::Value::Null).await.unwrap();
    session.run_pending().await;

    assert_matches!(
        session.add(&source, serde_json::Value::Null).await,
        Err(Error::Conflict(_))
    );
    assert_eq!(session.jobs().len(), 1);

    // The history of the first job is the one on disk.
    session.retry(job.id, serde_json::Value::Null).await.unwrap();
    session.flush().await;
    let saved = JsonSidecarStore::new().load(&source).await.unwrap().unwrap();
    assert_eq!(saved.tools.values().next().unwrap().versions.len(), 2);
}

#[tokio::test]
async fn sidecar_round_trip_restores_history() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let source = dir.path().join("movie.mkv");
    std::fs::write(&source, b"not really a movie").unwrap();
    let sidecar: Arc<dyn SidecarStore> = Arc::new(JsonSidecarStore::new());

    let first = common::session(
        PacedExecutor::new(Pace::Sleep(1), dir.path()),
        sidecar.clone(),
        &config,
    );
    let job = first.add(&source, serde_json::Value::Null).await.unwrap();
    first.run_pending().await;
    first.retry(job.id, serde_json::Value::Null).await.unwrap();
    let versions = first.versions(job.id);
    first.set_active(job.id, versions[0].id).await.unwrap();
    first
        .edit_version(job.id, versions[1].id, serde_json::json!({"file": "edited"}))
        .unwrap();
    first.flush().await;

    let path = sidecar_path(&source);
    assert!(path.exists());
    assert!(first.versions(job.id).iter().all(|v| v.persisted));

    // A fresh session over the same file sees the same history.
    let second = common::session(
        PacedExecutor::new(Pace::Sleep(1), dir.path()),
        sidecar.clone(),
        &config,
    );
    let reopened = second.add(&source, serde_json::Value::Null).await.unwrap();
    let restored = second.versions(reopened.id);
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0].id, versions[0].id);
    assert_eq!(restored[1].payload["file"], "edited");
    assert!(restored[1].edited_at.is_some());
    assert_eq!(second.active_version(reopened.id).unwrap().id, versions[0].id);

    // New runs continue the numbering.
    second.run_pending().await;
    assert_eq!(second.active_version(reopened.id).unwrap().name, "Version 3");

    second.clear_versions(reopened.id).await.unwrap();
    assert!(second.versions(reopened.id).is_empty());
    assert!(!path.exists());
}
