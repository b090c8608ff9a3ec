//! A cancelled run leaves nothing behind, and nothing a stale run does can
//! touch the job afterwards.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{Pace, PacedExecutor};
use rx_core::events::EventPayload;
use rx_core::{Error, JobStatus, RunId};
use rx_pipeline::JobPatch;

#[tokio::test]
async fn cancel_at_forty_percent_discards_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(2, dir.path());
    let session = common::session(
        PacedExecutor::new(Pace::StallAtFortyPercent, dir.path()),
        common::memory_sidecar(),
        &config,
    );
    let job = session.add(dir.path().join("movie.mkv"), serde_json::Value::Null).await.unwrap();
    let partial = session.pipeline().executor.partial_path(job.id);

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run_pending().await })
    };
    common::wait_until(|| session.job(job.id).is_some_and(|j| j.progress >= 39.9)).await;
    assert!(partial.exists());
    let running = session.job(job.id).unwrap();
    assert_eq!(running.status, JobStatus::Processing);
    assert_eq!(running.current_stage, 2);
    assert!(running.is_active());

    assert!(session.cancel_job(job.id));
    let summary = runner.await.unwrap();

    assert_eq!(summary.cancelled, 1);
    let settled = session.job(job.id).unwrap();
    assert_eq!(settled.status, JobStatus::Cancelled);
    assert!(settled.error.is_none());
    assert!(!settled.is_active());
    assert!(!partial.exists());
    assert!(session.versions(job.id).is_empty());
    assert!(session.active_version(job.id).is_none());
    assert!(session
        .recent_events(50)
        .iter()
        .any(|e| matches!(e.payload, EventPayload::JobCancelled { job_id } if job_id == job.id)));
}

#[tokio::test]
async fn cancelled_job_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let session = common::session(
        PacedExecutor::new(Pace::StallAtFortyPercent, dir.path()),
        common::memory_sidecar(),
        &config,
    );
    let job = session.add(dir.path().join("movie.mkv"), serde_json::Value::Null).await.unwrap();

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run_pending().await })
    };
    common::wait_until(|| session.job(job.id).is_some_and(|j| j.progress >= 39.9)).await;
    session.cancel_job(job.id);
    runner.await.unwrap();

    *session.pipeline().executor.pace.lock() = Pace::Sleep(1);
    let status = session.retry(job.id, serde_json::Value::Null).await.unwrap();

    assert_eq!(status, JobStatus::Completed);
    assert_eq!(session.versions(job.id).len(), 1);
    assert_eq!(session.active_version(job.id).unwrap().name, "Version 1");
}

// ---------------------------------------------------------------------------
// Stale runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn updates_from_a_finished_run_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let session = common::session(
        PacedExecutor::new(Pace::Sleep(1), dir.path()),
        common::memory_sidecar(),
        &config,
    );
    let job = session.add(dir.path().join("movie.mkv"), serde_json::Value::Null).await.unwrap();
    session.run_pending().await;
    let finished_run = session.versions(job.id)[0].run_id.unwrap();

    let jobs = &session.pipeline().jobs;
    assert!(!jobs.update_if_active(job.id, finished_run, JobPatch::progress(5.0)));
    assert!(!jobs.update_if_active(job.id, RunId::new(), JobPatch::status(JobStatus::Error)));

    let after = session.job(job.id).unwrap();
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.progress, 100.0);
}

#[tokio::test]
async fn a_new_run_supersedes_the_old_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let session = common::session(
        PacedExecutor::new(Pace::Sleep(1), dir.path()),
        common::memory_sidecar(),
        &config,
    );
    let job = session.add(dir.path().join("movie.mkv"), serde_json::Value::Null).await.unwrap();

    let cancel = &session.pipeline().cancel;
    let old = cancel.start_run(job.id);
    let new = cancel.start_run(job.id);

    assert_ne!(old.run_id, new.run_id);
    assert!(old.token.is_cancelled());
    assert!(!new.token.is_cancelled());
    assert!(!cancel.is_run_active(job.id, old.run_id));
    assert!(cancel.is_run_active(job.id, new.run_id));

    // Finishing the superseded run must not release the new one.
    cancel.finish_run(job.id, old.run_id);
    assert!(cancel.is_run_active(job.id, new.run_id));
    cancel.finish_run(job.id, new.run_id);
    assert_eq!(cancel.active_count(), 0);
}

#[tokio::test]
async fn removing_a_running_job_needs_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(1, dir.path());
    let session = common::session(
        PacedExecutor::new(Pace::StallAtFortyPercent, dir.path()),
        common::memory_sidecar(),
        &config,
    );
    let job = session.add(dir.path().join("movie.mkv"), serde_json::Value::Null).await.unwrap();
    let partial = session.pipeline().executor.partial_path(job.id);

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run_pending().await })
    };
    common::wait_until(|| session.job(job.id).is_some_and(|j| j.progress >= 39.9)).await;

    assert_matches!(session.remove(job.id, false).await, Err(Error::Conflict(_)));
    assert!(session.job(job.id).is_some());

    let removed = session.remove(job.id, true).await.unwrap();
    assert_eq!(removed.status, JobStatus::Cancelled);
    runner.await.unwrap();

    assert!(session.job(job.id).is_none());
    assert!(session.jobs().is_empty());
    assert!(!partial.exists());
    assert!(session.versions(job.id).is_empty());
}
