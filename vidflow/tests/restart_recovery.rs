//! Restart behaviour: the durable store is reconciled before workers start.

mod common;

use chrono::Utc;
use common::{Harness, job_events};
use vidflow::database::models::StreamDbModel;
use vidflow::domain::{JobKind, JobRecord, JobState, StreamInfo, StreamStatus};
use vidflow::recovery::{INTERRUPTED_JOB_ERROR, INTERRUPTED_STREAM_ERROR};

#[tokio::test]
async fn test_queued_jobs_survive_restart() {
    let h = Harness::new().await;
    h.put_asset("raw/a.mp4").await;

    // Submitted while no worker was running, then the process died.
    let job = h
        .container
        .submitter()
        .submit(JobKind::Analyze, vec!["raw/a.mp4".into()])
        .await
        .unwrap();

    let restarted = h.restarted();
    let mut rx = restarted.jobs.subscribe();
    let report = restarted.start().await.unwrap();
    assert_eq!(report.requeued_jobs, 1);

    let events = job_events(&mut rx, &job.job_id).await;
    assert_eq!(events.last().unwrap().state, JobState::Completed);
    assert_eq!(h.prober.call_count(), 1);

    restarted.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_jobs_fail_on_restart() {
    let h = Harness::new().await;
    let mut job = JobRecord::new(JobKind::Normalize, vec!["raw/a.mp4".into()]);
    h.container.jobs.create(&job).await.unwrap();
    job.start_processing().unwrap();
    job.advance("normalizing", 20).unwrap();
    h.container.jobs.persist(&job).await.unwrap();

    let restarted = h.restarted();
    let report = restarted.start().await.unwrap();
    assert_eq!(report.failed_jobs, 1);
    assert_eq!(report.requeued_jobs, 0);

    let record = restarted.jobs.load(&job.job_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.error.as_deref(), Some(INTERRUPTED_JOB_ERROR));
    assert_eq!(record.step.as_deref(), Some("normalizing"));
    assert!(h.engine.tasks.lock().is_empty());

    restarted.shutdown().await;
}

#[tokio::test]
async fn test_orphaned_streams_fail_on_restart() {
    let h = Harness::new().await;
    let info = StreamInfo {
        stream_id: "cam-9".into(),
        source_url: "rtsp://camera/9".into(),
        relay_url: "rtmp://localhost:1935/live/cam-9".into(),
        preview_url: "http://localhost:8888/cam-9/index.m3u8".into(),
        has_audio: true,
        status: StreamStatus::Reconnecting,
        reconnect_attempt: 2,
        error: None,
        started_at: Utc::now(),
    };
    h.container
        .stream_repo
        .upsert_stream(&StreamDbModel::from_info(&info))
        .await
        .unwrap();

    let restarted = h.restarted();
    let report = restarted.start().await.unwrap();
    assert_eq!(report.failed_streams, 1);

    let status = restarted.supervisor.get_status("cam-9").await.unwrap().unwrap();
    assert_eq!(status.status, StreamStatus::Failed);
    assert_eq!(status.error.as_deref(), Some(INTERRUPTED_STREAM_ERROR));
    let row = restarted.stream_repo.get_stream("cam-9").await.unwrap();
    assert_eq!(row.status, "FAILED");
    assert_eq!(h.engine.spawned(), 0);

    restarted.shutdown().await;
}
