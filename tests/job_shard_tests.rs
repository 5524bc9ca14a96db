
use std::sync::Arc;
use std::time::Duration;

use cadence::job::JobMetadata;
use cadence::job_shard::ShardError;
use cadence::journal::{JournalEntry, MemoryJournal};
use chrono::{Duration as TimeDelta, DurationRound, Utc};

use test_helpers::*;

#[cadence::test]
async fn schedule_returns_job_matching_inputs() {
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_at(start, TimeDelta::minutes(1));
    let due = start + TimeDelta::seconds(30);
    let mut metadata = JobMetadata::new();
    metadata.insert("k".to_string(), "v".to_string());

    let job = shard
        .schedule("grain-7", "reminder", due, Some(metadata.clone()))
        .await
        .expect("schedule");

    assert_eq!(job.target_id, "grain-7");
    assert_eq!(job.name, "reminder");
    assert_eq!(job.due_time, due);
    assert_eq!(job.shard_id, *shard.id());
    assert_eq!(job.metadata, Some(metadata));
    assert_eq!(shard.job_count(), 1);
    assert!(shard.contains_job(&job.id));
}

#[cadence::test]
async fn schedule_assigns_unique_ids() {
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_at(start, TimeDelta::minutes(1));
    let due = start + TimeDelta::seconds(1);
    let a = shard.schedule("t", "same", due, None).await.unwrap();
    let b = shard.schedule("t", "same", due, None).await.unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(shard.job_count(), 2);
}

#[cadence::test]
async fn schedule_rejects_due_times_outside_window() {
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_at(start, TimeDelta::minutes(1));

    let at_end = shard.schedule("t", "late", start + TimeDelta::minutes(1), None).await;
    assert!(matches!(at_end, Err(ShardError::OutOfRange { .. })));

    let before = shard.schedule("t", "early", start - TimeDelta::milliseconds(1), None).await;
    assert!(matches!(before, Err(ShardError::OutOfRange { .. })));

    assert!(shard.schedule("t", "first", start, None).await.is_ok());
    assert_eq!(shard.job_count(), 1);
}

#[cadence::test]
async fn complete_shard_rejects_new_jobs() {
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_at(start, TimeDelta::minutes(1));
    shard.mark_complete().await.unwrap();
    shard.mark_complete().await.unwrap();
    assert!(shard.is_complete());

    let res = shard.schedule("t", "n", start + TimeDelta::seconds(1), None).await;
    assert!(matches!(res, Err(ShardError::Complete(_))));
}

#[cadence::test]
async fn remove_is_false_for_unknown_jobs() {
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_at(start, TimeDelta::minutes(1));
    let job = shard.schedule("t", "n", start + TimeDelta::seconds(5), None).await.unwrap();

    assert!(shard.remove(&job.id).await.unwrap());
    assert!(!shard.remove(&job.id).await.unwrap());
    assert!(!shard.remove("no-such-job").await.unwrap());
    assert_eq!(shard.job_count(), 0);
}

#[cadence::test]
async fn completed_shard_drains_then_ends() {
    with_timeout!(5000, {
        let now = Utc::now();
        let shard = shard_at(now - TimeDelta::seconds(10), TimeDelta::minutes(1));
        let a = shard.schedule("t", "a", now - TimeDelta::seconds(1), None).await.unwrap();
        let b = shard.schedule("t", "b", now, None).await.unwrap();
        shard.mark_complete().await.unwrap();

        let mut ready = shard.consume_ready();
        let mut seen = Vec::new();
        while let Some(ctx) = ready.next().await {
            seen.push(ctx.job.id.clone());
            assert!(shard.remove(&ctx.job.id).await.unwrap());
        }
        seen.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(shard.job_count(), 0);
    });
}

#[cadence::test]
async fn retry_later_reappears_with_bumped_count() {
    with_timeout!(5000, {
        let now = Utc::now();
        let shard = shard_at(now - TimeDelta::seconds(10), TimeDelta::minutes(2));
        let job = shard.schedule("t", "flaky", now, None).await.unwrap();

        let mut ready = shard.consume_ready();
        let first = ready.next().await.unwrap();
        assert_eq!(first.dequeue_count, 1);

        let retry_at = Utc::now() + TimeDelta::milliseconds(300);
        assert!(shard.retry_later(&first.job, first.dequeue_count, retry_at).await.unwrap());
        let second = ready.next().await.unwrap();
        assert!(Utc::now() >= retry_at);
        assert_eq!(second.job.id, job.id);
        assert_eq!(second.dequeue_count, 2);
        assert_eq!(second.job.due_time, retry_at);
    });
}

#[cadence::test]
async fn retry_outside_window_is_rejected() {
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_at(start, TimeDelta::minutes(1));
    let job = shard.schedule("t", "n", start, None).await.unwrap();

    let res = shard
        .retry_later(&job, 1, start + TimeDelta::minutes(5))
        .await;
    assert!(matches!(res, Err(ShardError::OutOfRange { .. })));
    assert!(shard.contains_job(&job.id));
}

#[cadence::test]
async fn retry_of_removed_job_is_a_noop() {
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_at(start, TimeDelta::minutes(1));
    let job = shard.schedule("t", "n", start, None).await.unwrap();
    shard.remove(&job.id).await.unwrap();

    let rescheduled = shard
        .retry_later(&job, 1, start + TimeDelta::seconds(10))
        .await
        .unwrap();
    assert!(!rescheduled);
    assert_eq!(shard.job_count(), 0);
}

#[cadence::test]
async fn accept_transfer_keeps_identity_and_count() {
    with_timeout!(5000, {
        let now = Utc::now();
        let source = shard_at(now - TimeDelta::minutes(5), TimeDelta::minutes(1));
        let original = source
            .schedule("t", "moving", now - TimeDelta::minutes(5), None)
            .await
            .unwrap();

        let target = shard_at(now - TimeDelta::seconds(1), TimeDelta::minutes(1));
        let adopted = target
            .accept_transfer(original.with_due_time(now), 3)
            .await
            .unwrap();
        assert_eq!(adopted.id, original.id);
        assert_eq!(adopted.name, original.name);
        assert_eq!(adopted.target_id, original.target_id);
        assert_eq!(adopted.shard_id, *target.id());

        let ctx = target.consume_ready().next().await.unwrap();
        assert_eq!(ctx.job.id, original.id);
        assert_eq!(ctx.dequeue_count, 4);
    });
}

#[cadence::test]
async fn journal_sees_every_mutation() {
    let journal = Arc::new(MemoryJournal::new());
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_with_journal(start, TimeDelta::minutes(1), journal.clone());

    let job = shard.schedule("t", "n", start, None).await.unwrap();
    shard
        .retry_later(&job, 1, start + TimeDelta::seconds(2))
        .await
        .unwrap();
    shard.remove(&job.id).await.unwrap();
    shard.mark_complete().await.unwrap();
    shard.mark_complete().await.unwrap();

    let entries = journal.entries();
    assert_eq!(entries.len(), 4);
    assert!(matches!(&entries[0], JournalEntry::Add { job: j, .. } if j.id == job.id));
    assert!(matches!(&entries[1], JournalEntry::Retry { dequeue_count: 1, .. }));
    assert!(matches!(&entries[2], JournalEntry::Remove { job_id, .. } if *job_id == job.id));
    assert!(matches!(&entries[3], JournalEntry::Complete { .. }));

    let lines = journal.to_json_lines().unwrap();
    assert_eq!(lines.lines().count(), 4);
    assert!(lines.lines().next().unwrap().contains("\"op\":\"add\""));
}

#[cadence::test]
async fn journal_failure_leaves_queue_untouched() {
    let journal = Arc::new(MemoryJournal::new());
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_with_journal(start, TimeDelta::minutes(1), journal.clone());

    journal.set_failing(true);
    let res = shard.schedule("t", "n", start, None).await;
    assert!(matches!(res, Err(ShardError::Journal(_))));
    assert_eq!(shard.job_count(), 0);
}

#[cadence::test(flavor = "multi_thread", worker_threads = 2, timeout_ms = 5000)]
async fn completion_during_journal_write_refuses_the_job() {
    let journal = SlowAddJournal::new(Duration::from_millis(200));
    let now = Utc::now();
    let shard = Arc::new(shard_with_journal(
        now - TimeDelta::seconds(10),
        TimeDelta::minutes(1),
        journal.clone(),
    ));

    let scheduling = {
        let shard = Arc::clone(&shard);
        tokio::spawn(async move { shard.schedule("t", "late", now, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    shard.mark_complete().await.unwrap();

    // Nothing was queued when the shard completed, so the sequence ends.
    assert!(shard.consume_ready().next().await.is_none());

    let res = scheduling.await.unwrap();
    assert!(matches!(res, Err(ShardError::Complete(_))));
    assert_eq!(shard.job_count(), 0);

    let entries = journal.inner.entries();
    let added = entries
        .iter()
        .find_map(|e| match e {
            JournalEntry::Add { job, .. } => Some(job.id.clone()),
            _ => None,
        })
        .expect("add was journaled");
    assert!(matches!(entries.last(), Some(JournalEntry::Remove { job_id, .. }) if *job_id == added));
}

#[cadence::test(flavor = "multi_thread", worker_threads = 2, timeout_ms = 5000)]
async fn completion_during_journal_write_refuses_transfers() {
    let journal = SlowAddJournal::new(Duration::from_millis(200));
    let now = Utc::now();
    let source = shard_at(now - TimeDelta::minutes(5), TimeDelta::minutes(1));
    let moving = source
        .schedule("t", "moving", now - TimeDelta::minutes(5), None)
        .await
        .unwrap();
    let target = Arc::new(shard_with_journal(
        now - TimeDelta::seconds(10),
        TimeDelta::minutes(1),
        journal,
    ));

    let transferring = {
        let target = Arc::clone(&target);
        let job = moving.with_due_time(now);
        tokio::spawn(async move { target.accept_transfer(job, 2).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    target.mark_complete().await.unwrap();

    let res = transferring.await.unwrap();
    assert!(matches!(res, Err(ShardError::Complete(_))));
    assert!(!target.contains_job(&moving.id));
    assert!(target.consume_ready().next().await.is_none());
}

#[cadence::test]
async fn cancel_removes_only_jobs_not_yet_handed_out() {
    with_timeout!(5000, {
        let now = Utc::now();
        let shard = shard_at(now - TimeDelta::seconds(10), TimeDelta::minutes(1));
        let running = shard.schedule("t", "running", now - TimeDelta::seconds(1), None).await.unwrap();
        let waiting = shard.schedule("t", "waiting", now + TimeDelta::seconds(30), None).await.unwrap();

        let ctx = shard.consume_ready().next().await.unwrap();
        assert_eq!(ctx.job.id, running.id);

        assert!(!shard.cancel(&running.id).await.unwrap());
        assert!(shard.contains_job(&running.id));

        assert!(shard.cancel(&waiting.id).await.unwrap());
        assert!(!shard.contains_job(&waiting.id));
        assert!(!shard.cancel(&waiting.id).await.unwrap());
        assert_eq!(shard.job_count(), 1);
    });
}

#[cadence::test]
async fn failed_cancel_keeps_the_job_queued() {
    let journal = Arc::new(MemoryJournal::new());
    let start = Utc::now().duration_trunc(TimeDelta::minutes(1)).unwrap();
    let shard = shard_with_journal(start, TimeDelta::minutes(1), journal.clone());
    let job = shard.schedule("t", "n", start + TimeDelta::seconds(30), None).await.unwrap();

    journal.set_failing(true);
    let res = shard.cancel(&job.id).await;
    assert!(matches!(res, Err(ShardError::Journal(_))));
    assert!(shard.contains_job(&job.id));
    assert_eq!(shard.job_count(), 1);
}
