// Timers are rebuilt from the job store when a new process starts.

mod common;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;

use common::{builtin, lifecycle_with, task_spec, wait_for_runs, wait_until, OWNER};
use datagen_scheduler::job_store::JobStore;
use datagen_scheduler::store::INTERRUPTED_MESSAGE;
use datagen_scheduler::{ExecutionStatus, TaskStore};

fn open(path: &Path) -> TaskStore {
    TaskStore::new(Connection::open(path).unwrap()).unwrap()
}

#[tokio::test]
async fn restart_rearms_at_stored_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("datagen.db");

    let first = lifecycle_with(open(&db), builtin());
    let kept = first.create(OWNER, task_spec("0 0 1 1 *", 1)).unwrap();
    let paused = first.create(OWNER, task_spec("0 0 1 1 *", 1)).unwrap();
    first.pause(OWNER, &paused.id).unwrap();
    assert!(first.service().stop().await);
    drop(first);

    let second = lifecycle_with(open(&db), builtin());
    assert_eq!(second.service().armed_count(), 1);
    assert_eq!(second.service().armed_fire_time(&kept.id), kept.next_run_at);
    assert!(!second.service().is_armed(&paused.id));
    second.service().stop().await;
}

#[tokio::test]
async fn fire_missed_within_grace_runs_once_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("datagen.db");

    let store = open(&db);
    let first = lifecycle_with(store, builtin());
    let task = first.create(OWNER, task_spec("0 0 1 1 *", 4)).unwrap();
    first.service().stop().await;

    // simulate a fire that came due 10s ago while the process was down
    let mut entry = first.service().store().get_task(&task.id).unwrap().unwrap().schedule_entry();
    entry.next_run_at = Some(Utc::now() - chrono::Duration::seconds(10));
    first.service().store().upsert(&entry).unwrap();
    drop(first);

    let second = lifecycle_with(open(&db), builtin());
    assert!(wait_for_runs(&second, &task.id, 1).await);
    let stored = second.get(OWNER, &task.id).unwrap();
    assert_eq!(stored.run_count, 1);
    assert!(stored.next_run_at.unwrap() > Utc::now());
    assert!(wait_until(|| second.service().armed_fire_time(&task.id) == stored.next_run_at).await);
    second.service().stop().await;
}

#[tokio::test]
async fn fire_missed_beyond_grace_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("datagen.db");

    let first = lifecycle_with(open(&db), builtin());
    let task = first.create(OWNER, task_spec("0 0 1 1 *", 4)).unwrap();
    first.service().stop().await;

    let mut entry = first.service().store().get_task(&task.id).unwrap().unwrap().schedule_entry();
    entry.next_run_at = Some(Utc::now() - chrono::Duration::minutes(10));
    first.service().store().upsert(&entry).unwrap();
    drop(first);

    let second = lifecycle_with(open(&db), builtin());
    assert!(
        wait_until(|| {
            second
                .service()
                .armed_fire_time(&task.id)
                .is_some_and(|at| at > Utc::now())
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = second.get(OWNER, &task.id).unwrap();
    assert_eq!(stored.run_count, 0);
    assert_eq!(second.logs(OWNER, &task.id, 1, 20).unwrap().total, 0);
    assert_eq!(second.service().armed_fire_time(&task.id), stored.next_run_at);
    second.service().stop().await;
}

#[tokio::test]
async fn run_left_unfinished_is_closed_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("datagen.db");

    let first = lifecycle_with(open(&db), builtin());
    let task = first.create(OWNER, task_spec("0 0 1 1 *", 1)).unwrap();
    first.service().stop().await;
    // a run that started and never finished before the process died
    first.service().store().begin_run(&task.id, Utc::now()).unwrap();
    drop(first);

    let second = lifecycle_with(open(&db), builtin());
    let logs = second.logs(OWNER, &task.id, 1, 20).unwrap();
    assert_eq!(logs.total, 1);
    assert_eq!(logs.items[0].status, ExecutionStatus::Failed);
    assert!(logs.items[0].finished_at.is_some());
    assert_eq!(logs.items[0].error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert!(second.service().is_armed(&task.id));
    second.service().stop().await;
}
