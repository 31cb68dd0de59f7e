//! Background task queue: the `TaskQueue` seam, a SQLite-backed queue over the
//! `task` table, and the threaded runner that delivers units to the engine.

use crate::codec::ImageCodec;
use crate::config;
use crate::controller::Engine;
use crate::db;
use crate::joblog::{now_ms, prune_job_logs};
use crate::paths::AppPaths;
use crate::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Stored externally tagged (`{"process_file":{...}}`); internally tagged
/// enums do not deserialize under serde_json's `arbitrary_precision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnit {
    ProcessFile { locator: String, job_id: i64 },
    Finalize { job_id: i64 },
}

impl WorkUnit {
    pub fn unit_type(&self) -> &'static str {
        match self {
            WorkUnit::ProcessFile { .. } => "process_file",
            WorkUnit::Finalize { .. } => "finalize",
        }
    }

    pub fn job_id(&self) -> i64 {
        match self {
            WorkUnit::ProcessFile { job_id, .. } | WorkUnit::Finalize { job_id } => *job_id,
        }
    }
}

/// Delivery is at-least-once and unordered across units.
pub trait TaskQueue: Send + Sync {
    fn is_available(&self) -> bool;

    fn enqueue(&self, unit: &WorkUnit, group: &str) -> Result<()>;

    fn enqueue_batch(&self, units: &[WorkUnit], group: &str) -> Result<()> {
        for unit in units {
            self.enqueue(unit, group)?;
        }
        Ok(())
    }

    fn schedule_delayed(&self, unit: &WorkUnit, group: &str, delay: Duration) -> Result<()>;

    /// Drops units of `group` that have not started. Returns how many.
    fn cancel_group_pending(&self, group: &str) -> Result<usize>;

    /// Drops every pending unit and forgets finished history.
    fn purge(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

#[derive(Debug, Clone)]
pub struct SqliteTaskQueue {
    paths: AppPaths,
}

impl SqliteTaskQueue {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    fn insert(&self, units: &[WorkUnit], group: &str, run_after_ms: i64) -> Result<()> {
        let mut conn = db::open(&self.paths)?;
        db::migrate(&conn)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
INSERT INTO task (
  id,
  group_token,
  unit_type,
  payload_json,
  status,
  attempts,
  run_after_ms,
  created_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)
"#,
            )?;
            let created_at_ms = now_ms();
            for unit in units {
                stmt.execute(params![
                    Uuid::new_v4().to_string(),
                    group,
                    unit.unit_type(),
                    serde_json::to_string(unit)?,
                    TaskStatus::Queued.as_str(),
                    run_after_ms,
                    created_at_ms
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn is_available(&self) -> bool {
        db::ensure_schema(&self.paths).is_ok()
    }

    fn enqueue(&self, unit: &WorkUnit, group: &str) -> Result<()> {
        self.insert(std::slice::from_ref(unit), group, now_ms())
    }

    fn enqueue_batch(&self, units: &[WorkUnit], group: &str) -> Result<()> {
        self.insert(units, group, now_ms())
    }

    fn schedule_delayed(&self, unit: &WorkUnit, group: &str, delay: Duration) -> Result<()> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.insert(
            std::slice::from_ref(unit),
            group,
            now_ms().saturating_add(delay_ms),
        )
    }

    fn cancel_group_pending(&self, group: &str) -> Result<usize> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;
        let updated = conn.execute(
            "UPDATE task SET status=?1, finished_at_ms=?2 WHERE group_token=?3 AND status=?4",
            params![
                TaskStatus::Canceled.as_str(),
                now_ms(),
                group,
                TaskStatus::Queued.as_str()
            ],
        )?;
        Ok(updated)
    }

    fn purge(&self) -> Result<usize> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;
        let removed = conn.execute(
            "DELETE FROM task WHERE status<>?1",
            params![TaskStatus::Running.as_str()],
        )?;
        Ok(removed)
    }
}

pub fn task_counts(paths: &AppPaths, group: &str) -> Result<TaskCounts> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM task WHERE group_token=?1 GROUP BY status")?;
    let rows = stmt
        .query_map(params![group], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut counts = TaskCounts::default();
    for (status, n) in rows {
        let n = n.max(0) as usize;
        match status.as_str() {
            "queued" => counts.queued = n,
            "running" => counts.running = n,
            "succeeded" => counts.succeeded = n,
            "failed" => counts.failed = n,
            "canceled" => counts.canceled = n,
            _ => {}
        }
    }
    Ok(counts)
}

/// Deliveries per unit before it is given up on.
pub const MAX_TASK_ATTEMPTS: i64 = 3;
const TASK_RETRY_BASE_MS: i64 = 2_000;
const TASK_RETRY_MAX_MS: i64 = 60_000;

#[derive(Debug, Clone)]
struct TaskRow {
    id: String,
    payload_json: String,
    /// Deliveries before the current claim.
    attempts: i64,
}

fn fetch_due_tasks(paths: &AppPaths, now_ms: i64, limit: usize) -> Result<Vec<TaskRow>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT id, payload_json, attempts FROM task
         WHERE status=?1 AND run_after_ms<=?2
         ORDER BY run_after_ms ASC, created_at_ms ASC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            params![TaskStatus::Queued.as_str(), now_ms, limit as i64],
            |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    payload_json: row.get(1)?,
                    attempts: row.get(2)?,
                })
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn claim_task(paths: &AppPaths, task_id: &str) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let updated = conn.execute(
        "UPDATE task SET status=?1, started_at_ms=?2, attempts=attempts+1 WHERE id=?3 AND status=?4",
        params![
            TaskStatus::Running.as_str(),
            now_ms(),
            task_id,
            TaskStatus::Queued.as_str()
        ],
    )?;
    Ok(updated == 1)
}

fn finish_task(
    paths: &AppPaths,
    task_id: &str,
    status: TaskStatus,
    error: Option<String>,
) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE task SET status=?1, finished_at_ms=?2, error=?3 WHERE id=?4",
        params![status.as_str(), now_ms(), error, task_id],
    )?;
    Ok(())
}

fn retry_task(paths: &AppPaths, task_id: &str, run_after_ms: i64, error: &str) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE task SET status=?1, run_after_ms=?2, started_at_ms=NULL, error=?3 WHERE id=?4",
        params![TaskStatus::Queued.as_str(), run_after_ms, error, task_id],
    )?;
    Ok(())
}

fn retry_delay_ms(attempt: i64) -> i64 {
    let shift = (attempt - 1).clamp(0, 16) as u32;
    TASK_RETRY_BASE_MS
        .saturating_mul(1_i64 << shift)
        .min(TASK_RETRY_MAX_MS)
}

fn execute_task<C: ImageCodec>(engine: &Engine<C>, task: &TaskRow) -> Result<()> {
    let unit: WorkUnit = serde_json::from_str(&task.payload_json)?;
    engine.dispatch(&unit)
}

/// Records how a delivery ended. Failed units go back to the queue with a
/// growing delay; after the last attempt a file unit is folded into the job
/// as an error skip so the job can still drain. A payload that does not parse
/// fails at once.
fn settle_task<C: ImageCodec>(engine: &Engine<C>, task: &TaskRow, outcome: Result<()>) -> Result<()> {
    let paths = engine.paths();
    let err = match outcome {
        Ok(()) => return finish_task(paths, &task.id, TaskStatus::Succeeded, None),
        Err(e) => e,
    };

    let unit = serde_json::from_str::<WorkUnit>(&task.payload_json).ok();
    let attempt = task.attempts + 1;
    if unit.is_some() && attempt < MAX_TASK_ATTEMPTS {
        return retry_task(
            paths,
            &task.id,
            now_ms().saturating_add(retry_delay_ms(attempt)),
            &err.to_string(),
        );
    }

    if let Some(WorkUnit::ProcessFile { locator, job_id }) = unit {
        let _ = engine.abandon_file_unit(&locator, job_id, &err);
    }
    finish_task(paths, &task.id, TaskStatus::Failed, Some(err.to_string()))
}

fn requeue_orphaned_running_tasks(conn: &rusqlite::Connection) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE task SET status=?1, started_at_ms=NULL WHERE status=?2",
        params![TaskStatus::Queued.as_str(), TaskStatus::Running.as_str()],
    )?;
    Ok(updated)
}

/// Runs due tasks on the calling thread until none are due or `max` ran.
pub fn run_due_tasks<C: ImageCodec>(engine: &Engine<C>, now_ms: i64, max: usize) -> Result<usize> {
    let paths = engine.paths();
    let mut ran = 0_usize;
    while ran < max {
        let due = fetch_due_tasks(paths, now_ms, max - ran)?;
        if due.is_empty() {
            break;
        }
        for task in due {
            if !claim_task(paths, &task.id)? {
                continue;
            }
            let outcome = execute_task(engine, &task);
            settle_task(engine, &task, outcome)?;
            ran += 1;
        }
    }
    Ok(ran)
}

#[derive(Debug, Clone)]
pub struct RunnerHandle {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicUsize>,
}

impl RunnerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

pub fn start_runner<C>(engine: Arc<Engine<C>>) -> Result<RunnerHandle>
where
    C: ImageCodec + 'static,
{
    let paths = engine.paths().clone();
    paths.ensure_dirs()?;
    let conn = db::open(&paths)?;
    db::migrate(&conn)?;

    // Units that were mid-flight when the process died get delivered again.
    requeue_orphaned_running_tasks(&conn)?;

    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicUsize::new(0));

    let prune_paths = paths.clone();
    thread::spawn(move || {
        let _ = prune_job_logs(&prune_paths);
    });

    let stop_thread = stop.clone();
    let running_thread = running.clone();
    thread::spawn(move || runner_loop(engine, stop_thread, running_thread));

    Ok(RunnerHandle { stop, running })
}

fn runner_loop<C>(engine: Arc<Engine<C>>, stop: Arc<AtomicBool>, running: Arc<AtomicUsize>)
where
    C: ImageCodec + 'static,
{
    let paths = engine.paths().clone();
    while !stop.load(Ordering::SeqCst) {
        let max_concurrency = config::get_runner_concurrency(&paths)
            .unwrap_or(config::DEFAULT_RUNNER_CONCURRENCY);
        let available = max_concurrency.saturating_sub(running.load(Ordering::SeqCst));
        if available == 0 {
            thread::sleep(Duration::from_millis(50));
            continue;
        }

        let due = match fetch_due_tasks(&paths, now_ms(), available) {
            Ok(v) => v,
            Err(_) => {
                thread::sleep(Duration::from_millis(400));
                continue;
            }
        };
        if due.is_empty() {
            thread::sleep(Duration::from_millis(200));
            continue;
        }

        for task in due {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if !claim_task(&paths, &task.id).unwrap_or(false) {
                continue;
            }

            running.fetch_add(1, Ordering::SeqCst);
            let engine_worker = engine.clone();
            let running_worker = running.clone();
            thread::spawn(move || {
                let outcome = execute_task(&engine_worker, &task);
                let _ = settle_task(&engine_worker, &task, outcome);
                running_worker.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(dir: &tempfile::TempDir) -> (AppPaths, SqliteTaskQueue) {
        let paths = AppPaths::new(dir.path().to_path_buf());
        (paths.clone(), SqliteTaskQueue::new(paths))
    }

    #[test]
    fn work_units_roundtrip_through_payload_json() {
        let unit = WorkUnit::ProcessFile {
            locator: "2024/a.jpg".to_string(),
            job_id: 9,
        };
        let json = serde_json::to_string(&unit).expect("json");
        assert!(json.starts_with("{\"process_file\":{"));
        assert_eq!(serde_json::from_str::<WorkUnit>(&json).expect("parse"), unit);
        assert_eq!(unit.job_id(), 9);
    }

    #[test]
    fn delayed_units_are_not_due_yet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, queue) = queue(&dir);
        queue
            .enqueue(&WorkUnit::Finalize { job_id: 1 }, "optimize-1")
            .expect("enqueue");
        queue
            .schedule_delayed(
                &WorkUnit::Finalize { job_id: 1 },
                "optimize-1",
                Duration::from_secs(60),
            )
            .expect("schedule");

        let now = now_ms();
        assert_eq!(fetch_due_tasks(&paths, now, 10).expect("due").len(), 1);
        assert_eq!(
            fetch_due_tasks(&paths, now + 61_000, 10).expect("due later").len(),
            2
        );
    }

    #[test]
    fn cancel_group_only_touches_pending_units_of_that_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, queue) = queue(&dir);
        let units: Vec<WorkUnit> = (0..3)
            .map(|i| WorkUnit::ProcessFile {
                locator: format!("a-{i}.jpg"),
                job_id: 1,
            })
            .collect();
        queue.enqueue_batch(&units, "optimize-1").expect("batch");
        queue
            .enqueue(&WorkUnit::Finalize { job_id: 2 }, "optimize-2")
            .expect("other group");

        let first = fetch_due_tasks(&paths, now_ms(), 1).expect("due");
        assert!(claim_task(&paths, &first[0].id).expect("claim"));

        assert_eq!(queue.cancel_group_pending("optimize-1").expect("cancel"), 2);
        let counts = task_counts(&paths, "optimize-1").expect("counts");
        assert_eq!(counts.running, 1);
        assert_eq!(counts.canceled, 2);
        assert_eq!(task_counts(&paths, "optimize-2").expect("counts").queued, 1);
    }

    #[test]
    fn claim_is_exclusive_and_orphans_are_requeued() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, queue) = queue(&dir);
        queue
            .enqueue(&WorkUnit::Finalize { job_id: 1 }, "optimize-1")
            .expect("enqueue");
        let due = fetch_due_tasks(&paths, now_ms(), 10).expect("due");
        assert!(claim_task(&paths, &due[0].id).expect("claim"));
        assert!(!claim_task(&paths, &due[0].id).expect("second claim"));

        let conn = db::open(&paths).expect("open");
        assert_eq!(requeue_orphaned_running_tasks(&conn).expect("requeue"), 1);
        assert_eq!(fetch_due_tasks(&paths, now_ms(), 10).expect("due").len(), 1);
    }

    #[test]
    fn purge_keeps_running_units_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, queue) = queue(&dir);
        for i in 0..3 {
            queue
                .enqueue(&WorkUnit::Finalize { job_id: i }, "optimize-x")
                .expect("enqueue");
        }
        let due = fetch_due_tasks(&paths, now_ms(), 1).expect("due");
        assert!(claim_task(&paths, &due[0].id).expect("claim"));

        assert_eq!(queue.purge().expect("purge"), 2);
        let counts = task_counts(&paths, "optimize-x").expect("counts");
        assert_eq!(counts, TaskCounts { running: 1, ..TaskCounts::default() });
    }

    fn engine_with_file(dir: &tempfile::TempDir, locator: &str) -> Engine<crate::codec::WebpCodec> {
        let paths = AppPaths::new(dir.path().to_path_buf());
        let file = paths.resolve_locator(locator);
        std::fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        std::fs::write(&file, b"x").expect("write");
        Engine::open(paths, crate::codec::WebpCodec).expect("engine")
    }

    #[test]
    fn retry_delay_grows_and_is_capped() {
        assert_eq!(retry_delay_ms(1), TASK_RETRY_BASE_MS);
        assert_eq!(retry_delay_ms(2), TASK_RETRY_BASE_MS * 2);
        assert_eq!(retry_delay_ms(40), TASK_RETRY_MAX_MS);
    }

    #[test]
    fn a_unit_that_keeps_failing_is_folded_in_as_an_error_skip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_with_file(&dir, "2024/done.webp");
        let paths = engine.paths().clone();
        let started = engine
            .start_job(config::JobRequest {
                roots: vec!["2024".to_string()],
                ..config::JobRequest::default()
            })
            .expect("start");

        // Only a state write that records an error may land.
        let conn = db::open(&paths).expect("open");
        conn.execute_batch(
            "CREATE TRIGGER freeze_job_state BEFORE UPDATE ON job_state
             WHEN instr(NEW.state_json, 'error: ') = 0
             BEGIN SELECT RAISE(ABORT, 'state frozen'); END;",
        )
        .expect("trigger");

        run_due_tasks(&engine, i64::MAX / 2, 50).expect("drain");

        let view = engine.get_status().expect("status").expect("job");
        assert_eq!(view.status, crate::state::JobStatus::Completed);
        assert_eq!(view.counters.processed, 1);
        let job = crate::state::load_state(&paths).expect("load").expect("job");
        assert_eq!(job.skipped_files.len(), 1);
        let reason = &job.skipped_files[0].reason;
        assert!(reason.starts_with("error: "), "{reason}");
        assert!(reason.contains("state frozen"), "{reason}");

        let counts = task_counts(&paths, &crate::state::group_token(started.job_id)).expect("counts");
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.queued, 0);
        let attempts: i64 = conn
            .query_row(
                "SELECT attempts FROM task WHERE status='failed'",
                [],
                |row| row.get(0),
            )
            .expect("attempts");
        assert_eq!(attempts, MAX_TASK_ATTEMPTS);
    }

    #[test]
    fn undecodable_payload_fails_as_a_json_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_with_file(&dir, "2024/a.jpg");
        let paths = engine.paths().clone();
        let queue = SqliteTaskQueue::new(paths.clone());
        queue
            .enqueue(&WorkUnit::Finalize { job_id: 1 }, "optimize-1")
            .expect("enqueue");
        let conn = db::open(&paths).expect("open");
        conn.execute("UPDATE task SET payload_json='not json'", [])
            .expect("corrupt");

        run_due_tasks(&engine, i64::MAX / 2, 50).expect("drain");

        let (status, error): (String, String) = conn
            .query_row("SELECT status, error FROM task", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .expect("task");
        assert_eq!(status, "failed");
        assert!(error.starts_with("json error"), "{error}");
        let attempts: i64 = conn
            .query_row("SELECT attempts FROM task", [], |row| row.get(0))
            .expect("attempts");
        assert_eq!(attempts, 1);
    }
}
