//! The single persisted job document and its optimistic-concurrency store.
//!
//! Every work unit mutates the document through [`update_state`], which reads
//! `(version, document)`, applies the caller's closure and writes back only if
//! the version is unchanged. A lost race re-reads and re-applies, so concurrent
//! workers never overwrite each other's deltas.

use crate::config::JobParams;
use crate::db::{self, OptionalRowExt};
use crate::joblog::now_ms;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::thread;
use std::time::Duration;

const MAX_STATE_UPDATE_ATTEMPTS: usize = 200;
const META_KEY_LAST_JOB_EPOCH: &str = "last_job_epoch";

pub const SKIP_UNSPECIFIED: &str = "Unspecified";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Completed)
    }

    /// Forward-only transitions; a terminal status never changes again.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Queued, _) => true,
            (Running, Cancelling | Cancelled | Completed) => true,
            (Cancelling, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Additive counters. Also used as the per-file delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCounters {
    pub processed: usize,
    pub converted: usize,
    pub skipped: usize,
    pub deleted_originals: usize,
    pub deleted_originals_size: u64,
    pub thumbs_deleted: usize,
    pub deleted_thumbs_size: u64,
    pub total_deleted_files: usize,
    pub deleted_size: u64,
    pub webp_size: u64,
    pub created_thumbs_size: u64,
    pub created_webp_files: usize,
    pub created_thumbs_count: usize,
    pub total_created_files: usize,
    pub deleted_folders: usize,
}

impl JobCounters {
    /// Adds the file-level deltas. Log-derived counters are not touched here.
    fn add_file_delta(&mut self, delta: &JobCounters) {
        self.deleted_originals += delta.deleted_originals;
        self.deleted_originals_size += delta.deleted_originals_size;
        self.thumbs_deleted += delta.thumbs_deleted;
        self.deleted_thumbs_size += delta.deleted_thumbs_size;
        self.deleted_size += delta.deleted_size;
        self.webp_size += delta.webp_size;
        self.created_thumbs_size += delta.created_thumbs_size;
        self.created_webp_files += delta.created_webp_files;
        self.created_thumbs_count += delta.created_thumbs_count;
        self.total_created_files += delta.total_created_files;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedEntry {
    pub original: String,
    pub original_size: u64,
    pub converted: String,
    pub converted_size: u64,
}

impl fmt::Display for ConvertedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) \u{2192} {} ({})",
            self.original,
            format_bytes(self.original_size),
            self.converted,
            format_bytes(self.converted_size)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub file: String,
    pub reason: String,
}

impl fmt::Display for SkippedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \u{2014} {}", self.file, self.reason)
    }
}

/// What one file unit decided, computed before touching the shared document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOutcome {
    pub counters: JobCounters,
    pub converted: Option<ConvertedEntry>,
    pub skipped: Option<String>,
    /// The locator goes into the deleted-files log.
    pub deleted: bool,
}

impl FileOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn has_log_entry(&self) -> bool {
        self.converted.is_some() || self.skipped.is_some() || self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: i64,
    pub group: String,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub params: JobParams,
    pub total: usize,
    pub files: Vec<String>,
    pub done: BTreeSet<String>,
    pub counters: JobCounters,
    pub converted_files: Vec<ConvertedEntry>,
    pub skipped_files: Vec<SkippedEntry>,
    pub deleted_files: Vec<String>,
    pub deleted_folders_list: Vec<String>,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
}

impl JobState {
    pub fn new(id: i64, params: JobParams, files: Vec<String>) -> Self {
        Self {
            id,
            group: group_token(id),
            status: JobStatus::Queued,
            cancel_requested: false,
            params,
            total: files.len(),
            files,
            done: BTreeSet::new(),
            counters: JobCounters::default(),
            converted_files: Vec::new(),
            skipped_files: Vec::new(),
            deleted_files: Vec::new(),
            deleted_folders_list: Vec::new(),
            started_at_ms: now_ms(),
            ended_at_ms: None,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.done.len() >= self.total
    }

    /// Moves forward if the transition is allowed; returns whether it was.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() && self.ended_at_ms.is_none() {
            self.ended_at_ms = Some(now_ms());
        }
        true
    }

    /// Folds one file's outcome in. Returns false (and changes nothing) when
    /// the locator was already accounted for.
    pub fn apply_outcome(&mut self, locator: &str, outcome: &FileOutcome) -> bool {
        if self.done.contains(locator) {
            return false;
        }

        self.counters.add_file_delta(&outcome.counters);

        if let Some(entry) = &outcome.converted {
            if push_unique(&mut self.converted_files, entry.clone()) {
                self.counters.converted += 1;
            }
        }
        if outcome.deleted {
            push_unique(&mut self.deleted_files, locator.to_string());
        }
        if let Some(reason) = &outcome.skipped {
            self.log_skipped(locator, reason);
        }
        if !outcome.has_log_entry() {
            self.log_skipped(locator, SKIP_UNSPECIFIED);
        }

        self.done.insert(locator.to_string());
        self.reconcile_counters();
        true
    }

    pub fn log_skipped(&mut self, file: &str, reason: &str) {
        push_unique(
            &mut self.skipped_files,
            SkippedEntry {
                file: file.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    pub fn log_deleted_folder(&mut self, folder: &str) -> bool {
        push_unique(&mut self.deleted_folders_list, folder.to_string())
    }

    /// Re-derives the counters that must always equal their log sizes.
    pub fn reconcile_counters(&mut self) {
        self.counters.processed = self.done.len();
        self.counters.skipped = self.skipped_files.len();
        self.counters.total_deleted_files = self.deleted_files.len();
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) -> bool {
    if list.contains(&item) {
        return false;
    }
    list.push(item);
    true
}

pub fn group_token(job_id: i64) -> String {
    format!("optimize-{job_id}")
}

/// Read-only status snapshot; log-derived counters are recomputed on the way out.
#[derive(Debug, Clone, Serialize)]
pub struct JobStateView {
    pub id: i64,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub total: usize,
    pub progress: f32,
    #[serde(flatten)]
    pub counters: JobCounters,
    pub converted_files: Vec<String>,
    pub skipped_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub deleted_folders_list: Vec<String>,
    pub params: JobParams,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
}

impl From<&JobState> for JobStateView {
    fn from(state: &JobState) -> Self {
        let total = if state.total == 0 {
            state.files.len()
        } else {
            state.total
        };
        let mut counters = state.counters.clone();
        counters.processed = state.done.len();
        counters.skipped = state.skipped_files.len();
        counters.total_deleted_files = state.deleted_files.len();
        let progress = if total == 0 {
            1.0
        } else {
            (counters.processed as f32 / total as f32).min(1.0)
        };

        Self {
            id: state.id,
            status: state.status,
            cancel_requested: state.cancel_requested,
            total,
            progress,
            counters,
            converted_files: state.converted_files.iter().map(|e| e.to_string()).collect(),
            skipped_files: state.skipped_files.iter().map(|e| e.to_string()).collect(),
            deleted_files: state.deleted_files.clone(),
            deleted_folders_list: state.deleted_folders_list.clone(),
            params: state.params.clone(),
            started_at_ms: state.started_at_ms,
            ended_at_ms: state.ended_at_ms,
        }
    }
}

pub fn load_state(paths: &AppPaths) -> Result<Option<JobState>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    Ok(load_versioned(&conn)?.map(|(_, state)| state))
}

/// Overwrites the slot wholesale (new job).
pub fn replace_state(paths: &AppPaths, state: &JobState) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let mut state = state.clone();
    state.reconcile_counters();
    let json = serde_json::to_string(&state)?;
    conn.execute(
        "INSERT INTO job_state(slot, version, state_json) VALUES(1, 0, ?1)
         ON CONFLICT(slot) DO UPDATE SET state_json=excluded.state_json, version=job_state.version+1",
        params![json],
    )?;
    Ok(())
}

pub fn clear_state(paths: &AppPaths) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let removed = conn.execute("DELETE FROM job_state WHERE slot=1", [])?;
    Ok(removed > 0)
}

/// Read-modify-write with a version check.
///
/// The closure may run several times (once per conflict) and must derive its
/// change from the state it is handed. Returning `None` skips the write.
/// `Ok(None)` also means there was no job document at all.
pub fn update_state<T, F>(paths: &AppPaths, mut mutate: F) -> Result<Option<T>>
where
    F: FnMut(&mut JobState) -> Option<T>,
{
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    for attempt in 0..MAX_STATE_UPDATE_ATTEMPTS {
        let Some((version, mut state)) = load_versioned(&conn)? else {
            return Ok(None);
        };
        let Some(out) = mutate(&mut state) else {
            return Ok(None);
        };
        state.reconcile_counters();
        let json = serde_json::to_string(&state)?;
        let updated = conn.execute(
            "UPDATE job_state SET state_json=?1, version=version+1 WHERE slot=1 AND version=?2",
            params![json, version],
        )?;
        if updated == 1 {
            return Ok(Some(out));
        }
        thread::sleep(Duration::from_millis(1 + (attempt as u64 % 8)));
    }

    Err(EngineError::StateConflict {
        attempts: MAX_STATE_UPDATE_ATTEMPTS,
    })
}

fn load_versioned(conn: &Connection) -> Result<Option<(i64, JobState)>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, state_json FROM job_state WHERE slot=1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((version, json)) = row else {
        return Ok(None);
    };
    // An unreadable document degrades to "no job".
    Ok(serde_json::from_str::<JobState>(&json)
        .ok()
        .map(|state| (version, state)))
}

/// Next job epoch: strictly greater than every epoch handed out before.
pub fn allocate_epoch(paths: &AppPaths) -> Result<i64> {
    let mut conn = db::open(paths)?;
    db::migrate(&conn)?;
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let last = db::get_meta(&tx, META_KEY_LAST_JOB_EPOCH)?
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let next = now_ms().max(last + 1);
    db::set_meta(&tx, META_KEY_LAST_JOB_EPOCH, &next.to_string())?;
    tx.commit()?;
    Ok(next)
}

/// Human-readable size, 1024-based ("512 B", "1.2 MB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0_usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        let rounded = (value * 10.0).round() / 10.0;
        format!("{rounded} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_job_params, EngineConfig, JobRequest};
    use std::sync::Arc;

    fn params() -> JobParams {
        build_job_params(
            &EngineConfig::default(),
            JobRequest {
                roots: vec!["2024".to_string()],
                ..JobRequest::default()
            },
        )
        .expect("params")
    }

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("2024/img-{i}.jpg")).collect()
    }

    #[test]
    fn status_transitions_only_move_forward() {
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Running));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Cancelling));
        assert!(JobStatus::Cancelling.can_advance_to(JobStatus::Cancelled));
        assert!(!JobStatus::Cancelling.can_advance_to(JobStatus::Running));
        assert!(!JobStatus::Cancelling.can_advance_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_advance_to(JobStatus::Cancelling));
        assert!(!JobStatus::Cancelled.can_advance_to(JobStatus::Completed));

        let mut state = JobState::new(1, params(), files(1));
        assert!(state.advance(JobStatus::Completed));
        assert!(state.ended_at_ms.is_some());
        assert!(!state.advance(JobStatus::Running));
        assert_eq!(state.status, JobStatus::Completed);
    }

    #[test]
    fn replaying_an_outcome_is_a_no_op() {
        let mut state = JobState::new(1, params(), files(2));
        let mut outcome = FileOutcome::skipped("Already target format");
        outcome.counters.webp_size = 10;

        assert!(state.apply_outcome("2024/img-0.jpg", &outcome));
        let snapshot = state.clone();
        assert!(!state.apply_outcome("2024/img-0.jpg", &outcome));
        assert_eq!(state, snapshot);
        assert_eq!(state.counters.processed, 1);
        assert_eq!(state.counters.skipped, 1);
    }

    #[test]
    fn outcome_without_log_entry_is_logged_as_unspecified() {
        let mut state = JobState::new(1, params(), files(1));
        state.apply_outcome("2024/img-0.jpg", &FileOutcome::default());
        assert_eq!(state.skipped_files.len(), 1);
        assert_eq!(state.skipped_files[0].reason, SKIP_UNSPECIFIED);
        assert_eq!(state.counters.processed, 1);
    }

    #[test]
    fn counters_track_log_sizes() {
        let mut state = JobState::new(1, params(), files(3));
        let converted = FileOutcome {
            converted: Some(ConvertedEntry {
                original: "2024/img-0.jpg".to_string(),
                original_size: 2048,
                converted: "2024/img-0.webp".to_string(),
                converted_size: 512,
            }),
            deleted: true,
            ..FileOutcome::default()
        };
        state.apply_outcome("2024/img-0.jpg", &converted);
        state.apply_outcome("2024/img-1.jpg", &FileOutcome::skipped("Unsupported extension"));
        let thumb = FileOutcome {
            deleted: true,
            ..FileOutcome::default()
        };
        state.apply_outcome("2024/img-2.jpg", &thumb);

        assert_eq!(state.counters.processed, state.done.len());
        assert_eq!(state.counters.skipped, state.skipped_files.len());
        assert_eq!(state.counters.total_deleted_files, state.deleted_files.len());
        assert_eq!(state.counters.converted, 1);
        assert_eq!(state.counters.total_deleted_files, 2);
        assert!(state.is_drained());
    }

    #[test]
    fn view_recomputes_counters_from_logs() {
        let mut state = JobState::new(1, params(), files(2));
        state.apply_outcome("2024/img-0.jpg", &FileOutcome::skipped("Unattached media"));
        state.counters.processed = 99;
        state.counters.skipped = 42;

        let view = JobStateView::from(&state);
        assert_eq!(view.counters.processed, 1);
        assert_eq!(view.counters.skipped, 1);
        assert_eq!(view.skipped_files, vec!["2024/img-0.jpg \u{2014} Unattached media"]);
        assert!((view.progress - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn converted_entry_renders_both_sizes() {
        let entry = ConvertedEntry {
            original: "a.jpg".to_string(),
            original_size: 1_258_291,
            converted: "a.webp".to_string(),
            converted_size: 300,
        };
        assert_eq!(entry.to_string(), "a.jpg (1.2 MB) \u{2192} a.webp (300 B)");
    }

    #[test]
    fn format_bytes_matches_expected_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(50_000), "48.8 KB");
        assert_eq!(format_bytes(60_000), "58.6 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5 GB");
    }

    #[test]
    fn store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        assert!(load_state(&paths).expect("load").is_none());

        let state = JobState::new(7, params(), files(3));
        replace_state(&paths, &state).expect("replace");
        let loaded = load_state(&paths).expect("load").expect("present");
        assert_eq!(loaded.id, 7);
        assert_eq!(loaded.files.len(), 3);

        assert!(clear_state(&paths).expect("clear"));
        assert!(load_state(&paths).expect("load").is_none());
        assert!(!clear_state(&paths).expect("clear again"));
    }

    #[test]
    fn update_without_a_document_reports_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let out = update_state(&paths, |_| Some(())).expect("update");
        assert!(out.is_none());
    }

    #[test]
    fn corrupt_document_degrades_to_no_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let conn = db::open(&paths).expect("open");
        db::migrate(&conn).expect("migrate");
        conn.execute(
            "INSERT INTO job_state(slot, version, state_json) VALUES(1, 0, 'not json')",
            [],
        )
        .expect("insert");
        assert!(load_state(&paths).expect("load").is_none());
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let workers = 6;
        let per_worker = 15;
        let all = files(workers * per_worker);
        replace_state(&paths, &JobState::new(3, params(), all.clone())).expect("seed");

        let all = Arc::new(all);
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let paths = paths.clone();
                let all = all.clone();
                thread::spawn(move || {
                    for i in 0..per_worker {
                        let locator = all[w * per_worker + i].clone();
                        let mut outcome = FileOutcome::skipped("Unsupported extension");
                        outcome.counters.webp_size = 1;
                        update_state(&paths, |state| {
                            state.apply_outcome(&locator, &outcome).then_some(())
                        })
                        .expect("update");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }

        let state = load_state(&paths).expect("load").expect("present");
        assert_eq!(state.counters.processed, workers * per_worker);
        assert_eq!(state.counters.skipped, workers * per_worker);
        assert_eq!(state.counters.webp_size, (workers * per_worker) as u64);
        assert!(state.is_drained());
    }

    #[test]
    fn epochs_strictly_increase() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let a = allocate_epoch(&paths).expect("a");
        let b = allocate_epoch(&paths).expect("b");
        let c = allocate_epoch(&paths).expect("c");
        assert!(a < b && b < c);
    }
}
