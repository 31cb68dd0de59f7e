use crate::codec::ImageCodec;
use crate::config::{self, build_job_params, EngineConfig, JobRequest};
use crate::joblog::{log_line, remove_job_log_files};
use crate::paths::AppPaths;
use crate::queue::{SqliteTaskQueue, TaskQueue, WorkUnit};
use crate::state::{self, JobState, JobStateView, JobStatus};
use crate::{EngineError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

/// Extensions picked up by enumeration. Generated variants and files that are
/// already in the target format are included so the pipeline can account for them.
pub const ENUMERATED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "webp"];

pub struct Engine<C: ImageCodec> {
    pub(crate) paths: AppPaths,
    pub(crate) config: EngineConfig,
    pub(crate) codec: C,
    pub(crate) queue: Arc<dyn TaskQueue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStarted {
    pub job_id: i64,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub tasks_removed: usize,
    pub log_files_removed: usize,
    pub state_cleared: bool,
}

impl<C: ImageCodec> Engine<C> {
    pub fn new(paths: AppPaths, config: EngineConfig, codec: C, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            paths,
            config,
            codec,
            queue,
        }
    }

    /// Engine over the on-disk config and the SQLite task queue.
    pub fn open(paths: AppPaths, codec: C) -> Result<Self> {
        paths.ensure_dirs()?;
        let config = config::load_engine_config(&paths)?;
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(paths.clone()));
        Ok(Self::new(paths, config, codec, queue))
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn start_job(&self, request: JobRequest) -> Result<JobStarted> {
        let params = build_job_params(&self.config, request)?;
        if !self.queue.is_available() {
            return Err(EngineError::BackendUnavailable(
                "task queue is not reachable".to_string(),
            ));
        }

        let files = enumerate_files(&self.paths, &params.roots, params.max_files);
        let job_id = state::allocate_epoch(&self.paths)?;

        if let Some(previous) = state::load_state(&self.paths)? {
            self.queue.cancel_group_pending(&previous.group)?;
        }

        let job = JobState::new(job_id, params, files);
        let group = job.group.clone();
        let total = job.total;
        state::replace_state(&self.paths, &job)?;

        let units: Vec<WorkUnit> = job
            .files
            .iter()
            .map(|locator| WorkUnit::ProcessFile {
                locator: locator.clone(),
                job_id,
            })
            .collect();
        let scheduled = self.queue.enqueue_batch(&units, &group).and_then(|_| {
            self.queue.schedule_delayed(
                &WorkUnit::Finalize { job_id },
                &group,
                Duration::from_millis(self.config.finalize_initial_delay_ms),
            )
        });
        if let Err(e) = scheduled {
            let _ = self.queue.cancel_group_pending(&group);
            let _ = state::clear_state(&self.paths);
            return Err(EngineError::BackendUnavailable(e.to_string()));
        }

        state::update_state(&self.paths, |s| {
            (s.id == job_id && s.advance(JobStatus::Running)).then_some(())
        })?;

        let _ = log_line(
            &self.paths,
            &job_id.to_string(),
            "info",
            "job_started",
            serde_json::json!({
                "total": total,
                "roots": job.params.roots,
                "dry_run": job.params.dry_run,
            }),
        );

        Ok(JobStarted { job_id, total })
    }

    /// Flags the current job cancelled and wakes its finalizer. Returns false
    /// when there is no job to cancel.
    pub fn cancel_job(&self) -> Result<bool> {
        let flagged = state::update_state(&self.paths, |s| {
            if s.status.is_terminal() {
                return None;
            }
            s.cancel_requested = true;
            s.advance(JobStatus::Cancelling);
            Some((s.id, s.group.clone()))
        })?;
        let Some((job_id, group)) = flagged else {
            return Ok(false);
        };

        let dropped = self.queue.cancel_group_pending(&group)?;
        self.queue
            .schedule_delayed(&WorkUnit::Finalize { job_id }, &group, Duration::ZERO)?;

        let _ = log_line(
            &self.paths,
            &job_id.to_string(),
            "info",
            "job_cancel_requested",
            serde_json::json!({ "dropped_units": dropped }),
        );
        Ok(true)
    }

    pub fn get_status(&self) -> Result<Option<JobStateView>> {
        Ok(state::load_state(&self.paths)?.map(|s| JobStateView::from(&s)))
    }

    /// Forgets the job document. Converted media is left as it is.
    pub fn clear_results(&self) -> Result<bool> {
        let previous = state::load_state(&self.paths)?;
        let cleared = state::clear_state(&self.paths)?;
        if let Some(previous) = previous {
            let _ = log_line(
                &self.paths,
                &previous.id.to_string(),
                "info",
                "job_cleared",
                serde_json::json!({ "status": previous.status.as_str() }),
            );
        }
        Ok(cleared)
    }

    /// Drops all pending units, queue history, job logs and the job document.
    pub fn purge(&self) -> Result<PurgeSummary> {
        let previous = state::load_state(&self.paths)?;
        let tasks_removed = self.queue.purge()?;
        let log_files_removed = previous
            .as_ref()
            .map(|s| remove_job_log_files(&self.paths, &s.id.to_string()))
            .unwrap_or(0);
        let state_cleared = state::clear_state(&self.paths)?;
        Ok(PurgeSummary {
            tasks_removed,
            log_files_removed,
            state_cleared,
        })
    }

    /// Entry point the queue invokes for every delivered unit.
    pub fn dispatch(&self, unit: &WorkUnit) -> Result<()> {
        match unit {
            WorkUnit::ProcessFile { locator, job_id } => self.process_file_unit(locator, *job_id),
            WorkUnit::Finalize { job_id } => self.finalize_unit(*job_id),
        }
    }
}

/// Relative locators of candidate files under each root, in walk order,
/// stopping once `limit` files were collected across all roots.
pub fn enumerate_files(paths: &AppPaths, roots: &[String], limit: Option<usize>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for root in roots {
        let dir = paths.resolve_locator(root);
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() || !has_enumerated_extension(entry.path()) {
                continue;
            }
            let Some(locator) = paths.locator_for(entry.path()) else {
                continue;
            };
            if !seen.insert(locator.clone()) {
                continue;
            }
            files.push(locator);
            if limit.is_some_and(|max| files.len() >= max) {
                return files;
            }
        }
    }
    files
}

fn has_enumerated_extension(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ENUMERATED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
