use crate::codec::ImageCodec;
use crate::controller::Engine;
use crate::joblog::log_line;
use crate::paths::AppPaths;
use crate::queue::WorkUnit;
use crate::state::{self, JobStatus};
use crate::Result;
use std::time::Duration;
use walkdir::WalkDir;

impl<C: ImageCodec> Engine<C> {
    /// Polls for drain completion; reschedules itself until every file is done.
    pub fn finalize_unit(&self, job_id: i64) -> Result<()> {
        let Some(job) = state::load_state(&self.paths)? else {
            return Ok(());
        };
        if job.id != job_id || job.status.is_terminal() {
            return Ok(());
        }
        let log_id = job_id.to_string();

        if job.cancel_requested {
            let cancelled = state::update_state(&self.paths, |s| {
                (s.id == job_id && s.advance(JobStatus::Cancelled)).then_some(())
            })?;
            if cancelled.is_some() {
                let _ = log_line(
                    &self.paths,
                    &log_id,
                    "info",
                    "job_cancelled",
                    serde_json::json!({ "processed": job.done.len(), "total": job.total }),
                );
            }
            return Ok(());
        }

        if !job.is_drained() {
            self.queue.schedule_delayed(
                &WorkUnit::Finalize { job_id },
                &job.group,
                Duration::from_millis(self.config.finalize_retry_delay_ms),
            )?;
            let _ = log_line(
                &self.paths,
                &log_id,
                "info",
                "finalize_waiting",
                serde_json::json!({ "processed": job.done.len(), "total": job.total }),
            );
            return Ok(());
        }

        let dry_run = job.params.dry_run;
        let folders = if job.params.delete_empty_folders {
            prune_empty_folders(&self.paths, &job.params.roots, dry_run)
        } else {
            Vec::new()
        };
        for folder in &folders {
            let _ = log_line(
                &self.paths,
                &log_id,
                "info",
                "folder_removed",
                serde_json::json!({ "folder": folder, "dry_run": dry_run }),
            );
        }

        let finished = state::update_state(&self.paths, |s| {
            if s.id != job_id || s.status.is_terminal() {
                return None;
            }
            if s.cancel_requested {
                s.advance(JobStatus::Cancelled);
                return Some(JobStatus::Cancelled);
            }
            for folder in &folders {
                if s.log_deleted_folder(folder) && !dry_run {
                    s.counters.deleted_folders += 1;
                }
            }
            s.advance(JobStatus::Completed);
            Some(JobStatus::Completed)
        })?;

        match finished {
            Some(JobStatus::Completed) => {
                let _ = log_line(
                    &self.paths,
                    &log_id,
                    "info",
                    "job_completed",
                    serde_json::json!({ "total": job.total, "folders": folders.len() }),
                );
            }
            Some(JobStatus::Cancelled) => {
                let _ = log_line(&self.paths, &log_id, "info", "job_cancelled", serde_json::json!({}));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Empty directories under each root (the root included), children before
/// parents. A real run removes them and returns the ones that went away; a
/// dry run only lists what is empty right now.
pub fn prune_empty_folders(paths: &AppPaths, roots: &[String], dry_run: bool) -> Vec<String> {
    let mut out = Vec::new();
    for root in roots {
        let root_dir = paths.resolve_locator(root);
        if !root_dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&root_dir)
            .sort_by_file_name()
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            let is_empty = std::fs::read_dir(dir)
                .map(|mut it| it.next().is_none())
                .unwrap_or(false);
            if !is_empty {
                continue;
            }
            let Some(locator) = paths.locator_for(dir) else {
                continue;
            };
            if dry_run {
                if !out.contains(&locator) {
                    out.push(locator);
                }
            } else if std::fs::remove_dir(dir).is_ok() {
                out.push(locator);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WebpCodec;
    use crate::config::{build_job_params, JobRequest};
    use crate::queue::{task_counts, SqliteTaskQueue, TaskQueue};
    use crate::state::JobState;
    use std::sync::Arc;

    fn mkdirs(paths: &AppPaths, locators: &[&str]) {
        for l in locators {
            std::fs::create_dir_all(paths.resolve_locator(l)).expect("mkdir");
        }
    }

    fn engine(paths: &AppPaths) -> Engine<WebpCodec> {
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(paths.clone()));
        Engine::new(paths.clone(), Default::default(), WebpCodec, queue)
    }

    fn seed(paths: &AppPaths, files: &[&str], tweak: impl FnOnce(&mut JobRequest)) -> JobState {
        let mut req = JobRequest {
            roots: vec!["2024".to_string()],
            ..JobRequest::default()
        };
        tweak(&mut req);
        let params = build_job_params(&Default::default(), req).expect("params");
        let id = state::allocate_epoch(paths).expect("epoch");
        let mut job = JobState::new(id, params, files.iter().map(|f| f.to_string()).collect());
        job.advance(JobStatus::Running);
        state::replace_state(paths, &job).expect("seed");
        job
    }

    #[test]
    fn nested_empty_folders_are_removed_children_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        mkdirs(&paths, &["2024/01/deep/deeper", "2024/02"]);
        std::fs::write(paths.resolve_locator("2024/02/keep.txt"), b"x").expect("file");

        let removed = prune_empty_folders(&paths, &["2024".to_string()], false);
        assert_eq!(removed, vec!["2024/01/deep/deeper", "2024/01/deep", "2024/01"]);
        assert!(!paths.resolve_locator("2024/01").exists());
        assert!(paths.resolve_locator("2024/02").exists());
    }

    #[test]
    fn dry_run_lists_only_currently_empty_folders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        mkdirs(&paths, &["2024/01/deep"]);

        let listed = prune_empty_folders(&paths, &["2024".to_string()], true);
        assert_eq!(listed, vec!["2024/01/deep"]);
        assert!(paths.resolve_locator("2024/01/deep").exists());
    }

    #[test]
    fn an_emptied_root_is_removed_too() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        mkdirs(&paths, &["2024/05"]);
        let removed = prune_empty_folders(&paths, &["2024/05".to_string()], false);
        assert_eq!(removed, vec!["2024/05"]);
    }

    #[test]
    fn undrained_job_reschedules_the_finalizer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let job = seed(&paths, &["2024/a.jpg"], |_| {});

        engine(&paths).finalize_unit(job.id).expect("finalize");

        let state = state::load_state(&paths).expect("load").expect("job");
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(task_counts(&paths, &job.group).expect("counts").queued, 1);
    }

    #[test]
    fn drained_job_completes_and_prunes_folders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        mkdirs(&paths, &["2024/01/empty"]);
        let job = seed(&paths, &[], |r| r.delete_empty_folders = true);

        engine(&paths).finalize_unit(job.id).expect("finalize");

        let state = state::load_state(&paths).expect("load").expect("job");
        assert_eq!(state.status, JobStatus::Completed);
        assert!(state.ended_at_ms.is_some());
        assert_eq!(state.counters.deleted_folders, 3);
        assert_eq!(state.deleted_folders_list, vec!["2024/01/empty", "2024/01", "2024"]);
    }

    #[test]
    fn cancelled_job_ends_without_cleanup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        mkdirs(&paths, &["2024/01"]);
        let job = seed(&paths, &["2024/a.jpg"], |r| r.delete_empty_folders = true);
        state::update_state(&paths, |s| {
            s.cancel_requested = true;
            s.advance(JobStatus::Cancelling);
            Some(())
        })
        .expect("cancel");

        engine(&paths).finalize_unit(job.id).expect("finalize");

        let state = state::load_state(&paths).expect("load").expect("job");
        assert_eq!(state.status, JobStatus::Cancelled);
        assert!(state.ended_at_ms.is_some());
        assert!(state.deleted_folders_list.is_empty());
        assert!(paths.resolve_locator("2024/01").exists());
    }

    #[test]
    fn stale_finalizer_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let job = seed(&paths, &[], |_| {});

        engine(&paths).finalize_unit(job.id - 1).expect("stale");
        let state = state::load_state(&paths).expect("load").expect("job");
        assert_eq!(state.status, JobStatus::Running);
    }
}
