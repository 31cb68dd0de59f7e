use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use media_optimizer_engine::codec::WebpCodec;
use media_optimizer_engine::config::{self, JobRequest};
use media_optimizer_engine::controller::Engine;
use media_optimizer_engine::joblog::now_ms;
use media_optimizer_engine::paths::AppPaths;
use media_optimizer_engine::queue::{run_due_tasks, start_runner, task_counts};
use media_optimizer_engine::{db, redirects, state};

const SYNC_DRAIN_BATCH: usize = 256;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut command: Option<String> = None;
    let mut request = JobRequest::default();
    let mut enabled_sizes: Vec<String> = Vec::new();
    let mut sync = false;
    let mut concurrency: Option<usize> = None;
    let mut out_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--base-dir" => base_dir = Some(PathBuf::from(value(&args, &mut i, arg)?)),
            "--root" => request.roots.push(value(&args, &mut i, arg)?),
            "--threshold" => request.threshold = Some(number(&args, &mut i, arg)?),
            "--quality" => request.quality = Some(number(&args, &mut i, arg)?),
            "--thumb-quality" => request.thumb_quality = Some(number(&args, &mut i, arg)?),
            "--max-files" => request.max_files = Some(number(&args, &mut i, arg)?),
            "--exclude-author" => request.excluded_authors.push(number(&args, &mut i, arg)?),
            "--size" => enabled_sizes.push(value(&args, &mut i, arg)?),
            "--dry-run" => request.dry_run = true,
            "--resize" => request.enable_resize = true,
            "--ignore-unattached" => request.ignore_unattached = true,
            "--delete-empty-folders" => request.delete_empty_folders = true,
            "--skip-if-larger" => request.skip_if_larger = true,
            "--strip-metadata" => request.strip_metadata = true,
            "--delete-thumbnails" => request.enable_thumbnail_deletion = true,
            "--keep-originals" => request.enable_original_deletion = Some(false),
            "--no-convert" => request.create_target_format = Some(false),
            "--sync" => sync = true,
            "--concurrency" => concurrency = Some(number(&args, &mut i, arg)?),
            "--out" => out_path = Some(PathBuf::from(value(&args, &mut i, arg)?)),
            other if other.starts_with("--") => {
                return Err(format!("unknown arg: {other} (try --help)"))
            }
            other => {
                if command.is_some() {
                    return Err(format!("unexpected argument: {other}"));
                }
                command = Some(other.to_string());
            }
        }
        i += 1;
    }
    if !enabled_sizes.is_empty() {
        request.enabled_sizes = Some(enabled_sizes);
    }

    let command = command.ok_or_else(|| "missing command (try --help)".to_string())?;
    let base_dir = base_dir.unwrap_or_else(default_base_dir);
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    db::ensure_schema(&paths).map_err(|e| e.to_string())?;

    let engine = Engine::open(paths.clone(), WebpCodec).map_err(|e| e.to_string())?;

    match command.as_str() {
        "start" => {
            let started = engine.start_job(request).map_err(|e| e.to_string())?;
            println!("Job {} queued ({} files)", started.job_id, started.total);
        }
        "status" => match engine.get_status().map_err(|e| e.to_string())? {
            Some(view) => {
                let json = serde_json::to_string_pretty(&view).map_err(|e| e.to_string())?;
                println!("{json}");
                let counts =
                    task_counts(&paths, &state::group_token(view.id)).map_err(|e| e.to_string())?;
                println!(
                    "Queue: {} queued, {} running, {} succeeded, {} failed, {} canceled",
                    counts.queued, counts.running, counts.succeeded, counts.failed, counts.canceled
                );
            }
            None => println!("idle"),
        },
        "cancel" => {
            if engine.cancel_job().map_err(|e| e.to_string())? {
                println!("Cancellation requested");
            } else {
                println!("No running job");
            }
        }
        "clear" => {
            let cleared = engine.clear_results().map_err(|e| e.to_string())?;
            println!("{}", if cleared { "Results cleared" } else { "Nothing to clear" });
        }
        "purge" => {
            let summary = engine.purge().map_err(|e| e.to_string())?;
            println!(
                "Purged {} tasks, {} log files, state cleared: {}",
                summary.tasks_removed, summary.log_files_removed, summary.state_cleared
            );
        }
        "run" => {
            if let Some(n) = concurrency {
                let applied =
                    config::set_runner_concurrency(&paths, n).map_err(|e| e.to_string())?;
                println!("Runner concurrency: {applied}");
            }
            run_until_terminal(engine, sync)?;
        }
        "redirects" => {
            let job = state::load_state(&paths)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "no job results to export".to_string())?;
            let csv = redirects::export_redirects_csv(&job, engine.config())
                .map_err(|e| e.to_string())?;
            match out_path {
                Some(path) => {
                    std::fs::write(&path, csv).map_err(|e| e.to_string())?;
                    println!("Wrote {}", path.to_string_lossy());
                }
                None => print!("{csv}"),
            }
        }
        other => return Err(format!("unknown command: {other} (try --help)")),
    }

    Ok(())
}

fn run_until_terminal(engine: Engine<WebpCodec>, sync: bool) -> Result<(), String> {
    if sync {
        loop {
            let ran = run_due_tasks(&engine, now_ms(), SYNC_DRAIN_BATCH).map_err(|e| e.to_string())?;
            if is_finished(&engine)? {
                break;
            }
            if ran == 0 {
                thread::sleep(Duration::from_millis(250));
            }
        }
    } else {
        let engine = Arc::new(engine);
        let runner = start_runner(engine.clone()).map_err(|e| e.to_string())?;
        while !is_finished(&engine)? {
            thread::sleep(Duration::from_millis(500));
        }
        runner.stop();
        while runner.in_flight() > 0 {
            thread::sleep(Duration::from_millis(50));
        }
        report(&engine)?;
        return Ok(());
    }
    report(&engine)
}

fn is_finished(engine: &Engine<WebpCodec>) -> Result<bool, String> {
    Ok(engine
        .get_status()
        .map_err(|e| e.to_string())?
        .map(|v| v.status.is_terminal())
        .unwrap_or(true))
}

fn report(engine: &Engine<WebpCodec>) -> Result<(), String> {
    match engine.get_status().map_err(|e| e.to_string())? {
        Some(view) => println!(
            "Job {} {}: {}/{} processed, {} converted, {} skipped, {} deleted ({}), {} created ({})",
            view.id,
            view.status,
            view.counters.processed,
            view.total,
            view.counters.converted,
            view.counters.skipped,
            view.counters.total_deleted_files,
            state::format_bytes(view.counters.deleted_size),
            view.counters.total_created_files,
            state::format_bytes(view.counters.webp_size + view.counters.created_thumbs_size),
        ),
        None => println!("idle"),
    }
    Ok(())
}

fn value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("{flag} expects a number, got {raw:?}"))
}

fn default_base_dir() -> PathBuf {
    if let Ok(v) = std::env::var("MEDIA_OPTIMIZER_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return PathBuf::from(t);
        }
    }
    PathBuf::from(".")
}

fn print_help() {
    println!(
        r#"media_optimizer

Converts stored images to WebP as a resumable background job.

Usage:
  media_optimizer [--base-dir <path>] <command> [options]

Commands:
  start       Enumerate files under the given roots and queue a new job
  status      Print the current job view and queue counts
  cancel      Request cancellation of the current job
  clear       Forget the current job results (media is left untouched)
  purge       Drop queued units, queue history, job logs and results
  run         Deliver queued units until the current job is finished
  redirects   Export the old-to-new URL redirect map as CSV

Options for start:
  --root <rel>            Root under <base-dir>/uploads (repeatable)
  --dry-run               Account for everything without touching storage
  --resize                Bound the longer side to --threshold (default 2048)
  --threshold <px>
  --quality <0-100>       Main image quality (default 85)
  --thumb-quality <0-100> Size variant quality (default 70)
  --size <name>           Only generate this registered size (repeatable)
  --ignore-unattached     Skip files with no owning record and no reference
  --exclude-author <id>   Skip media owned by this author (repeatable)
  --delete-thumbnails     Delete stale generated size variants
  --keep-originals        Never delete converted originals
  --no-convert            Only clean up size variants
  --skip-if-larger        Keep the original when the output would be larger
  --strip-metadata        Drop embedded metadata
  --delete-empty-folders  Remove folders left empty once the job drains
  --max-files <n>         Stop enumeration after n files

Options for run:
  --sync                  Deliver units on this thread instead of the worker pool
  --concurrency <n>       Persist the worker pool size (1-16)

Options for redirects:
  --out <file>            Write the CSV to a file instead of stdout

Base dir defaults to $MEDIA_OPTIMIZER_BASE_DIR, else the current directory.
"#
    );
}
