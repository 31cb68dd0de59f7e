//! Per-file pipeline. Every unit decides its outcome against storage first and
//! only then folds the resulting delta into the shared job document.

use crate::codec::ImageCodec;
use crate::config::{JobParams, TARGET_EXTENSION, TARGET_MIME_TYPE};
use crate::controller::Engine;
use crate::geometry::{compute_variant, fit_longest_side};
use crate::joblog::log_line;
use crate::media::{self, GeneratedSize, VariantMetadata};
use crate::references;
use crate::state::{self, format_bytes, ConvertedEntry, FileOutcome, JobStatus};
use crate::{db, Result};
use image::imageops::FilterType;
use regex::Regex;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

pub const CONVERTIBLE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic"];

pub const SKIP_ALREADY_TARGET: &str = "Already target format";
pub const SKIP_UNSUPPORTED: &str = "Unsupported extension";
pub const SKIP_UNATTACHED: &str = "Unattached media";
pub const SKIP_DELETION_DISABLED: &str = "Original deletion disabled";
pub const SKIP_TARGET_DISABLED: &str = "Target format creation disabled";

const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// `<stem>-<W>x<H>.<ext>` as written for a generated size variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantName {
    pub dimensions: String,
    pub extension: String,
}

pub fn parse_variant_name(file_name: &str) -> Option<VariantName> {
    static VARIANT_RE: OnceLock<Regex> = OnceLock::new();
    let re = VARIANT_RE.get_or_init(|| {
        Regex::new(r"(?i)-(\d+)x(\d+)\.(jpe?g|png|heic|webp)$").expect("variant name regex")
    });
    let caps = re.captures(file_name)?;
    Some(VariantName {
        dimensions: format!("{}x{}", &caps[1], &caps[2]),
        extension: caps[3].to_ascii_lowercase(),
    })
}

fn extension_of(locator: &str) -> String {
    Path::new(locator)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Same locator with its extension swapped for the target format.
pub fn target_locator(locator: &str) -> String {
    let name_start = locator.rfind('/').map(|i| i + 1).unwrap_or(0);
    let stem_end = locator[name_start..]
        .rfind('.')
        .map(|i| name_start + i)
        .unwrap_or(locator.len());
    format!("{}.{TARGET_EXTENSION}", &locator[..stem_end])
}

fn variant_file_name(target: &str, width: u32, height: u32) -> String {
    let file_name = target.rsplit('/').next().unwrap_or(target);
    let stem = file_name
        .strip_suffix(&format!(".{TARGET_EXTENSION}"))
        .unwrap_or(file_name);
    format!("{stem}-{width}x{height}.{TARGET_EXTENSION}")
}

fn sibling_locator(locator: &str, file_name: &str) -> String {
    match locator.rfind('/') {
        Some(i) => format!("{}/{file_name}", &locator[..i]),
        None => file_name.to_string(),
    }
}

impl<C: ImageCodec> Engine<C> {
    pub fn process_file_unit(&self, locator: &str, job_id: i64) -> Result<()> {
        let Some(job) = state::load_state(&self.paths)? else {
            return Ok(());
        };
        if job.id != job_id || job.cancel_requested || job.done.contains(locator) {
            return Ok(());
        }
        let params = job.params;

        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;

        let mut outcome = FileOutcome::default();
        if let Err(e) = self.evaluate_file(&conn, &params, job_id, locator, &mut outcome) {
            let _ = log_line(
                &self.paths,
                &job_id.to_string(),
                "warn",
                "file_error",
                serde_json::json!({ "file": locator, "error": e.to_string() }),
            );
            outcome.skipped = Some(format!("error: {e}"));
        }

        let applied = state::update_state(&self.paths, |s| {
            if s.id != job_id {
                return None;
            }
            if s.status == JobStatus::Queued {
                s.advance(JobStatus::Running);
            }
            s.apply_outcome(locator, &outcome).then_some(())
        })?;
        if applied.is_some() {
            self.log_outcome(job_id, locator, &outcome);
        }
        Ok(())
    }

    /// Gives up on a file whose unit kept failing: it counts as processed
    /// with an error skip so the job can still drain.
    pub fn abandon_file_unit(
        &self,
        locator: &str,
        job_id: i64,
        error: &crate::EngineError,
    ) -> Result<()> {
        let outcome = FileOutcome::skipped(format!("error: {error}"));
        let applied = state::update_state(&self.paths, |s| {
            if s.id != job_id {
                return None;
            }
            s.apply_outcome(locator, &outcome).then_some(())
        })?;
        if applied.is_some() {
            let _ = log_line(
                &self.paths,
                &job_id.to_string(),
                "warn",
                "file_abandoned",
                serde_json::json!({ "file": locator, "error": error.to_string() }),
            );
        }
        Ok(())
    }

    fn log_outcome(&self, job_id: i64, locator: &str, outcome: &FileOutcome) {
        let (event, data) = if let Some(entry) = &outcome.converted {
            (
                "file_converted",
                serde_json::json!({
                    "file": locator,
                    "target": entry.converted,
                    "original_size": entry.original_size,
                    "target_size": entry.converted_size,
                    "variants": outcome.counters.created_thumbs_count,
                }),
            )
        } else if let Some(reason) = &outcome.skipped {
            ("file_skipped", serde_json::json!({ "file": locator, "reason": reason }))
        } else if outcome.deleted {
            (
                "thumbnail_touched",
                serde_json::json!({
                    "file": locator,
                    "deleted": outcome.counters.thumbs_deleted > 0,
                }),
            )
        } else {
            return;
        };
        let _ = log_line(&self.paths, &job_id.to_string(), "info", event, data);
    }

    fn evaluate_file(
        &self,
        conn: &Connection,
        params: &JobParams,
        job_id: i64,
        locator: &str,
        out: &mut FileOutcome,
    ) -> Result<()> {
        let path = self.paths.resolve_locator(locator);
        let public_url = self.config.public_url(locator);
        let record = media::find_owning_record(conn, &public_url, locator)?;

        if let Some(author_id) = record.as_ref().and_then(|r| r.author_id) {
            if params.excluded_authors.contains(&author_id) {
                let label = media::author_label(conn, author_id)?;
                out.skipped = Some(format!("User excluded: {label}"));
                return Ok(());
            }
        }

        if record.is_none()
            && params.ignore_unattached
            && !references::has_reference(conn, &public_url)?
        {
            out.skipped = Some(SKIP_UNATTACHED.to_string());
            return Ok(());
        }

        let file_name = locator.rsplit('/').next().unwrap_or(locator);
        if let Some(variant) = parse_variant_name(file_name) {
            let stale = variant.extension != TARGET_EXTENSION
                || !params.registered_dimensions.contains(&variant.dimensions);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if params.enable_thumbnail_deletion
                && stale
                && self.remove_best_effort(job_id, locator, params.dry_run)
            {
                out.counters.thumbs_deleted += 1;
                out.counters.deleted_thumbs_size += size;
                out.counters.deleted_size += size;
            }
            out.deleted = true;
            return Ok(());
        }

        let extension = extension_of(locator);
        if extension == TARGET_EXTENSION {
            out.skipped = Some(SKIP_ALREADY_TARGET.to_string());
            return Ok(());
        }
        if !CONVERTIBLE_EXTENSIONS.contains(&extension.as_str()) {
            out.skipped = Some(SKIP_UNSUPPORTED.to_string());
            return Ok(());
        }
        if !params.create_target_format {
            out.skipped = Some(SKIP_TARGET_DISABLED.to_string());
            return Ok(());
        }

        self.convert(conn, params, job_id, locator, record.map(|r| r.id), out)
    }

    fn convert(
        &self,
        conn: &Connection,
        params: &JobParams,
        job_id: i64,
        locator: &str,
        record_id: Option<i64>,
        out: &mut FileOutcome,
    ) -> Result<()> {
        let codec = &self.codec;
        let path = self.paths.resolve_locator(locator);
        let original_size = std::fs::metadata(&path)?.len();

        let mut image = codec.auto_orient(codec.decode(&path)?);
        if !codec.is_rgb(&image) {
            image = codec.to_rgb(image);
        }
        if params.enable_resize {
            let (w, h) = codec.dimensions(&image);
            if let Some((nw, nh)) = fit_longest_side(w, h, params.threshold) {
                image = codec.resize(&image, nw, nh, RESIZE_FILTER);
            }
        }
        if params.strip_metadata {
            image = codec.strip_metadata(image);
        }

        let encoded = codec.encode(&image, params.quality)?;
        let new_size = encoded.len() as u64;
        if params.skip_if_larger && new_size > original_size {
            out.skipped = Some(format!(
                "Encoded output larger than original ({} > {})",
                format_bytes(new_size),
                format_bytes(original_size)
            ));
            return Ok(());
        }

        let new_locator = target_locator(locator);
        if !params.dry_run {
            std::fs::write(self.paths.resolve_locator(&new_locator), &encoded)?;
        }
        out.counters.created_webp_files += 1;
        out.counters.total_created_files += 1;
        out.counters.webp_size += new_size;
        out.converted = Some(ConvertedEntry {
            original: locator.to_string(),
            original_size,
            converted: new_locator.clone(),
            converted_size: new_size,
        });

        let sizes = self.generate_variants(params, &image, &new_locator, out)?;

        let old_url = self.config.public_url(locator);
        let new_url = self.config.public_url(&new_locator);
        if !params.dry_run {
            if let Some(record_id) = record_id {
                let (width, height) = codec.dimensions(&image);
                let metadata = VariantMetadata {
                    file: new_locator.clone(),
                    width,
                    height,
                    filesize: new_size,
                    sizes,
                };
                media::repoint_record(conn, record_id, &new_locator, &new_url, &metadata)?;
            }
        }

        if references::has_reference(conn, &old_url)? {
            let _ = log_line(
                &self.paths,
                &job_id.to_string(),
                "info",
                "original_retained",
                serde_json::json!({ "file": locator }),
            );
        } else if params.enable_original_deletion {
            if self.remove_best_effort(job_id, locator, params.dry_run) {
                out.counters.deleted_originals += 1;
                out.counters.deleted_originals_size += original_size;
                out.counters.deleted_size += original_size;
                out.deleted = true;
                let _ = log_line(
                    &self.paths,
                    &job_id.to_string(),
                    "info",
                    "original_deleted",
                    serde_json::json!({ "file": locator, "dry_run": params.dry_run }),
                );
            }
        } else {
            out.skipped = Some(SKIP_DELETION_DISABLED.to_string());
        }

        if !params.dry_run {
            let report =
                references::rewrite_all(conn, &old_url, &new_url, self.config.rewrite_batch_size)?;
            if report.rows_updated > 0 {
                let _ = log_line(
                    &self.paths,
                    &job_id.to_string(),
                    "info",
                    "references_rewritten",
                    serde_json::json!({
                        "from": old_url,
                        "to": new_url,
                        "rows": report.rows_updated,
                    }),
                );
            }
        }
        Ok(())
    }

    /// Deletes a file unless this is a dry run. A failed removal is logged and
    /// reported as `false`; it never fails the unit.
    fn remove_best_effort(&self, job_id: i64, locator: &str, dry_run: bool) -> bool {
        if dry_run {
            return true;
        }
        match std::fs::remove_file(self.paths.resolve_locator(locator)) {
            Ok(()) => true,
            Err(e) => {
                let _ = log_line(
                    &self.paths,
                    &job_id.to_string(),
                    "warn",
                    "delete_failed",
                    serde_json::json!({ "file": locator, "error": e.to_string() }),
                );
                false
            }
        }
    }

    /// Encodes every enabled size from the converted image. Files are only
    /// written for a real run; the counters are the same either way.
    fn generate_variants(
        &self,
        params: &JobParams,
        image: &C::Image,
        new_locator: &str,
        out: &mut FileOutcome,
    ) -> Result<BTreeMap<String, GeneratedSize>> {
        let codec = &self.codec;
        let (width, height) = codec.dimensions(image);
        let mut sizes = BTreeMap::new();

        for size in &params.enabled_sizes {
            if size.width == 0 && size.height == 0 {
                continue;
            }
            let geometry = compute_variant(width, height, size.width, size.height, size.crop);
            if geometry.width == 0 || geometry.height == 0 {
                continue;
            }

            let mut variant = codec.resize(image, geometry.width, geometry.height, RESIZE_FILTER);
            let (final_w, final_h) = if size.crop && size.width > 0 && size.height > 0 {
                variant = codec.crop(
                    variant,
                    size.width,
                    size.height,
                    geometry.crop_x,
                    geometry.crop_y,
                );
                (size.width, size.height)
            } else {
                (geometry.width, geometry.height)
            };

            let bytes = codec.encode(&variant, params.thumb_quality)?;
            let file = variant_file_name(new_locator, final_w, final_h);
            if !params.dry_run {
                let target = self.paths.resolve_locator(&sibling_locator(new_locator, &file));
                std::fs::write(target, &bytes)?;
            }

            let filesize = bytes.len() as u64;
            out.counters.created_thumbs_count += 1;
            out.counters.created_thumbs_size += filesize;
            out.counters.total_created_files += 1;
            sizes.insert(
                size.name.clone(),
                GeneratedSize {
                    file,
                    width: final_w,
                    height: final_h,
                    mime_type: TARGET_MIME_TYPE.to_string(),
                    filesize,
                },
            );
        }
        Ok(sizes)
    }
}
