use crate::paths::AppPaths;
use crate::{db, EngineError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

pub const TARGET_EXTENSION: &str = "webp";
pub const TARGET_MIME_TYPE: &str = "image/webp";

const DEFAULT_THRESHOLD: u32 = 2048;
const DEFAULT_QUALITY: u8 = 85;
const DEFAULT_THUMB_QUALITY: u8 = 70;
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost/uploads";
const DEFAULT_FINALIZE_INITIAL_DELAY_MS: u64 = 5_000;
const DEFAULT_FINALIZE_RETRY_DELAY_MS: u64 = 10_000;
const DEFAULT_REWRITE_BATCH_SIZE: usize = 500;
const MAX_REWRITE_BATCH_SIZE: usize = 10_000;

pub const DEFAULT_RUNNER_CONCURRENCY: usize = 4;
pub const MAX_RUNNER_CONCURRENCY: usize = 16;
const META_KEY_RUNNER_CONCURRENCY: &str = "runner_max_concurrency";

/// A registered named size a derived variant is generated at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeVariant {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub crop: bool,
}

impl SizeVariant {
    fn new(name: &str, width: u32, height: u32, crop: bool) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            crop,
        }
    }

    /// `WxH` label, only for sizes constrained on both axes.
    pub fn dimension_label(&self) -> Option<String> {
        if self.width > 0 && self.height > 0 {
            Some(format!("{}x{}", self.width, self.height))
        } else {
            None
        }
    }
}

pub fn default_size_variants() -> Vec<SizeVariant> {
    vec![
        SizeVariant::new("thumbnail", 150, 150, true),
        SizeVariant::new("medium", 300, 300, false),
        SizeVariant::new("medium_large", 768, 0, false),
        SizeVariant::new("large", 1024, 1024, false),
        SizeVariant::new("1536x1536", 1536, 1536, false),
        SizeVariant::new("2048x2048", 2048, 2048, false),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Public URL of the uploads root; locators are appended to it.
    pub public_base_url: String,
    pub size_variants: Vec<SizeVariant>,
    pub finalize_initial_delay_ms: u64,
    pub finalize_retry_delay_ms: u64,
    pub rewrite_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            size_variants: default_size_variants(),
            finalize_initial_delay_ms: DEFAULT_FINALIZE_INITIAL_DELAY_MS,
            finalize_retry_delay_ms: DEFAULT_FINALIZE_RETRY_DELAY_MS,
            rewrite_batch_size: DEFAULT_REWRITE_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.public_base_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::Config(format!(
                "public_base_url must be http(s): {}",
                self.public_base_url
            )));
        }
        if self.rewrite_batch_size == 0 || self.rewrite_batch_size > MAX_REWRITE_BATCH_SIZE {
            return Err(EngineError::Config(format!(
                "rewrite_batch_size must be within 1..={MAX_REWRITE_BATCH_SIZE}"
            )));
        }
        for size in &self.size_variants {
            if size.name.trim().is_empty() {
                return Err(EngineError::Config("size variant without a name".to_string()));
            }
        }
        Ok(())
    }

    /// Public URL of a relative locator.
    pub fn public_url(&self, locator: &str) -> String {
        format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            locator.trim_start_matches('/')
        )
    }
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    let path = paths.engine_config_path();
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse engine config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    config.validate()?;
    let path = paths.engine_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

pub fn get_runner_concurrency(paths: &AppPaths) -> Result<usize> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let value = db::get_meta(&conn, META_KEY_RUNNER_CONCURRENCY)?;
    Ok(value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|v| v.clamp(1, MAX_RUNNER_CONCURRENCY))
        .unwrap_or(DEFAULT_RUNNER_CONCURRENCY))
}

pub fn set_runner_concurrency(paths: &AppPaths, max_concurrency: usize) -> Result<usize> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let max_concurrency = max_concurrency.clamp(1, MAX_RUNNER_CONCURRENCY);
    db::set_meta(&conn, META_KEY_RUNNER_CONCURRENCY, &max_concurrency.to_string())?;
    Ok(max_concurrency)
}

/// Raw operator input for a new job. Unset fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub roots: Vec<String>,
    pub threshold: Option<u32>,
    pub quality: Option<u8>,
    pub thumb_quality: Option<u8>,
    pub ignore_unattached: bool,
    pub dry_run: bool,
    pub enabled_sizes: Option<Vec<String>>,
    pub enable_resize: bool,
    pub delete_empty_folders: bool,
    pub skip_if_larger: bool,
    pub strip_metadata: bool,
    pub excluded_authors: Vec<i64>,
    pub enable_thumbnail_deletion: bool,
    pub enable_original_deletion: Option<bool>,
    pub create_target_format: Option<bool>,
    pub max_files: Option<usize>,
}

/// Validated, immutable snapshot every work unit of a job reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub roots: Vec<String>,
    pub threshold: u32,
    pub quality: u8,
    pub thumb_quality: u8,
    pub ignore_unattached: bool,
    pub dry_run: bool,
    pub enabled_sizes: Vec<SizeVariant>,
    pub registered_dimensions: Vec<String>,
    pub enable_resize: bool,
    pub delete_empty_folders: bool,
    pub skip_if_larger: bool,
    pub strip_metadata: bool,
    pub excluded_authors: Vec<i64>,
    pub enable_thumbnail_deletion: bool,
    pub enable_original_deletion: bool,
    pub create_target_format: bool,
    pub max_files: Option<usize>,
}

pub fn build_job_params(config: &EngineConfig, req: JobRequest) -> Result<JobParams> {
    let roots = normalize_roots(req.roots)?;
    if roots.is_empty() {
        return Err(EngineError::Config("no roots selected".to_string()));
    }

    let quality = req.quality.unwrap_or(DEFAULT_QUALITY);
    let thumb_quality = req.thumb_quality.unwrap_or(DEFAULT_THUMB_QUALITY);
    for (label, value) in [("quality", quality), ("thumb_quality", thumb_quality)] {
        if value > 100 {
            return Err(EngineError::Config(format!(
                "{label} must be within 0..=100 (got {value})"
            )));
        }
    }

    let threshold = req.threshold.unwrap_or(DEFAULT_THRESHOLD);
    if req.enable_resize && threshold == 0 {
        return Err(EngineError::Config(
            "threshold must be at least 1px when resizing".to_string(),
        ));
    }

    if req.max_files == Some(0) {
        return Err(EngineError::Config("max_files must be at least 1".to_string()));
    }

    let enabled_sizes = match req.enabled_sizes {
        None => config.size_variants.clone(),
        Some(names) => {
            let mut out = Vec::new();
            for name in names {
                let name = name.trim();
                if name.is_empty() || out.iter().any(|s: &SizeVariant| s.name == name) {
                    continue;
                }
                let size = config
                    .size_variants
                    .iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| EngineError::Config(format!("unknown size variant: {name}")))?;
                out.push(size.clone());
            }
            out
        }
    };

    let registered_dimensions = config
        .size_variants
        .iter()
        .filter_map(SizeVariant::dimension_label)
        .collect();

    let mut excluded_authors = req.excluded_authors;
    excluded_authors.sort_unstable();
    excluded_authors.dedup();

    Ok(JobParams {
        roots,
        threshold,
        quality,
        thumb_quality,
        ignore_unattached: req.ignore_unattached,
        dry_run: req.dry_run,
        enabled_sizes,
        registered_dimensions,
        enable_resize: req.enable_resize,
        delete_empty_folders: req.delete_empty_folders,
        skip_if_larger: req.skip_if_larger,
        strip_metadata: req.strip_metadata,
        excluded_authors,
        enable_thumbnail_deletion: req.enable_thumbnail_deletion,
        enable_original_deletion: req.enable_original_deletion.unwrap_or(true),
        create_target_format: req.create_target_format.unwrap_or(true),
        max_files: req.max_files,
    })
}

fn normalize_roots(inputs: Vec<String>) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for raw in inputs {
        let trimmed = raw.trim().replace('\\', "/");
        let trimmed = trimmed.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.contains(':') || trimmed.split('/').any(|part| part == "..") {
            return Err(EngineError::Config(format!(
                "root must be relative to the uploads directory: {raw}"
            )));
        }
        if !out.iter().any(|r| r == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}
