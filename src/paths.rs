use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("optimizer.json")
    }

    /// Storage root every job locator is relative to.
    pub fn uploads_dir(&self) -> PathBuf {
        self.base_dir.join("uploads")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("app.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    pub fn job_log_path(&self, job_id: &str) -> PathBuf {
        self.job_logs_dir().join(format!("{job_id}.jsonl"))
    }

    /// Absolute path of a relative locator under the uploads root.
    pub fn resolve_locator(&self, locator: &str) -> PathBuf {
        let trimmed = locator.trim_start_matches(['/', '\\']);
        let mut path = self.uploads_dir();
        for part in trimmed.split(['/', '\\']).filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// Relative, forward-slashed locator for a path under the uploads root.
    pub fn locator_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.uploads_dir()).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.uploads_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_roundtrips_through_uploads_root() {
        let paths = AppPaths::new(PathBuf::from("/srv/site"));
        let abs = paths.resolve_locator("/2024/05/photo.jpg");
        assert_eq!(abs, PathBuf::from("/srv/site/uploads/2024/05/photo.jpg"));
        assert_eq!(paths.locator_for(&abs).as_deref(), Some("2024/05/photo.jpg"));
    }

    #[test]
    fn locator_for_rejects_paths_outside_uploads() {
        let paths = AppPaths::new(PathBuf::from("/srv/site"));
        assert!(paths.locator_for(Path::new("/srv/other/a.jpg")).is_none());
        assert!(paths.locator_for(&paths.uploads_dir()).is_none());
    }
}
