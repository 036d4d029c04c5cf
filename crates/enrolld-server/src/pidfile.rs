use std::path::{Path, PathBuf};

/// Writes and removes the supervisor's PID file (spec.md §4.7 supplement:
/// `<run_dir>/enrolld.pid`, written after a successful bind and removed
/// once the process reaches STOPPED).
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(run_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join("enrolld.pid");
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    pub fn remove(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove pid file");
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}
