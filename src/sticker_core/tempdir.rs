use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sysinfo::System;
use tracing::{debug, info};

/// Process-owned home for the two-pass encoder's log files. Pass-log bases
/// embed the pid, a timestamp and the attempt number so concurrent jobs
/// never collide on side files.
pub(crate) struct TempStore {
    dir: PathBuf,
}

impl TempStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create temp directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pass_log_base(&self, attempt: u32) -> PathBuf {
        self.dir.join(format!(
            "ffmpeg_pass_{}_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp(),
            attempt
        ))
    }

    /// Best-effort removal of temp files older than `max_age`. Runs on the
    /// periodic sweep between conversions; also emits a RAM usage line so
    /// long batches leave a memory trace in the log.
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let aged = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > max_age);
            if aged && fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "removed aged temp file");
                removed += 1;
            }
        }
        log_memory();
        removed
    }
}

fn log_memory() {
    let mut sys = System::new();
    sys.refresh_memory();
    let to_mb = |bytes: u64| bytes / (1024 * 1024);
    info!(
        used_mb = to_mb(sys.used_memory()),
        total_mb = to_mb(sys.total_memory()),
        "system RAM after sweep"
    );
}
