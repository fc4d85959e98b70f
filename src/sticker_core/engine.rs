use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Result, ensure};
use serde_json::Value;
use tracing::{error, info};

use crate::sticker_core::batch::{run_hex_batch, run_video_batch};
use crate::sticker_core::domain::{Job, JobKind, JobStatus, gpu_mode, unix_now};
use crate::sticker_core::registry::ProcessRegistry;
use crate::sticker_core::settings::ServerConfig;
use crate::sticker_core::stats::StatsTracker;
use crate::sticker_core::tempdir::TempStore;

/// Terminal jobs older than this (past end_time) are eligible for eviction
/// by the cleanup endpoint.
const EVICT_AGE_S: f64 = 300.0;

/// Facade over the job registry, the stats sink and the worker threads.
/// HTTP handlers validate payloads and call these methods; each submitted
/// job gets exactly one worker thread that owns serial iteration over the
/// job's inputs.
pub struct Engine {
    registry: Arc<ProcessRegistry>,
    stats: Arc<StatsTracker>,
    temp: Arc<TempStore>,
}

impl Engine {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let temp = TempStore::new(config.temp_dir())?;
        let stats = StatsTracker::new(config.stats_file())?;
        Ok(Self {
            registry: Arc::new(ProcessRegistry::new()),
            stats: Arc::new(stats),
            temp: Arc::new(temp),
        })
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    /// Admit a conversion batch: create the record with every file seeded
    /// `pending`, verify it is retrievable, then hand it to a worker. A
    /// client polling the returned id immediately will find it.
    pub fn submit_video_conversion(
        &self,
        files: Vec<PathBuf>,
        output_dir: PathBuf,
        settings: HashMap<String, Value>,
    ) -> Result<String> {
        let id = video_job_id();
        info!(
            job = %id,
            files = files.len(),
            gpu_mode = ?gpu_mode(&settings),
            "admitting video conversion (CPU encode path)"
        );
        self.registry.create(Job::new(
            id.clone(),
            JobKind::VideoConversion,
            files,
            output_dir,
            settings,
        ));
        ensure!(
            self.registry.contains(&id),
            "process {id} not found after initialization"
        );
        self.spawn_worker(id.clone(), JobKind::VideoConversion);
        Ok(id)
    }

    /// Admit a hex-edit batch. A caller-supplied process id is honored so
    /// the GUI can correlate retries.
    pub fn submit_hex_edit(
        &self,
        files: Vec<PathBuf>,
        output_dir: PathBuf,
        process_id: Option<String>,
    ) -> Result<String> {
        let id = process_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(hex_job_id);
        info!(job = %id, files = files.len(), "admitting hex edit");
        self.registry.create(Job::new(
            id.clone(),
            JobKind::HexEdit,
            files,
            output_dir,
            HashMap::new(),
        ));
        ensure!(
            self.registry.contains(&id),
            "process {id} not found after initialization"
        );
        self.spawn_worker(id.clone(), JobKind::HexEdit);
        Ok(id)
    }

    pub fn stop(&self, id: &str) -> bool {
        self.registry.request_stop(id)
    }

    pub fn stop_all(&self) {
        self.registry.stop_all_and_clear();
    }

    pub fn pause(&self, id: &str) -> bool {
        self.registry.update(id, |job| {
            job.paused = true;
            job.current_stage = "Operation paused by user".to_string();
        })
    }

    pub fn resume(&self, id: &str) -> bool {
        self.registry.update(id, |job| {
            job.paused = false;
            job.current_stage = "Operation resumed".to_string();
        })
    }

    pub fn progress(&self, id: &str) -> Option<Job> {
        self.registry.get(id)
    }

    pub fn cleanup_finished(&self) -> (Vec<String>, Vec<String>) {
        self.registry.evict_finished(EVICT_AGE_S)
    }

    fn spawn_worker(&self, job_id: String, kind: JobKind) {
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let temp = Arc::clone(&self.temp);
        let fallback_registry = Arc::clone(&self.registry);
        let fallback_id = job_id.clone();

        let worker = move || {
            registry.update(&job_id, |job| {
                job.status = JobStatus::Processing;
                job.current_stage = match kind {
                    JobKind::VideoConversion => "Starting batch conversion...",
                    JobKind::HexEdit => "Starting batch hex edit...",
                }
                .to_string();
            });

            let outcome = match kind {
                JobKind::VideoConversion => run_video_batch(&registry, &stats, &temp, &job_id),
                JobKind::HexEdit => run_hex_batch(&registry, &stats, &job_id),
            };
            if let Err(err) = outcome {
                error!(job = %job_id, "worker failed: {err:#}");
                registry.update(&job_id, |job| {
                    job.status = JobStatus::Error;
                    job.current_stage = format!("Error: {err}");
                    job.end_time = Some(unix_now());
                    job.failed_files = job.total_files - job.completed_files;
                });
            }
        };

        let spawned = thread::Builder::new()
            .name(format!("job-{}", fallback_id))
            .spawn(worker);
        if let Err(err) = spawned {
            error!(job = %fallback_id, "could not spawn worker thread: {err}");
            fallback_registry.update(&fallback_id, |job| {
                job.status = JobStatus::Error;
                job.current_stage = format!("Error: {err}");
                job.end_time = Some(unix_now());
            });
        }
    }
}

/// `conversion-<unix_ms>-<8 hex>`: millisecond timestamps plus a random
/// suffix so rapid submissions never collide, while clients can keep
/// matching on the `conversion-` prefix.
fn video_job_id() -> String {
    format!(
        "conversion-{}-{:08x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

fn hex_job_id() -> String {
    format!(
        "hex_{}_{:08x}",
        chrono::Utc::now().timestamp(),
        rand::random::<u32>()
    )
}
