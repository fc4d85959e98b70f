use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::sticker_core::domain::{FileState, FileStatus, Job, JobStatus, unix_now};

/// Stop/pause flags a worker reads at its checkpoints. `None` from
/// [`ProcessRegistry::control`] means the record was evicted, which workers
/// treat the same as a stop.
#[derive(Debug, Clone, Copy)]
pub struct ControlFlags {
    pub stopped: bool,
    pub paused: bool,
}

/// Thread-safe map of job id → job record, mutated by HTTP handlers and by
/// worker threads. One mutex guards map shape, counters, and per-file
/// sub-records collectively; nothing performs I/O or waits under the lock,
/// and readers always receive snapshots.
pub struct ProcessRegistry {
    inner: Mutex<HashMap<String, Job>>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, job: Job) {
        self.lock().insert(job.id.clone(), job);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    pub fn control(&self, id: &str) -> Option<ControlFlags> {
        let map = self.lock();
        map.get(id).map(|job| ControlFlags {
            stopped: job.status == JobStatus::Stopped,
            paused: job.paused,
        })
    }

    /// Apply `mutate` to the record. A terminal status is never overwritten
    /// (jobs never leave `stopped`/`completed`/`error`), and reaching one
    /// clears the pause flags.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut Job)) -> bool {
        let mut map = self.lock();
        let Some(job) = map.get_mut(id) else {
            return false;
        };
        let prior = job.status;
        mutate(job);
        if prior.is_terminal() && job.status != prior {
            job.status = prior;
        }
        if job.status.is_terminal() {
            job.can_pause = false;
            job.paused = false;
        }
        true
    }

    /// Apply `mutate` to one per-file sub-record, then recompute the job's
    /// aggregates: `completed_files`, `progress` (mean of per-file progress,
    /// one decimal), and `current_file`. A file that already reached
    /// `completed` or `error` is left untouched.
    pub fn update_file(
        &self,
        id: &str,
        index: usize,
        mutate: impl FnOnce(&mut FileStatus),
    ) -> bool {
        let mut map = self.lock();
        let Some(job) = map.get_mut(id) else {
            return false;
        };
        let Some(file) = job.file_statuses.get_mut(&index) else {
            return false;
        };
        if file.status.is_terminal() {
            return true;
        }
        mutate(file);
        recompute_aggregates(job, index);
        true
    }

    /// Stop request: observable by the worker at its next inter-attempt or
    /// inter-file check. Running encoder passes are allowed to finish.
    pub fn request_stop(&self, id: &str) -> bool {
        self.update(id, |job| {
            job.status = JobStatus::Stopped;
            job.current_stage = "Stopped by user".to_string();
        })
    }

    /// Stop every job and clear the map eagerly. Orphaned workers observe
    /// the missing id as a stop at their next checkpoint.
    pub fn stop_all_and_clear(&self) {
        let mut map = self.lock();
        for job in map.values_mut() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Stopped;
                job.current_stage = "Stopped by user".to_string();
            }
            job.can_pause = false;
            job.paused = false;
        }
        map.clear();
    }

    /// Evict terminal `completed`/`error` jobs older than `max_age_s` past
    /// their end time. Returns (evicted ids, remaining ids).
    pub fn evict_finished(&self, max_age_s: f64) -> (Vec<String>, Vec<String>) {
        let now = unix_now();
        let mut map = self.lock();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, job)| {
                matches!(job.status, JobStatus::Completed | JobStatus::Error)
                    && job.end_time.is_some_and(|end| now - end > max_age_s)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
        }
        let remaining = map.keys().cloned().collect();
        (expired, remaining)
    }
}

fn recompute_aggregates(job: &mut Job, touched: usize) {
    job.completed_files = job
        .file_statuses
        .values()
        .filter(|fs| fs.status == FileState::Completed)
        .count();

    let total = if job.total_files > 0 {
        job.total_files
    } else {
        job.file_statuses.len().max(1)
    };
    let sum: f64 = job
        .file_statuses
        .values()
        .map(|fs| f64::from(fs.progress).clamp(0.0, 100.0))
        .sum();
    job.progress = round1(sum / total as f64);

    if let Some(fs) = job.file_statuses.get(&touched) {
        if !fs.filename.is_empty() {
            job.current_file = fs.filename.clone();
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
