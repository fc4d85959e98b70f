use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    VideoConversion,
    HexEdit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Processing,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl JobStatus {
    /// Terminal statuses persist until the job is evicted by the cleanup
    /// endpoint; the registry refuses transitions out of them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Completed | JobStatus::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Pending,
    Starting,
    Analyzing,
    Preparing,
    Converting,
    Checking,
    /// Hex-edit files report a single `processing` state between 0 and 100.
    Processing,
    Completed,
    Error,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Completed | FileState::Error)
    }
}

/// Per-input sub-record within a job. Mutated only by the worker that owns
/// the file; HTTP readers receive snapshots taken under the registry lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub filename: String,
    pub status: FileState,
    pub progress: u8,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crf: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl FileStatus {
    pub fn pending(filename: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: FileState::Pending,
            progress: 0,
            stage: stage.into(),
            attempt: None,
            crf: None,
            bitrate: None,
            file_size: None,
            attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub input_file: String,
    pub output_file: String,
    pub success: bool,
    /// Output size in kilobytes; 0 when the file failed.
    pub file_size: f64,
}

/// A submitted batch plus its in-memory record. Owned exclusively by the
/// `ProcessRegistry`; `input_paths` is immutable for the job's lifetime.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub input_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub settings: HashMap<String, Value>,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub progress: f64,
    pub status: JobStatus,
    pub paused: bool,
    pub can_pause: bool,
    pub current_file: String,
    pub current_stage: String,
    pub file_statuses: BTreeMap<usize, FileStatus>,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub results: Vec<FileResult>,
}

impl Job {
    pub fn new(
        id: String,
        kind: JobKind,
        input_paths: Vec<PathBuf>,
        output_dir: PathBuf,
        settings: HashMap<String, Value>,
    ) -> Self {
        let (seed_stage, init_stage) = match kind {
            JobKind::VideoConversion => ("Ready to convert", "Initializing conversion..."),
            JobKind::HexEdit => ("Waiting for hex edit...", "Initializing hex edit..."),
        };
        let file_statuses = input_paths
            .iter()
            .enumerate()
            .map(|(i, path)| (i, FileStatus::pending(basename(path), seed_stage)))
            .collect();
        Self {
            id,
            kind,
            total_files: input_paths.len(),
            completed_files: 0,
            failed_files: 0,
            progress: 0.0,
            status: JobStatus::Initializing,
            paused: false,
            can_pause: true,
            current_file: String::new(),
            current_stage: init_stage.to_string(),
            file_statuses,
            start_time: unix_now(),
            end_time: None,
            results: Vec::new(),
            input_paths,
            output_dir,
            settings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuMode {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

/// The settings bag is an untyped map so GUI builds can add keys without
/// breaking older servers; only `gpu_mode` is recognized today.
pub fn gpu_mode(settings: &HashMap<String, Value>) -> GpuMode {
    match settings.get("gpu_mode").and_then(Value::as_str) {
        Some("cpu") => GpuMode::Cpu,
        Some("gpu") => GpuMode::Gpu,
        _ => GpuMode::Auto,
    }
}

pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Wall-clock seconds since the UNIX epoch, with sub-second precision.
pub(crate) fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn status_enums_use_wire_casing() {
        assert_eq!(
            serde_json::to_value(JobKind::VideoConversion).unwrap(),
            json!("video_conversion")
        );
        assert_eq!(
            serde_json::to_value(JobKind::HexEdit).unwrap(),
            json!("hex_edit")
        );
        assert_eq!(
            serde_json::to_value(JobStatus::Initializing).unwrap(),
            json!("initializing")
        );
        assert_eq!(
            serde_json::to_value(FileState::Pending).unwrap(),
            json!("pending")
        );
        assert_eq!(
            serde_json::to_value(FileState::Processing).unwrap(),
            json!("processing")
        );
    }

    #[test]
    fn file_status_omits_unset_diagnostics() {
        let seeded = FileStatus::pending("clip.mp4", "Ready to convert");
        let value = serde_json::to_value(&seeded).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.get("filename"), Some(&json!("clip.mp4")));
        assert_eq!(obj.get("status"), Some(&json!("pending")));
        assert_eq!(obj.get("progress"), Some(&json!(0)));
        assert_eq!(obj.get("stage"), Some(&json!("Ready to convert")));
        assert!(!obj.contains_key("attempt"));
        assert!(!obj.contains_key("crf"));
        assert!(!obj.contains_key("bitrate"));
        assert!(!obj.contains_key("file_size"));
    }

    #[test]
    fn file_status_map_serializes_with_string_indices() {
        let job = Job::new(
            "conversion-1-abcd1234".to_string(),
            JobKind::VideoConversion,
            vec![PathBuf::from("/in/a.mp4"), PathBuf::from("/in/b.mov")],
            PathBuf::from("/out"),
            HashMap::new(),
        );
        let value = serde_json::to_value(&job.file_statuses).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["0"]["filename"], json!("a.mp4"));
        assert_eq!(obj["1"]["filename"], json!("b.mov"));
    }

    #[test]
    fn new_job_seeds_every_file_as_pending() {
        let job = Job::new(
            "hex_1_deadbeef".to_string(),
            JobKind::HexEdit,
            vec![PathBuf::from("/in/a.webm")],
            PathBuf::from("/out"),
            HashMap::new(),
        );
        assert_eq!(job.total_files, 1);
        assert_eq!(job.file_statuses.len(), 1);
        assert_eq!(job.status, JobStatus::Initializing);
        assert!(job.can_pause);
        assert!(!job.paused);
        assert_eq!(job.file_statuses[&0].stage, "Waiting for hex edit...");
        assert_eq!(job.current_stage, "Initializing hex edit...");
    }

    #[test]
    fn gpu_mode_recognizes_known_values_and_ignores_the_rest() {
        let mut settings: HashMap<String, Value> = HashMap::new();
        assert_eq!(gpu_mode(&settings), GpuMode::Auto);

        settings.insert("gpu_mode".into(), json!("cpu"));
        settings.insert("future_knob".into(), json!({"nested": true}));
        assert_eq!(gpu_mode(&settings), GpuMode::Cpu);

        settings.insert("gpu_mode".into(), json!("quantum"));
        assert_eq!(gpu_mode(&settings), GpuMode::Auto);
    }
}
