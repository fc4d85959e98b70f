use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::sticker_core::convert::{ConvertOutcome, convert_video};
use crate::sticker_core::domain::{FileResult, FileState, JobStatus, basename, unix_now};
use crate::sticker_core::hexpatch::patch_file;
use crate::sticker_core::registry::ProcessRegistry;
use crate::sticker_core::stats::{StatKind, StatsTracker};
use crate::sticker_core::tempdir::TempStore;

/// Temp sweep cadence, counted in processed files per job.
const SWEEP_EVERY_FILES: usize = 5;
const TEMP_MAX_AGE: Duration = Duration::from_secs(3600);
const PAUSE_POLL: Duration = Duration::from_secs(1);

enum Checkpoint {
    Continue,
    Stop,
}

/// Inter-file stop/pause gate. Blocks in 1 s slices while paused; a stop
/// during pause wins, and an evicted record reads as a stop.
fn checkpoint(registry: &ProcessRegistry, job_id: &str) -> Checkpoint {
    loop {
        match registry.control(job_id) {
            None => return Checkpoint::Stop,
            Some(flags) if flags.stopped => return Checkpoint::Stop,
            Some(flags) if flags.paused => thread::sleep(PAUSE_POLL),
            Some(_) => return Checkpoint::Continue,
        }
    }
}

/// Convert every input of a video job sequentially, then finalize the
/// record and feed the stats sink. Per-file failures are local; the batch
/// always moves on to the next input.
pub(crate) fn run_video_batch(
    registry: &ProcessRegistry,
    stats: &StatsTracker,
    temp: &TempStore,
    job_id: &str,
) -> Result<()> {
    let Some(job) = registry.get(job_id) else {
        return Ok(());
    };
    let inputs = job.input_paths;
    let output_dir = job.output_dir;
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;

    info!(job = job_id, files = inputs.len(), output_dir = %output_dir.display(), "starting batch conversion");

    let mut results: Vec<FileResult> = Vec::with_capacity(inputs.len());
    let mut completed = 0usize;
    let mut processed_since_sweep = 0usize;

    for (i, input) in inputs.iter().enumerate() {
        if matches!(checkpoint(registry, job_id), Checkpoint::Stop) {
            info!(job = job_id, "stopped before file {}", i + 1);
            break;
        }

        let filename = basename(input);
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output = output_dir.join(format!("{stem}_converted.webm"));

        info!(job = job_id, file = %filename, index = i, "processing file {}/{}", i + 1, inputs.len());
        registry.update_file(job_id, i, |fs| {
            fs.status = FileState::Starting;
            fs.progress = 0;
            fs.stage = "Starting conversion...".to_string();
        });

        match convert_video(registry, temp, job_id, i, input, &output) {
            ConvertOutcome::Cancelled => {
                info!(job = job_id, "stopped during file {}", i + 1);
                break;
            }
            ConvertOutcome::Completed { size_kb } => {
                completed += 1;
                results.push(FileResult {
                    input_file: input.to_string_lossy().into_owned(),
                    output_file: output.to_string_lossy().into_owned(),
                    success: true,
                    file_size: size_kb,
                });
            }
            ConvertOutcome::Failed => {
                warn!(job = job_id, file = %filename, "file failed");
                results.push(FileResult {
                    input_file: input.to_string_lossy().into_owned(),
                    output_file: output.to_string_lossy().into_owned(),
                    success: false,
                    file_size: 0.0,
                });
            }
        }

        processed_since_sweep += 1;
        if processed_since_sweep >= SWEEP_EVERY_FILES {
            info!(job = job_id, "running scheduled temp sweep");
            temp.sweep_older_than(TEMP_MAX_AGE);
            processed_since_sweep = 0;
        }

        pre_mark_next_file(registry, job_id, &inputs, i);
    }

    finalize_batch(registry, job_id, &results, completed, inputs.len(), "Completed!");
    for result in &results {
        stats.increment(StatKind::Conversion, result.success);
    }
    Ok(())
}

/// Patch every input of a hex job sequentially. Per-file progress is binary
/// (0 then 100); the aggregate advances file by file.
pub(crate) fn run_hex_batch(
    registry: &ProcessRegistry,
    stats: &StatsTracker,
    job_id: &str,
) -> Result<()> {
    let Some(job) = registry.get(job_id) else {
        return Ok(());
    };
    let inputs = job.input_paths;
    let output_dir = job.output_dir;
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;

    info!(job = job_id, files = inputs.len(), "starting batch hex edit");

    let mut results: Vec<FileResult> = Vec::with_capacity(inputs.len());
    let mut completed = 0usize;

    for (i, input) in inputs.iter().enumerate() {
        let filename = basename(input);
        registry.update(job_id, |job| {
            if job.status.is_terminal() {
                return;
            }
            job.progress = (i as f64 / inputs.len() as f64) * 100.0;
            job.current_file = filename.clone();
            job.current_stage = format!("Hex editing {filename} ({}/{})", i + 1, inputs.len());
            job.completed_files = completed;
        });

        if matches!(checkpoint(registry, job_id), Checkpoint::Stop) {
            info!(job = job_id, "stopped before file {}", i + 1);
            break;
        }

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output_name = match input.extension() {
            Some(ext) => format!("{stem}_hexedited.{}", ext.to_string_lossy()),
            None => format!("{stem}_hexedited"),
        };
        let output = output_dir.join(output_name);

        registry.update_file(job_id, i, |fs| {
            fs.status = FileState::Processing;
            fs.progress = 0;
            fs.stage = "Processing hex edit...".to_string();
        });

        match patch_file(input, &output) {
            Ok(report) => {
                let verdict = if report.marker_found {
                    "Pattern found"
                } else {
                    "Pattern not found"
                };
                info!(job = job_id, file = %filename, offset = ?report.offset, "hex edit done ({verdict})");
                registry.update_file(job_id, i, |fs| {
                    fs.status = FileState::Completed;
                    fs.progress = 100;
                    fs.stage = format!("Hex edit completed! {verdict}");
                });
                completed += 1;
                let size_kb = fs::metadata(&output)
                    .map(|m| m.len() as f64 / 1024.0)
                    .unwrap_or(0.0);
                results.push(FileResult {
                    input_file: input.to_string_lossy().into_owned(),
                    output_file: output.to_string_lossy().into_owned(),
                    success: true,
                    file_size: size_kb,
                });
            }
            Err(err) => {
                warn!(job = job_id, file = %filename, "hex edit failed: {err}");
                registry.update_file(job_id, i, |fs| {
                    fs.status = FileState::Error;
                    fs.progress = 0;
                    fs.stage = format!("Hex edit failed: {err}");
                });
                results.push(FileResult {
                    input_file: input.to_string_lossy().into_owned(),
                    output_file: output.to_string_lossy().into_owned(),
                    success: false,
                    file_size: 0.0,
                });
            }
        }
    }

    finalize_batch(
        registry,
        job_id,
        &results,
        completed,
        inputs.len(),
        "Hex edit completed!",
    );
    for result in &results {
        stats.increment(StatKind::HexEdit, result.success);
    }
    Ok(())
}

/// UI smoothing: once file `i` is done, show file `i+1` as converting if it
/// has not progressed on its own yet.
fn pre_mark_next_file(registry: &ProcessRegistry, job_id: &str, inputs: &[PathBuf], i: usize) {
    if i + 1 >= inputs.len() {
        return;
    }
    let next_name = basename(&inputs[i + 1]);
    registry.update(job_id, |job| {
        if job.status.is_terminal() {
            return;
        }
        let total = job.total_files;
        if let Some(fs) = job.file_statuses.get_mut(&(i + 1)) {
            if matches!(
                fs.status,
                FileState::Pending
                    | FileState::Starting
                    | FileState::Preparing
                    | FileState::Analyzing
            ) {
                fs.status = FileState::Converting;
                job.current_file = next_name.clone();
                job.current_stage = format!("Converting {next_name} ({}/{total})", i + 2);
            }
        }
    });
}

/// Counters, results, end time; status/progress/stage only when the job has
/// not already reached a terminal status (a stopped job stays stopped).
fn finalize_batch(
    registry: &ProcessRegistry,
    job_id: &str,
    results: &[FileResult],
    completed: usize,
    total: usize,
    label: &str,
) {
    registry.update(job_id, |job| {
        job.completed_files = completed;
        job.failed_files = total - completed;
        job.end_time = Some(unix_now());
        job.results = results.to_vec();
        if !job.status.is_terminal() {
            job.status = JobStatus::Completed;
            job.progress = 100.0;
            job.current_stage = format!("{label} {completed}/{total} files processed");
        }
    });
    info!(job = job_id, completed, total, "batch finished");
}
