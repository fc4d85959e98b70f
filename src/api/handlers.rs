use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::sticker_core::{Engine, Job, encoder_available, probe};

type ApiResponse = (StatusCode, Json<Value>);

/// Decode a JSON request body; `None` covers both an empty body and
/// malformed JSON, which the endpoints report in their legacy wording.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Option<T> {
    serde_json::from_slice(body).ok()
}

fn ok_body(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn ok_data(data: Value) -> ApiResponse {
    ok_body(json!({ "success": true, "data": data }))
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
}

/// The original UI shows at most the first few offending paths.
fn preview(paths: &[String]) -> Vec<&String> {
    paths.iter().take(3).collect()
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub(crate) async fn health() -> ApiResponse {
    ok_body(json!({
        "success": true,
        "status": "healthy",
        "timestamp": unix_now(),
    }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnalyzeVideoRequest {
    file_path: Option<String>,
}

pub(crate) async fn analyze_video(body: Bytes) -> ApiResponse {
    let Some(file_path) = parse_body::<AnalyzeVideoRequest>(&body).and_then(|r| r.file_path)
    else {
        return api_error(StatusCode::BAD_REQUEST, "No file path provided");
    };
    let path = PathBuf::from(&file_path);
    if !path.exists() {
        return api_error(StatusCode::NOT_FOUND, "File not found");
    }

    let probed = tokio::task::spawn_blocking(move || probe(&path)).await;
    match probed {
        Ok(Ok(media)) => {
            let file_size = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
            let size_mb = file_size as f64 / (1024.0 * 1024.0);
            ok_data(json!({
                "duration": format!("{:.1}s", media.duration_s),
                "size": format!("{size_mb:.1}MB"),
                "width": media.width,
                "height": media.height,
                "file_size_bytes": file_size,
            }))
        }
        Ok(Err(err)) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConvertVideosRequest {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    output_dir: String,
    #[serde(default)]
    settings: HashMap<String, Value>,
}

pub(crate) async fn convert_videos(
    State(engine): State<Arc<Engine>>,
    body: Bytes,
) -> ApiResponse {
    let Some(request) = parse_body::<ConvertVideosRequest>(&body) else {
        return api_error(StatusCode::BAD_REQUEST, "No data provided");
    };
    if request.files.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "No files provided");
    }
    if request.output_dir.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "No output directory provided");
    }

    let missing: Vec<String> = request
        .files
        .iter()
        .filter(|f| !Path::new(f.as_str()).exists())
        .cloned()
        .collect();
    if !missing.is_empty() {
        warn!(?missing, "rejecting submit with missing inputs");
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("Files not found: {:?}...", preview(&missing)),
        );
    }
    let unreadable: Vec<String> = request
        .files
        .iter()
        .filter(|f| std::fs::File::open(f.as_str()).is_err())
        .cloned()
        .collect();
    if !unreadable.is_empty() {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("Cannot read files: {:?}...", preview(&unreadable)),
        );
    }

    if let Err(err) = std::fs::create_dir_all(&request.output_dir) {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("Cannot create output directory: {err}"),
        );
    }

    let encoder_present = tokio::task::spawn_blocking(encoder_available)
        .await
        .unwrap_or(false);
    if !encoder_present {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "FFmpeg not found");
    }

    let files = request.files.iter().map(PathBuf::from).collect();
    match engine.submit_video_conversion(
        files,
        PathBuf::from(&request.output_dir),
        request.settings,
    ) {
        Ok(process_id) => {
            info!(%process_id, "conversion started");
            ok_data(json!({ "process_id": process_id }))
        }
        Err(err) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Server error: {err}"),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HexEditRequest {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    output_dir: String,
    #[serde(default)]
    process_id: Option<String>,
}

pub(crate) async fn hex_edit(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResponse {
    let Some(request) = parse_body::<HexEditRequest>(&body) else {
        return api_error(StatusCode::BAD_REQUEST, "No data provided");
    };
    if request.files.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "No files provided");
    }
    if request.output_dir.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "No output directory provided");
    }

    let mut invalid: Vec<String> = Vec::new();
    for file in &request.files {
        let path = Path::new(file.as_str());
        if !path.exists() {
            invalid.push(format!("File not found: {file}"));
        } else if !path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("webm"))
        {
            invalid.push(format!("Not a WEBM file: {file}"));
        }
    }
    if !invalid.is_empty() {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid files: {invalid:?}"),
        );
    }

    if let Err(err) = std::fs::create_dir_all(&request.output_dir) {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("Cannot create output directory: {err}"),
        );
    }

    let files = request.files.iter().map(PathBuf::from).collect();
    match engine.submit_hex_edit(files, PathBuf::from(&request.output_dir), request.process_id) {
        Ok(process_id) => ok_body(json!({ "success": true, "process_id": process_id })),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn progress_data(job: &Job) -> Value {
    json!({
        "progress": job.progress,
        "status": job.status,
        "current_stage": job.current_stage,
        "current_file": job.current_file,
        "total_files": job.total_files,
        "completed_files": job.completed_files,
        "failed_files": job.failed_files,
        "file_statuses": job.file_statuses,
        "paused": job.paused,
        "can_pause": job.can_pause,
    })
}

pub(crate) async fn conversion_progress(
    State(engine): State<Arc<Engine>>,
    UrlPath(process_id): UrlPath<String>,
) -> ApiResponse {
    match engine.progress(&process_id) {
        Some(job) => ok_data(progress_data(&job)),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "Process not found",
                "status": 404,
            })),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ProcessIdRequest {
    #[serde(default)]
    process_id: Option<String>,
}

pub(crate) async fn stop_process(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResponse {
    let process_id = parse_body::<ProcessIdRequest>(&body).and_then(|r| r.process_id);
    let Some(process_id) = process_id.filter(|id| !id.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "process_id required");
    };

    if process_id == "ALL" {
        info!("stopping all processes");
        engine.stop_all();
        return ok_body(json!({ "success": true }));
    }

    if engine.stop(&process_id) {
        info!(%process_id, "stop requested");
        ok_body(json!({ "success": true }))
    } else {
        api_error(StatusCode::NOT_FOUND, "Process not found")
    }
}

pub(crate) async fn pause_operation(
    State(engine): State<Arc<Engine>>,
    body: Bytes,
) -> ApiResponse {
    let process_id = parse_body::<ProcessIdRequest>(&body)
        .and_then(|r| r.process_id)
        .unwrap_or_default();
    if engine.pause(&process_id) {
        info!(%process_id, "paused");
        ok_body(json!({ "success": true, "message": "Operation paused" }))
    } else {
        api_error(StatusCode::NOT_FOUND, "Process not found")
    }
}

pub(crate) async fn resume_operation(
    State(engine): State<Arc<Engine>>,
    body: Bytes,
) -> ApiResponse {
    let process_id = parse_body::<ProcessIdRequest>(&body)
        .and_then(|r| r.process_id)
        .unwrap_or_default();
    if engine.resume(&process_id) {
        info!(%process_id, "resumed");
        ok_body(json!({ "success": true, "message": "Operation resumed" }))
    } else {
        api_error(StatusCode::NOT_FOUND, "Process not found")
    }
}

pub(crate) async fn cleanup_processes(State(engine): State<Arc<Engine>>) -> ApiResponse {
    let (cleaned, remaining) = engine.cleanup_finished();
    info!(cleaned = cleaned.len(), "cleaned up finished processes");
    ok_body(json!({
        "success": true,
        "cleaned_processes": cleaned,
        "remaining_processes": remaining,
    }))
}

pub(crate) async fn debug_processes(State(engine): State<Arc<Engine>>) -> ApiResponse {
    let jobs = engine.registry().snapshot();
    let mut processes = serde_json::Map::new();
    for job in &jobs {
        processes.insert(
            job.id.clone(),
            json!({
                "type": job.kind,
                "status": job.status,
                "progress": job.progress,
                "total_files": job.total_files,
                "completed_files": job.completed_files,
                "current_stage": job.current_stage,
                "can_pause": job.can_pause,
                "paused": job.paused,
            }),
        );
    }
    ok_body(json!({
        "success": true,
        "active_processes": Value::Object(processes),
        "count": jobs.len(),
    }))
}
