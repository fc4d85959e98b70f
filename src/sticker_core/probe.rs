use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

/// Pixel formats that carry an alpha plane. GIF inputs are treated as
/// transparent regardless because their palette alpha is not always
/// reflected in the reported pix_fmt.
const ALPHA_PIX_FMTS: [&str; 7] = [
    "rgba", "bgra", "argb", "abgr", "yuva420p", "yuva444p", "pal8",
];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid media: {0}")]
    InvalidMedia(String),
    #[error("ffprobe not found on PATH")]
    ToolMissing,
    #[error("failed to run ffprobe: {0}")]
    SpawnFailed(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaProbe {
    pub duration_s: f64,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: String,
}

/// Query duration, dimensions and pixel format of an input. Two ffprobe
/// invocations: one against the container format, one against the first
/// video stream.
pub fn probe(path: &Path) -> Result<MediaProbe, ProbeError> {
    let duration_out = run_ffprobe(
        &[
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ],
        path,
    )?;
    let duration_s = parse_duration(&duration_out)?;

    let stream_out = run_ffprobe(
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,pix_fmt",
            "-of",
            "csv=s=x:p=0",
        ],
        path,
    )?;
    let (width, height, pix_fmt) = parse_stream_line(&stream_out);

    Ok(MediaProbe {
        duration_s,
        width,
        height,
        pix_fmt,
    })
}

pub fn has_alpha(pix_fmt: &str, path: &Path) -> bool {
    let is_gif = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gif"));
    is_gif || ALPHA_PIX_FMTS.contains(&pix_fmt.to_ascii_lowercase().as_str())
}

fn run_ffprobe(args: &[&str], path: &Path) -> Result<String, ProbeError> {
    let output = Command::new("ffprobe")
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ProbeError::ToolMissing
            } else {
                ProbeError::SpawnFailed(err)
            }
        })?;
    if !output.status.success() {
        return Err(ProbeError::InvalidMedia(format!(
            "ffprobe exited with {} for {}",
            output.status,
            path.display()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_duration(raw: &str) -> Result<f64, ProbeError> {
    let first = raw.lines().next().unwrap_or_default().trim();
    let duration: f64 = first
        .parse()
        .map_err(|_| ProbeError::InvalidMedia(format!("unparseable duration {first:?}")))?;
    if duration <= 0.0 {
        return Err(ProbeError::InvalidMedia(format!(
            "non-positive duration {duration}"
        )));
    }
    Ok(duration)
}

/// The stream query prints `width x height x pix_fmt` with `x` as the
/// separator; missing fields degrade to zero / "unknown".
fn parse_stream_line(raw: &str) -> (u32, u32, String) {
    let line = raw.lines().next().unwrap_or_default().trim();
    let mut parts = line.split('x');
    let width = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let height = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let pix_fmt = parts.next().unwrap_or("unknown").to_string();
    (width, height, pix_fmt)
}
