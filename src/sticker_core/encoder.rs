use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use sysinfo::System;

/// Telegram sticker geometry: the longer side is pinned to 512 px, the
/// shorter one scales to an even dimension preserving aspect.
pub(crate) const SCALE_FILTER: &str = "scale='if(gte(iw,ih),512,-2)':'if(gte(iw,ih),-2,512)'";

const VPX_CPU_USED: u32 = 5;

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

static ENCODER_THREADS: Lazy<usize> = Lazy::new(|| {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.cpus().len().max(1)
});

/// One encoder invocation, fully determined by the rate-control state plus
/// IO paths, the pass number, and the alpha flag.
pub(crate) struct EncodeSpec<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub crf: u32,
    pub bitrate_kbps: u32,
    pub pass: u8,
    pub pass_log_base: &'a Path,
    pub alpha: bool,
}

pub(crate) fn encode_args(spec: &EncodeSpec<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-threads".into(),
        ENCODER_THREADS.to_string().into(),
        "-i".into(),
        spec.input.as_os_str().to_owned(),
        "-vf".into(),
        SCALE_FILTER.into(),
        "-c:v".into(),
        "libvpx-vp9".into(),
    ];
    if spec.alpha {
        args.push("-pix_fmt".into());
        args.push("yuva420p".into());
    }
    args.extend([
        "-crf".into(),
        spec.crf.to_string().into(),
        "-b:v".into(),
        format!("{}k", spec.bitrate_kbps).into(),
        "-maxrate".into(),
        format!("{}k", (spec.bitrate_kbps as f64 * 1.5) as u32).into(),
        "-bufsize".into(),
        format!("{}k", spec.bitrate_kbps * 3).into(),
        "-row-mt".into(),
        "1".into(),
        "-tile-columns".into(),
        "4".into(),
        "-cpu-used".into(),
        VPX_CPU_USED.to_string().into(),
        "-pass".into(),
        spec.pass.to_string().into(),
        "-passlogfile".into(),
        spec.pass_log_base.as_os_str().to_owned(),
    ]);
    if spec.pass == 1 {
        args.extend(["-f".into(), "null".into(), NULL_DEVICE.into()]);
    } else {
        args.extend(["-an".into(), "-f".into(), "webm".into()]);
        args.push(spec.output.as_os_str().to_owned());
    }
    args
}

/// Run one encoder pass with all stdio discarded. Non-zero exit is an
/// error; retry policy lives with the caller.
pub(crate) fn run_pass(spec: &EncodeSpec<'_>) -> Result<()> {
    let status = Command::new("ffmpeg")
        .args(encode_args(spec))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("failed to run ffmpeg on {}", spec.input.display()))?;
    if !status.success() {
        bail!(
            "ffmpeg pass {} exited with {} for {}",
            spec.pass,
            status,
            spec.input.display()
        );
    }
    Ok(())
}

/// Best-effort removal of the side files the two-pass encoder leaves next
/// to the pass-log base.
pub(crate) fn cleanup_pass_logs(pass_log_base: &Path) {
    let base = pass_log_base.to_string_lossy();
    for suffix in ["-0.log", "-0.log.mbtree"] {
        let _ = fs::remove_file(format!("{base}{suffix}"));
    }
}

/// Startup and submit-time preflight: the server refuses work when the
/// encoder is not on PATH.
pub fn encoder_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec<'a>(input: &'a Path, output: &'a Path, base: &'a Path) -> EncodeSpec<'a> {
        EncodeSpec {
            input,
            output,
            crf: 30,
            bitrate_kbps: 406,
            pass: 1,
            pass_log_base: base,
            alpha: false,
        }
    }

    fn stringify(args: &[std::ffi::OsString]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn pass_one_targets_the_null_muxer() {
        let (input, output, base) = (
            PathBuf::from("/in/clip.mp4"),
            PathBuf::from("/out/clip_converted.webm"),
            PathBuf::from("/tmp/ffmpeg_pass_1_2_3"),
        );
        let args = stringify(&encode_args(&spec(&input, &output, &base)));

        assert_eq!(args[args.len() - 3..], ["-f", "null", NULL_DEVICE]);
        assert!(!args.iter().any(|a| a == "-an"));
        assert!(!args.iter().any(|a| a == "-pix_fmt"));

        let crf_at = args.iter().position(|a| a == "-crf").unwrap();
        assert_eq!(args[crf_at + 1], "30");
        let br_at = args.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(args[br_at + 1], "406k");
        let maxrate_at = args.iter().position(|a| a == "-maxrate").unwrap();
        assert_eq!(args[maxrate_at + 1], "609k");
        let bufsize_at = args.iter().position(|a| a == "-bufsize").unwrap();
        assert_eq!(args[bufsize_at + 1], "1218k");
        let vf_at = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf_at + 1], SCALE_FILTER);
    }

    #[test]
    fn pass_two_writes_webm_without_audio_and_keeps_alpha() {
        let (input, output, base) = (
            PathBuf::from("/in/anim.gif"),
            PathBuf::from("/out/anim_converted.webm"),
            PathBuf::from("/tmp/ffmpeg_pass_1_2_3"),
        );
        let mut s = spec(&input, &output, &base);
        s.pass = 2;
        s.alpha = true;
        let args = stringify(&encode_args(&s));

        assert_eq!(
            args[args.len() - 4..],
            ["-an", "-f", "webm", "/out/anim_converted.webm"]
        );
        let pix_at = args.iter().position(|a| a == "-pix_fmt").unwrap();
        assert_eq!(args[pix_at + 1], "yuva420p");
        let pass_at = args.iter().position(|a| a == "-pass").unwrap();
        assert_eq!(args[pass_at + 1], "2");
    }

    #[test]
    fn cleanup_removes_pass_log_side_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ffmpeg_pass_9_9_1");
        let log = dir.path().join("ffmpeg_pass_9_9_1-0.log");
        let mbtree = dir.path().join("ffmpeg_pass_9_9_1-0.log.mbtree");
        std::fs::write(&log, b"stats").unwrap();
        std::fs::write(&mbtree, b"tree").unwrap();

        cleanup_pass_logs(&base);
        assert!(!log.exists());
        assert!(!mbtree.exists());

        // Missing files are not an error.
        cleanup_pass_logs(&base);
    }
}
