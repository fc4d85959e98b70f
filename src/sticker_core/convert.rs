use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::sticker_core::domain::{FileState, basename};
use crate::sticker_core::encoder::{EncodeSpec, cleanup_pass_logs, run_pass};
use crate::sticker_core::probe::{ProbeError, has_alpha, probe};
use crate::sticker_core::registry::ProcessRegistry;
use crate::sticker_core::tempdir::TempStore;

/// Telegram's sticker size contract, in kilobytes. Outputs are accepted
/// inside [0.90·T, T].
pub(crate) const TARGET_SIZE_KB: f64 = 254.0;
const TARGET_RANGE_MIN: f64 = TARGET_SIZE_KB * 0.90;
const TARGET_RANGE_MAX: f64 = TARGET_SIZE_KB;

/// Effectively infinite; the search terminates through its bounds, not
/// through this cap. It still appears in the attempt stage string.
const MAX_ATTEMPTS: u32 = 99999;

const MIN_CRF: u32 = 1;
const MAX_CRF: u32 = 50;
const MIN_BITRATE_KBPS: u32 = 50;
const MAX_BITRATE_KBPS: u32 = 50_000;

/// Two consecutive attempts closer than this are a plateau.
const PLATEAU_DELTA_KB: f64 = TARGET_SIZE_KB * 0.04;
const PLATEAU_TRIGGER: u32 = 2;

const PAUSE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConvertOutcome {
    Completed { size_kb: f64 },
    Failed,
    Cancelled,
}

/// What the rate-control update decided for the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Adjust {
    Continue,
    /// Plateaued while oversized; bitrate was cut.
    PlateauReduced,
    /// Plateaued while undersized; bitrate was raised.
    PlateauRaised,
    /// The search saturated with the output still below the band; the
    /// current output is the best achievable.
    AcceptAsBest,
}

/// Per-attempt search state. CRF moves first with bigger steps on the
/// early attempts; bitrate takes over once CRF saturates or the size
/// plateaus.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RateControl {
    pub crf: u32,
    pub bitrate_kbps: u32,
    pub attempt: u32,
    plateau_count: u32,
    last_size_kb: f64,
}

impl RateControl {
    pub(crate) fn new(duration_s: f64) -> Self {
        let initial = ((TARGET_SIZE_KB * 8.0) / duration_s) as u32;
        Self {
            crf: 30,
            bitrate_kbps: initial.max(MIN_BITRATE_KBPS),
            attempt: 1,
            plateau_count: 0,
            last_size_kb: 0.0,
        }
    }

    pub(crate) fn within_target(size_kb: f64) -> bool {
        (TARGET_RANGE_MIN..=TARGET_RANGE_MAX).contains(&size_kb)
    }

    /// Advance the search after an attempt landed outside the band.
    pub(crate) fn adjust(&mut self, size_kb: f64) -> Adjust {
        let size_diff = (size_kb - self.last_size_kb).abs();
        self.last_size_kb = size_kb;

        let crf_step = if self.attempt <= 4 { 3 } else { 2 };
        if size_kb > TARGET_RANGE_MAX {
            if self.crf < MAX_CRF {
                self.crf = (self.crf + crf_step).min(MAX_CRF);
            } else {
                self.bitrate_kbps =
                    ((self.bitrate_kbps as f64 * 0.92) as u32).max(MIN_BITRATE_KBPS);
            }
        } else if size_kb < TARGET_RANGE_MIN {
            if self.crf > MIN_CRF {
                self.crf = self.crf.saturating_sub(crf_step).max(MIN_CRF);
            } else if self.bitrate_kbps < MAX_BITRATE_KBPS {
                self.bitrate_kbps =
                    ((self.bitrate_kbps as f64 * 1.08) as u32).min(MAX_BITRATE_KBPS);
            } else {
                return Adjust::AcceptAsBest;
            }
        }

        if size_diff < PLATEAU_DELTA_KB {
            self.plateau_count += 1;
        } else {
            self.plateau_count = 0;
        }

        let mut outcome = Adjust::Continue;
        if self.plateau_count >= PLATEAU_TRIGGER {
            if size_kb > TARGET_RANGE_MAX {
                self.bitrate_kbps =
                    ((self.bitrate_kbps as f64 * 0.9) as u32).max(MIN_BITRATE_KBPS);
                outcome = Adjust::PlateauReduced;
            } else if size_kb < TARGET_RANGE_MIN {
                if self.bitrate_kbps >= MAX_BITRATE_KBPS {
                    return Adjust::AcceptAsBest;
                }
                self.bitrate_kbps =
                    ((self.bitrate_kbps as f64 * 1.1) as u32).min(MAX_BITRATE_KBPS);
                outcome = Adjust::PlateauRaised;
            }
            self.plateau_count = 0;
        }

        self.attempt += 1;
        outcome
    }
}

/// The attempt formula collapses to ~15 for any realistic attempt count,
/// so readers see pass progress as small offsets from there and must
/// tolerate dips between attempts.
fn base_progress(attempt: u32) -> u8 {
    (15.0 + (f64::from(attempt) / f64::from(MAX_ATTEMPTS)) * 70.0) as u8
}

fn file_size_kb(path: &Path) -> f64 {
    fs::metadata(path).map(|m| m.len() as f64 / 1024.0).unwrap_or(0.0)
}

fn set_file_error(registry: &ProcessRegistry, job_id: &str, index: usize, stage: String) {
    registry.update_file(job_id, index, |fs| {
        fs.status = FileState::Error;
        fs.progress = 0;
        fs.stage = stage;
    });
}

/// Drive the two-pass encoder toward the target band for one input.
/// Pause and stop are observed between attempts only; a running pass is
/// never interrupted.
pub(crate) fn convert_video(
    registry: &ProcessRegistry,
    temp: &TempStore,
    job_id: &str,
    file_index: usize,
    input: &Path,
    output: &Path,
) -> ConvertOutcome {
    let filename = basename(input);
    info!(job = job_id, file = %filename, "converting video");

    let media = match probe(input) {
        Ok(media) => media,
        Err(err @ ProbeError::InvalidMedia(_)) => {
            warn!(file = %filename, "probe rejected input: {err}");
            set_file_error(registry, job_id, file_index, "Error: Invalid video".to_string());
            return ConvertOutcome::Failed;
        }
        Err(err) => {
            warn!(file = %filename, "probe failed: {err}");
            set_file_error(registry, job_id, file_index, format!("Conversion error: {err}"));
            return ConvertOutcome::Failed;
        }
    };
    let alpha = has_alpha(&media.pix_fmt, input);

    registry.update_file(job_id, file_index, |fs| {
        fs.status = FileState::Analyzing;
        fs.progress = 5;
        fs.stage = "Analyzing video...".to_string();
    });

    registry.update_file(job_id, file_index, |fs| {
        fs.status = FileState::Preparing;
        fs.progress = 10;
        fs.stage = format!(
            "Duration: {:.1}s, Size: {}x{}",
            media.duration_s, media.width, media.height
        );
    });

    let mut rc = RateControl::new(media.duration_s);
    info!(
        file = %filename,
        duration_s = media.duration_s,
        alpha,
        initial_bitrate = rc.bitrate_kbps,
        "target band {TARGET_RANGE_MIN:.1}-{TARGET_RANGE_MAX:.1}KB"
    );

    while rc.attempt <= MAX_ATTEMPTS {
        // Stop/pause checkpoint. A stop during pause wins; an evicted job
        // record reads as a stop.
        loop {
            match registry.control(job_id) {
                None => return ConvertOutcome::Cancelled,
                Some(flags) if flags.stopped => return ConvertOutcome::Cancelled,
                Some(flags) if flags.paused => {
                    debug!(job = job_id, "paused, waiting");
                    thread::sleep(PAUSE_POLL);
                }
                Some(_) => break,
            }
        }

        let (attempt, crf, bitrate) = (rc.attempt, rc.crf, rc.bitrate_kbps);
        let base = base_progress(attempt);
        registry.update_file(job_id, file_index, |fs| {
            fs.status = FileState::Converting;
            fs.progress = base;
            fs.stage = format!("Attempt {attempt}/{MAX_ATTEMPTS} - CRF:{crf} BR:{bitrate}k");
            fs.attempt = Some(attempt);
            fs.crf = Some(crf);
            fs.bitrate = Some(bitrate);
        });

        let pass_log_base = temp.pass_log_base(attempt);
        let mut spec = EncodeSpec {
            input,
            output,
            crf,
            bitrate_kbps: bitrate,
            pass: 1,
            pass_log_base: &pass_log_base,
            alpha,
        };

        registry.update_file(job_id, file_index, |fs| {
            fs.progress = base + 5;
            fs.stage = format!("Pass 1/2 - CRF:{crf}");
        });
        if let Err(err) = run_pass(&spec) {
            cleanup_pass_logs(&pass_log_base);
            warn!(file = %filename, "pass 1 failed: {err:#}");
            set_file_error(registry, job_id, file_index, format!("Conversion error: {err}"));
            return ConvertOutcome::Failed;
        }

        spec.pass = 2;
        registry.update_file(job_id, file_index, |fs| {
            fs.progress = base + 10;
            fs.stage = format!("Pass 2/2 - CRF:{crf}");
        });
        if let Err(err) = run_pass(&spec) {
            cleanup_pass_logs(&pass_log_base);
            warn!(file = %filename, "pass 2 failed: {err:#}");
            set_file_error(registry, job_id, file_index, format!("Conversion error: {err}"));
            return ConvertOutcome::Failed;
        }

        if !output.exists() {
            cleanup_pass_logs(&pass_log_base);
            set_file_error(
                registry,
                job_id,
                file_index,
                "Error: Output file not created".to_string(),
            );
            return ConvertOutcome::Failed;
        }
        let size_kb = file_size_kb(output);
        if size_kb == 0.0 {
            cleanup_pass_logs(&pass_log_base);
            set_file_error(registry, job_id, file_index, "Error: Zero file size".to_string());
            return ConvertOutcome::Failed;
        }

        debug!(
            file = %filename,
            attempt,
            crf,
            bitrate,
            size_kb,
            "attempt finished"
        );
        registry.update_file(job_id, file_index, |fs| {
            fs.status = FileState::Checking;
            fs.progress = 85;
            fs.stage = format!(
                "Size: {size_kb:.1}KB (Target: {}KB)",
                TARGET_SIZE_KB as u32
            );
            fs.file_size = Some(size_kb);
        });

        if RateControl::within_target(size_kb) {
            cleanup_pass_logs(&pass_log_base);
            registry.update_file(job_id, file_index, |fs| {
                fs.status = FileState::Completed;
                fs.progress = 100;
                fs.stage = format!("Completed! {size_kb:.1}KB in {attempt} attempts");
                fs.file_size = Some(size_kb);
                fs.attempts = Some(attempt);
            });
            info!(file = %filename, size_kb, attempts = attempt, "size within target band");
            return ConvertOutcome::Completed { size_kb };
        }

        match rc.adjust(size_kb) {
            Adjust::AcceptAsBest => {
                cleanup_pass_logs(&pass_log_base);
                registry.update_file(job_id, file_index, |fs| {
                    fs.status = FileState::Completed;
                    fs.progress = 100;
                    fs.stage = format!("Completed! {size_kb:.1}KB (max quality)");
                    fs.file_size = Some(size_kb);
                    fs.attempts = Some(attempt);
                });
                warn!(
                    file = %filename,
                    size_kb,
                    "cannot reach target band, accepting best output"
                );
                return ConvertOutcome::Completed { size_kb };
            }
            Adjust::PlateauReduced => {
                info!(file = %filename, bitrate = rc.bitrate_kbps, "plateaued, reducing bitrate");
                registry.update_file(job_id, file_index, |fs| {
                    fs.stage = "Plateaued. Reducing bitrate".to_string();
                });
            }
            Adjust::PlateauRaised => {
                info!(file = %filename, bitrate = rc.bitrate_kbps, "plateaued, increasing bitrate");
                registry.update_file(job_id, file_index, |fs| {
                    fs.stage = "Plateaued. Increasing bitrate".to_string();
                });
            }
            Adjust::Continue => {}
        }

        cleanup_pass_logs(&pass_log_base);
    }

    warn!(file = %filename, "max attempts reached without landing in the band");
    ConvertOutcome::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_bitrate_follows_duration_with_a_floor() {
        let rc = RateControl::new(5.0);
        assert_eq!(rc.crf, 30);
        assert_eq!(rc.bitrate_kbps, 406); // (254 * 8) / 5

        let long = RateControl::new(10_000.0);
        assert_eq!(long.bitrate_kbps, MIN_BITRATE_KBPS);
    }

    #[test]
    fn target_band_is_inclusive() {
        assert!(RateControl::within_target(TARGET_RANGE_MIN));
        assert!(RateControl::within_target(TARGET_RANGE_MAX));
        assert!(RateControl::within_target(240.0));
        assert!(!RateControl::within_target(TARGET_RANGE_MIN - 0.01));
        assert!(!RateControl::within_target(TARGET_RANGE_MAX + 0.01));
    }

    #[test]
    fn oversized_outputs_raise_crf_with_early_big_steps() {
        let mut rc = RateControl::new(5.0);
        assert_eq!(rc.adjust(400.0), Adjust::Continue);
        assert_eq!(rc.crf, 33);
        assert_eq!(rc.attempt, 2);

        // Attempts 2..4 still step by 3, later ones by 2.
        rc.adjust(380.0);
        rc.adjust(360.0);
        rc.adjust(340.0);
        assert_eq!(rc.crf, 42);
        rc.adjust(320.0);
        assert_eq!(rc.crf, 44);
    }

    #[test]
    fn undersized_outputs_lower_crf_toward_the_floor() {
        let mut rc = RateControl::new(5.0);
        rc.adjust(100.0);
        assert_eq!(rc.crf, 27);

        let mut floored = RateControl::new(5.0);
        floored.crf = 2;
        floored.adjust(100.0);
        assert_eq!(floored.crf, MIN_CRF);
    }

    #[test]
    fn crf_saturation_hands_over_to_bitrate() {
        let mut rc = RateControl::new(5.0);
        rc.crf = MAX_CRF;
        rc.bitrate_kbps = 1000;
        rc.adjust(400.0);
        assert_eq!(rc.crf, MAX_CRF);
        assert_eq!(rc.bitrate_kbps, 920);

        let mut rc = RateControl::new(5.0);
        rc.crf = MIN_CRF;
        rc.bitrate_kbps = 1000;
        rc.adjust(100.0);
        assert_eq!(rc.crf, MIN_CRF);
        assert_eq!(rc.bitrate_kbps, 1080);
    }

    #[test]
    fn saturated_bitrate_below_band_accepts_best_output() {
        let mut rc = RateControl::new(5.0);
        rc.crf = MIN_CRF;
        rc.bitrate_kbps = MAX_BITRATE_KBPS;
        assert_eq!(rc.adjust(100.0), Adjust::AcceptAsBest);
    }

    #[test]
    fn plateau_switches_to_bitrate_and_resets_its_counter() {
        let mut rc = RateControl::new(5.0);
        rc.bitrate_kbps = 1000;
        // Two consecutive near-identical oversized results trip the detector
        // (the first attempt's diff vs. 0 is large and does not count).
        assert_eq!(rc.adjust(300.0), Adjust::Continue);
        assert_eq!(rc.adjust(301.0), Adjust::Continue);
        assert_eq!(rc.adjust(302.0), Adjust::PlateauReduced);
        assert_eq!(rc.bitrate_kbps, 900);
        assert_eq!(rc.plateau_count, 0);
    }

    #[test]
    fn plateau_below_band_raises_bitrate_or_accepts_at_the_cap() {
        let mut rc = RateControl::new(5.0);
        rc.crf = MIN_CRF;
        rc.bitrate_kbps = 1000;
        rc.adjust(100.0);
        rc.adjust(101.0);
        assert_eq!(rc.adjust(102.0), Adjust::PlateauRaised);
        // 1.08 CRF-floor growth applied first, then the 1.1 plateau factor.
        assert_eq!(rc.bitrate_kbps, 1384);

        let mut capped = RateControl::new(5.0);
        capped.crf = 10;
        capped.bitrate_kbps = MAX_BITRATE_KBPS;
        capped.adjust(100.0);
        capped.adjust(101.0);
        assert_eq!(capped.adjust(102.0), Adjust::AcceptAsBest);
    }

    #[test]
    fn search_bounds_never_escape() {
        let mut rc = RateControl::new(5.0);
        for _ in 0..200 {
            rc.adjust(400.0);
            assert!((MIN_CRF..=MAX_CRF).contains(&rc.crf));
            assert!((MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&rc.bitrate_kbps));
        }
        let mut rc = RateControl::new(5.0);
        for _ in 0..200 {
            rc.adjust(10.0);
            assert!((MIN_CRF..=MAX_CRF).contains(&rc.crf));
            assert!((MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&rc.bitrate_kbps));
        }
    }

    #[test]
    fn attempt_base_progress_collapses_to_fifteen() {
        assert_eq!(base_progress(1), 15);
        assert_eq!(base_progress(50), 15);
        assert_eq!(base_progress(1000), 15);
    }
}
