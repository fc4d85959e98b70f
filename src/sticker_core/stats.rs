use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Read-through cache lifetime; polling front-ends read stats far more
/// often than the counters change.
const CACHE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Conversion,
    HexEdit,
    Image,
    Sticker,
}

/// The persisted stats document. Image and sticker counters are carried for
/// compatibility with the other front-ends that share `stats.json`; this
/// server only bumps conversions and hex edits. Missing fields load as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeStats {
    #[serde(default)]
    pub total_conversions: u64,
    #[serde(default)]
    pub successful_conversions: u64,
    #[serde(default)]
    pub failed_conversions: u64,
    #[serde(default)]
    pub total_hexedits: u64,
    #[serde(default)]
    pub successful_hexedits: u64,
    #[serde(default)]
    pub failed_hexedits: u64,
    #[serde(default)]
    pub total_images_converted: u64,
    #[serde(default)]
    pub successful_images: u64,
    #[serde(default)]
    pub failed_images: u64,
    #[serde(default)]
    pub total_stickers_created: u64,
}

struct CacheState {
    stats: Option<CumulativeStats>,
    read_at: Option<Instant>,
}

/// Cumulative counters persisted as one JSON document, rewritten in full on
/// each increment. Writes are mutex-guarded; reads are served from a 10 s
/// cache to keep polling cheap.
pub struct StatsTracker {
    path: PathBuf,
    state: Mutex<CacheState>,
}

impl StatsTracker {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create stats directory {}", parent.display())
                })?;
            }
        }
        if !path.exists() {
            write_document(&path, &CumulativeStats::default())?;
        }
        Ok(Self {
            path,
            state: Mutex::new(CacheState {
                stats: None,
                read_at: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> CumulativeStats {
        let mut state = self.lock();
        self.load_locked(&mut state)
    }

    pub fn increment(&self, kind: StatKind, success: bool) {
        let mut state = self.lock();
        let mut stats = self.load_locked(&mut state);
        match kind {
            StatKind::Conversion => {
                stats.total_conversions += 1;
                if success {
                    stats.successful_conversions += 1;
                } else {
                    stats.failed_conversions += 1;
                }
            }
            StatKind::HexEdit => {
                stats.total_hexedits += 1;
                if success {
                    stats.successful_hexedits += 1;
                } else {
                    stats.failed_hexedits += 1;
                }
            }
            StatKind::Image => {
                stats.total_images_converted += 1;
                if success {
                    stats.successful_images += 1;
                } else {
                    stats.failed_images += 1;
                }
            }
            StatKind::Sticker => {
                stats.total_stickers_created += 1;
            }
        }
        if let Err(err) = write_document(&self.path, &stats) {
            warn!(path = %self.path.display(), "could not save stats: {err:#}");
        }
        state.stats = Some(stats);
        state.read_at = Some(Instant::now());
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_locked(&self, state: &mut CacheState) -> CumulativeStats {
        if let (Some(stats), Some(read_at)) = (&state.stats, state.read_at) {
            if read_at.elapsed() < CACHE_TIMEOUT {
                return stats.clone();
            }
        }
        let stats = match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), "stats file unreadable, using defaults: {err}");
                CumulativeStats::default()
            }),
            Err(_) => CumulativeStats::default(),
        };
        state.stats = Some(stats.clone());
        state.read_at = Some(Instant::now());
        stats
    }
}

fn write_document(path: &Path, stats: &CumulativeStats) -> Result<()> {
    let body = serde_json::to_vec_pretty(stats).context("failed to encode stats")?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}
