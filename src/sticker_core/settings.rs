use std::env;
use std::path::PathBuf;

use clap::Parser;

/// Runtime configuration, collected once at startup and threaded into the
/// engine. Every flag has an environment fallback so the desktop front-end
/// can launch the server without building a command line.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stickerpress",
    about = "Batch video-to-WebM sticker conversion server"
)]
pub struct ServerConfig {
    /// Address the HTTP control plane binds to.
    #[arg(long, default_value = "0.0.0.0", env = "STICKERPRESS_HOST")]
    pub host: String,

    /// Port the HTTP control plane listens on.
    #[arg(long, default_value_t = 5000, env = "STICKERPRESS_PORT")]
    pub port: u16,

    /// Directory for two-pass log files; defaults to a process-owned
    /// folder under the system temp dir.
    #[arg(long, env = "STICKERPRESS_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Path of the cumulative stats document.
    #[arg(long, env = "STICKERPRESS_STATS_FILE")]
    pub stats_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("VideoConverterTemp"))
    }

    pub fn stats_file(&self) -> PathBuf {
        self.stats_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("logs").join("stats.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_backend() {
        let config = ServerConfig::parse_from(["stickerpress"]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert!(config.temp_dir().ends_with("VideoConverterTemp"));
        assert!(config.stats_file().ends_with("stats.json"));
    }

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::parse_from([
            "stickerpress",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--temp-dir",
            "/tmp/press",
            "--stats-file",
            "/tmp/press/stats.json",
        ]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.temp_dir(), PathBuf::from("/tmp/press"));
        assert_eq!(config.stats_file(), PathBuf::from("/tmp/press/stats.json"));
    }
}
