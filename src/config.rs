//! Configuration types for the download engine and its host process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Preferred quality for media extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Best available video and audio.
    #[default]
    Best,
    /// At most 2160 lines.
    P2160,
    /// At most 1080 lines.
    P1080,
    /// At most 720 lines.
    P720,
    /// At most 480 lines.
    P480,
    /// Audio track only.
    Audio,
}

impl Quality {
    /// Returns the extractor format selector for this preference.
    #[must_use]
    pub const fn format_selector(self) -> &'static str {
        match self {
            Self::Best => "bv*+ba/b",
            Self::P2160 => "bv*[height<=2160]+ba/b[height<=2160]/b",
            Self::P1080 => "bv*[height<=1080]+ba/b[height<=1080]/b",
            Self::P720 => "bv*[height<=720]+ba/b[height<=720]/b",
            Self::P480 => "bv*[height<=480]+ba/b[height<=480]/b",
            Self::Audio => "ba/b",
        }
    }
}

/// Which BitTorrent engine drives torrent and magnet jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentBackend {
    /// The segmented CLI downloader with BitTorrent support.
    #[default]
    Cli,
    /// An in-process streaming engine installed on the engine builder.
    Embedded,
}

/// Locations of the external fetch tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Media-page extractor binary.
    pub ytdlp: String,
    /// Segmented downloader binary.
    pub aria2c: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ytdlp: std::env::var("FETCHQ_YTDLP").unwrap_or_else(|_| "yt-dlp".to_string()),
            aria2c: std::env::var("FETCHQ_ARIA2C").unwrap_or_else(|_| "aria2c".to_string()),
        }
    }
}

/// Settings read by the scheduler and every fetch strategy.
///
/// A value of this type is handed to the dispatcher at construction and to
/// each strategy at dispatch time; nothing reads it through a global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrently active jobs.
    pub max_concurrent: usize,
    /// Automatic retries allowed for transient failures.
    pub max_retries: u32,
    /// Delay spent in `retrying` before a job is re-queued.
    pub retry_delay_secs: u64,
    /// Number of terminal jobs kept in history.
    pub history_limit: usize,
    /// Minimum interval between throttled snapshot broadcasts.
    pub broadcast_interval_ms: u64,
    /// Minimum interval between unchanged per-job progress reports.
    pub progress_interval_ms: u64,
    /// Coalescing window for state file writes.
    pub persist_debounce_ms: u64,
    /// Time allowed for a cancelled tool to exit.
    pub kill_grace_secs: u64,
    /// Default media quality.
    pub quality: Quality,
    /// Torrent engine selection.
    pub torrent_backend: TorrentBackend,
    /// Time a magnet link may spend resolving metadata without progress.
    pub magnet_metadata_timeout_secs: u64,
    /// Time a `.torrent` job may spend without its first bytes.
    pub torrent_idle_timeout_secs: u64,
    /// Time any transfer may go without progress once started.
    pub stall_timeout_secs: u64,
    /// Connections per server for the segmented downloader.
    pub connections: u32,
    /// Segments per file for the segmented downloader.
    pub splits: u32,
    /// Directory where downloads are written.
    pub download_dir: PathBuf,
    /// External tool locations.
    pub tools: ToolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            retry_delay_secs: 5,
            history_limit: 50,
            broadcast_interval_ms: 250,
            progress_interval_ms: 500,
            persist_debounce_ms: 1000,
            kill_grace_secs: 5,
            quality: Quality::Best,
            torrent_backend: TorrentBackend::Cli,
            magnet_metadata_timeout_secs: 90,
            torrent_idle_timeout_secs: 180,
            stall_timeout_secs: 600,
            connections: 16,
            splits: 16,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            tools: ToolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the global concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the automatic retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the retry delay in seconds.
    #[must_use]
    pub const fn with_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    /// Sets the history cap.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Sets the torrent backend.
    #[must_use]
    pub const fn with_torrent_backend(mut self, backend: TorrentBackend) -> Self {
        self.torrent_backend = backend;
        self
    }

    /// Sets the magnet metadata timeout in seconds.
    #[must_use]
    pub const fn with_magnet_metadata_timeout_secs(mut self, secs: u64) -> Self {
        self.magnet_metadata_timeout_secs = secs;
        self
    }

    /// Sets the download directory.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    #[must_use]
    pub const fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    #[must_use]
    pub const fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// Idle timeout before the first byte of a torrent arrives.
    ///
    /// Magnet links also have to resolve metadata through the DHT, so they
    /// get the shorter window and fail faster when the swarm is empty.
    #[must_use]
    pub const fn torrent_start_timeout(&self, magnet: bool) -> Duration {
        if magnet {
            Duration::from_secs(self.magnet_metadata_timeout_secs)
        } else {
            Duration::from_secs(self.torrent_idle_timeout_secs)
        }
    }
}

/// Path configuration for the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Where the queue state document is written.
    pub state_file: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_dir().join("state.json"),
        }
    }
}

/// Returns the directory where engine state is stored.
///
/// Uses `STATE_DIRECTORY` (set by systemd when `StateDirectory=` is configured),
/// falling back to `$XDG_DATA_HOME/fetchq` for interactive use.
#[must_use]
pub fn default_state_dir() -> PathBuf {
    std::env::var("STATE_DIRECTORY").map_or_else(
        |_| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fetchq")
        },
        PathBuf::from,
    )
}

/// API server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API server bind address.
    pub host: String,
    /// API server port.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9723,
        }
    }
}

/// Complete application configuration combining engine, path, and API settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine configuration.
    pub engine: EngineConfig,
    /// Path configuration.
    pub paths: PathConfig,
    /// API configuration.
    pub api: ApiConfig,
}

impl AppConfig {
    /// Default config file location (`$XDG_CONFIG_HOME/fetchq/config.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fetchq")
            .join("config.toml")
    }

    /// Loads the config at `path`, writing a default template first if the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or created.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            log::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Saves the config atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot
    /// be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
