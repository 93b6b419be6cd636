use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::analyzer::AnalyzerOptions;
use crate::analyzer::features::ExtractionSettings;
use crate::model::{AnalysisMode, BeatStorage, BpmTolerance, SegmentDensity};
use crate::pool::{self, TaskTimeout};

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Worker contexts. 0 = size from cores and available memory.
    pub workers: usize,
    /// Cap on the memory the sizing rule may assume, in MB.
    pub memory_ceiling_mb: Option<u64>,
    pub analysis_mode: AnalysisMode,
    pub segment_density: SegmentDensity,
    pub beat_storage: BeatStorage,
    pub bpm_tolerance: BpmTolerance,
    /// Cache entries older than this are pruned at startup.
    pub cache_max_age_days: u32,
    /// Seconds a track may sit in the analyzing state with no task.
    pub watchdog_grace_secs: u64,
    pub task_timeout: TimeoutConfig,
    /// Respawns allowed per worker context before it is retired.
    pub max_restarts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            workers: 0,
            memory_ceiling_mb: None,
            analysis_mode: AnalysisMode::default(),
            segment_density: SegmentDensity::default(),
            beat_storage: BeatStorage::default(),
            bpm_tolerance: BpmTolerance::default(),
            cache_max_age_days: 30,
            watchdog_grace_secs: 30,
            task_timeout: TimeoutConfig::default(),
            max_restarts: 3,
        }
    }
}

/// Per-file deadline: `base_secs + per_mib_secs * size_in_MiB`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub base_secs: u64,
    pub per_mib_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_secs: 30,
            per_mib_secs: 2,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/mixlab/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → sizing rule over cores and memory.
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            pool::detect_workers(self.memory_ceiling_mb)
        }
    }

    pub fn extraction_settings(&self) -> ExtractionSettings {
        ExtractionSettings {
            mode: self.analysis_mode,
            segment_density: self.segment_density,
            beat_storage: self.beat_storage,
        }
    }

    pub fn analyzer_options(&self) -> AnalyzerOptions {
        AnalyzerOptions {
            workers: self.resolve_workers(),
            max_restarts: self.max_restarts,
            timeout: TaskTimeout {
                base: Duration::from_secs(self.task_timeout.base_secs),
                per_mib: Duration::from_secs(self.task_timeout.per_mib_secs),
            },
            watchdog_grace: Duration::from_secs(self.watchdog_grace_secs),
            mode: self.analysis_mode,
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("mixlab.db")
    } else {
        // Fallback: current directory
        PathBuf::from("mixlab.db")
    }
}
