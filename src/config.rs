use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Directories to scan for MIDI files (used when `scan` has no CLI args).
    pub music_dirs: Vec<PathBuf>,
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Fingerprinting options.
    pub fingerprint: FingerprintConfig,
    /// Metadata lookup sink options.
    pub lookup: LookupConfig,
}

/// Fingerprinting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Grid resolution in steps per bar.
    pub grid_steps_per_bar: usize,
    /// Velocity-weighted rhythm grids (2 bits/step) instead of binary.
    /// Fingerprints from the two modes are not comparable; a corpus must
    /// be built entirely in one mode.
    pub weighted_rhythm: bool,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            grid_steps_per_bar: crate::DEFAULT_GRID_STEPS_PER_BAR,
            weighted_rhythm: false,
        }
    }
}

/// Metadata lookup (genre/tag enrichment) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Cache TTL in days before an entry is considered stale.
    pub cache_ttl_days: i64,
    /// TTL in days for negative (miss/failure) cache entries.
    pub negative_ttl_days: i64,
    /// Retry attempts per request before recording a failure.
    pub retry_budget: u32,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            cache_ttl_days: 30,
            negative_ttl_days: 1,
            retry_budget: 3,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/riffbank/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        match toml::from_str::<AppConfig>(&contents) {
                            Ok(config) => {
                                log::info!("Loaded config from {}", path.display());
                                config
                            }
                            Err(e) => {
                                log::warn!(
                                    "Failed to parse {}: {}. Using defaults.",
                                    path.display(),
                                    e
                                );
                                Self::default()
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to read {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        Self::default()
                    }
                }
            }
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
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
        data_dir.join("riffbank.db")
    } else {
        // Fallback: current directory
        PathBuf::from("riffbank.db")
    }
}
