//! Settings Persistence System
//!
//! Provides persistent scheduler settings with:
//! - Atomic file writes (temp file + rename)
//! - Per-field defaults so partial files stay loadable
//! - Normalization instead of rejection for out-of-range values
//!
//! Storage location: {config_dir}/settings.json

use std::fs;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{fs::atomic_write_json_pretty, CoreError, CoreResult};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Default per-job in-flight limit when a submission doesn't specify one
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

// =============================================================================
// Batch Settings
// =============================================================================

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// In-flight limit used when a submission omits `maxConcurrent`
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,

    /// Process-wide in-flight ceiling across all jobs (0 = disabled)
    #[serde(default)]
    pub global_max_concurrent: usize,

    /// Maximum number of simultaneously active jobs (0 = unlimited)
    #[serde(default)]
    pub max_active_jobs: usize,

    /// Maximum retained history records, oldest dropped first (0 = unbounded)
    #[serde(default)]
    pub history_limit: usize,

    /// JSONL journal that makes history survive restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_path: Option<PathBuf>,

    /// Capacity of the lifecycle event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_event_capacity() -> usize {
    256
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            default_max_concurrent: default_max_concurrent(),
            global_max_concurrent: 0,
            max_active_jobs: 0,
            history_limit: 0,
            history_path: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl BatchSettings {
    /// Normalizes and clamps settings so persisted state is always valid.
    ///
    /// Corrects bad values instead of failing, so old or hand-edited files
    /// never prevent the scheduler from starting.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;
        self.default_max_concurrent = self.default_max_concurrent.clamp(1, 64);
        self.global_max_concurrent = self.global_max_concurrent.min(256);
        self.event_capacity = self.event_capacity.clamp(16, 65_536);

        if let Some(path) = &self.history_path {
            if path.as_os_str().is_empty() {
                self.history_path = None;
            }
        }
    }

    /// Sets the journal path
    pub fn with_history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = Some(path.into());
        self
    }

    /// Sets the process-wide in-flight ceiling
    pub fn with_global_max_concurrent(mut self, limit: usize) -> Self {
        self.global_max_concurrent = limit;
        self
    }
}

// =============================================================================
// Settings Manager
// =============================================================================

/// Settings manager for loading, saving, and resetting settings
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager rooted at the given config directory
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            settings_path: config_dir.join(SETTINGS_FILE),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file is missing or unreadable
    pub fn load(&self) -> BatchSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(BatchSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<BatchSettings>(&content)?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
            }

            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                BatchSettings::default()
            }
        }
    }

    /// Save settings to disk; returns the normalized settings that were written
    pub fn save(&self, settings: &BatchSettings) -> CoreResult<BatchSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();

            atomic_write_json_pretty(&self.settings_path, &normalized)?;

            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }

    /// Reset settings to defaults and delete the settings file
    pub fn reset(&self) -> CoreResult<BatchSettings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path).map_err(|e| {
                    CoreError::Internal(format!("Failed to delete settings file: {}", e))
                })?;
                info!("Settings file deleted");
            }
            Ok(BatchSettings::default())
        })
    }
}
