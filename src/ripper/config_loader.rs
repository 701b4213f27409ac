//! Settings loading, persistence and live reload
//!
//! Settings live in `settings.toml` inside the config directory. The core
//! never caches them: every decision point takes a fresh snapshot through
//! `SettingsManager::settings()`. Saving or editing the file publishes
//! `Event::SettingsUpdate` on the event bus.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Config, Event as FsEvent, EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ripper::event_bus::{Event, EventBus};

/// Name of the settings file inside the config directory
pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Upstream forum and account options
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Upstream {
    /// Base URL of the forum, also used as the gallery API host
    pub proxy: String,
    pub username: String,
    pub password: String,
    pub login: bool,
    pub leave_thanks: bool,
    /// Look up alternative titles of each added post
    pub fetch_metadata: bool,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            proxy: "https://vipergirls.to".to_string(),
            username: String::new(),
            password: String::new(),
            login: false,
            leave_thanks: false,
            fetch_metadata: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Download {
    pub download_directory: String,
    pub temp_directory: String,
    pub auto_start: bool,
    /// Delete a post and its images once it completes
    pub clear_completed: bool,
    /// Prefix file names with the image ordinal
    pub force_order: bool,
    /// Thread scans with at most this many posts are added without a choice
    pub auto_queue_threshold: usize,
}

impl Default for Download {
    fn default() -> Self {
        Self {
            download_directory: "./downloads".to_string(),
            temp_directory: "./.tmp".to_string(),
            auto_start: true,
            clear_completed: false,
            force_order: false,
            auto_queue_threshold: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Connection {
    /// Worker pool size, 0 selects the number of available cores
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub timeout_secs: u64,
    /// Minimum interval between persisted progress updates of one image
    pub progress_interval_ms: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            max_attempts: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 5_000,
            timeout_secs: 30,
            progress_interval_ms: 250,
        }
    }
}

impl Connection {
    pub fn worker_count(&self) -> usize {
        if self.max_concurrent == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_concurrent
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_directory: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Storage {
    /// Empty selects the in-memory store
    pub database_file: String,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            database_file: "./data/ripper.sqlite".to_string(),
        }
    }
}

/// Batching of notifications pushed to attached sinks
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Notifications {
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            max_batch_size: 1_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub upstream: Upstream,
    pub download: Download,
    pub connection: Connection,
    pub logging: Logging,
    pub storage: Storage,
    pub notifications: Notifications,
}

/// Owns the current settings and keeps them in sync with the settings file
pub struct SettingsManager {
    settings: Arc<RwLock<Settings>>,
    config_dir: Option<PathBuf>,
    event_bus: EventBus,
    _watcher: Option<RecommendedWatcher>,
}

impl SettingsManager {
    /// Load settings from `config_dir`, creating the file with defaults if needed, and watch it
    pub fn new(config_dir: impl AsRef<Path>, event_bus: EventBus) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let settings = Self::load_settings(&config_dir)?;
        let path = config_dir.join(SETTINGS_FILE);
        if !path.exists() {
            Self::write_settings(&path, &settings)?;
            info!("Created {} with default values", path.display());
        }

        let mut manager = Self {
            settings: Arc::new(RwLock::new(settings)),
            config_dir: Some(config_dir),
            event_bus,
            _watcher: None,
        };
        manager.setup_watcher()?;
        Ok(manager)
    }

    /// Settings held only in memory, never written to disk
    pub fn in_memory(settings: Settings, event_bus: EventBus) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            config_dir: None,
            event_bus,
            _watcher: None,
        }
    }

    fn load_settings(config_dir: &Path) -> ConfigResult<Settings> {
        let path = config_dir.join(SETTINGS_FILE);
        if !path.exists() {
            warn!("Settings file not found: {}", path.display());
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&path)?;
        match toml::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                error!("Failed to parse {}: {}", SETTINGS_FILE, e);
                info!("Backing up unreadable settings and continuing with defaults");
                if let Err(backup_err) = fs::rename(&path, path.with_extension("toml.backup")) {
                    warn!("Failed to back up settings file: {}", backup_err);
                }
                let defaults = Settings::default();
                Self::write_settings(&path, &defaults)?;
                Ok(defaults)
            }
        }
    }

    fn write_settings(path: &Path, settings: &Settings) -> ConfigResult<()> {
        let toml_string =
            toml::to_string_pretty(settings).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    fn setup_watcher(&mut self) -> ConfigResult<()> {
        let Some(config_dir) = self.config_dir.clone() else {
            return Ok(());
        };
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(tx, Config::default())?;
        watcher.watch(&config_dir, RecursiveMode::NonRecursive)?;

        let settings = self.settings.clone();
        let event_bus = self.event_bus.clone();

        // notify delivers on a std channel, so drain it off the async runtime.
        std::thread::spawn(move || {
            for res in rx {
                match res {
                    Ok(FsEvent { kind: FsEventKind::Modify(_), paths, .. }) => {
                        let touched = paths
                            .iter()
                            .any(|p| p.file_name().and_then(|n| n.to_str()) == Some(SETTINGS_FILE));
                        if !touched {
                            continue;
                        }
                        match Self::load_settings(&config_dir) {
                            Ok(new_settings) => {
                                let changed = {
                                    let mut current = settings.write();
                                    let changed = *current != new_settings;
                                    *current = new_settings;
                                    changed
                                };
                                if changed {
                                    info!("Reloaded settings");
                                    event_bus.publish(Event::SettingsUpdate);
                                }
                            }
                            Err(e) => error!("Failed to reload settings: {}", e),
                        }
                    }
                    Err(e) => error!("Watch error: {}", e),
                    _ => {}
                }
            }
        });

        self._watcher = Some(watcher);
        Ok(())
    }

    /// Current settings snapshot
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Replace the settings, persist them and notify subscribers
    pub fn save_settings(&self, settings: Settings) -> ConfigResult<()> {
        if let Some(dir) = &self.config_dir {
            Self::write_settings(&dir.join(SETTINGS_FILE), &settings)?;
        }
        *self.settings.write() = settings;
        self.event_bus.publish(Event::SettingsUpdate);
        Ok(())
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }
}

/// Create a settings manager backed by `config_dir`
pub fn init_settings(
    config_dir: impl AsRef<Path>,
    event_bus: EventBus,
) -> ConfigResult<Arc<SettingsManager>> {
    Ok(Arc::new(SettingsManager::new(config_dir, event_bus)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_written_on_first_load() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::new(dir.path(), EventBus::new()).unwrap();

        assert!(dir.path().join(SETTINGS_FILE).exists());
        assert_eq!(manager.settings(), Settings::default());
    }

    #[test]
    fn test_partial_file_falls_back_to_section_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "[upstream]\nproxy = \"https://forum.example\"\n\n[download]\nauto_start = false\n",
        )
        .unwrap();

        let manager = SettingsManager::new(dir.path(), EventBus::new()).unwrap();
        let settings = manager.settings();
        assert_eq!(settings.upstream.proxy, "https://forum.example");
        assert!(!settings.download.auto_start);
        assert_eq!(settings.connection.max_attempts, 3);
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "this is = = not toml").unwrap();

        let manager = SettingsManager::new(dir.path(), EventBus::new()).unwrap();
        assert_eq!(manager.settings(), Settings::default());
        assert!(dir.path().join("settings.toml.backup").exists());
    }

    #[test]
    fn test_save_publishes_settings_update() {
        let bus = EventBus::new();
        let events = bus.subscribe();
        let manager = SettingsManager::in_memory(Settings::default(), bus);

        let mut settings = manager.settings();
        settings.upstream.proxy = "https://mirror.example".to_string();
        manager.save_settings(settings).unwrap();

        assert_eq!(manager.settings().upstream.proxy, "https://mirror.example");
        assert_eq!(events.try_recv().unwrap(), Event::SettingsUpdate);
    }

    #[test]
    fn test_worker_count_defaults_to_cores() {
        let connection = Connection::default();
        assert!(connection.worker_count() >= 1);
        let fixed = Connection { max_concurrent: 3, ..Connection::default() };
        assert_eq!(fixed.worker_count(), 3);
    }
}
