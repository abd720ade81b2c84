use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use veil_core::DetectorMode;
use veil_engine::EngineSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("match threshold {0} outside (0, 2]")]
    InvalidThreshold(f32),
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// User-facing settings. Changing `match_threshold` or `detector_mode`
/// invalidates every evaluation made so far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub match_threshold: f32,
    pub enabled: bool,
    pub detector_mode: DetectorMode,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            enabled: true,
            detector_mode: DetectorMode::Hybrid,
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0 && self.match_threshold <= 2.0) {
            return Err(ConfigError::InvalidThreshold(self.match_threshold));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            match_threshold: self.match_threshold,
            detector_mode: self.detector_mode,
        }
    }

    /// True when moving from `other` to `self` can change a verdict.
    pub fn affects_matching(&self, other: &Configuration) -> bool {
        self.match_threshold != other.match_threshold || self.detector_mode != other.detector_mode
    }
}

/// Scheduling and timeout knobs of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTuning {
    pub batch_size: usize,
    pub debounce_ms: u64,
    pub max_debounce_latency_ms: u64,
    pub load_wait_ms: u64,
    pub detect_timeout_ms: u64,
    pub model_ready_wait_ms: u64,
    pub thorough_wait_ms: u64,
    pub hydration_idle_fallback_ms: u64,
    /// Smallest rendered or intrinsic side, in device-independent pixels, worth a detection.
    pub min_picture_size: f32,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            batch_size: 5,
            debounce_ms: 100,
            max_debounce_latency_ms: 1_000,
            load_wait_ms: 5_000,
            detect_timeout_ms: 15_000,
            model_ready_wait_ms: 10_000,
            thorough_wait_ms: 5_000,
            hydration_idle_fallback_ms: 1_500,
            min_picture_size: 30.0,
        }
    }
}

impl PipelineTuning {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_debounce_latency(&self) -> Duration {
        Duration::from_millis(self.max_debounce_latency_ms)
    }

    pub fn load_wait(&self) -> Duration {
        Duration::from_millis(self.load_wait_ms)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }

    pub fn model_ready_wait(&self) -> Duration {
        Duration::from_millis(self.model_ready_wait_ms)
    }

    pub fn thorough_wait(&self) -> Duration {
        Duration::from_millis(self.thorough_wait_ms)
    }

    pub fn hydration_idle_fallback(&self) -> Duration {
        Duration::from_millis(self.hydration_idle_fallback_ms)
    }
}

/// On-disk layout of the settings file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SettingsFile {
    settings: Configuration,
    pipeline: PipelineTuning,
}

/// Configuration source: current value, change notifications, persistence.
pub struct ConfigStore {
    path: Option<PathBuf>,
    tx: watch::Sender<Configuration>,
    tuning: PipelineTuning,
}

impl ConfigStore {
    /// In-memory store with no backing file.
    pub fn new(config: Configuration, tuning: PipelineTuning) -> Self {
        let (tx, _) = watch::channel(config);
        Self {
            path: None,
            tx,
            tuning,
        }
    }

    /// Load from a TOML file (missing file means defaults), then apply `VEIL_*` overrides.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<SettingsFile>(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsFile::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        let (config, tuning) = apply_env(file.settings, file.pipeline);
        config.validate()?;
        if tuning.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        tracing::debug!(path = %path.display(), ?config, "settings loaded");
        let (tx, _) = watch::channel(config);
        Ok(Self {
            path: Some(path),
            tx,
            tuning,
        })
    }

    /// Defaults plus `VEIL_*` overrides, without a backing file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let (config, tuning) = apply_env(Configuration::default(), PipelineTuning::default());
        config.validate()?;
        if tuning.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(Self::new(config, tuning))
    }

    pub fn get(&self) -> Configuration {
        *self.tx.borrow()
    }

    pub fn tuning(&self) -> &PipelineTuning {
        &self.tuning
    }

    pub fn subscribe(&self) -> watch::Receiver<Configuration> {
        self.tx.subscribe()
    }

    /// Replace the configuration, notify subscribers, and persist if file-backed.
    pub fn update(&self, config: Configuration) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(path) = &self.path {
            self.persist(path, config)?;
        }
        self.tx.send_replace(config);
        tracing::info!(
            threshold = config.match_threshold,
            enabled = config.enabled,
            mode = %config.detector_mode,
            "configuration updated"
        );
        Ok(())
    }

    fn persist(&self, path: &Path, config: Configuration) -> Result<(), ConfigError> {
        let file = SettingsFile {
            settings: config,
            pipeline: self.tuning.clone(),
        };
        let text = toml::to_string_pretty(&file)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn apply_env(mut config: Configuration, mut tuning: PipelineTuning) -> (Configuration, PipelineTuning) {
    config.match_threshold = env_f32("VEIL_MATCH_THRESHOLD", config.match_threshold);
    config.enabled = std::env::var("VEIL_ENABLED")
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(config.enabled);
    config.detector_mode = std::env::var("VEIL_DETECTOR_MODE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.detector_mode);
    tuning.batch_size = env_usize("VEIL_BATCH_SIZE", tuning.batch_size);
    tuning.detect_timeout_ms = env_u64("VEIL_DETECT_TIMEOUT_MS", tuning.detect_timeout_ms);
    (config, tuning)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.match_threshold, 0.6);
        assert!(config.enabled);
        assert_eq!(config.detector_mode, DetectorMode::Hybrid);
        assert_eq!(PipelineTuning::default().batch_size, 5);
        assert_eq!(PipelineTuning::default().debounce(), Duration::from_millis(100));
    }

    #[test]
    fn test_threshold_bounds() {
        for bad in [0.0, -0.1, 2.5, f32::NAN] {
            let config = Configuration {
                match_threshold: bad,
                ..Configuration::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::InvalidThreshold(_))));
        }
        let edge = Configuration {
            match_threshold: 2.0,
            ..Configuration::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_affects_matching_ignores_enabled() {
        let base = Configuration::default();
        let disabled = Configuration { enabled: false, ..base };
        let stricter = Configuration { match_threshold: 0.4, ..base };
        let fast = Configuration { detector_mode: DetectorMode::Fast, ..base };
        assert!(!disabled.affects_matching(&base));
        assert!(stricter.affects_matching(&base));
        assert!(fast.affects_matching(&base));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[settings]\nmatch_threshold = 0.45\n\n[pipeline]\nbatch_size = 3\n").unwrap();

        let file: SettingsFile = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file.settings.match_threshold, 0.45);
        assert!(file.settings.enabled);
        assert_eq!(file.pipeline.batch_size, 3);
        assert_eq!(file.pipeline.debounce_ms, 100);
    }

    #[test]
    fn test_update_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let store = ConfigStore {
            path: Some(path.clone()),
            tx: watch::channel(Configuration::default()).0,
            tuning: PipelineTuning::default(),
        };
        let mut rx = store.subscribe();

        let next = Configuration {
            match_threshold: 0.5,
            detector_mode: DetectorMode::Thorough,
            ..Configuration::default()
        };
        store.update(next).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), next);
        let saved: SettingsFile = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.settings, next);
    }

    #[test]
    fn test_update_rejects_invalid_threshold() {
        let store = ConfigStore::new(Configuration::default(), PipelineTuning::default());
        let bad = Configuration {
            match_threshold: 3.0,
            ..Configuration::default()
        };
        assert!(store.update(bad).is_err());
        assert_eq!(store.get(), Configuration::default());
    }
}
