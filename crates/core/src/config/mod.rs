//! Configuration for a drift session.
//!
//! Settings live in a TOML document with one table per subsystem. Besides
//! the typed view, the raw document is kept so any value can be read by its
//! dotted path (`sync.pattern_timing`), and `key=value` overrides can be
//! applied before the typed view is decoded.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::audio::DEFAULT_TEMPO_BPM;
use crate::engine::{EngineSettings, TimingMode, DEFAULT_ON_BEAT_WINDOW};
use crate::motion::{MotionProvider, DEFAULT_MAX_SPEED};
use crate::pattern::{DEFAULT_AUDIO_REFERENCE, DEFAULT_PATTERN_DIR};
use crate::{DriftError, Result};

/// Location the binary reads when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub autopilot: AutopilotConfig,
    pub sync: SyncConfig,
    pub development: DevelopmentConfig,
    pub safety: SafetyConfig,
    pub patterns: PatternConfig,
    pub logging: LoggingConfig,
    #[serde(skip)]
    raw: Table,
}

impl AppConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Self::with_overrides(contents.parse::<Table>()?, &[])
    }

    /// Reads `path`, applying `overrides` (`dotted.key=value`) on top.
    pub fn load(path: &Path, overrides: &[String]) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DriftError::Config(format!("cannot read `{}`: {err}", path.display()))
        })?;
        let raw = contents.parse::<Table>()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Self::with_overrides(raw, overrides)
    }

    /// Like [`AppConfig::load`], but a missing file yields the built-in
    /// defaults. Used for the implicit default path only.
    pub fn load_or_default(path: &Path, overrides: &[String]) -> Result<Self> {
        match fs::metadata(path) {
            Ok(_) => Self::load(path, overrides),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                Self::with_overrides(Table::new(), overrides)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn with_overrides(mut raw: Table, overrides: &[String]) -> Result<Self> {
        for entry in overrides {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                DriftError::Config(format!("override `{entry}` must look like key=value"))
            })?;
            set_path(&mut raw, key.trim(), parse_override(value.trim()))?;
        }
        let mut config: AppConfig = Value::Table(raw.clone()).try_into()?;
        config.raw = raw;
        Ok(config)
    }

    /// Looks up a value by dotted path in the source document.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.raw.get(segments.next()?)?;
        for segment in segments {
            current = current.as_table()?.get(segment)?;
        }
        Some(current)
    }

    /// Scheduler settings derived from the `sync` table.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings::from(&self.sync)
    }
}

fn parse_override(value: &str) -> Value {
    // Anything that is not a TOML literal is taken as a bare string.
    format!("v = {value}")
        .parse::<Table>()
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| Value::String(value.to_string()))
}

fn set_path(root: &mut Table, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(DriftError::Config(format!("invalid configuration key `{path}`")));
    }
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| DriftError::Config("empty configuration key".to_string()))?;

    let mut table = root;
    for segment in parents {
        let entry = table
            .entry(segment.to_string())
            .or_insert(Value::Table(Table::new()));
        table = entry.as_table_mut().ok_or_else(|| {
            DriftError::Config(format!("`{segment}` in `{path}` is not a table"))
        })?;
    }
    table.insert(last.to_string(), value);
    Ok(())
}

/// Music playback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Tempo seed handed to the beat clock.
    pub tempo: f64,
    pub volume: f32,
    pub default_track: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            tempo: DEFAULT_TEMPO_BPM,
            volume: 0.7,
            default_track: DEFAULT_AUDIO_REFERENCE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub provider: MotionProvider,
    pub max_speed: f64,
    pub safety_mode: bool,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            provider: MotionProvider::Simulation,
            max_speed: DEFAULT_MAX_SPEED,
            safety_mode: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub pattern_timing: TimingMode,
    pub visual_feedback: bool,
    pub on_beat_window: f64,
    pub cooldown_ms: u64,
    pub sample_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pattern_timing: TimingMode::OnBeat,
            visual_feedback: true,
            on_beat_window: DEFAULT_ON_BEAT_WINDOW,
            cooldown_ms: 200,
            sample_interval_ms: 10,
            idle_interval_ms: 1_000,
            join_timeout_ms: 2_000,
        }
    }
}

impl From<&SyncConfig> for EngineSettings {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            timing_mode: sync.pattern_timing,
            visual_feedback: sync.visual_feedback,
            on_beat_window: sync.on_beat_window.clamp(0.0, 1.0),
            cooldown: Duration::from_millis(sync.cooldown_ms),
            // A zero interval would spin the loop.
            sample_interval: Duration::from_millis(sync.sample_interval_ms.max(1)),
            idle_interval: Duration::from_millis(sync.idle_interval_ms.max(1)),
            join_timeout: Duration::from_millis(sync.join_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevelopmentConfig {
    /// Refuse to drive a real vehicle, whatever mode is requested.
    pub simulation_only: bool,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            simulation_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Pause between the safety warning and the first motion command.
    pub warning_delay_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            warning_delay_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub directory: String,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            directory: DEFAULT_PATTERN_DIR.to_string(),
        }
    }
}

/// How often the session log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG` and `--debug`.
    pub level: String,
    /// Session log written next to the console output. Empty disables it.
    pub file: String,
    pub rotation: LogRotation,
    /// Rolled-over files kept besides the current one.
    pub backup_count: usize,
}

impl LoggingConfig {
    /// The log file path, `None` when file logging is off.
    pub fn file_path(&self) -> Option<&Path> {
        let file = self.file.trim();
        (!file.is_empty()).then(|| Path::new(file))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "logs/drift-sync.log".to_string(),
            rotation: LogRotation::Daily,
            backup_count: 5,
        }
    }
}
