use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DriftError, Result};

/// Track used when a pattern does not name one.
pub const DEFAULT_AUDIO_REFERENCE: &str = "music/default_phonk.mp3";

/// Directory patterns are looked up in when none is configured.
pub const DEFAULT_PATTERN_DIR: &str = "patterns";

/// One timed motion instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStep {
    pub name: String,
    #[serde(rename = "speed")]
    pub target_speed: f64,
    #[serde(rename = "steering")]
    pub target_steering: f64,
    /// Seconds the step holds before the next one in auto-advance mode.
    pub duration: f64,
}

impl PatternStep {
    pub fn new(
        name: impl Into<String>,
        target_speed: f64,
        target_steering: f64,
        duration: f64,
    ) -> Self {
        Self {
            name: name.into(),
            target_speed,
            target_steering,
            duration,
        }
    }
}

/// An ordered drift choreography.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        rename = "music_file",
        alias = "audio_reference",
        default = "default_audio_reference"
    )]
    pub audio_reference: String,
    pub steps: Vec<PatternStep>,
}

fn default_audio_reference() -> String {
    DEFAULT_AUDIO_REFERENCE.to_string()
}

impl Pattern {
    /// The built-in pattern used whenever no pattern file exists.
    pub fn default_drift() -> Self {
        Self {
            name: "Basic Drift".to_string(),
            description: "Simple drift pattern for demonstration".to_string(),
            audio_reference: default_audio_reference(),
            steps: vec![
                PatternStep::new("Straight", 20.0, 0.0, 3.0),
                PatternStep::new("Left Drift", 15.0, -0.7, 2.0),
                PatternStep::new("Recover", 18.0, 0.3, 1.5),
                PatternStep::new("Right Drift", 15.0, 0.7, 2.0),
                PatternStep::new("Recover", 18.0, -0.3, 1.5),
            ],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Sum of the declared step durations, i.e. one auto-advance pass.
    pub fn total_duration(&self) -> f64 {
        self.steps.iter().map(|step| step.duration).sum()
    }

    fn validate(mut self, path: &Path) -> Result<Self> {
        for (index, step) in self.steps.iter_mut().enumerate() {
            if !(step.duration.is_finite() && step.duration > 0.0) {
                return Err(DriftError::pattern_parse(
                    path,
                    format!(
                        "step {index} (`{}`) has non-positive duration {}",
                        step.name, step.duration
                    ),
                ));
            }
            if !(step.target_speed.is_finite() && step.target_speed >= 0.0) {
                return Err(DriftError::pattern_parse(
                    path,
                    format!(
                        "step {index} (`{}`) has invalid speed {}",
                        step.name, step.target_speed
                    ),
                ));
            }
            if step.target_steering.is_nan() {
                return Err(DriftError::pattern_parse(
                    path,
                    format!("step {index} (`{}`) has invalid steering", step.name),
                ));
            }
            let clamped = step.target_steering.clamp(-1.0, 1.0);
            if clamped != step.target_steering {
                tracing::warn!(
                    step = %step.name,
                    steering = step.target_steering,
                    clamped,
                    "steering outside [-1, 1], clamping"
                );
                step.target_steering = clamped;
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternFormat {
    Json,
    Toml,
    Yaml,
}

impl PatternFormat {
    /// Extensions tried for a bare identifier, in lookup order.
    const EXTENSIONS: [&'static str; 4] = ["json", "toml", "yaml", "yml"];

    fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("toml") => Self::Toml,
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Json,
        }
    }

    fn parse(self, path: &Path, contents: &str) -> Result<Pattern> {
        match self {
            Self::Json => {
                serde_json::from_str(contents).map_err(|err| DriftError::pattern_parse(path, err))
            }
            Self::Toml => {
                toml::from_str(contents).map_err(|err| DriftError::pattern_parse(path, err))
            }
            Self::Yaml => {
                serde_yaml::from_str(contents).map_err(|err| DriftError::pattern_parse(path, err))
            }
        }
    }
}

/// Resolves pattern identifiers to validated patterns.
#[derive(Debug, Clone)]
pub struct PatternStore {
    root: PathBuf,
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new(DEFAULT_PATTERN_DIR)
    }
}

impl PatternStore {
    /// Creates a store that resolves bare names under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory bare names are resolved in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate files for `identifier`, in lookup order. Identifiers that
    /// already look like a path are used as-is.
    pub fn candidates(&self, identifier: &str) -> Vec<PathBuf> {
        let as_path = Path::new(identifier);
        if as_path.extension().is_some() || as_path.components().count() > 1 {
            return vec![as_path.to_path_buf()];
        }
        PatternFormat::EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{identifier}.{ext}")))
            .collect()
    }

    /// Loads `identifier`, falling back to [`Pattern::default_drift`] when
    /// no file exists. A file that exists but does not decode is an error.
    pub fn load(&self, identifier: &str) -> Result<Pattern> {
        for path in self.candidates(identifier) {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(DriftError::pattern_parse(&path, err)),
            };
            let pattern = PatternFormat::from_path(&path)
                .parse(&path, &contents)?
                .validate(&path)?;
            tracing::info!(
                pattern = %pattern.name,
                path = %path.display(),
                steps = pattern.len(),
                "loaded pattern"
            );
            return Ok(pattern);
        }

        tracing::info!(identifier, "pattern file not found, using built-in drift pattern");
        Ok(Pattern::default_drift())
    }
}
