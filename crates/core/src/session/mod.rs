//! Session lifecycle: brings playback, the motion backend and the scheduler
//! up in order and tears them down in reverse, also on drop.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{
    AppConfig, DriftError, MotionInterface, MotionProvider, Pattern, PlaybackEngine, Result,
    SimulationMotion, SyncEngine, TimingMode,
};

/// What a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Steer the configured autopilot backend.
    Drift,
    /// Steer the in-process simulation.
    Simulation,
    /// Play music only; no motion commands.
    AudioOnly,
}

impl SessionMode {
    /// Applies the `development.simulation_only` safety toggle.
    pub fn resolve(self, config: &AppConfig) -> Self {
        if self == Self::Drift && config.development.simulation_only {
            tracing::warn!("forcing simulation mode due to safety configuration");
            Self::Simulation
        } else {
            self
        }
    }

    pub fn drives_motion(self) -> bool {
        !matches!(self, Self::AudioOnly)
    }
}

impl FromStr for SessionMode {
    type Err = DriftError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "drift" => Ok(Self::Drift),
            "simulation" => Ok(Self::Simulation),
            "audio-only" => Ok(Self::AudioOnly),
            other => Err(DriftError::Config(format!("unknown session mode `{other}`"))),
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drift => "drift",
            Self::Simulation => "simulation",
            Self::AudioOnly => "audio-only",
        })
    }
}

/// A running session. Dropping it stops everything it started.
pub struct Session {
    mode: SessionMode,
    pattern: Arc<Pattern>,
    playback: PlaybackEngine,
    motion: Option<Arc<dyn MotionInterface>>,
    engine: Option<SyncEngine>,
    stopped: bool,
}

impl Session {
    /// Starts a session in `mode` (already resolved against the safety
    /// toggle). Structural failures abort startup after undoing whatever had
    /// already been started.
    pub fn start(config: &AppConfig, mode: SessionMode, pattern: Pattern) -> Result<Self> {
        let settings = config.engine_settings();
        let mut session = Self {
            mode,
            pattern: Arc::new(pattern),
            playback: PlaybackEngine::new(config.audio.tempo),
            motion: None,
            engine: None,
            stopped: false,
        };
        tracing::info!(
            mode = %mode,
            pattern = %session.pattern.name,
            steps = session.pattern.len(),
            pass_seconds = session.pattern.total_duration(),
            timing = %settings.timing_mode,
            "starting session"
        );

        if mode.drives_motion() {
            if config.autopilot.safety_mode {
                tracing::info!("autopilot safety mode enabled");
            }
            session.motion = Some(start_motion(config, mode)?);
        }

        session.playback.set_volume(config.audio.volume)?;
        let track = if session.pattern.audio_reference.is_empty() {
            config.audio.default_track.clone()
        } else {
            session.pattern.audio_reference.clone()
        };
        session.playback.load_track(&track)?;
        if let Err(err) = session.playback.play() {
            let timing_gated = settings.timing_mode == TimingMode::OnBeat || !mode.drives_motion();
            if timing_gated {
                return Err(err);
            }
            tracing::warn!(error = %err, "no beat clock, auto-advance continues without it");
        }

        if let Some(motion) = &session.motion {
            let mut engine = SyncEngine::new(
                session.pattern.clone(),
                session.playback.clock(),
                motion.clone(),
                settings,
            );
            engine.start()?;
            session.engine = Some(engine);
        }

        tracing::info!(mode = %mode, "session running");
        Ok(session)
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn engine(&self) -> Option<&SyncEngine> {
        self.engine.as_ref()
    }

    pub fn motion(&self) -> Option<&Arc<dyn MotionInterface>> {
        self.motion.as_ref()
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    /// Current beat phase of the music, `0.0` when nothing is playing.
    pub fn beat_phase(&self) -> f64 {
        self.playback.clock().phase(std::time::Instant::now())
    }

    /// Stops the scheduler, then playback, then the motion backend. Safe to
    /// call repeatedly; the first teardown error is returned after every
    /// component has been asked to stop.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let mut first_error = None;
        if let Some(engine) = self.engine.as_mut() {
            if let Err(err) = engine.stop() {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.playback.stop() {
            first_error.get_or_insert(err);
        }
        if let Some(motion) = &self.motion {
            if let Err(err) = motion.stop() {
                tracing::warn!(
                    backend = motion.name(),
                    error = %err,
                    "motion backend failed to stop"
                );
                first_error.get_or_insert(err);
            }
        }

        tracing::info!(mode = %self.mode, "session stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("pattern", &self.pattern.name)
            .field("engine", &self.engine)
            .field("stopped", &self.stopped)
            .finish()
    }
}

fn start_motion(config: &AppConfig, mode: SessionMode) -> Result<Arc<dyn MotionInterface>> {
    let max_speed = config.autopilot.max_speed;
    let requested = match mode {
        SessionMode::Drift => config.autopilot.provider,
        _ => MotionProvider::Simulation,
    };

    let backend: Arc<dyn MotionInterface> = Arc::from(requested.build(max_speed));
    match backend.start() {
        Ok(()) => Ok(backend),
        Err(DriftError::NotImplemented(what)) => {
            tracing::warn!(
                provider = backend.name(),
                "{what} is not implemented, using simulation"
            );
            let fallback: Arc<dyn MotionInterface> = Arc::new(SimulationMotion::new(max_speed));
            fallback.start()?;
            Ok(fallback)
        }
        Err(err) => Err(err),
    }
}
