use std::sync::{Arc, Mutex, MutexGuard};

use crate::{BeatClock, DriftError, Result};

/// Tempo assumed for a track when nothing better is known.
pub const DEFAULT_TEMPO_BPM: f64 = 150.0;

#[derive(Debug, Default)]
struct PlaybackState {
    track: Option<String>,
    playing: bool,
    volume: f32,
}

/// Stand-in for the music player. It does not decode audio; it tracks which
/// track is loaded and keeps the shared [`BeatClock`] running while "playing".
#[derive(Debug)]
pub struct PlaybackEngine {
    tempo_bpm: f64,
    clock: Arc<BeatClock>,
    state: Mutex<PlaybackState>,
}

impl PlaybackEngine {
    /// Creates a player whose tracks all run at `tempo_bpm`.
    pub fn new(tempo_bpm: f64) -> Self {
        Self {
            tempo_bpm,
            clock: Arc::new(BeatClock::new()),
            state: Mutex::new(PlaybackState {
                volume: 0.7,
                ..PlaybackState::default()
            }),
        }
    }

    /// Returns the beat clock this player drives.
    pub fn clock(&self) -> Arc<BeatClock> {
        self.clock.clone()
    }

    pub fn tempo(&self) -> f64 {
        self.tempo_bpm
    }

    /// Loads an opaque track reference and reports the tempo it will play at.
    pub fn load_track(&self, reference: &str) -> Result<f64> {
        if reference.trim().is_empty() {
            return Err(DriftError::Config("track reference is empty".to_string()));
        }
        let mut state = self.lock()?;
        state.track = Some(reference.to_string());
        tracing::info!(track = reference, tempo_bpm = self.tempo_bpm, "loaded track");
        Ok(self.tempo_bpm)
    }

    pub fn track(&self) -> Result<Option<String>> {
        Ok(self.lock()?.track.clone())
    }

    /// Starts playback and the beat clock. Fails with
    /// [`DriftError::InvalidTempo`] when the configured tempo is unusable.
    pub fn play(&self) -> Result<()> {
        let mut state = self.lock()?;
        let Some(track) = state.track.clone() else {
            tracing::warn!("play requested with no track loaded");
            return Ok(());
        };
        self.clock.start(self.tempo_bpm)?;
        state.playing = true;
        tracing::info!(track = %track, "playing");
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.playing = false;
        self.clock.stop();
        tracing::info!("paused playback");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.playing {
            tracing::info!("stopping playback");
        }
        state.playing = false;
        self.clock.stop();
        Ok(())
    }

    pub fn is_playing(&self) -> Result<bool> {
        Ok(self.lock()?.playing)
    }

    /// Sets the volume, clamped to `[0, 1]`.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let mut state = self.lock()?;
        state.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        tracing::debug!(volume = state.volume, "volume set");
        Ok(())
    }

    pub fn volume(&self) -> Result<f32> {
        Ok(self.lock()?.volume)
    }

    fn lock(&self) -> Result<MutexGuard<'_, PlaybackState>> {
        self.state
            .lock()
            .map_err(|_| DriftError::EngineState("playback state has been poisoned".to_string()))
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPO_BPM)
    }
}
