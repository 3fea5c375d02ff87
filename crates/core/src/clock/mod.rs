use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::{DriftError, Result};

/// Tempo range most drift tracks fall into. Documented only; the clock
/// accepts any positive tempo.
pub const TYPICAL_TEMPO_RANGE: RangeInclusive<f64> = 60.0..=200.0;

/// A single reading of the beat signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatSample {
    /// Normalised position within the current beat, in `[0, 1)`.
    pub phase: f64,
    /// Ordinal of the beat cycle since the clock epoch.
    pub beat_index: u64,
    /// Bumped every time the clock is (re)started. Beat indices from
    /// different generations are unrelated.
    pub generation: u64,
}

/// Anything the scheduler can read beat timing from.
///
/// Returning `None` means there is no timing signal at all, which callers
/// must not confuse with being on the beat.
pub trait PhaseSource: Send + Sync {
    fn sample(&self) -> Option<BeatSample>;

    /// Length of one beat, when known.
    fn beat_period(&self) -> Option<Duration> {
        None
    }
}

/// Seconds per beat for the given tempo.
pub fn beat_period_secs(tempo_bpm: f64) -> f64 {
    60.0 / tempo_bpm
}

/// Phase within the beat after `elapsed_secs` at `tempo_bpm`.
pub fn phase_at(elapsed_secs: f64, tempo_bpm: f64) -> f64 {
    sample_at(elapsed_secs, tempo_bpm).phase
}

fn sample_at(elapsed_secs: f64, tempo_bpm: f64) -> BeatSample {
    let period = beat_period_secs(tempo_bpm);
    let elapsed = elapsed_secs.max(0.0);
    let beats = elapsed / period;
    let beat_index = beats.floor();
    let mut phase = beats - beat_index;
    // Guards against `x - floor(x)` rounding up to exactly 1.0.
    if !(0.0..1.0).contains(&phase) {
        phase = 0.0;
    }
    BeatSample {
        phase,
        beat_index: beat_index as u64,
        generation: 0,
    }
}

fn validate_tempo(tempo_bpm: f64) -> Result<f64> {
    if tempo_bpm.is_finite() && tempo_bpm > 0.0 {
        Ok(tempo_bpm)
    } else {
        Err(DriftError::InvalidTempo(tempo_bpm))
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    tempo_bpm: f64,
    epoch: Instant,
    generation: u64,
}

/// Wall-clock beat timer. Shared between the playback engine, which starts
/// and stops it, and the scheduler, which samples it.
#[derive(Debug, Default)]
pub struct BeatClock {
    timing: RwLock<Option<Timing>>,
    starts: AtomicU64,
}

impl BeatClock {
    /// Creates a stopped clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting beats at `tempo_bpm` from now.
    pub fn start(&self, tempo_bpm: f64) -> Result<()> {
        self.start_at(tempo_bpm, Instant::now())
    }

    /// Starts counting beats at `tempo_bpm` with an explicit epoch.
    pub fn start_at(&self, tempo_bpm: f64, epoch: Instant) -> Result<()> {
        let tempo_bpm = validate_tempo(tempo_bpm)?;
        if !TYPICAL_TEMPO_RANGE.contains(&tempo_bpm) {
            tracing::debug!(tempo_bpm, "tempo outside the typical range");
        }
        let generation = self.starts.fetch_add(1, Ordering::AcqRel) + 1;
        *self.write() = Some(Timing {
            tempo_bpm,
            epoch,
            generation,
        });
        Ok(())
    }

    /// Clears the epoch so the clock no longer produces a timing signal.
    pub fn stop(&self) {
        *self.write() = None;
    }

    /// Whether the clock currently produces a timing signal.
    pub fn is_active(&self) -> bool {
        self.read().is_some()
    }

    /// Tempo the clock is running at, `None` while stopped.
    pub fn tempo(&self) -> Option<f64> {
        self.read().map(|timing| timing.tempo_bpm)
    }

    /// Phase at `now`; `0.0` when inactive.
    pub fn phase(&self, now: Instant) -> f64 {
        self.sample_at(now).map(|sample| sample.phase).unwrap_or(0.0)
    }

    /// Full beat reading at `now`, `None` while stopped.
    pub fn sample_at(&self, now: Instant) -> Option<BeatSample> {
        let timing = (*self.read())?;
        let elapsed = now.saturating_duration_since(timing.epoch).as_secs_f64();
        Some(BeatSample {
            generation: timing.generation,
            ..sample_at(elapsed, timing.tempo_bpm)
        })
    }

    // The guarded value is a plain `Copy` struct, so a poisoned lock still
    // holds consistent data.
    fn read(&self) -> RwLockReadGuard<'_, Option<Timing>> {
        self.timing.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Timing>> {
        self.timing
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PhaseSource for BeatClock {
    fn sample(&self) -> Option<BeatSample> {
        self.sample_at(Instant::now())
    }

    fn beat_period(&self) -> Option<Duration> {
        self.tempo()
            .map(|tempo| Duration::from_secs_f64(beat_period_secs(tempo)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPOS: [f64; 6] = [1.0, 60.0, 93.5, 140.0, 174.0, 100_000.0];
    const TIMES: [f64; 7] = [0.0, 0.013, 0.25, 1.0, 3.7, 59.99, 1234.5];

    #[test]
    fn phase_stays_in_unit_range() {
        for tempo in TEMPOS {
            for t in TIMES {
                let phase = phase_at(t, tempo);
                assert!((0.0..1.0).contains(&phase), "tempo {tempo} t {t} -> {phase}");
            }
        }
    }

    #[test]
    fn phase_repeats_every_beat_period() {
        for tempo in TEMPOS {
            let period = beat_period_secs(tempo);
            for t in TIMES {
                let a = phase_at(t, tempo);
                let b = phase_at(t + period, tempo);
                let diff = (a - b).abs();
                // Phases near the wrap may land on either side of 0/1.
                let wrapped = diff.min(1.0 - diff);
                assert!(wrapped < 1e-6, "tempo {tempo} t {t}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn half_a_beat_is_half_phase() {
        assert!((phase_at(0.25, 120.0) - 0.5).abs() < 1e-9);
        assert_eq!(sample_at(1.25, 120.0).beat_index, 2);
    }

    #[test]
    fn rejects_non_positive_tempo() {
        let clock = BeatClock::new();
        for tempo in [0.0, -120.0, f64::NAN, f64::INFINITY] {
            let err = clock.start(tempo).unwrap_err();
            assert!(matches!(err, DriftError::InvalidTempo(_)));
        }
        assert!(!clock.is_active());
    }

    #[test]
    fn inactive_clock_reads_zero() {
        let clock = BeatClock::new();
        assert_eq!(clock.phase(Instant::now()), 0.0);
        assert!(PhaseSource::sample(&clock).is_none());
        assert!(clock.beat_period().is_none());
    }

    #[test]
    fn samples_relative_to_epoch() {
        let clock = BeatClock::new();
        let epoch = Instant::now();
        clock.start_at(60.0, epoch).unwrap();

        let sample = clock
            .sample_at(epoch + Duration::from_millis(2_500))
            .expect("clock is active");
        assert_eq!(sample.beat_index, 2);
        assert!((sample.phase - 0.5).abs() < 1e-9);
        assert_eq!(clock.beat_period(), Some(Duration::from_secs(1)));

        clock.stop();
        assert!(!clock.is_active());
    }

    #[test]
    fn restart_starts_a_new_generation() {
        let clock = BeatClock::new();
        let epoch = Instant::now();
        clock.start_at(120.0, epoch).unwrap();
        let first = clock.sample_at(epoch).unwrap();

        clock.stop();
        clock.start_at(120.0, epoch).unwrap();
        let second = clock.sample_at(epoch).unwrap();

        assert_eq!(first.beat_index, second.beat_index);
        assert!(second.generation > first.generation);
    }

    #[test]
    fn accepts_extreme_tempo() {
        let clock = BeatClock::new();
        clock.start(1_000_000.0).unwrap();
        let phase = clock.phase(Instant::now());
        assert!((0.0..1.0).contains(&phase));
    }
}
