//! Beat-locked scheduler.
//!
//! The engine owns one background thread that samples a [`PhaseSource`],
//! decides whether the step under the cursor fires, and forwards the step's
//! targets to a [`MotionInterface`]. The owning thread only ever starts and
//! stops it. Sleeps between iterations wait on a channel so a stop request
//! wakes the loop immediately instead of waiting out a step duration.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::{BeatSample, DriftError, MotionInterface, Pattern, PhaseSource, Result};

/// Phase below which a beat counts as "on the beat".
pub const DEFAULT_ON_BEAT_WINDOW: f64 = 0.1;

/// How steps advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingMode {
    /// Fire once per beat, at the start of the beat cycle.
    #[serde(rename = "beat")]
    OnBeat,
    /// Fire back to back, holding each step for its own duration.
    #[serde(rename = "auto")]
    AutoAdvance,
}

impl Default for TimingMode {
    fn default() -> Self {
        Self::OnBeat
    }
}

impl fmt::Display for TimingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnBeat => f.write_str("beat"),
            Self::AutoAdvance => f.write_str("auto"),
        }
    }
}

/// Tuning for the scheduler loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub timing_mode: TimingMode,
    /// Log every fired step at `info` instead of `debug`.
    pub visual_feedback: bool,
    pub on_beat_window: f64,
    /// Minimum pause after an on-beat fire.
    pub cooldown: Duration,
    /// Pause between phase samples while waiting for the beat.
    pub sample_interval: Duration,
    /// Pause between checks when the pattern has no steps.
    pub idle_interval: Duration,
    /// Upper bound on how long `stop` waits for the loop to exit.
    pub join_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timing_mode: TimingMode::default(),
            visual_feedback: true,
            on_beat_window: DEFAULT_ON_BEAT_WINDOW,
            cooldown: Duration::from_millis(200),
            sample_interval: Duration::from_millis(10),
            idle_interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Stopped => 2,
        }
    }
}

/// Flags and counters shared between the handle and the loop thread. The
/// loop is the only writer of `cursor` and the counters.
#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    running: AtomicBool,
    cancel_requested: AtomicBool,
    cursor: AtomicUsize,
    fired: AtomicU64,
    dispatch_failures: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }
}

struct Worker {
    handle: JoinHandle<()>,
    wake_tx: Sender<()>,
    done_rx: Receiver<()>,
}

/// Handle to a scheduler session.
pub struct SyncEngine {
    pattern: Arc<Pattern>,
    clock: Arc<dyn PhaseSource>,
    motion: Arc<dyn MotionInterface>,
    settings: EngineSettings,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl SyncEngine {
    /// Creates an idle engine. Nothing runs until [`SyncEngine::start`].
    pub fn new(
        pattern: Arc<Pattern>,
        clock: Arc<dyn PhaseSource>,
        motion: Arc<dyn MotionInterface>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            pattern,
            clock,
            motion,
            settings,
            shared: Arc::new(Shared::default()),
            worker: None,
        }
    }

    /// Lifecycle state as last set by `start`, `stop` or `reset`.
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the loop thread is alive. Cleared as soon as the loop exits,
    /// even when it exits by panicking.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Index of the step that fires next.
    pub fn cursor(&self) -> usize {
        self.shared.cursor.load(Ordering::Acquire)
    }

    /// Number of steps fired since the last start.
    pub fn fired(&self) -> u64 {
        self.shared.fired.load(Ordering::Acquire)
    }

    /// Number of motion commands the backend rejected.
    pub fn dispatch_failures(&self) -> u64 {
        self.shared.dispatch_failures.load(Ordering::Acquire)
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The pattern being played.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Spawns the scheduler loop. Only valid from [`EngineState::Idle`].
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != EngineState::Idle {
            return Err(DriftError::EngineState(format!(
                "cannot start sync engine while {state:?}; reset it first"
            )));
        }

        let (wake_tx, wake_rx) = bounded(1);
        let (done_tx, done_rx) = bounded::<()>(0);

        self.shared.cancel_requested.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(EngineState::Running);

        let sync_loop = SyncLoop {
            pattern: self.pattern.clone(),
            clock: self.clock.clone(),
            motion: self.motion.clone(),
            settings: self.settings.clone(),
            shared: self.shared.clone(),
            wake_rx,
            last_fired_beat: None,
            clock_available: true,
        };

        let spawned = thread::Builder::new()
            .name("drift-sync".to_string())
            .spawn(move || {
                let _exit = LoopExit {
                    shared: sync_loop.shared.clone(),
                    _done: done_tx,
                };
                sync_loop.run();
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_state(EngineState::Stopped);
                return Err(err.into());
            }
        };

        tracing::info!(
            mode = %self.settings.timing_mode,
            pattern = %self.pattern.name,
            steps = self.pattern.len(),
            "sync engine running"
        );

        self.worker = Some(Worker {
            handle,
            wake_tx,
            done_rx,
        });
        Ok(())
    }

    /// Requests cancellation and waits, bounded by the join timeout, for the
    /// loop to finish its current iteration. Calling it again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.cancel_requested.store(true, Ordering::Release);

        let Some(worker) = self.worker.take() else {
            if self.state() == EngineState::Running {
                self.shared.set_state(EngineState::Stopped);
            }
            return Ok(());
        };

        let _ = worker.wake_tx.try_send(());
        let outcome = match worker.done_rx.recv_timeout(self.settings.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(
                    timeout_ms = self.settings.join_timeout.as_millis() as u64,
                    "sync loop did not exit in time, detaching it"
                );
                Err(DriftError::EngineState(
                    "sync loop did not stop within the join timeout".to_string(),
                ))
            }
            _ => {
                if worker.handle.join().is_err() {
                    tracing::error!("sync loop panicked");
                }
                Ok(())
            }
        };

        self.shared.running.store(false, Ordering::Release);
        self.shared.set_state(EngineState::Stopped);
        tracing::info!(
            fired = self.fired(),
            dispatch_failures = self.dispatch_failures(),
            "sync engine stopped"
        );
        outcome
    }

    /// Returns a stopped engine to [`EngineState::Idle`] with the cursor at
    /// the first step.
    pub fn reset(&mut self) -> Result<()> {
        if self.state() == EngineState::Running {
            return Err(DriftError::EngineState(
                "cannot reset a running sync engine".to_string(),
            ));
        }
        self.shared.cursor.store(0, Ordering::Release);
        self.shared.fired.store(0, Ordering::Release);
        self.shared.dispatch_failures.store(0, Ordering::Release);
        self.shared.cancel_requested.store(false, Ordering::Release);
        self.shared.set_state(EngineState::Idle);
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("pattern", &self.pattern.name)
            .field("motion", &self.motion.name())
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .finish()
    }
}

/// Dropped when the loop thread ends, including by unwinding. Clears
/// `running` and disconnects the done channel `stop` waits on.
struct LoopExit {
    shared: Arc<Shared>,
    _done: Sender<()>,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

/// Identity of a beat cycle: clock generation, then beat index.
type BeatKey = (u64, u64);

struct SyncLoop {
    pattern: Arc<Pattern>,
    clock: Arc<dyn PhaseSource>,
    motion: Arc<dyn MotionInterface>,
    settings: EngineSettings,
    shared: Arc<Shared>,
    wake_rx: Receiver<()>,
    last_fired_beat: Option<BeatKey>,
    clock_available: bool,
}

impl SyncLoop {
    fn run(mut self) {
        tracing::debug!("sync loop started");
        while !self.shared.cancelled() {
            let pause = self.iterate();
            if self.pause(pause) {
                break;
            }
        }
        tracing::debug!("sync loop exited");
    }

    /// Sleeps for `duration` unless woken. Returns `true` when the loop
    /// should exit.
    fn pause(&self, duration: Duration) -> bool {
        match self.wake_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.shared.cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Runs one iteration and returns how long to wait before the next.
    fn iterate(&mut self) -> Duration {
        if self.pattern.is_empty() {
            return self.settings.idle_interval;
        }

        let sample = self.observe_clock();
        let phase = sample.map(|s| s.phase).unwrap_or(0.0);

        match self.settings.timing_mode {
            TimingMode::OnBeat => {
                let beat = sample.map(|s| (s.generation, s.beat_index));
                // Without a clock there is no beat identity to debounce on.
                let fresh = beat.is_none() || beat != self.last_fired_beat;
                if phase < self.settings.on_beat_window && fresh {
                    self.fire(phase);
                    self.last_fired_beat = beat;
                    self.cooldown()
                } else {
                    self.settings.sample_interval
                }
            }
            TimingMode::AutoAdvance => {
                let hold = self.fire(phase);
                Duration::try_from_secs_f64(hold)
                    .unwrap_or_default()
                    .max(self.settings.sample_interval)
            }
        }
    }

    fn observe_clock(&mut self) -> Option<BeatSample> {
        let sample = self.clock.sample();
        match (self.clock_available, sample.is_some()) {
            (true, false) => tracing::warn!(
                mode = %self.settings.timing_mode,
                "beat clock unavailable, treating phase as 0"
            ),
            (false, true) => tracing::info!("beat clock available again"),
            _ => {}
        }
        self.clock_available = sample.is_some();
        sample
    }

    /// Cooldown after an on-beat fire, always longer than the on-beat window.
    fn cooldown(&self) -> Duration {
        let window = self
            .clock
            .beat_period()
            .map(|period| period.mul_f64(self.settings.on_beat_window * 2.0))
            .unwrap_or_default();
        self.settings.cooldown.max(window)
    }

    /// Dispatches the step under the cursor and advances it. Returns the
    /// step's duration in seconds.
    fn fire(&self, phase: f64) -> f64 {
        let len = self.pattern.len();
        let index = self.shared.cursor.load(Ordering::Acquire) % len;
        let step = &self.pattern.steps[index];

        if let Err(err) = self.motion.set_speed(step.target_speed) {
            self.record_failure("speed", &step.name, &err);
        }
        if let Err(err) = self.motion.set_steering(step.target_steering) {
            self.record_failure("steering", &step.name, &err);
        }

        self.shared.cursor.store((index + 1) % len, Ordering::Release);
        let fired = self.shared.fired.fetch_add(1, Ordering::AcqRel) + 1;

        if self.settings.visual_feedback {
            tracing::info!(
                step = %step.name,
                index,
                fired,
                phase,
                speed = step.target_speed,
                steering = step.target_steering,
                "step fired"
            );
        } else {
            tracing::debug!(step = %step.name, index, fired, phase, "step fired");
        }

        step.duration
    }

    fn record_failure(&self, command: &str, step: &str, err: &DriftError) {
        self.shared.dispatch_failures.fetch_add(1, Ordering::AcqRel);
        tracing::warn!(command, step, error = %err, "motion command failed, continuing");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;
    use crate::{BeatClock, PatternStep};

    #[derive(Debug, Clone, PartialEq)]
    enum Command {
        Speed(f64),
        Steering(f64),
    }

    #[derive(Default)]
    struct RecordingMotion {
        commands: Mutex<Vec<Command>>,
        reject_speed: bool,
        panic_on_speed: bool,
    }

    impl RecordingMotion {
        fn rejecting_speed() -> Self {
            Self {
                reject_speed: true,
                ..Self::default()
            }
        }

        fn panicking() -> Self {
            Self {
                panic_on_speed: true,
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<Command> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl MotionInterface for RecordingMotion {
        fn name(&self) -> &str {
            "recording"
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn set_speed(&self, speed: f64) -> Result<()> {
            if self.panic_on_speed {
                panic!("speed controller crashed");
            }
            if self.reject_speed {
                return Err(DriftError::CommandDispatch("speed link down".into()));
            }
            self.commands.lock().unwrap().push(Command::Speed(speed));
            Ok(())
        }

        fn set_steering(&self, steering: f64) -> Result<()> {
            self.commands.lock().unwrap().push(Command::Steering(steering));
            Ok(())
        }
    }

    /// Replays fixed samples, then repeats the last one.
    struct ScriptedSource {
        samples: Mutex<VecDeque<BeatSample>>,
        last: Mutex<Option<BeatSample>>,
    }

    impl ScriptedSource {
        fn new(samples: &[(u64, f64)]) -> Self {
            let samples: Vec<(u64, u64, f64)> = samples
                .iter()
                .map(|&(beat_index, phase)| (1, beat_index, phase))
                .collect();
            Self::with_generations(&samples)
        }

        fn with_generations(samples: &[(u64, u64, f64)]) -> Self {
            Self {
                samples: Mutex::new(
                    samples
                        .iter()
                        .map(|&(generation, beat_index, phase)| BeatSample {
                            phase,
                            beat_index,
                            generation,
                        })
                        .collect(),
                ),
                last: Mutex::new(None),
            }
        }

        fn exhausted(&self) -> bool {
            self.samples.lock().unwrap().is_empty()
        }
    }

    impl PhaseSource for ScriptedSource {
        fn sample(&self) -> Option<BeatSample> {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.samples.lock().unwrap().pop_front() {
                *last = Some(next);
            }
            *last
        }
    }

    fn three_steps(duration: f64) -> Arc<Pattern> {
        Arc::new(Pattern {
            name: "Triplet".to_string(),
            description: String::new(),
            audio_reference: "t.mp3".to_string(),
            steps: vec![
                PatternStep::new("a", 10.0, -0.5, duration),
                PatternStep::new("b", 11.0, 0.0, duration),
                PatternStep::new("c", 12.0, 0.5, duration),
            ],
        })
    }

    fn fast_settings(timing_mode: TimingMode) -> EngineSettings {
        EngineSettings {
            timing_mode,
            visual_feedback: false,
            on_beat_window: DEFAULT_ON_BEAT_WINDOW,
            cooldown: Duration::from_millis(1),
            sample_interval: Duration::from_millis(1),
            idle_interval: Duration::from_millis(5),
            join_timeout: Duration::from_secs(2),
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn cursor_wraps_modulo_step_count() {
        let motion = Arc::new(RecordingMotion::default());
        let mut engine = SyncEngine::new(
            three_steps(0.001),
            Arc::new(BeatClock::new()),
            motion.clone(),
            fast_settings(TimingMode::AutoAdvance),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.fired() >= 7));
        engine.stop().unwrap();

        let fired = engine.fired();
        assert_eq!(engine.cursor() as u64, fired % 3);

        let speeds: Vec<f64> = motion
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::Speed(v) => Some(v),
                Command::Steering(_) => None,
            })
            .collect();
        assert_eq!(speeds.len() as u64, fired);
        for (i, speed) in speeds.iter().enumerate() {
            assert_eq!(*speed, [10.0, 11.0, 12.0][i % 3]);
        }
    }

    #[test]
    fn commands_follow_pattern_order() {
        let motion = Arc::new(RecordingMotion::default());
        let mut engine = SyncEngine::new(
            three_steps(0.001),
            Arc::new(BeatClock::new()),
            motion.clone(),
            fast_settings(TimingMode::AutoAdvance),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.fired() >= 2));
        engine.stop().unwrap();

        let commands = motion.commands();
        assert_eq!(
            &commands[..4],
            [
                Command::Speed(10.0),
                Command::Steering(-0.5),
                Command::Speed(11.0),
                Command::Steering(0.0),
            ]
        );
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let motion = Arc::new(RecordingMotion::default());
        let mut engine = SyncEngine::new(
            three_steps(0.001),
            Arc::new(BeatClock::new()),
            motion.clone(),
            fast_settings(TimingMode::AutoAdvance),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.fired() >= 1));

        engine.stop().unwrap();
        let after_first = motion.commands().len();
        let fired = engine.fired();

        engine.stop().unwrap();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_running());
        assert_eq!(motion.commands().len(), after_first);
        assert_eq!(engine.fired(), fired);
    }

    #[test]
    fn stop_interrupts_long_step_promptly() {
        let mut engine = SyncEngine::new(
            three_steps(60.0),
            Arc::new(BeatClock::new()),
            Arc::new(RecordingMotion::default()),
            fast_settings(TimingMode::AutoAdvance),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.fired() >= 1));

        let started = Instant::now();
        engine.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.fired(), 1);
    }

    #[test]
    fn empty_pattern_never_dispatches() {
        let motion = Arc::new(RecordingMotion::default());
        let pattern = Arc::new(Pattern {
            steps: Vec::new(),
            ..Pattern::default_drift()
        });
        let mut engine = SyncEngine::new(
            pattern,
            Arc::new(BeatClock::new()),
            motion.clone(),
            fast_settings(TimingMode::OnBeat),
        );

        engine.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(engine.is_running());
        engine.stop().unwrap();

        assert!(motion.commands().is_empty());
        assert_eq!(engine.fired(), 0);
        assert_eq!(engine.cursor(), 0);
    }

    #[test]
    fn on_beat_fires_once_per_beat() {
        let source = Arc::new(ScriptedSource::new(&[
            (0, 0.01),
            (0, 0.03),
            (0, 0.05),
            (0, 0.08),
            (0, 0.40),
            (0, 0.90),
            (1, 0.00),
            (1, 0.02),
            (1, 0.06),
            (1, 0.50),
            (2, 0.70),
        ]));
        let motion = Arc::new(RecordingMotion::default());
        let mut engine = SyncEngine::new(
            three_steps(1.0),
            source.clone(),
            motion.clone(),
            fast_settings(TimingMode::OnBeat),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || source.exhausted()));
        thread::sleep(Duration::from_millis(20));
        engine.stop().unwrap();

        assert_eq!(engine.fired(), 2);
        assert_eq!(engine.cursor(), 2);
        assert_eq!(motion.commands().len(), 4);
    }

    #[test]
    fn restarted_clock_fires_on_its_first_beat() {
        // Beat 3 of the first run, then beat 3 of a restarted clock with no
        // off-beat sample in between.
        let source = Arc::new(ScriptedSource::with_generations(&[
            (1, 3, 0.01),
            (1, 3, 0.04),
            (2, 3, 0.02),
            (2, 3, 0.05),
            (2, 3, 0.60),
        ]));
        let mut engine = SyncEngine::new(
            three_steps(1.0),
            source.clone(),
            Arc::new(RecordingMotion::default()),
            fast_settings(TimingMode::OnBeat),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || source.exhausted()));
        thread::sleep(Duration::from_millis(20));
        engine.stop().unwrap();

        assert_eq!(engine.fired(), 2);
    }

    #[test]
    fn panicking_backend_clears_running() {
        let mut engine = SyncEngine::new(
            three_steps(0.001),
            Arc::new(BeatClock::new()),
            Arc::new(RecordingMotion::panicking()),
            fast_settings(TimingMode::AutoAdvance),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || !engine.is_running()));
        assert_eq!(engine.fired(), 0);

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn on_beat_ignores_samples_outside_window() {
        let source = Arc::new(ScriptedSource::new(&[(0, 0.5), (0, 0.75), (0, 0.99)]));
        let mut engine = SyncEngine::new(
            three_steps(1.0),
            source.clone(),
            Arc::new(RecordingMotion::default()),
            fast_settings(TimingMode::OnBeat),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || source.exhausted()));
        thread::sleep(Duration::from_millis(10));
        engine.stop().unwrap();

        assert_eq!(engine.fired(), 0);
    }

    #[test]
    fn inactive_clock_degrades_to_firing_every_cooldown() {
        let mut engine = SyncEngine::new(
            three_steps(1.0),
            Arc::new(BeatClock::new()),
            Arc::new(RecordingMotion::default()),
            fast_settings(TimingMode::OnBeat),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.fired() >= 3));
        engine.stop().unwrap();
    }

    #[test]
    fn dispatch_failures_do_not_stop_the_session() {
        let motion = Arc::new(RecordingMotion::rejecting_speed());
        let mut engine = SyncEngine::new(
            three_steps(0.001),
            Arc::new(BeatClock::new()),
            motion.clone(),
            fast_settings(TimingMode::AutoAdvance),
        );

        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.fired() >= 3));
        assert!(engine.is_running());
        engine.stop().unwrap();

        assert_eq!(engine.dispatch_failures(), engine.fired());
        assert!(motion
            .commands()
            .iter()
            .all(|c| matches!(c, Command::Steering(_))));
    }

    #[test]
    fn restart_requires_reset() {
        let mut engine = SyncEngine::new(
            three_steps(0.001),
            Arc::new(BeatClock::new()),
            Arc::new(RecordingMotion::default()),
            fast_settings(TimingMode::AutoAdvance),
        );

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(DriftError::EngineState(_))));
        engine.stop().unwrap();
        assert!(matches!(engine.start(), Err(DriftError::EngineState(_))));

        engine.reset().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.cursor(), 0);
        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.fired() >= 1));
        engine.stop().unwrap();
    }

    #[test]
    fn stop_before_start_keeps_engine_idle() {
        let mut engine = SyncEngine::new(
            three_steps(1.0),
            Arc::new(BeatClock::new()),
            Arc::new(RecordingMotion::default()),
            EngineSettings::default(),
        );
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn timing_modes_use_config_names() {
        let mode: TimingMode = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(mode, TimingMode::AutoAdvance);
        assert_eq!(TimingMode::OnBeat.to_string(), "beat");
    }
}
