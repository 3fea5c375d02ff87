//! Core library for the Drift Sync application.
//!
//! Drift Sync plays a drift choreography in time with music. A
//! [`PatternStore`] resolves the choreography, a [`BeatClock`] turns the
//! track's tempo into a beat phase, and the [`SyncEngine`] walks the pattern
//! on a background thread, sending each step to a [`MotionInterface`]
//! backend. [`Session`] wires these together and guarantees teardown.

pub mod audio;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod motion;
pub mod pattern;
pub mod session;

pub use audio::PlaybackEngine;
pub use clock::{BeatClock, BeatSample, PhaseSource};
pub use config::{AppConfig, AudioConfig, LogRotation, LoggingConfig, SyncConfig};
pub use engine::{EngineSettings, EngineState, SyncEngine, TimingMode};
pub use error::{DriftError, Result};
pub use motion::{MotionInterface, MotionProvider, MotionReading, SimulationMotion, VendorMotion};
pub use pattern::{Pattern, PatternStep, PatternStore};
pub use session::{Session, SessionMode};
