use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::{DriftError, Result};

/// Speed ceiling applied by the simulation backend when none is configured.
pub const DEFAULT_MAX_SPEED: f64 = 25.0;

/// Capability the scheduler drives. Implementations clamp out-of-range
/// targets themselves and only fail when the underlying system is
/// unavailable.
pub trait MotionInterface: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Sets the target speed. Negative values clamp to zero and values above
    /// the backend's ceiling clamp to that ceiling.
    fn set_speed(&self, speed: f64) -> Result<()>;

    /// Sets the target steering, clamped to `[-1, 1]`.
    fn set_steering(&self, steering: f64) -> Result<()>;
}

/// Which backend the `autopilot.provider` setting selects. Unknown names in
/// a configuration file decode to [`MotionProvider::Simulation`] with a
/// warning; [`FromStr`] stays strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum MotionProvider {
    Simulation,
    Tesla,
    Comma,
}

impl Default for MotionProvider {
    fn default() -> Self {
        Self::Simulation
    }
}

impl FromStr for MotionProvider {
    type Err = DriftError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "simulation" => Ok(Self::Simulation),
            "tesla" => Ok(Self::Tesla),
            "comma" => Ok(Self::Comma),
            other => Err(DriftError::Config(format!(
                "unknown autopilot provider `{other}`"
            ))),
        }
    }
}

impl From<String> for MotionProvider {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(provider = %value, "unknown autopilot provider, using simulation");
            Self::Simulation
        })
    }
}

impl MotionProvider {
    /// Builds the backend for this provider.
    pub fn build(self, max_speed: f64) -> Box<dyn MotionInterface> {
        match self {
            Self::Simulation => Box::new(SimulationMotion::new(max_speed)),
            Self::Tesla => Box::new(VendorMotion::new("tesla")),
            Self::Comma => Box::new(VendorMotion::new("comma")),
        }
    }
}

/// Last values accepted by the simulation backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionReading {
    pub speed: f64,
    pub steering: f64,
}

#[derive(Debug, Default)]
struct SimulationState {
    active: bool,
    reading: MotionReading,
}

/// In-process vehicle model for development and dry runs.
#[derive(Debug)]
pub struct SimulationMotion {
    max_speed: f64,
    state: Mutex<SimulationState>,
}

impl SimulationMotion {
    /// Creates a stopped simulation that caps speed at `max_speed`.
    pub fn new(max_speed: f64) -> Self {
        Self {
            max_speed: max_speed.max(0.0),
            state: Mutex::new(SimulationState::default()),
        }
    }

    /// Speed ceiling applied to every `set_speed`.
    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    /// Whether the simulation accepts commands.
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Last clamped speed and steering, zeroed by `stop`.
    pub fn reading(&self) -> MotionReading {
        self.lock().reading
    }

    fn lock(&self) -> MutexGuard<'_, SimulationState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active_state(&self) -> Result<MutexGuard<'_, SimulationState>> {
        let state = self.lock();
        if state.active {
            Ok(state)
        } else {
            Err(DriftError::CommandDispatch(
                "simulation autopilot is not running".to_string(),
            ))
        }
    }
}

impl Default for SimulationMotion {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SPEED)
    }
}

impl MotionInterface for SimulationMotion {
    fn name(&self) -> &str {
        "simulation"
    }

    fn start(&self) -> Result<()> {
        tracing::info!(max_speed = self.max_speed, "starting simulation autopilot");
        self.lock().active = true;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        tracing::info!("stopping simulation autopilot");
        let mut state = self.lock();
        state.active = false;
        state.reading = MotionReading::default();
        Ok(())
    }

    fn set_speed(&self, speed: f64) -> Result<()> {
        let mut state = self.active_state()?;
        let speed = if speed.is_nan() { 0.0 } else { speed };
        state.reading.speed = speed.clamp(0.0, self.max_speed);
        tracing::debug!(speed = state.reading.speed, "simulation speed");
        Ok(())
    }

    fn set_steering(&self, steering: f64) -> Result<()> {
        let mut state = self.active_state()?;
        let steering = if steering.is_nan() { 0.0 } else { steering };
        state.reading.steering = steering.clamp(-1.0, 1.0);
        tracing::debug!(steering = state.reading.steering, "simulation steering");
        Ok(())
    }
}

/// Placeholder for third-party driving stacks. Every operation reports that
/// the integration does not exist yet.
#[derive(Debug, Clone)]
pub struct VendorMotion {
    vendor: &'static str,
}

impl VendorMotion {
    pub fn new(vendor: &'static str) -> Self {
        Self { vendor }
    }

    fn unsupported<T>(&self) -> Result<T> {
        Err(DriftError::NotImplemented(format!(
            "{} autopilot integration",
            self.vendor
        )))
    }
}

impl MotionInterface for VendorMotion {
    fn name(&self) -> &str {
        self.vendor
    }

    fn start(&self) -> Result<()> {
        self.unsupported()
    }

    fn stop(&self) -> Result<()> {
        self.unsupported()
    }

    fn set_speed(&self, _speed: f64) -> Result<()> {
        self.unsupported()
    }

    fn set_steering(&self, _steering: f64) -> Result<()> {
        self.unsupported()
    }
}
