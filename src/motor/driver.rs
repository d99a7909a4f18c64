// High-level motor handle
//
// Wraps a raw motor controller with mode dispatch, unit conversion and a
// one-entry command cache that drops writes identical to the previous one.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hardware::{HardwareError, MotorController, NeutralMode};

/// Percent output limits
pub const MAX_PERCENT_OUTPUT: f64 = 1.0;

/// Voltage command limits
pub const MAX_VOLTAGE: f64 = 12.0;

#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Motor {name}: {source}")]
    Hardware {
        name: String,
        #[source]
        source: HardwareError,
    },

    #[error("Motor {name} cannot follow itself")]
    SelfFollow { name: String },
}

pub type Result<T> = std::result::Result<T, MotorError>;

/// How a commanded value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Fraction of bus voltage in [-1, 1]
    PercentOutput,
    /// Volts in [-12, 12]
    Voltage,
    /// Mechanism units per time unit, closed loop on the controller
    Velocity,
    /// Mechanism units, closed loop on the controller
    Position,
}

/// Last dispatched (value, mode, feedforward)
#[derive(Debug, Clone, Copy)]
struct CommandCache {
    value: f64,
    mode: ControlMode,
    feed_forward: f64,
}

impl CommandCache {
    /// Bitwise comparison, so -0.0 and 0.0 are distinct commands
    fn matches(&self, value: f64, mode: ControlMode, feed_forward: f64) -> bool {
        self.value.to_bits() == value.to_bits()
            && self.mode == mode
            && self.feed_forward.to_bits() == feed_forward.to_bits()
    }
}

impl Default for CommandCache {
    fn default() -> Self {
        Self {
            value: 0.0,
            mode: ControlMode::PercentOutput,
            feed_forward: 0.0,
        }
    }
}

struct MotorInner {
    name: String,
    controller: Box<dyn MotorController>,
    cache: CommandCache,
    /// Raw units per mechanism unit
    unit_conversion: f64,
    /// Raw time base per mechanism time base
    time_conversion: f64,
}

impl MotorInner {
    fn hardware(&self, source: HardwareError) -> MotorError {
        MotorError::Hardware {
            name: self.name.clone(),
            source,
        }
    }
}

/// Shared handle to one physical motor
///
/// Clones refer to the same motor and command cache, so the control loop and
/// the follower replication task can both command it.
#[derive(Clone)]
pub struct Motor {
    inner: Arc<Mutex<MotorInner>>,
}

impl Motor {
    pub fn new(name: impl Into<String>, controller: Box<dyn MotorController>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MotorInner {
                name: name.into(),
                controller,
                cache: CommandCache::default(),
                unit_conversion: 1.0,
                time_conversion: 1.0,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    /// Whether two handles refer to the same motor
    pub fn same_motor(&self, other: &Motor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Percent output shorthand
    pub fn set_output(&self, output: f64) -> Result<bool> {
        self.set(output, ControlMode::PercentOutput, 0.0)
    }

    /// Command the motor; returns whether anything was written to hardware
    ///
    /// A command identical to the previous one (value, mode and feedforward) is
    /// dropped. The cache only advances once the controller accepts the write,
    /// so a failed write is retried on the next call.
    pub fn set(&self, value: f64, mode: ControlMode, feed_forward: f64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.cache.matches(value, mode, feed_forward) {
            return Ok(false);
        }

        let units = inner.unit_conversion;
        let time = inner.time_conversion;
        let written = match mode {
            ControlMode::PercentOutput => inner
                .controller
                .set_percent_output(value.clamp(-MAX_PERCENT_OUTPUT, MAX_PERCENT_OUTPUT)),
            ControlMode::Voltage => inner
                .controller
                .set_voltage(value.clamp(-MAX_VOLTAGE, MAX_VOLTAGE)),
            ControlMode::Velocity => inner
                .controller
                .set_velocity(value * units * time, feed_forward),
            ControlMode::Position => inner.controller.set_position(value * units, feed_forward),
        };
        written.map_err(|e| inner.hardware(e))?;

        inner.cache = CommandCache {
            value,
            mode,
            feed_forward,
        };
        Ok(true)
    }

    /// Raw units per mechanism unit (e.g. motor rotations per meter)
    pub fn set_unit_conversion(&self, factor: f64) {
        self.inner.lock().unit_conversion = factor;
    }

    /// Raw time base per mechanism time base (e.g. 60 for RPM against m/s)
    pub fn set_time_conversion(&self, factor: f64) {
        self.inner.lock().time_conversion = factor;
    }

    /// Position in mechanism units
    pub fn position(&self) -> Result<f64> {
        let inner = self.inner.lock();
        let raw = inner.controller.raw_position().map_err(|e| inner.hardware(e))?;
        Ok(raw / inner.unit_conversion)
    }

    /// Velocity in mechanism units per mechanism time base
    pub fn velocity(&self) -> Result<f64> {
        let inner = self.inner.lock();
        let raw = inner.controller.raw_velocity().map_err(|e| inner.hardware(e))?;
        Ok(raw / inner.unit_conversion / inner.time_conversion)
    }

    /// Redefine the current position in mechanism units
    pub fn reset_position(&self, units: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        let raw = units * inner.unit_conversion;
        debug!("{}: position reference reset to {:.3}", inner.name, units);
        inner
            .controller
            .reset_raw_position(raw)
            .map_err(|e| inner.hardware(e))
    }

    /// Output currently applied by the controller, in [-1, 1]
    pub fn applied_output(&self) -> Result<f64> {
        let inner = self.inner.lock();
        inner.controller.applied_output().map_err(|e| inner.hardware(e))
    }

    pub fn set_neutral_mode(&self, mode: NeutralMode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .controller
            .set_neutral_mode(mode)
            .map_err(|e| inner.hardware(e))
    }

    pub fn set_inverted(&self, inverted: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .controller
            .set_inverted(inverted)
            .map_err(|e| inner.hardware(e))
    }

    pub fn enable_voltage_compensation(&self, volts: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .controller
            .enable_voltage_compensation(volts)
            .map_err(|e| inner.hardware(e))
    }
}

impl fmt::Debug for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Motor")
            .field("name", &inner.name)
            .field("cache", &inner.cache)
            .finish()
    }
}
