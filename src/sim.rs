// Ideal simulated hardware
//
// Every device is a cheap clonable handle onto shared state, so a test or the
// host loop can keep one handle to inspect and step the device while the
// drivetrain owns another.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::hardware::{AbsoluteEncoder, Gyro, HardwareError, MotorController, NeutralMode, Result};

/// Raw velocity (rotations/s) reached at full output
pub const DEFAULT_FREE_SPEED: f64 = 100.0;

/// Last command received by a simulated motor, in raw units
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimCommand {
    PercentOutput(f64),
    Voltage(f64),
    Velocity { raw: f64, feed_forward: f64 },
    Position { raw: f64, feed_forward: f64 },
}

#[derive(Debug)]
struct SimMotorState {
    free_speed: f64,
    nominal_voltage: f64,
    output: f64,
    raw_position: f64,
    raw_velocity: f64,
    holding_position: bool,
    last_command: Option<SimCommand>,
    dispatches: usize,
    neutral_mode: NeutralMode,
    inverted: bool,
    fault: Option<String>,
}

/// Motor that reaches any commanded velocity or position instantly
#[derive(Debug, Clone)]
pub struct SimMotor {
    state: Arc<Mutex<SimMotorState>>,
}

impl Default for SimMotor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMotor {
    pub fn new() -> Self {
        Self::with_free_speed(DEFAULT_FREE_SPEED)
    }

    pub fn with_free_speed(free_speed: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimMotorState {
                free_speed,
                nominal_voltage: 12.0,
                output: 0.0,
                raw_position: 0.0,
                raw_velocity: 0.0,
                holding_position: false,
                last_command: None,
                dispatches: 0,
                neutral_mode: NeutralMode::Coast,
                inverted: false,
                fault: None,
            })),
        }
    }

    /// Advance the shaft by `dt` seconds at the current velocity
    pub fn step(&self, dt: f64) {
        let mut state = self.state.lock();
        if !state.holding_position {
            state.raw_position += state.raw_velocity * dt;
        }
    }

    /// Number of commands written (resets and configuration excluded)
    pub fn dispatch_count(&self) -> usize {
        self.state.lock().dispatches
    }

    pub fn last_command(&self) -> Option<SimCommand> {
        self.state.lock().last_command
    }

    pub fn output(&self) -> f64 {
        self.state.lock().output
    }

    /// Raw shaft position, bypassing the controller interface
    pub fn shaft_position(&self) -> f64 {
        self.state.lock().raw_position
    }

    pub fn free_speed(&self) -> f64 {
        self.state.lock().free_speed
    }

    pub fn neutral_mode(&self) -> NeutralMode {
        self.state.lock().neutral_mode
    }

    pub fn is_inverted(&self) -> bool {
        self.state.lock().inverted
    }

    /// Make subsequent commands fail with a fault, or clear it
    pub fn set_fault(&self, reason: Option<&str>) {
        self.state.lock().fault = reason.map(str::to_owned);
    }

    fn command(&self, command: SimCommand) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.fault {
            return Err(HardwareError::Fault {
                device: "sim motor".to_owned(),
                reason: reason.clone(),
            });
        }

        match command {
            SimCommand::PercentOutput(output) => {
                state.output = output;
                state.raw_velocity = output * state.free_speed;
                state.holding_position = false;
            }
            SimCommand::Voltage(volts) => {
                state.output = (volts / state.nominal_voltage).clamp(-1.0, 1.0);
                state.raw_velocity = state.output * state.free_speed;
                state.holding_position = false;
            }
            SimCommand::Velocity { raw, .. } => {
                state.output = (raw / state.free_speed).clamp(-1.0, 1.0);
                state.raw_velocity = raw;
                state.holding_position = false;
            }
            SimCommand::Position { raw, .. } => {
                state.output = 0.0;
                state.raw_velocity = 0.0;
                state.raw_position = raw;
                state.holding_position = true;
            }
        }
        state.last_command = Some(command);
        state.dispatches += 1;
        Ok(())
    }
}

impl MotorController for SimMotor {
    fn set_percent_output(&mut self, output: f64) -> Result<()> {
        self.command(SimCommand::PercentOutput(output))
    }

    fn set_voltage(&mut self, volts: f64) -> Result<()> {
        self.command(SimCommand::Voltage(volts))
    }

    fn set_velocity(&mut self, raw_velocity: f64, feed_forward: f64) -> Result<()> {
        self.command(SimCommand::Velocity {
            raw: raw_velocity,
            feed_forward,
        })
    }

    fn set_position(&mut self, raw_position: f64, feed_forward: f64) -> Result<()> {
        self.command(SimCommand::Position {
            raw: raw_position,
            feed_forward,
        })
    }

    fn reset_raw_position(&mut self, raw_position: f64) -> Result<()> {
        self.state.lock().raw_position = raw_position;
        Ok(())
    }

    fn applied_output(&self) -> Result<f64> {
        Ok(self.output())
    }

    fn raw_position(&self) -> Result<f64> {
        Ok(self.shaft_position())
    }

    fn raw_velocity(&self) -> Result<f64> {
        Ok(self.state.lock().raw_velocity)
    }

    fn set_neutral_mode(&mut self, mode: NeutralMode) -> Result<()> {
        self.state.lock().neutral_mode = mode;
        Ok(())
    }

    fn set_inverted(&mut self, inverted: bool) -> Result<()> {
        self.state.lock().inverted = inverted;
        Ok(())
    }

    fn enable_voltage_compensation(&mut self, volts: f64) -> Result<()> {
        self.state.lock().nominal_voltage = volts;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SimGyroState {
    yaw: f64,
    pitch: f64,
    roll: f64,
}

/// Gyro whose yaw is set or integrated by the caller
#[derive(Debug, Clone, Default)]
pub struct SimGyro {
    state: Arc<Mutex<SimGyroState>>,
}

impl SimGyro {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_yaw(&self, degrees: f64) {
        self.state.lock().yaw = degrees;
    }

    pub fn set_tilt(&self, pitch: f64, roll: f64) {
        let mut state = self.state.lock();
        state.pitch = pitch;
        state.roll = roll;
    }

    /// Integrate a yaw rate (rad/s) over `dt` seconds
    pub fn step(&self, omega: f64, dt: f64) {
        self.state.lock().yaw += (omega * dt).to_degrees();
    }
}

impl Gyro for SimGyro {
    fn yaw(&self) -> Result<f64> {
        Ok(self.state.lock().yaw)
    }

    fn pitch(&self) -> Result<f64> {
        Ok(self.state.lock().pitch)
    }

    fn roll(&self) -> Result<f64> {
        Ok(self.state.lock().roll)
    }

    fn reset_to(&mut self, yaw_degrees: f64) -> Result<()> {
        self.set_yaw(yaw_degrees);
        Ok(())
    }
}

/// Absolute encoder reporting a settable angle
#[derive(Debug, Clone, Default)]
pub struct SimEncoder {
    degrees: Arc<Mutex<Option<f64>>>,
}

impl SimEncoder {
    pub fn new(degrees: f64) -> Self {
        Self {
            degrees: Arc::new(Mutex::new(Some(degrees))),
        }
    }

    pub fn set_degrees(&self, degrees: f64) {
        *self.degrees.lock() = Some(degrees);
    }

    /// Simulate a dropped sensor
    pub fn disconnect(&self) {
        *self.degrees.lock() = None;
    }
}

impl AbsoluteEncoder for SimEncoder {
    fn absolute_degrees(&self) -> Result<f64> {
        self.degrees.lock().ok_or_else(|| HardwareError::Disconnected {
            device: "sim encoder".to_owned(),
        })
    }
}
