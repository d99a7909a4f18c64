// Host loop: drives a simulated swerve chassis from zenoh commands
// Note: the watchdog holds the robot still if teleop stops sending commands,
// otherwise the last velocity would be held forever

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::runtime::Handle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{
    CMD_TIMEOUT, DriveConfig, LOOP_HZ, REPLICATION_PERIOD, TOPIC_CMD_DRIVE, TOPIC_HEALTH,
    TOPIC_TELEMETRY, TOPIC_VISION,
};
use crate::kinematics::{MODULE_COUNT, VelocityScrew};
use crate::messages::{DriveCommand, RuntimeHealth, VisionMeasurement};
use crate::motor::{FollowerRegistry, Motor};
use crate::sim::{SimEncoder, SimGyro, SimMotor};
use crate::swerve::{DriveError, Drivetrain, ModuleHardware, WatchObserver};

#[derive(Debug, Parser)]
#[command(name = "swerve-runtime", about = "Swerve drive control loop over zenoh")]
pub struct Args {
    /// Drivetrain configuration (JSON); built-in defaults when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Control loop frequency in Hz
    #[arg(long, default_value_t = LOOP_HZ)]
    pub loop_hz: u64,

    /// Follower replication period in milliseconds
    #[arg(long, default_value_t = REPLICATION_PERIOD.as_millis() as u64)]
    pub replication_ms: u64,

    /// Interpret commands in the robot frame unless they say otherwise
    #[arg(long)]
    pub robot_relative: bool,
}

pub struct Runtime {
    latest_cmd: Option<DriveCommand>,
    cmd_received_at: Instant,
    cmd_timeout: Duration,
    health: RuntimeHealth,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_timeout(CMD_TIMEOUT)
    }

    pub fn with_timeout(cmd_timeout: Duration) -> Self {
        Self {
            latest_cmd: None,
            cmd_received_at: Instant::now(),
            cmd_timeout,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming command
    pub fn on_command(&mut self, cmd: DriveCommand) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = Instant::now();
    }

    /// Command to apply this tick, `None` when the watchdog has tripped
    pub fn compute_command(&mut self) -> Option<DriveCommand> {
        let cmd_age = self.cmd_received_at.elapsed();

        if cmd_age > self.cmd_timeout {
            // Watchdog triggered - stop the robot
            if self.health != RuntimeHealth::CmdStale {
                warn!("Command stale ({:?} old), stopping robot", cmd_age);
            }
            self.health = RuntimeHealth::CmdStale;
            None
        } else if let Some(cmd) = self.latest_cmd {
            if self.health == RuntimeHealth::CmdStale {
                info!("Commands resumed");
            }
            self.health = RuntimeHealth::Ok;
            Some(cmd)
        } else {
            // No command ever received
            self.health = RuntimeHealth::CmdStale;
            None
        }
    }
}

/// Handles onto the simulated devices, for stepping them each tick
pub struct SimChassis {
    pub gyro: SimGyro,
    pub motors: Vec<SimMotor>,
}

impl SimChassis {
    pub fn step(&self, omega: f64, dt: f64) {
        for motor in &self.motors {
            motor.step(dt);
        }
        self.gyro.step(omega, dt);
    }
}

/// Drivetrain on simulated hardware, each drive motor paired with a follower
pub fn build_sim_drivetrain(
    config: &DriveConfig,
    registry: &FollowerRegistry,
) -> Result<(Drivetrain, SimChassis), DriveError> {
    let gyro = SimGyro::new();
    // steer, drive, drive follower
    let sims: [[SimMotor; 3]; MODULE_COUNT] =
        std::array::from_fn(|_| std::array::from_fn(|_| SimMotor::new()));

    let hardware: [ModuleHardware; MODULE_COUNT] = std::array::from_fn(|i| ModuleHardware {
        steer: Motor::new(format!("module{i}.steer"), Box::new(sims[i][0].clone())),
        drive: Motor::new(format!("module{i}.drive"), Box::new(sims[i][1].clone())),
        encoder: Box::new(SimEncoder::new(config.modules[i].absolute_offset_deg)),
    });

    for (i, module) in hardware.iter().enumerate() {
        let follower = Motor::new(
            format!("module{i}.drive_follower"),
            Box::new(sims[i][2].clone()),
        );
        follower.set_inverted(config.modules[i].drive_inverted)?;
        registry.follow(&module.drive, &follower)?;
    }

    let drivetrain = Drivetrain::new(config, Box::new(gyro.clone()), hardware)?;
    let motors = sims.into_iter().flatten().collect();
    Ok((drivetrain, SimChassis { gyro, motors }))
}

pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading drivetrain config from {}", path.display());
            DriveConfig::from_json_file(path)?
        }
        None => DriveConfig::default(),
    };
    if args.loop_hz == 0 {
        return Err("loop rate must be positive".into());
    }
    let dt = 1.0 / args.loop_hz as f64;
    config.control_period_s = dt;
    config.field_relative = !args.robot_relative;

    let registry = FollowerRegistry::new();
    let (mut drivetrain, chassis) = build_sim_drivetrain(&config, &registry)?;
    let (observer, telemetry) = WatchObserver::new();
    drivetrain.set_observer(Box::new(observer));
    let vision = drivetrain.vision_sender();

    let replication = registry.spawn(
        &Handle::current(),
        Duration::from_millis(args.replication_ms.max(1)),
    );

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_cmd = session.declare_subscriber(TOPIC_CMD_DRIVE).await?;
    let sub_vision = session.declare_subscriber(TOPIC_VISION).await?;
    let pub_telemetry = session.declare_publisher(TOPIC_TELEMETRY).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut runtime = Runtime::new();
    let mut tick = interval(Duration::from_secs_f64(dt));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout, {} motors with followers",
        args.loop_hz,
        CMD_TIMEOUT.as_millis(),
        registry.leader_count()
    );
    info!("Subscribed to: {}, {}", TOPIC_CMD_DRIVE, TOPIC_VISION);
    info!("Publishing to: {}, {}", TOPIC_TELEMETRY, TOPIC_HEALTH);

    loop {
        tick.tick().await;

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = sub_cmd.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<DriveCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Queue pose corrections, applied inside the next periodic
        while let Ok(Some(sample)) = sub_vision.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<VisionMeasurement>(&payload) {
                Ok(m) => vision.send(m.pose(), m.timestamp)?,
                Err(e) => warn!("Failed to parse vision measurement: {}", e),
            }
        }

        // 3. Drive (includes watchdog logic)
        let result = match runtime.compute_command() {
            Some(cmd) => {
                let screw = VelocityScrew::from(&cmd);
                match cmd.field_relative {
                    Some(true) => drivetrain.drive_field_relative(screw),
                    Some(false) => drivetrain.drive_robot_relative(screw),
                    None => drivetrain.drive(screw),
                }
            }
            None => drivetrain.drive_robot_relative(VelocityScrew::zero()),
        };
        if let Err(e) = result {
            warn!("Drive command failed: {}", e);
        }

        // 4. Advance the simulated hardware, then odometry
        let omega = drivetrain.robot_velocity().map(|v| v.omega).unwrap_or(0.0);
        chassis.step(omega, dt);
        if let Err(e) = drivetrain.periodic(started.elapsed().as_secs_f64()) {
            warn!("Periodic update failed: {}", e);
        }

        // 5. Publish telemetry and health
        let telemetry_json = serde_json::to_string(&*telemetry.borrow())?;
        pub_telemetry.put(telemetry_json).await?;

        let health = match runtime.health() {
            RuntimeHealth::Ok if drivetrain.health_check().contains(&false) => {
                RuntimeHealth::ModuleFault
            }
            health => health,
        };
        let health_json = serde_json::to_string(&health)?;
        pub_health.put(health_json).await?;

        if replication.is_finished() {
            return Err("follower replication task exited".into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_stale_until_first_command() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.compute_command(), None);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        let cmd = DriveCommand {
            vx: 1.0,
            ..DriveCommand::default()
        };
        runtime.on_command(cmd);
        assert_eq!(runtime.compute_command(), Some(cmd));
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_watchdog_trips_on_old_command() {
        let mut runtime = Runtime::with_timeout(Duration::from_millis(5));
        runtime.on_command(DriveCommand::default());
        assert!(runtime.compute_command().is_some());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(runtime.compute_command(), None);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_sim_drivetrain_followers_track_drive_motors() {
        let registry = FollowerRegistry::new();
        let (mut drivetrain, chassis) =
            build_sim_drivetrain(&DriveConfig::default(), &registry).unwrap();
        assert_eq!(registry.leader_count(), MODULE_COUNT);

        drivetrain
            .drive_robot_relative(VelocityScrew::new(1.0, 0.0, 0.0))
            .unwrap();
        registry.replicate_once();

        // Motors are pushed as steer, drive, follower per module
        let drive = &chassis.motors[1];
        let follower = &chassis.motors[2];
        assert!(drive.output() > 0.0);
        assert_abs_diff_eq!(follower.output(), drive.output(), epsilon = 1e-12);

        chassis.step(0.0, 0.5);
        let pose = drivetrain.periodic(0.5).unwrap();
        assert_abs_diff_eq!(pose.x(), 0.5, epsilon = 1e-6);
    }
}
