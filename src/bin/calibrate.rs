// Interactive two-pose calibration for a six-joint arm.
//
// Disables torque, walks the operator through the two reference poses,
// derives the calibration (homing offsets + drive modes, or quadrant
// interpolation tables), writes the JSON config, then live-prints
// logical positions until interrupted.
//
// Usage:
//   servo-calibrate --port /dev/ttyACM0 --family feetech
//   servo-calibrate --port /dev/ttyUSB0 --family dynamixel \
//       --scheme interpolation --output follower.left.json --follower

use std::io::{self, Write};
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::warn;

use servo_chain::arm::Arm;
use servo_chain::bus::{Bus, MotorDescriptor};
use servo_chain::calibration::{
    ArmCalibration, derive_interpolation_calibration, derive_offset_calibration,
};
use servo_chain::config::{ArmConfig, JointConfig};
use servo_chain::protocol::ProtocolFamily;
use servo_chain::registers::MotorModel;
use servo_chain::transport::Transport;

const JOINT_NAMES: [&str; 6] = [
    "shoulder_pan",
    "shoulder_lift",
    "elbow_flex",
    "wrist_flex",
    "wrist_roll",
    "gripper",
];

// Reference poses in encoder ticks (offset scheme) and in degrees
// (interpolation scheme).
const TICK_TARGETS_POSE1: [i32; 6] = [0, -1024, 1024, 0, -1024, 0];
const TICK_TARGETS_POSE2: [i32; 6] = [1024, 0, 0, 1024, 0, -1024];
const DEGREE_TARGETS_POSE1: [i32; 6] = [0, -90, 90, 0, -90, 0];
const DEGREE_TARGETS_POSE2: [i32; 6] = [90, 0, 0, 90, 0, -90];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Family {
    Dynamixel,
    Feetech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scheme {
    /// Per-joint homing offset and drive mode, logical unit ticks.
    Offsets,
    /// Quadrant interpolation tables, logical unit degrees.
    Interpolation,
}

#[derive(Debug, Parser)]
#[command(about = "Two-pose calibration for a six-joint servo arm")]
struct Args {
    /// Serial port of the arm
    #[arg(long)]
    port: String,

    /// Servo family on the chain
    #[arg(long, value_enum, default_value = "feetech")]
    family: Family,

    /// Calibration scheme to derive
    #[arg(long, value_enum, default_value = "offsets")]
    scheme: Scheme,

    /// Output config path
    #[arg(long, default_value = "calibration.json")]
    output: PathBuf,

    /// Follower arm: enable torque and position gains after calibrating
    #[arg(long)]
    follower: bool,
}

fn pause() {
    print!("Press Enter to continue...");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin().read_line(&mut line).ok();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Calibration failed: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let (family, model, modes, gains) = match args.family {
        // Arm joints in extended position mode, gripper current-based;
        // stock X-series position gains.
        Family::Dynamixel => (
            ProtocolFamily::Dynamixel,
            MotorModel::XSeries,
            [4u32, 4, 4, 4, 4, 5],
            (1500u16, 0u16, 600u16),
        ),
        Family::Feetech => (
            ProtocolFamily::Feetech,
            MotorModel::ScsSeries,
            [0u32; 6],
            (32, 0, 0),
        ),
    };

    let descriptors: Vec<MotorDescriptor> = JOINT_NAMES
        .iter()
        .enumerate()
        .map(|(index, name)| MotorDescriptor {
            id: index as u8 + 1,
            model,
            joint_name: name.to_string(),
        })
        .collect();

    let mut arm = Arm::new(Bus::open(&args.port, family, &descriptors)?);
    arm.prepare_configuration(&modes)?;
    arm.begin_calibration()?;

    println!("Move the arm to the first reference pose.");
    pause();
    let pose1 = arm.try_read_raw_positions();

    println!("Move the arm to the second reference pose.");
    pause();
    let pose2 = arm.try_read_raw_positions();

    let (calibration, config) = match args.scheme {
        Scheme::Offsets => {
            let joints =
                derive_offset_calibration(&pose1, &pose2, &TICK_TARGETS_POSE1, &TICK_TARGETS_POSE2)?;
            let mut records = Vec::new();
            let mut resolved = Vec::new();
            for (index, joint) in joints.iter().enumerate() {
                let Some(joint) = joint else {
                    return Err(
                        format!("joint {} did not respond during capture", JOINT_NAMES[index])
                            .into(),
                    );
                };
                resolved.push(*joint);
                records.push(JointConfig {
                    name: JOINT_NAMES[index].to_string(),
                    id: index as u8 + 1,
                    model,
                    torque: args.follower,
                    offset: Some(joint.offset),
                    drive_mode: Some(joint.drive_mode),
                    interpolation: None,
                    p: gains.0,
                    i: gains.1,
                    d: gains.2,
                });
            }
            (
                ArmCalibration::OffsetDriveMode(resolved),
                ArmConfig { joints: records },
            )
        }
        Scheme::Interpolation => {
            let tables = derive_interpolation_calibration(
                &pose1,
                &pose2,
                &DEGREE_TARGETS_POSE1,
                &DEGREE_TARGETS_POSE2,
            )?;
            let mut records = Vec::new();
            let mut resolved = Vec::new();
            for (index, table) in tables.iter().enumerate() {
                let Some(table) = table else {
                    return Err(
                        format!("joint {} did not respond during capture", JOINT_NAMES[index])
                            .into(),
                    );
                };
                resolved.push(table.clone());
                records.push(JointConfig {
                    name: JOINT_NAMES[index].to_string(),
                    id: index as u8 + 1,
                    model,
                    torque: args.follower,
                    offset: None,
                    drive_mode: None,
                    interpolation: Some(table.clone()),
                    p: gains.0,
                    i: gains.1,
                    d: gains.2,
                });
            }
            (
                ArmCalibration::Interpolated(resolved),
                ArmConfig { joints: records },
            )
        }
    };

    config.save(&args.output)?;
    println!("Wrote {}", args.output.display());

    arm.apply_calibration(calibration)?;
    if args.follower {
        arm.apply_startup_policy(&config)?;
    }

    println!("Verify the calibration (Ctrl+C to exit):");
    verify_loop(&mut arm);
}

fn verify_loop<T: Transport>(arm: &mut Arm<T>) -> ! {
    loop {
        match arm.read_positions() {
            Ok(positions) => {
                let formatted: Vec<String> = JOINT_NAMES
                    .iter()
                    .zip(&positions)
                    .map(|(name, position)| match position {
                        Some(value) => format!("{name}={value:.1}"),
                        None => format!("{name}=?"),
                    })
                    .collect();
                println!("{}", formatted.join("  "));
            }
            Err(e) => warn!("read failed: {e}"),
        }
        sleep(Duration::from_millis(500));
    }
}
