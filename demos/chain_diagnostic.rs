// Chain diagnostic: READ-ONLY check of every joint on the arm.
//
// This tool does NOT write anything to the motors - run it before
// calibrating to verify wiring, ids and register access.
//
// Usage: cargo run --example chain_diagnostic -- [port] [family]
// Example: cargo run --example chain_diagnostic -- /dev/ttyACM0 feetech

use std::io::{self, Write};

use servo_chain::bus::{Bus, MotorDescriptor};
use servo_chain::calibration::sign_extend;
use servo_chain::protocol::ProtocolFamily;
use servo_chain::registers::MotorModel;

const JOINT_NAMES: [&str; 6] = [
    "shoulder_pan",
    "shoulder_lift",
    "elbow_flex",
    "wrist_flex",
    "wrist_roll",
    "gripper",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyACM0".to_string());
    let (family, model) = match std::env::args().nth(2).as_deref() {
        Some("dynamixel") => (ProtocolFamily::Dynamixel, MotorModel::XSeries),
        _ => (ProtocolFamily::Feetech, MotorModel::ScsSeries),
    };

    println!("Servo chain diagnostic (READ-ONLY)");
    println!("Serial port: {}", port);
    println!("Family: {:?}", family);
    println!();

    let descriptors: Vec<MotorDescriptor> = JOINT_NAMES
        .iter()
        .enumerate()
        .map(|(index, name)| MotorDescriptor {
            id: index as u8 + 1,
            model,
            joint_name: name.to_string(),
        })
        .collect();

    println!("Step 1: Opening serial port...");
    let mut bus = match Bus::open(&port, family, &descriptors) {
        Ok(bus) => {
            println!("  ✓ Serial port opened");
            bus
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - Verify the USB cable is connected");
            println!("  - Check nothing else holds the port open");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Pinging joints...");
    let mut all_found = true;
    for (index, name) in JOINT_NAMES.iter().enumerate() {
        print!("  {} (ID {}): ", name, index + 1);
        io::stdout().flush()?;

        match bus.ping(index as u8 + 1) {
            Ok(true) => println!("✓ RESPONDING"),
            Ok(false) => {
                println!("✗ NO RESPONSE");
                all_found = false;
            }
            Err(e) => {
                println!("✗ ERROR: {}", e);
                all_found = false;
            }
        }
    }
    println!();

    if !all_found {
        println!("⚠ Not all joints responded.");
        println!("  - Check the power supply");
        println!("  - Verify ids are 1..=6 along the chain");
        println!("  - Check the daisy-chain cabling");
        println!();
    }

    println!("Step 3: Reading joint registers...");
    println!();
    for name in JOINT_NAMES {
        println!("  === {} ===", name);

        match bus.read(model.torque_field(), name) {
            Ok(val) => {
                let status = if val == 1 { "ENABLED" } else { "disabled" };
                println!("    Torque:   {} ({})", val, status);
            }
            Err(e) => println!("    Torque:   ERROR - {}", e),
        }

        match bus.read(model.operating_mode_field(), name) {
            Ok(mode) => println!("    Mode:     {}", mode),
            Err(e) => println!("    Mode:     ERROR - {}", e),
        }

        let width = bus.register(name, "Present_Position")?.width;
        match bus.read("Present_Position", name) {
            Ok(raw) => {
                let ticks = sign_extend(raw, width);
                let degrees = ticks as f32 * 360.0 / 4096.0;
                println!("    Position: {} ticks ({:.1}°)", ticks, degrees);
            }
            Err(e) => println!("    Position: ERROR - {}", e),
        }

        println!();
    }

    println!("Diagnostic complete.");
    println!("If every joint responded with a plausible position, run:");
    println!("  cargo run --bin servo-calibrate -- --port {}", port);

    Ok(())
}
