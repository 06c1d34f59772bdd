// Serial bus driver and position calibration for daisy-chained servo
// arms (Dynamixel X-series and Feetech SCS-series).
//
// Layering, bottom up:
// - transport: the serial line (write / bounded-timeout read / clear)
// - protocol: instruction and status framing for both families
// - registers: control tables mapping field names to (address, width)
// - bus: single-motor and grouped register access, bus lifecycle
// - calibration: raw encoder counts <-> logical joint angles
// - config: persisted per-joint calibration records
// - arm: calibrated high-level driver tying the layers together

pub mod arm;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registers;
pub mod transport;

pub use arm::Arm;
pub use bus::{Bus, BusState, MotorDescriptor};
pub use calibration::{ArmCalibration, DriveMode};
pub use config::{ArmConfig, ConfigError, JointConfig};
pub use error::{BusError, Result};
pub use protocol::ProtocolFamily;
pub use registers::MotorModel;
pub use transport::{SerialTransport, Transport};
