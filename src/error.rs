// Error taxonomy for the servo bus.
//
// Communication errors are reported per-operation and never retried at
// this layer: blindly retrying a sync-write can double-apply a motion
// command, so retry policy belongs to the caller. Configuration errors
// (unknown model, field or joint) fail before any bus traffic happens.

use crate::bus::BusState;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("serial port {port} unavailable: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("short write on serial port: {0}")]
    TxFailure(#[source] std::io::Error),

    #[error("no response from motor {id} within {timeout_ms}ms")]
    RxTimeout { id: u8, timeout_ms: u64 },

    #[error("corrupt status frame from motor {id}: {reason}")]
    RxCorrupt { id: u8, reason: String },

    #[error("unparseable response from motor {id}: no valid frame header")]
    ParsingError { id: u8 },

    #[error("status frame id mismatch: addressed {expected}, got {got}")]
    UnexpectedId { expected: u8, got: u8 },

    #[error("motor {id} reports device fault 0x{flags:02X}")]
    DeviceError { id: u8, flags: u8 },

    #[error("register field {0:?} is not in the control table for this model")]
    UnsupportedField(String),

    #[error("motor model {0:?} is not supported")]
    UnsupportedModel(String),

    #[error("unknown joint {0:?}")]
    UnknownJoint(String),

    #[error("motor id {0} is outside the addressable range")]
    InvalidMotorId(u8),

    #[error("{joints} joints but {values} values")]
    LengthMismatch { joints: usize, values: usize },

    #[error("bus is closed")]
    Closed,

    #[error("a transaction is already in flight on this port")]
    PortBusy,

    #[error("invalid bus state transition {from:?} -> {to:?}")]
    InvalidTransition { from: BusState, to: BusState },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
