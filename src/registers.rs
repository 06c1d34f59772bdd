// Control tables: symbolic register names to (address, width) per motor
// model family.
//
// The two address spaces are disjoint and must never be conflated; a
// bus therefore refuses descriptors whose model belongs to the other
// family. Unknown models or field names are configuration errors and
// fail before any bus traffic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};
use crate::protocol::ProtocolFamily;

/// Register map family a motor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorModel {
    /// Dynamixel X-series (XL330, XL430, XM430, ...).
    #[serde(
        rename = "x_series",
        alias = "xl330-m077",
        alias = "xl330-m288",
        alias = "xl430-w250",
        alias = "xm430-w350",
        alias = "xm540-w270"
    )]
    XSeries,
    /// Feetech SCS/STS series (STS3215, ...).
    #[serde(rename = "scs_series", alias = "sts3215")]
    ScsSeries,
}

impl MotorModel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x_series" | "xl330-m077" | "xl330-m288" | "xl430-w250" | "xm430-w350"
            | "xm540-w270" => Some(Self::XSeries),
            "scs_series" | "sts3215" => Some(Self::ScsSeries),
            _ => None,
        }
    }

    pub fn family(self) -> ProtocolFamily {
        match self {
            Self::XSeries => ProtocolFamily::Dynamixel,
            Self::ScsSeries => ProtocolFamily::Feetech,
        }
    }

    pub fn torque_field(self) -> &'static str {
        "Torque_Enable"
    }

    pub fn operating_mode_field(self) -> &'static str {
        match self {
            Self::XSeries => "Operating_Mode",
            Self::ScsSeries => "Mode",
        }
    }

    pub fn homing_field(self) -> &'static str {
        match self {
            Self::XSeries => "Homing_Offset",
            Self::ScsSeries => "Offset",
        }
    }

    /// Only the X-series exposes a drive-mode register.
    pub fn drive_mode_field(self) -> Option<&'static str> {
        match self {
            Self::XSeries => Some("Drive_Mode"),
            Self::ScsSeries => None,
        }
    }

    /// Position-loop gain fields, (P, I, D).
    pub fn pid_fields(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::XSeries => ("Position_P_Gain", "Position_I_Gain", "Position_D_Gain"),
            Self::ScsSeries => ("P_Coefficient", "I_Coefficient", "D_Coefficient"),
        }
    }
}

/// One control-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDef {
    pub address: u16,
    /// 1, 2 or 4 bytes.
    pub width: u8,
}

#[rustfmt::skip]
const X_SERIES_CONTROL_TABLE: &[(&str, u16, u8)] = &[
    ("Model_Number",           0, 2),
    ("Model_Information",      2, 4),
    ("Firmware_Version",       6, 1),
    ("ID",                     7, 1),
    ("Baud_Rate",              8, 1),
    ("Return_Delay_Time",      9, 1),
    ("Drive_Mode",            10, 1),
    ("Operating_Mode",        11, 1),
    ("Secondary_ID",          12, 1),
    ("Protocol_Type",         13, 1),
    ("Homing_Offset",         20, 4),
    ("Moving_Threshold",      24, 4),
    ("Temperature_Limit",     31, 1),
    ("Max_Voltage_Limit",     32, 2),
    ("Min_Voltage_Limit",     34, 2),
    ("PWM_Limit",             36, 2),
    ("Current_Limit",         38, 2),
    ("Acceleration_Limit",    40, 4),
    ("Velocity_Limit",        44, 4),
    ("Max_Position_Limit",    48, 4),
    ("Min_Position_Limit",    52, 4),
    ("Shutdown",              63, 1),
    ("Torque_Enable",         64, 1),
    ("LED",                   65, 1),
    ("Status_Return_Level",   68, 1),
    ("Registered_Instruction", 69, 1),
    ("Hardware_Error_Status", 70, 1),
    ("Velocity_I_Gain",       76, 2),
    ("Velocity_P_Gain",       78, 2),
    ("Position_D_Gain",       80, 2),
    ("Position_I_Gain",       82, 2),
    ("Position_P_Gain",       84, 2),
    ("Feedforward_2nd_Gain",  88, 2),
    ("Feedforward_1st_Gain",  90, 2),
    ("Bus_Watchdog",          98, 1),
    ("Goal_PWM",             100, 2),
    ("Goal_Current",         102, 2),
    ("Goal_Velocity",        104, 4),
    ("Profile_Acceleration", 108, 4),
    ("Profile_Velocity",     112, 4),
    ("Goal_Position",        116, 4),
    ("Realtime_Tick",        120, 2),
    ("Moving",               122, 1),
    ("Moving_Status",        123, 1),
    ("Present_PWM",          124, 2),
    ("Present_Current",      126, 2),
    ("Present_Velocity",     128, 4),
    ("Present_Position",     132, 4),
    ("Velocity_Trajectory",  136, 4),
    ("Position_Trajectory",  140, 4),
    ("Present_Input_Voltage", 144, 2),
    ("Present_Temperature",  146, 1),
];

#[rustfmt::skip]
const SCS_SERIES_CONTROL_TABLE: &[(&str, u16, u8)] = &[
    ("Model",                  3, 2),
    ("ID",                     5, 1),
    ("Baud_Rate",              6, 1),
    ("Return_Delay",           7, 1),
    ("Response_Status_Level",  8, 1),
    ("Min_Angle_Limit",        9, 2),
    ("Max_Angle_Limit",       11, 2),
    ("Max_Temperature_Limit", 13, 1),
    ("Max_Voltage_Limit",     14, 1),
    ("Min_Voltage_Limit",     15, 1),
    ("Max_Torque_Limit",      16, 2),
    ("Phase",                 18, 1),
    ("Unloading_Condition",   19, 1),
    ("LED_Alarm_Condition",   20, 1),
    ("P_Coefficient",         21, 1),
    ("D_Coefficient",         22, 1),
    ("I_Coefficient",         23, 1),
    ("Minimum_Startup_Force", 24, 2),
    ("CW_Dead_Zone",          26, 1),
    ("CCW_Dead_Zone",         27, 1),
    ("Protection_Current",    28, 2),
    ("Angular_Resolution",    30, 1),
    ("Offset",                31, 2),
    ("Mode",                  33, 1),
    ("Protective_Torque",     34, 1),
    ("Protection_Time",       35, 1),
    ("Overload_Torque",       36, 1),
    ("Speed_P_Coefficient",   37, 1),
    ("Over_Current_Protection_Time", 38, 1),
    ("Velocity_I_Coefficient", 39, 1),
    ("Torque_Enable",         40, 1),
    ("Acceleration",          41, 1),
    ("Goal_Position",         42, 2),
    ("Goal_Time",             44, 2),
    ("Goal_Speed",            46, 2),
    ("Lock",                  55, 1),
    ("Present_Position",      56, 2),
    ("Present_Speed",         58, 2),
    ("Present_Load",          60, 2),
    ("Present_Voltage",       62, 1),
    ("Present_Temperature",   63, 1),
    ("Status",                65, 1),
    ("Moving",                66, 1),
    ("Present_Current",       69, 2),
];

/// Field registry built once at bus construction.
#[derive(Debug)]
pub struct ControlTable {
    x_series: HashMap<&'static str, RegisterDef>,
    scs_series: HashMap<&'static str, RegisterDef>,
}

impl ControlTable {
    pub fn new() -> Self {
        let build = |table: &[(&'static str, u16, u8)]| {
            table
                .iter()
                .map(|&(name, address, width)| (name, RegisterDef { address, width }))
                .collect()
        };
        Self {
            x_series: build(X_SERIES_CONTROL_TABLE),
            scs_series: build(SCS_SERIES_CONTROL_TABLE),
        }
    }

    pub fn lookup(&self, model: MotorModel, field: &str) -> Result<RegisterDef> {
        let table = match model {
            MotorModel::XSeries => &self.x_series,
            MotorModel::ScsSeries => &self.scs_series,
        };
        table
            .get(field)
            .copied()
            .ok_or_else(|| BusError::UnsupportedField(field.to_string()))
    }
}

impl Default for ControlTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_position_differs_per_family() {
        let table = ControlTable::new();

        let x = table.lookup(MotorModel::XSeries, "Goal_Position").unwrap();
        assert_eq!((x.address, x.width), (116, 4));

        let scs = table.lookup(MotorModel::ScsSeries, "Goal_Position").unwrap();
        assert_eq!((scs.address, scs.width), (42, 2));
    }

    #[test]
    fn key_configuration_registers_resolve() {
        let table = ControlTable::new();
        for (model, field, address, width) in [
            (MotorModel::XSeries, "Torque_Enable", 64, 1),
            (MotorModel::XSeries, "Present_Position", 132, 4),
            (MotorModel::XSeries, "Homing_Offset", 20, 4),
            (MotorModel::XSeries, "Drive_Mode", 10, 1),
            (MotorModel::XSeries, "Operating_Mode", 11, 1),
            (MotorModel::ScsSeries, "Torque_Enable", 40, 1),
            (MotorModel::ScsSeries, "Present_Position", 56, 2),
            (MotorModel::ScsSeries, "Offset", 31, 2),
            (MotorModel::ScsSeries, "Mode", 33, 1),
        ] {
            let def = table.lookup(model, field).unwrap();
            assert_eq!((def.address, def.width), (address, width), "{field}");
        }
    }

    #[test]
    fn unknown_field_is_rejected() {
        let table = ControlTable::new();
        // An X-series-only field must not leak into the SCS table.
        assert!(matches!(
            table.lookup(MotorModel::ScsSeries, "Homing_Offset"),
            Err(BusError::UnsupportedField(_))
        ));
        assert!(matches!(
            table.lookup(MotorModel::XSeries, "No_Such_Register"),
            Err(BusError::UnsupportedField(_))
        ));
    }

    #[test]
    fn model_aliases_resolve() {
        assert_eq!(MotorModel::from_name("xl330-m288"), Some(MotorModel::XSeries));
        assert_eq!(MotorModel::from_name("sts3215"), Some(MotorModel::ScsSeries));
        assert_eq!(MotorModel::from_name("mg996r"), None);
    }
}
