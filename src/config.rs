// Persisted per-joint calibration records.
//
// Written once by the calibration procedure, read at startup, never
// mutated in between. The JSON mirrors the files the arms ship with:
// one record per joint carrying the motor identity, the torque policy,
// the calibration artifacts of whichever scheme is in force, and the
// position-loop gains.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bus::MotorDescriptor;
use crate::calibration::{ArmCalibration, DriveMode, InterpolationTable, JointOffset};
use crate::registers::MotorModel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("joint {0:?} carries no calibration, or mixes schemes with its siblings")]
    IncompleteCalibration(String),
}

/// One joint's persisted record. Exactly one calibration scheme should
/// be populated: `offset`/`drive_mode`, or `interpolation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointConfig {
    pub name: String,
    pub id: u8,
    pub model: MotorModel,
    /// Torque at startup: followers hold their pose, leaders stay free.
    pub torque: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_mode: Option<DriveMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolation: Option<InterpolationTable>,
    #[serde(rename = "P")]
    pub p: u16,
    #[serde(rename = "I")]
    pub i: u16,
    #[serde(rename = "D")]
    pub d: u16,
}

/// Whole-arm configuration file, joints in chain order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArmConfig {
    pub joints: Vec<JointConfig>,
}

impl ArmConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Bus descriptors in file order.
    pub fn descriptors(&self) -> Vec<MotorDescriptor> {
        self.joints
            .iter()
            .map(|joint| MotorDescriptor {
                id: joint.id,
                model: joint.model,
                joint_name: joint.name.clone(),
            })
            .collect()
    }

    /// Assemble the calibration scheme. Every joint must carry the same
    /// kind of record; a joint with neither is an error, reported by
    /// name.
    pub fn calibration(&self) -> Result<ArmCalibration, ConfigError> {
        if !self.joints.is_empty() && self.joints.iter().all(|j| j.interpolation.is_some()) {
            return Ok(ArmCalibration::Interpolated(
                self.joints
                    .iter()
                    .filter_map(|j| j.interpolation.clone())
                    .collect(),
            ));
        }
        if !self.joints.is_empty() && self.joints.iter().all(|j| j.offset.is_some()) {
            return Ok(ArmCalibration::OffsetDriveMode(
                self.joints
                    .iter()
                    .map(|j| JointOffset {
                        offset: j.offset.unwrap_or(0),
                        drive_mode: j.drive_mode.unwrap_or_default(),
                    })
                    .collect(),
            ));
        }

        let offender = self
            .joints
            .iter()
            .find(|j| j.offset.is_none() && j.interpolation.is_none())
            .or(self.joints.first());
        Err(ConfigError::IncompleteCalibration(
            offender.map(|j| j.name.clone()).unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset_joint(name: &str, id: u8, offset: i32) -> JointConfig {
        JointConfig {
            name: name.to_string(),
            id,
            model: MotorModel::XSeries,
            torque: true,
            offset: Some(offset),
            drive_mode: Some(DriveMode::Normal),
            interpolation: None,
            p: 1500,
            i: 0,
            d: 600,
        }
    }

    #[test]
    fn json_round_trip() {
        let config = ArmConfig {
            joints: vec![
                offset_joint("shoulder_pan", 1, -1024),
                offset_joint("gripper", 6, 0),
            ],
        };

        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: ArmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        // Gains keep their upper-case wire names.
        assert!(json.contains("\"P\": 1500"));
    }

    #[test]
    fn model_aliases_deserialize() {
        let json = r#"{
            "name": "gripper", "id": 6, "model": "xl330-m288",
            "torque": true, "offset": 0, "P": 250, "I": 0, "D": 600
        }"#;
        let joint: JointConfig = serde_json::from_str(json).unwrap();
        assert_eq!(joint.model, MotorModel::XSeries);
        assert_eq!(joint.drive_mode, None);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let dir = std::env::temp_dir().join("servo-chain-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(ArmConfig::load(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = std::env::temp_dir().join("servo-chain-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("arm.json");

        let config = ArmConfig {
            joints: vec![offset_joint("elbow_flex", 3, 512)],
        };
        config.save(&path).unwrap();
        assert_eq!(ArmConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn calibration_assembly_demands_one_scheme() {
        let mut config = ArmConfig {
            joints: vec![offset_joint("a", 1, 10), offset_joint("b", 2, 20)],
        };
        assert!(matches!(
            config.calibration().unwrap(),
            ArmCalibration::OffsetDriveMode(joints) if joints.len() == 2
        ));

        config.joints[1].offset = None;
        let err = config.calibration().unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteCalibration(name) if name == "b"));
    }
}
