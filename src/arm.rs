// High-level arm driver: the calibration engine sitting above the
// single-motor and group clients.
//
// Startup from a persisted config:
//
//   let config = ArmConfig::load(path)?;
//   let bus = Bus::open(port, family, &config.descriptors())?;
//   let mut arm = Arm::with_calibration(bus, config.calibration()?);
//   arm.prepare_configuration(&modes)?;
//   arm.apply_calibration(...) / arm.apply_startup_policy(&config)?;
//
// Operating-mode changes are rejected by these servo families while
// torque is enabled, so the configuration sequence is fixed: torque
// off, operating mode, homing reset, drive-mode reset.

use tracing::{info, warn};

use crate::bus::{Bus, BusState};
use crate::calibration::{ArmCalibration, TICKS_PER_REVOLUTION, reconcile_all, sign_extend};
use crate::config::ArmConfig;
use crate::error::{BusError, Result};
use crate::transport::Transport;

pub struct Arm<T: Transport> {
    bus: Bus<T>,
    joints: Vec<String>,
    calibration: Option<ArmCalibration>,
    /// Last accepted raw reading per joint, for wraparound
    /// reconciliation.
    last_raw: Vec<Option<i32>>,
}

impl<T: Transport> Arm<T> {
    pub fn new(bus: Bus<T>) -> Self {
        let joints: Vec<String> = bus.joint_names().iter().map(|s| s.to_string()).collect();
        let count = joints.len();
        Self {
            bus,
            joints,
            calibration: None,
            last_raw: vec![None; count],
        }
    }

    pub fn with_calibration(bus: Bus<T>, calibration: ArmCalibration) -> Self {
        let mut arm = Self::new(bus);
        arm.calibration = Some(calibration);
        arm
    }

    pub fn bus(&mut self) -> &mut Bus<T> {
        &mut self.bus
    }

    pub fn calibration(&self) -> Option<&ArmCalibration> {
        self.calibration.as_ref()
    }

    /// The ordered configuration sequence, one broadcast per step.
    /// `operating_modes` aligns with the joint list.
    pub fn prepare_configuration(&mut self, operating_modes: &[u32]) -> Result<()> {
        if operating_modes.len() != self.joints.len() {
            return Err(BusError::LengthMismatch {
                joints: self.joints.len(),
                values: operating_modes.len(),
            });
        }
        self.bus.transition(BusState::Configuring)?;
        let Some(first) = self.joints.first() else {
            return Ok(());
        };
        let model = self
            .bus
            .motor(first)
            .ok_or_else(|| BusError::UnknownJoint(first.clone()))?
            .model;

        let names: Vec<&str> = self.joints.iter().map(String::as_str).collect();
        let zeros = vec![Some(0u32); names.len()];
        let modes: Vec<Option<u32>> = operating_modes.iter().map(|&m| Some(m)).collect();

        self.bus.sync_write(model.torque_field(), &names, &zeros)?;
        self.bus
            .sync_write(model.operating_mode_field(), &names, &modes)?;
        self.bus.sync_write(model.homing_field(), &names, &zeros)?;
        if let Some(field) = model.drive_mode_field() {
            self.bus.sync_write(field, &names, &zeros)?;
        }

        info!("servo chain configured for calibration");
        Ok(())
    }

    /// Mark the start of the supervised two-pose capture.
    pub fn begin_calibration(&mut self) -> Result<()> {
        self.bus.transition(BusState::Calibrating)
    }

    /// Install the calibration and move to the operational state.
    pub fn apply_calibration(&mut self, calibration: ArmCalibration) -> Result<()> {
        if calibration.len() != self.joints.len() {
            return Err(BusError::LengthMismatch {
                joints: self.joints.len(),
                values: calibration.len(),
            });
        }
        self.calibration = Some(calibration);
        match self.bus.state() {
            BusState::Configuring | BusState::Calibrating => {
                self.bus.transition(BusState::Operational)
            }
            _ => Ok(()),
        }
    }

    /// Position-loop gains and the torque policy from a persisted
    /// config.
    pub fn apply_startup_policy(&mut self, config: &ArmConfig) -> Result<()> {
        let Some(first) = config.joints.first() else {
            return Ok(());
        };
        let names: Vec<&str> = config.joints.iter().map(|j| j.name.as_str()).collect();
        let (p_field, i_field, d_field) = first.model.pid_fields();

        let gains = |pick: fn(&crate::config::JointConfig) -> u16| -> Vec<Option<u32>> {
            config.joints.iter().map(|j| Some(pick(j) as u32)).collect()
        };
        self.bus.sync_write(p_field, &names, &gains(|j| j.p))?;
        self.bus.sync_write(i_field, &names, &gains(|j| j.i))?;
        self.bus.sync_write(d_field, &names, &gains(|j| j.d))?;

        let torque: Vec<Option<u32>> =
            config.joints.iter().map(|j| Some(j.torque as u32)).collect();
        self.bus
            .sync_write(first.model.torque_field(), &names, &torque)?;
        Ok(())
    }

    pub fn enable_torque(&mut self) -> Result<()> {
        self.write_torque(1)
    }

    /// Disable torque on every joint so the arm moves freely.
    pub fn disable_torque(&mut self) -> Result<()> {
        self.write_torque(0)
    }

    fn write_torque(&mut self, value: u32) -> Result<()> {
        let Some(first) = self.joints.first() else {
            return Ok(());
        };
        let model = self
            .bus
            .motor(first)
            .ok_or_else(|| BusError::UnknownJoint(first.clone()))?
            .model;
        let names: Vec<&str> = self.joints.iter().map(String::as_str).collect();
        let values = vec![Some(value); names.len()];
        self.bus.sync_write(model.torque_field(), &names, &values)
    }

    /// Present positions as signed raw ticks, in joint order.
    pub fn read_raw_positions(&mut self) -> Result<Vec<i32>> {
        let names: Vec<&str> = self.joints.iter().map(String::as_str).collect();
        let values = self.bus.sync_read("Present_Position", &names)?;

        let mut raw = Vec::with_capacity(values.len());
        for (joint, value) in self.joints.iter().zip(&values) {
            let reg = self.bus.register(joint, "Present_Position")?;
            raw.push(sign_extend(*value, reg.width));
        }
        Ok(raw)
    }

    /// Like `read_raw_positions`, but a failed batch folds into all-None
    /// so a transient fault does not abort a capture loop.
    pub fn try_read_raw_positions(&mut self) -> Vec<Option<i32>> {
        match self.read_raw_positions() {
            Ok(values) => values.into_iter().map(Some).collect(),
            Err(e) => {
                warn!("position read failed: {e}");
                vec![None; self.joints.len()]
            }
        }
    }

    /// Calibrated logical positions. Fresh readings are first folded
    /// into the revolution window nearest the last accepted value, so a
    /// spurious ±4096-tick jump from a communication fault cannot leak
    /// through. Without a calibration the raw ticks pass through.
    pub fn read_positions(&mut self) -> Result<Vec<Option<f32>>> {
        let raw = self.read_raw_positions()?;
        let fresh: Vec<Option<i32>> = raw.into_iter().map(Some).collect();
        let reconciled = reconcile_all(&fresh, &self.last_raw, TICKS_PER_REVOLUTION);
        self.last_raw.clone_from(&reconciled);

        Ok(match &self.calibration {
            Some(calibration) => calibration.to_logical(&reconciled),
            None => reconciled.iter().map(|v| v.map(|v| v as f32)).collect(),
        })
    }

    /// Write logical goals; None entries are skipped, leaving those
    /// joints on their previous goal.
    pub fn write_goal_positions(&mut self, logical: &[Option<f32>]) -> Result<()> {
        if logical.len() != self.joints.len() {
            return Err(BusError::LengthMismatch {
                joints: self.joints.len(),
                values: logical.len(),
            });
        }
        let physical: Vec<Option<i32>> = match &self.calibration {
            Some(calibration) => calibration.to_physical(logical),
            None => logical.iter().map(|v| v.map(|v| v.round() as i32)).collect(),
        };
        let values: Vec<Option<u32>> = physical.iter().map(|v| v.map(|v| v as u32)).collect();
        let names: Vec<&str> = self.joints.iter().map(String::as_str).collect();
        self.bus.sync_write("Goal_Position", &names, &values)
    }

    /// Close the underlying bus and release the serial line.
    pub fn close(mut self) {
        self.bus.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MotorDescriptor;
    use crate::calibration::{DriveMode, JointOffset};
    use crate::protocol::{BROADCAST_ID, ProtocolFamily, checksum};
    use crate::registers::MotorModel;
    use crate::transport::MockTransport;

    fn status_bytes(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8;
        let mut frame = vec![0xFF, 0xFF, id, length, error];
        frame.extend_from_slice(params);
        frame.push(checksum(&frame[2..]));
        frame
    }

    fn dxl_arm(joints: &[(u8, &str)]) -> Arm<MockTransport> {
        let descriptors: Vec<_> = joints
            .iter()
            .map(|&(id, name)| MotorDescriptor {
                id,
                model: MotorModel::XSeries,
                joint_name: name.to_string(),
            })
            .collect();
        Arm::new(
            Bus::with_transport(MockTransport::new(), ProtocolFamily::Dynamixel, &descriptors)
                .unwrap(),
        )
    }

    fn scs_arm(joints: &[(u8, &str)]) -> Arm<MockTransport> {
        let descriptors: Vec<_> = joints
            .iter()
            .map(|&(id, name)| MotorDescriptor {
                id,
                model: MotorModel::ScsSeries,
                joint_name: name.to_string(),
            })
            .collect();
        Arm::new(
            Bus::with_transport(MockTransport::new(), ProtocolFamily::Feetech, &descriptors)
                .unwrap(),
        )
    }

    fn queue_aggregate(arm: &mut Arm<MockTransport>, first_id: u8, raws: &[i32]) {
        let mut payload = Vec::new();
        for &raw in raws {
            payload.extend_from_slice(&(raw as u32).to_le_bytes());
        }
        arm.bus()
            .test_transport()
            .queue(&status_bytes(first_id, 0, &payload));
    }

    #[test]
    fn configuration_writes_in_required_order() {
        let mut arm = dxl_arm(&[(1, "shoulder_pan"), (2, "shoulder_lift")]);
        arm.prepare_configuration(&[4, 5]).unwrap();

        let written = arm.bus().test_transport().written.clone();
        assert_eq!(written.len(), 4);
        // torque disable, operating mode, homing reset, drive-mode reset
        assert_eq!(written[0][5], 64);
        assert_eq!(written[1][5], 11);
        assert_eq!(written[2][5], 20);
        assert_eq!(written[3][5], 10);
        for frame in &written {
            assert_eq!(frame[2], BROADCAST_ID);
        }
        // per-joint operating modes land in the mode blocks
        assert_eq!(written[1][7..9], [1, 4]);
        assert_eq!(written[1][9..11], [2, 5]);
        assert_eq!(arm.bus().state(), BusState::Configuring);
    }

    #[test]
    fn feetech_configuration_skips_drive_mode() {
        let mut arm = scs_arm(&[(1, "a"), (2, "b")]);
        arm.prepare_configuration(&[0, 0]).unwrap();

        let written = arm.bus().test_transport().written.clone();
        assert_eq!(written.len(), 3);
        assert_eq!(written[0][5], 40); // Torque_Enable
        assert_eq!(written[1][5], 33); // Mode
        assert_eq!(written[2][5], 31); // Offset
    }

    #[test]
    fn read_positions_applies_calibration_and_sign_extension() {
        let mut arm = dxl_arm(&[(1, "a"), (2, "b")]);
        arm.apply_calibration(ArmCalibration::OffsetDriveMode(vec![
            JointOffset {
                offset: 100,
                drive_mode: DriveMode::Normal,
            },
            JointOffset {
                offset: 0,
                drive_mode: DriveMode::Inverted,
            },
        ]))
        .unwrap();

        queue_aggregate(&mut arm, 1, &[24, -50]);
        let positions = arm.read_positions().unwrap();
        assert_eq!(positions, vec![Some(124.0), Some(50.0)]);
    }

    #[test]
    fn read_positions_reconciles_revolution_jumps() {
        let mut arm = dxl_arm(&[(1, "a")]);

        queue_aggregate(&mut arm, 1, &[0]);
        assert_eq!(arm.read_positions().unwrap(), vec![Some(0.0)]);

        // A dropped high word turns 0 into 4095; the nearest
        // representative of the last accepted reading is -1.
        queue_aggregate(&mut arm, 1, &[4095]);
        assert_eq!(arm.read_positions().unwrap(), vec![Some(-1.0)]);
    }

    #[test]
    fn goal_writes_invert_the_calibration() {
        let mut arm = dxl_arm(&[(1, "a"), (2, "b")]);
        arm.apply_calibration(ArmCalibration::OffsetDriveMode(vec![
            JointOffset {
                offset: 100,
                drive_mode: DriveMode::Normal,
            },
            JointOffset {
                offset: 0,
                drive_mode: DriveMode::Inverted,
            },
        ]))
        .unwrap();

        arm.write_goal_positions(&[Some(124.0), None]).unwrap();

        let written = arm.bus().test_transport().written.clone();
        assert_eq!(written.len(), 1);
        let frame = &written[0];
        assert_eq!(frame[5], 116); // Goal_Position
        assert_eq!(frame[6], 4);
        // Only joint 1 participates; logical 124 - offset 100 = raw 24.
        assert_eq!(frame[7], 1);
        assert_eq!(&frame[8..12], &24u32.to_le_bytes());
        assert_eq!(frame.len(), 7 + 5 + 1);
    }

    #[test]
    fn calibration_length_must_match_joint_count() {
        let mut arm = dxl_arm(&[(1, "a"), (2, "b")]);
        let err = arm
            .apply_calibration(ArmCalibration::OffsetDriveMode(vec![JointOffset {
                offset: 0,
                drive_mode: DriveMode::Normal,
            }]))
            .unwrap_err();
        assert!(matches!(err, BusError::LengthMismatch { joints: 2, values: 1 }));
    }

    #[test]
    fn failed_batch_read_folds_to_none() {
        let mut arm = scs_arm(&[(1, "a"), (2, "b")]);
        // No responses queued: the sequential read times out on motor 1.
        assert_eq!(arm.try_read_raw_positions(), vec![None, None]);
    }

    #[test]
    fn startup_policy_writes_gains_then_torque() {
        use crate::config::{ArmConfig, JointConfig};

        let mut arm = dxl_arm(&[(1, "a")]);
        let config = ArmConfig {
            joints: vec![JointConfig {
                name: "a".to_string(),
                id: 1,
                model: MotorModel::XSeries,
                torque: true,
                offset: Some(0),
                drive_mode: None,
                interpolation: None,
                p: 1500,
                i: 0,
                d: 600,
            }],
        };
        arm.apply_startup_policy(&config).unwrap();

        let written = arm.bus().test_transport().written.clone();
        assert_eq!(written.len(), 4);
        assert_eq!(written[0][5], 84); // Position_P_Gain
        assert_eq!(written[1][5], 82); // Position_I_Gain
        assert_eq!(written[2][5], 80); // Position_D_Gain
        assert_eq!(written[3][5], 64); // Torque_Enable
        assert_eq!(written[3][8], 1);
    }
}
