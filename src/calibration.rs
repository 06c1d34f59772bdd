// Position calibration: raw wraparound encoder counts to logical joint
// angles and back.
//
// Two schemes coexist. The offset + drive-mode scheme keeps logical
// values in encoder ticks: a per-joint additive offset plus a sign flip
// for joints assembled mirrored. The quadrant-interpolation scheme maps
// through piecewise-linear tables in degrees, built from two reference
// poses, and covers the full rotation without needing a third pose.
//
// Every vector operation propagates None per slot, so one disconnected
// joint never poisons calibration of its siblings.

use serde::{Deserialize, Serialize};

/// Encoder ticks per revolution for both servo families used here.
pub const TICKS_PER_REVOLUTION: i32 = 4096;

/// Ticks per quarter turn; reference poses snap to these boundaries.
pub const QUARTER_TURN: i32 = 1024;

const DEGREES_PER_TICK: f32 = 360.0 / TICKS_PER_REVOLUTION as f32;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("joint {joint}: both reference poses round to the same quadrant")]
    DegeneratePoses { joint: usize },

    #[error("joint {joint}: both reference poses share the same logical target")]
    DuplicateTargets { joint: usize },

    #[error("joint {joint}: logical target {target} is not a quarter-turn multiple in [-180, 180]")]
    InvalidTarget { joint: usize, target: i32 },

    #[error("mismatched pose lengths: {left} vs {right}")]
    MismatchedLengths { left: usize, right: usize },
}

/// Per-joint sign convention compensating mirrored assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    #[default]
    Normal,
    Inverted,
}

/// Twos-complement reinterpretation of an unsigned register value over
/// its declared width (1, 2 or 4 bytes).
pub fn sign_extend(value: u32, width: u8) -> i32 {
    match width {
        1 => value as u8 as i8 as i32,
        2 => value as u16 as i16 as i32,
        _ => value as i32,
    }
}

/// Fold a fresh reading into the window nearest the last-known-good
/// value, correcting the ±one-revolution jumps a transient
/// communication fault can inject.
pub fn reconcile_wraparound(fresh: i32, last: i32, window: i32) -> i32 {
    let half = window / 2;
    let mut value = fresh;
    while value - last > half {
        value -= window;
    }
    while last - value > half {
        value += window;
    }
    value
}

/// Element-wise reconcile; slots with no fresh or no prior reading pass
/// through unchanged.
pub fn reconcile_all(fresh: &[Option<i32>], last: &[Option<i32>], window: i32) -> Vec<Option<i32>> {
    fresh
        .iter()
        .zip(last)
        .map(|(fresh, last)| match (fresh, last) {
            (Some(f), Some(l)) => Some(reconcile_wraparound(*f, *l, window)),
            _ => *fresh,
        })
        .collect()
}

/// Snap each reading to the nearest quarter-turn boundary.
pub fn nearest_quarter_turn(values: &[Option<i32>]) -> Vec<Option<i32>> {
    values
        .iter()
        .map(|value| {
            value.map(|v| (v as f64 / QUARTER_TURN as f64).round() as i32 * QUARTER_TURN)
        })
        .collect()
}

// =========================================================================
// Offset + drive-mode scheme
// =========================================================================

/// `logical = (inverted ? -raw : raw) + offset` for one joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointOffset {
    pub offset: i32,
    pub drive_mode: DriveMode,
}

impl JointOffset {
    pub fn to_logical(&self, raw: i32) -> i32 {
        let signed = match self.drive_mode {
            DriveMode::Normal => raw,
            DriveMode::Inverted => -raw,
        };
        signed + self.offset
    }

    pub fn to_physical(&self, logical: i32) -> i32 {
        let signed = logical - self.offset;
        match self.drive_mode {
            DriveMode::Normal => signed,
            DriveMode::Inverted => -signed,
        }
    }
}

fn check_lengths<A, B>(left: &[A], right: &[B]) -> Result<(), CalibrationError> {
    if left.len() != right.len() {
        return Err(CalibrationError::MismatchedLengths {
            left: left.len(),
            right: right.len(),
        });
    }
    Ok(())
}

/// Drive modes from the second reference pose: any joint whose snapped
/// reading misses its target is mounted mirrored. Sign and offset are
/// not separable from a single pose, which is why the procedure needs
/// two.
pub fn detect_drive_modes(
    snapped_pose2: &[Option<i32>],
    targets2: &[i32],
) -> Result<Vec<Option<DriveMode>>, CalibrationError> {
    check_lengths(snapped_pose2, targets2)?;
    Ok(snapped_pose2
        .iter()
        .zip(targets2)
        .map(|(snapped, target)| {
            snapped.map(|s| {
                if s == *target {
                    DriveMode::Normal
                } else {
                    DriveMode::Inverted
                }
            })
        })
        .collect())
}

/// Offsets that land each snapped pose-1 reading on its target under
/// the given drive modes: `offset = target - (±snapped)`.
pub fn compute_offsets(
    snapped_pose1: &[Option<i32>],
    targets1: &[i32],
    drive_modes: &[Option<DriveMode>],
) -> Result<Vec<Option<i32>>, CalibrationError> {
    check_lengths(snapped_pose1, targets1)?;
    check_lengths(snapped_pose1, drive_modes)?;
    Ok(snapped_pose1
        .iter()
        .zip(targets1.iter().zip(drive_modes))
        .map(|(snapped, (target, mode))| match (snapped, mode) {
            (Some(snapped), Some(mode)) => {
                let signed = match mode {
                    DriveMode::Normal => *snapped,
                    DriveMode::Inverted => -snapped,
                };
                Some(target - signed)
            }
            _ => None,
        })
        .collect())
}

/// The full two-pose derivation: snap both captures to quarter-turn
/// boundaries, read the drive modes off pose 2, then compute the final
/// offsets from pose 1 under those modes. Joints missing either capture
/// come back as None.
pub fn derive_offset_calibration(
    pose1: &[Option<i32>],
    pose2: &[Option<i32>],
    targets1: &[i32],
    targets2: &[i32],
) -> Result<Vec<Option<JointOffset>>, CalibrationError> {
    check_lengths(pose1, pose2)?;
    check_lengths(pose1, targets1)?;
    check_lengths(pose1, targets2)?;

    let snapped1 = nearest_quarter_turn(pose1);
    let snapped2 = nearest_quarter_turn(pose2);
    let modes = detect_drive_modes(&snapped2, targets2)?;
    let offsets = compute_offsets(&snapped1, targets1, &modes)?;

    Ok(offsets
        .iter()
        .zip(&modes)
        .map(|(offset, mode)| match (offset, mode) {
            (Some(offset), Some(mode)) => Some(JointOffset {
                offset: *offset,
                drive_mode: *mode,
            }),
            _ => None,
        })
        .collect())
}

// =========================================================================
// Quadrant-interpolation scheme
// =========================================================================

/// Piecewise-linear mapping for one joint, built from two reference
/// poses snapped to quarter-turn boundaries.
///
/// The forward table holds the logical value at physical 0°, 90°, 180°,
/// 270° and 360° of one revolution; the inverse table holds physical
/// degrees at logical -180°..180° in 90° steps. All nodes derive from
/// the measured quadrant plus a constant per-quadrant delta, never
/// independently, which keeps adjacent quadrants continuous modulo the
/// ±180° seam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationTable {
    /// Logical degrees at physical 0°, 90°, 180°, 270°, 360°.
    pub physical_to_logical: [f32; 5],
    /// Physical degrees at logical -180°, -90°, 0°, 90°, 180°.
    pub logical_to_physical: [f32; 5],
}

fn wrap_degrees(mut value: f32) -> f32 {
    while value > 180.0 {
        value -= 360.0;
    }
    while value < -180.0 {
        value += 360.0;
    }
    value
}

/// A node sitting exactly on the ±180° seam is ambiguous; pick the sign
/// that keeps the segment spanning its nominal quarter turn.
fn seam_limits(low: f32, high: f32) -> (f32, f32) {
    if low.abs() == 180.0 && (high - low).abs() != 90.0 {
        return (-low, high);
    }
    if high.abs() == 180.0 && (high - low).abs() != 90.0 {
        return (low, -high);
    }
    (low, high)
}

/// Quarter-turn boundary index (0..=3) the reading snaps to, within one
/// revolution.
fn quadrant_boundary(raw: i32) -> usize {
    let within_rev = raw.rem_euclid(TICKS_PER_REVOLUTION);
    let snapped =
        ((within_rev as f64 / QUARTER_TURN as f64).round() as i32 * QUARTER_TURN)
            .rem_euclid(TICKS_PER_REVOLUTION);
    (snapped / QUARTER_TURN) as usize
}

/// Snapped reading in degrees, keeping multi-turn excursions.
fn snapped_degrees(raw: i32) -> f32 {
    ((raw as f64 / QUARTER_TURN as f64).round() * QUARTER_TURN as f64) as f32 * DEGREES_PER_TICK
}

impl InterpolationTable {
    /// Build both direction tables from two captured poses and their
    /// intended logical targets (quarter-turn degrees in [-180, 180]).
    pub fn from_poses(
        raw1: i32,
        raw2: i32,
        target1: i32,
        target2: i32,
        joint: usize,
    ) -> Result<Self, CalibrationError> {
        for target in [target1, target2] {
            if target % 90 != 0 || !(-180..=180).contains(&target) {
                return Err(CalibrationError::InvalidTarget { joint, target });
            }
        }
        if target1 == target2 {
            return Err(CalibrationError::DuplicateTargets { joint });
        }

        let boundary1 = quadrant_boundary(raw1);
        let boundary2 = quadrant_boundary(raw2);
        if boundary1 == boundary2 {
            return Err(CalibrationError::DegeneratePoses { joint });
        }

        // Forward: anchor at the lower measured boundary and step the
        // measured logical delta once per quadrant, wrapping back into
        // (-180, 180] where a propagated node leaves the span.
        let (anchor, anchor_value, step) = if boundary1 < boundary2 {
            (boundary1 as i32, target1, target2 - target1)
        } else {
            (boundary2 as i32, target2, target1 - target2)
        };
        let mut physical_to_logical = [0f32; 5];
        for (node, slot) in physical_to_logical.iter_mut().enumerate() {
            *slot = if node == boundary1 {
                target1 as f32
            } else if node == boundary2 {
                target2 as f32
            } else {
                wrap_degrees((anchor_value + (node as i32 - anchor) * step) as f32)
            };
        }

        // Inverse: same propagation over the logical axis; physical
        // degrees keep multi-turn excursions and never wrap.
        let degrees1 = snapped_degrees(raw1);
        let degrees2 = snapped_degrees(raw2);
        let (anchor, anchor_value, step) = if target1 < target2 {
            (target1, degrees1, degrees2 - degrees1)
        } else {
            (target2, degrees2, degrees1 - degrees2)
        };
        let node1 = ((target1 + 180) / 90) as usize;
        let node2 = ((target2 + 180) / 90) as usize;
        let mut logical_to_physical = [0f32; 5];
        for (node, slot) in logical_to_physical.iter_mut().enumerate() {
            let logical = -180 + 90 * node as i32;
            *slot = if node == node1 {
                degrees1
            } else if node == node2 {
                degrees2
            } else {
                anchor_value + ((logical - anchor) / 90) as f32 * step
            };
        }

        Ok(Self {
            physical_to_logical,
            logical_to_physical,
        })
    }

    /// Raw ticks to logical degrees.
    pub fn to_logical(&self, raw: i32) -> f32 {
        let degrees = raw.rem_euclid(TICKS_PER_REVOLUTION) as f32 * DEGREES_PER_TICK;
        let segment = ((degrees / 90.0) as usize).min(3);
        let (low, high) = seam_limits(
            self.physical_to_logical[segment],
            self.physical_to_logical[segment + 1],
        );
        low + (degrees - 90.0 * segment as f32) / 90.0 * (high - low)
    }

    /// Logical degrees to raw ticks. Out-of-range inputs clamp to the
    /// calibrated span rather than commanding an unrelated position.
    pub fn to_physical(&self, logical: f32) -> i32 {
        let clamped = logical.clamp(-180.0, 180.0);
        let segment = (((clamped + 180.0) / 90.0) as usize).min(3);
        let low = self.logical_to_physical[segment];
        let high = self.logical_to_physical[segment + 1];
        let start = -180.0 + 90.0 * segment as f32;
        let degrees = low + (clamped - start) / 90.0 * (high - low);
        (degrees / DEGREES_PER_TICK).round() as i32
    }
}

/// Interpolation tables for every joint; unreadable joints propagate
/// None instead of failing their siblings.
pub fn derive_interpolation_calibration(
    pose1: &[Option<i32>],
    pose2: &[Option<i32>],
    targets1: &[i32],
    targets2: &[i32],
) -> Result<Vec<Option<InterpolationTable>>, CalibrationError> {
    check_lengths(pose1, pose2)?;
    check_lengths(pose1, targets1)?;
    check_lengths(pose1, targets2)?;

    pose1
        .iter()
        .zip(pose2)
        .zip(targets1.iter().zip(targets2))
        .enumerate()
        .map(|(joint, ((raw1, raw2), (t1, t2)))| match (raw1, raw2) {
            (Some(raw1), Some(raw2)) => {
                InterpolationTable::from_poses(*raw1, *raw2, *t1, *t2, joint).map(Some)
            }
            _ => Ok(None),
        })
        .collect()
}

// =========================================================================
// Whole-arm calibration
// =========================================================================

/// The calibration scheme in force for an arm, one entry per joint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArmCalibration {
    /// Logical unit: encoder ticks.
    OffsetDriveMode(Vec<JointOffset>),
    /// Logical unit: degrees.
    Interpolated(Vec<InterpolationTable>),
}

impl ArmCalibration {
    pub fn len(&self) -> usize {
        match self {
            Self::OffsetDriveMode(joints) => joints.len(),
            Self::Interpolated(tables) => tables.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw readings to logical values, element-wise.
    pub fn to_logical(&self, raw: &[Option<i32>]) -> Vec<Option<f32>> {
        match self {
            Self::OffsetDriveMode(joints) => raw
                .iter()
                .zip(joints)
                .map(|(value, joint)| value.map(|v| joint.to_logical(v) as f32))
                .collect(),
            Self::Interpolated(tables) => raw
                .iter()
                .zip(tables)
                .map(|(value, table)| value.map(|v| table.to_logical(v)))
                .collect(),
        }
    }

    /// Logical values to raw goal ticks, element-wise.
    pub fn to_physical(&self, logical: &[Option<f32>]) -> Vec<Option<i32>> {
        match self {
            Self::OffsetDriveMode(joints) => logical
                .iter()
                .zip(joints)
                .map(|(value, joint)| value.map(|v| joint.to_physical(v.round() as i32)))
                .collect(),
            Self::Interpolated(tables) => logical
                .iter()
                .zip(tables)
                .map(|(value, table)| value.map(|v| table.to_physical(v)))
                .collect(),
        }
    }
}
