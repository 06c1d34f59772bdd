// Single-motor and grouped register access over one serial line.
//
// The protocol is strictly request/response: every instruction is
// followed synchronously by its status read before the next operation
// may begin. A Bus is single-threaded; the port-busy guard catches
// accidental reentrancy, not concurrent use. Closing is terminal and
// releases the serial line; a closed bus can only be replaced, never
// reopened.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{BusError, Result};
use crate::protocol::{FrameError, PacketCodec, ProtocolFamily, StatusDecoder, StatusFrame, checksum};
use crate::registers::{ControlTable, MotorModel, RegisterDef};
use crate::transport::{DEFAULT_BAUDRATE, DEFAULT_TIMEOUT_MS, SerialTransport, Transport};

/// Reserved broadcast id; valid unicast ids are 0..=253.
pub const MAX_MOTOR_ID: u8 = 253;

/// One motor on the chain, as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorDescriptor {
    pub id: u8,
    pub model: MotorModel,
    pub joint_name: String,
}

/// Bus lifecycle. `Closed` is terminal; re-opening requires a new Bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Uninitialized,
    Configuring,
    Calibrating,
    Operational,
    Closed,
}

impl BusState {
    fn may_transition_to(self, next: BusState) -> bool {
        use BusState::*;
        matches!(
            (self, next),
            (Uninitialized, Configuring)
                | (Configuring, Calibrating)
                | (Configuring, Operational)
                | (Calibrating, Operational)
                | (Uninitialized | Configuring | Calibrating | Operational, Closed)
        )
    }
}

/// Cached sync-write frame for one (field, id set). The data blocks are
/// rewritten in place on every call; only the first call allocates.
#[derive(Debug)]
struct GroupWrite {
    frame: Vec<u8>,
    ids: Vec<u8>,
    width: u8,
}

impl GroupWrite {
    fn new(codec: &PacketCodec, reg: RegisterDef, entries: &[(u8, u32)]) -> Self {
        let ids = entries.iter().map(|&(id, _)| id).collect();
        let frame = codec.sync_write_frame(reg.address, reg.width, entries);
        Self {
            frame,
            ids,
            width: reg.width,
        }
    }

    /// Overwrite each id's data block and refresh the checksum.
    fn update(&mut self, codec: &PacketCodec, entries: &[(u8, u32)]) {
        let width = self.width as usize;
        for &(id, value) in entries {
            let Some(slot) = self.ids.iter().position(|&i| i == id) else {
                continue;
            };
            let start = 7 + slot * (1 + width) + 1;
            codec.encode_value_into(value, &mut self.frame[start..start + width]);
        }
        let last = self.frame.len() - 1;
        self.frame[last] = checksum(&self.frame[2..last]);
    }
}

/// Cached sync-read request frame for one (field, id set).
#[derive(Debug)]
struct GroupRead {
    frame: Vec<u8>,
    ids: Vec<u8>,
}

impl GroupRead {
    fn new(codec: &PacketCodec, reg: RegisterDef, ids: &[u8]) -> Self {
        Self {
            frame: codec.sync_read_frame(reg.address, reg.width, ids),
            ids: ids.to_vec(),
        }
    }
}

type GroupKey = (String, Vec<u8>);

fn group_key(field: &str, ids: &[u8]) -> GroupKey {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    (field.to_string(), sorted)
}

pub struct Bus<T: Transport = SerialTransport> {
    transport: Option<T>,
    codec: PacketCodec,
    table: ControlTable,
    motors: HashMap<String, MotorDescriptor>,
    /// Joint names in declaration order.
    joint_order: Vec<String>,
    write_groups: HashMap<GroupKey, GroupWrite>,
    read_groups: HashMap<GroupKey, GroupRead>,
    decoder: StatusDecoder,
    state: BusState,
    packet_timeout: Duration,
    in_flight: bool,
}

impl Bus<SerialTransport> {
    /// Open the serial line at the deployment's standard baud rate.
    pub fn open(port: &str, family: ProtocolFamily, descriptors: &[MotorDescriptor]) -> Result<Self> {
        Self::open_with_baudrate(port, family, descriptors, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(
        port: &str,
        family: ProtocolFamily,
        descriptors: &[MotorDescriptor],
        baud_rate: u32,
    ) -> Result<Self> {
        info!("opening servo bus on {}", port);
        let transport = SerialTransport::open(port, baud_rate)?;
        Self::with_transport(transport, family, descriptors)
    }
}

impl<T: Transport> Bus<T> {
    /// Build a bus over an already-open transport. Descriptors are
    /// validated here, before any traffic: ids must be unicast and
    /// every model must belong to the bus's protocol family.
    pub fn with_transport(
        transport: T,
        family: ProtocolFamily,
        descriptors: &[MotorDescriptor],
    ) -> Result<Self> {
        let mut motors = HashMap::new();
        let mut joint_order = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            if descriptor.id > MAX_MOTOR_ID {
                return Err(BusError::InvalidMotorId(descriptor.id));
            }
            if descriptor.model.family() != family {
                return Err(BusError::UnsupportedModel(format!(
                    "{:?} on a {:?} bus",
                    descriptor.model, family
                )));
            }
            joint_order.push(descriptor.joint_name.clone());
            motors.insert(descriptor.joint_name.clone(), descriptor.clone());
        }

        Ok(Self {
            transport: Some(transport),
            codec: PacketCodec::new(family),
            table: ControlTable::new(),
            motors,
            joint_order,
            write_groups: HashMap::new(),
            read_groups: HashMap::new(),
            decoder: StatusDecoder::new(),
            state: BusState::Uninitialized,
            packet_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            in_flight: false,
        })
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn family(&self) -> ProtocolFamily {
        self.codec.family()
    }

    pub fn packet_timeout(&self) -> Duration {
        self.packet_timeout
    }

    pub fn set_packet_timeout(&mut self, timeout: Duration) {
        self.packet_timeout = timeout;
    }

    /// Joint names in declaration order.
    pub fn joint_names(&self) -> Vec<&str> {
        self.joint_order.iter().map(String::as_str).collect()
    }

    pub fn motor(&self, joint: &str) -> Option<&MotorDescriptor> {
        self.motors.get(joint)
    }

    /// Control-table entry for a joint's field.
    pub fn register(&self, joint: &str, field: &str) -> Result<RegisterDef> {
        let motor = self
            .motors
            .get(joint)
            .ok_or_else(|| BusError::UnknownJoint(joint.to_string()))?;
        self.table.lookup(motor.model, field)
    }

    /// Advance the lifecycle state machine. Transitions only move
    /// forward; `Closed` is reachable from everywhere and terminal.
    pub fn transition(&mut self, next: BusState) -> Result<()> {
        if self.state == BusState::Closed {
            return Err(BusError::Closed);
        }
        if !self.state.may_transition_to(next) {
            return Err(BusError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("bus state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Close the bus and release the serial line. Idempotent; every
    /// subsequent operation fails with `Closed`.
    pub fn close(&mut self) {
        if self.state != BusState::Closed {
            info!("closing servo bus");
            self.state = BusState::Closed;
        }
        // Dropping the transport releases the port even if the caller
        // got here via an error path.
        self.transport = None;
    }

    /// Drop any unread input. Recommended recovery when a caller raced
    /// an operation against an external timer and the bus may hold a
    /// half-received frame.
    pub fn clear_input(&mut self) -> Result<()> {
        self.decoder.reset();
        self.transport()?.clear_input()
    }

    /// Ping one motor id. `Ok(false)` on timeout; other faults surface
    /// as errors.
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        let frame = self.codec.ping_frame(id);
        match self.request(&frame, id, self.packet_timeout) {
            Ok(_) => Ok(true),
            Err(BusError::RxTimeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a named control-table field on one motor. The value is
    /// encoded little-endian into the field's declared width.
    pub fn write(&mut self, field: &str, joint: &str, value: u32) -> Result<()> {
        let (id, reg) = self.field_for(joint, field)?;
        let frame = self.codec.write_frame(id, reg.address, reg.width, value);
        debug!("write {}={} to motor {} ({})", field, value, id, joint);
        self.request(&frame, id, self.packet_timeout)?;
        Ok(())
    }

    /// Read a named field as its raw unsigned register content. Callers
    /// needing a signed interpretation apply
    /// [`crate::calibration::sign_extend`] over the field's width.
    pub fn read(&mut self, field: &str, joint: &str) -> Result<u32> {
        let (id, reg) = self.field_for(joint, field)?;
        let frame = self.codec.read_frame(id, reg.address, reg.width);
        let status = self.request(&frame, id, self.packet_timeout)?;
        self.decode_payload(id, reg, &status)
    }

    /// Stage a write to be committed later by [`Bus::action`].
    pub fn reg_write(&mut self, field: &str, joint: &str, value: u32) -> Result<()> {
        let (id, reg) = self.field_for(joint, field)?;
        let frame = self.codec.reg_write_frame(id, reg.address, reg.width, value);
        self.request(&frame, id, self.packet_timeout)?;
        Ok(())
    }

    /// Commit all staged writes on every motor at once.
    pub fn action(&mut self) -> Result<()> {
        let frame = self.codec.action_frame(crate::protocol::BROADCAST_ID);
        self.send(&frame)
    }

    /// Write one field across many motors in a single broadcast frame.
    /// `values` aligns with `joints`; `None` entries are skipped, so not
    /// every joint need participate. No status frame is returned for a
    /// broadcast write.
    pub fn sync_write(&mut self, field: &str, joints: &[&str], values: &[Option<u32>]) -> Result<()> {
        if joints.len() != values.len() {
            return Err(BusError::LengthMismatch {
                joints: joints.len(),
                values: values.len(),
            });
        }

        let mut entries = Vec::with_capacity(joints.len());
        let mut reg = None;
        for (joint, value) in joints.iter().zip(values) {
            let (id, r) = self.field_for(joint, field)?;
            reg = Some(r);
            if let Some(value) = value {
                entries.push((id, *value));
            }
        }
        let Some(reg) = reg else { return Ok(()) };
        if entries.is_empty() {
            return Ok(());
        }

        debug!("sync write {} to {} motors", field, entries.len());
        let key = group_key(field, &entries.iter().map(|&(id, _)| id).collect::<Vec<_>>());
        self.begin()?;
        let result = {
            let codec = self.codec;
            let group = self
                .write_groups
                .entry(key)
                .or_insert_with(|| GroupWrite::new(&codec, reg, &entries));
            group.update(&codec, &entries);
            match self.transport.as_mut() {
                Some(transport) => transport.write_all(&group.frame),
                None => Err(BusError::Closed),
            }
        };
        self.in_flight = false;
        result
    }

    /// Read one field from many motors, returned in request order.
    ///
    /// Dynamixel issues a single broadcast sync-read whose aggregated
    /// payload is split back into per-motor slices; a malformed
    /// aggregate is only detectable after all bytes arrive. Feetech has
    /// no hardware sync-read, so the bus issues one read round trip per
    /// motor and the first failure aborts the whole batch.
    pub fn sync_read(&mut self, field: &str, joints: &[&str]) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(joints.len());
        let mut reg = None;
        for joint in joints {
            let (id, r) = self.field_for(joint, field)?;
            ids.push(id);
            reg = Some(r);
        }
        let Some(reg) = reg else { return Ok(Vec::new()) };

        match self.codec.family() {
            ProtocolFamily::Dynamixel => self.sync_read_aggregate(field, reg, &ids),
            ProtocolFamily::Feetech => self.sync_read_sequential(reg, &ids),
        }
    }

    fn sync_read_aggregate(&mut self, field: &str, reg: RegisterDef, ids: &[u8]) -> Result<Vec<u32>> {
        let timeout = sync_timeout(self.baud_rate()?, reg.width, ids.len());
        let key = group_key(field, ids);

        self.begin()?;
        let result = (|| {
            let codec = self.codec;
            let request_ids = {
                let group = self
                    .read_groups
                    .entry(key)
                    .or_insert_with(|| GroupRead::new(&codec, reg, ids));
                match self.transport.as_mut() {
                    Some(transport) => transport.write_all(&group.frame)?,
                    None => return Err(BusError::Closed),
                }
                group.ids.clone()
            };
            // The aggregate comes back as one status-like frame carrying
            // the first motor's id and width * count payload bytes.
            let status = self.read_status(request_ids[0], timeout)?;
            let expected = reg.width as usize * request_ids.len();
            if status.params.len() != expected {
                return Err(BusError::RxCorrupt {
                    id: request_ids[0],
                    reason: format!(
                        "aggregate payload of {} bytes, expected {}",
                        status.params.len(),
                        expected
                    ),
                });
            }
            let by_id: HashMap<u8, u32> = request_ids
                .iter()
                .zip(status.params.chunks(reg.width as usize))
                .map(|(&id, chunk)| (id, self.codec.decode_value(chunk)))
                .collect();
            Ok(ids.iter().map(|id| by_id[id]).collect())
        })();
        self.in_flight = false;
        result
    }

    fn sync_read_sequential(&mut self, reg: RegisterDef, ids: &[u8]) -> Result<Vec<u32>> {
        let mut values = Vec::with_capacity(ids.len());
        for &id in ids {
            let frame = self.codec.read_frame(id, reg.address, reg.width);
            let status = self.request(&frame, id, self.packet_timeout)?;
            values.push(self.decode_payload(id, reg, &status)?);
        }
        Ok(values)
    }

    fn field_for(&self, joint: &str, field: &str) -> Result<(u8, RegisterDef)> {
        let motor = self
            .motors
            .get(joint)
            .ok_or_else(|| BusError::UnknownJoint(joint.to_string()))?;
        let reg = self.table.lookup(motor.model, field)?;
        Ok((motor.id, reg))
    }

    fn decode_payload(&self, id: u8, reg: RegisterDef, status: &StatusFrame) -> Result<u32> {
        if status.params.len() != reg.width as usize {
            return Err(BusError::RxCorrupt {
                id,
                reason: format!(
                    "payload of {} bytes, expected {}",
                    status.params.len(),
                    reg.width
                ),
            });
        }
        Ok(self.codec.decode_value(&status.params))
    }

    fn transport(&mut self) -> Result<&mut T> {
        self.transport.as_mut().ok_or(BusError::Closed)
    }

    #[cfg(test)]
    pub(crate) fn test_transport(&mut self) -> &mut T {
        self.transport.as_mut().expect("bus closed")
    }

    fn baud_rate(&self) -> Result<u32> {
        self.transport
            .as_ref()
            .map(Transport::baud_rate)
            .ok_or(BusError::Closed)
    }

    fn begin(&mut self) -> Result<()> {
        if self.state == BusState::Closed || self.transport.is_none() {
            return Err(BusError::Closed);
        }
        if self.in_flight {
            return Err(BusError::PortBusy);
        }
        self.in_flight = true;
        Ok(())
    }

    /// Fire-and-forget instruction (broadcast writes have no status).
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.begin()?;
        let result = self.transport().and_then(|t| t.write_all(frame));
        self.in_flight = false;
        result
    }

    /// One request/response transaction.
    fn request(&mut self, frame: &[u8], expected_id: u8, timeout: Duration) -> Result<StatusFrame> {
        self.begin()?;
        let result = (|| {
            self.transport()?.write_all(frame)?;
            self.read_status(expected_id, timeout)
        })();
        self.in_flight = false;
        result
    }

    /// Accumulate bytes until a status frame completes or the deadline
    /// expires. Timeout with zero bytes is RxTimeout; with a partial
    /// plausible frame, RxCorrupt; with bytes that never formed a
    /// header, ParsingError.
    fn read_status(&mut self, expected_id: u8, timeout: Duration) -> Result<StatusFrame> {
        self.decoder.reset();
        let deadline = Instant::now() + timeout;
        let mut received = 0usize;
        let mut chunk = [0u8; 64];

        loop {
            match self.decoder.poll() {
                Ok(Some(frame)) => {
                    if frame.id != expected_id {
                        return Err(BusError::UnexpectedId {
                            expected: expected_id,
                            got: frame.id,
                        });
                    }
                    if frame.error != 0 {
                        return Err(BusError::DeviceError {
                            id: frame.id,
                            flags: frame.error,
                        });
                    }
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(FrameError::Checksum { id }) => {
                    return Err(BusError::RxCorrupt {
                        id,
                        reason: "checksum mismatch".to_string(),
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(expected_id, received, timeout));
            }
            let n = match self.transport.as_mut() {
                Some(transport) => transport.read_some(&mut chunk, remaining)?,
                None => return Err(BusError::Closed),
            };
            if n == 0 {
                // The transport waited the full remaining time.
                return Err(self.timeout_error(expected_id, received, timeout));
            }
            self.decoder.feed(&chunk[..n]);
            received += n;
        }
    }

    fn timeout_error(&self, id: u8, received: usize, timeout: Duration) -> BusError {
        if received == 0 {
            BusError::RxTimeout {
                id,
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if self.decoder.header_seen() {
            BusError::RxCorrupt {
                id,
                reason: format!("partial frame after {received} bytes"),
            }
        } else {
            BusError::ParsingError { id }
        }
    }
}

impl<T: Transport> Drop for Bus<T> {
    fn drop(&mut self) {
        if self.state != BusState::Closed {
            debug!("servo bus dropped without an explicit close");
        }
    }
}

/// Receive deadline for a grouped operation: (width + 6) status bytes
/// per motor at 10 bits per character, scaled to the baud rate.
fn sync_timeout(baud_rate: u32, width: u8, count: usize) -> Duration {
    let chars = (width as u64 + 6) * count as u64;
    Duration::from_micros(chars * 10 * 1_000_000 / baud_rate as u64)
}
