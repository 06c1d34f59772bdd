// Instruction and status framing for Dynamixel X-series and Feetech
// SCS-series buses.
//
// Both families share the same frame shape:
//
//   [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
//
// where `Length = params + 2` and the checksum is the one's complement
// of the byte sum from ID through the last parameter. They differ in
// the sync instruction codes and, potentially, the byte order of
// multi-byte register values, so both are carried explicitly by the
// codec instead of living in global state: two buses of different
// families can coexist in one process.

/// Packet header bytes.
pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Reserved id addressing every motor on the chain at once.
pub const BROADCAST_ID: u8 = 0xFE;

/// Highest id a status frame can plausibly carry.
const MAX_STATUS_ID: u8 = 0xFD;

/// Largest plausible declared length (error + params + checksum).
const MAX_DECLARED_LEN: u8 = 250;

/// Instruction set shared by both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping,
    Read,
    Write,
    RegWrite,
    Action,
    SyncRead,
    SyncWrite,
}

/// Which servo family a bus speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    Dynamixel,
    Feetech,
}

/// Byte order of multi-byte register values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl ProtocolFamily {
    /// Family-specific instruction codes. Ping through Action are
    /// common; the sync instructions diverge.
    pub fn instruction_code(self, instruction: Instruction) -> u8 {
        match instruction {
            Instruction::Ping => 0x01,
            Instruction::Read => 0x02,
            Instruction::Write => 0x03,
            Instruction::RegWrite => 0x04,
            Instruction::Action => 0x05,
            Instruction::SyncRead => match self {
                Self::Dynamixel => 130,
                Self::Feetech => 132,
            },
            Instruction::SyncWrite => match self {
                Self::Dynamixel => 131,
                Self::Feetech => 83,
            },
        }
    }

    /// Both families run little-endian in this deployment.
    pub fn default_endianness(self) -> Endianness {
        Endianness::Little
    }
}

/// One's complement of the byte sum from id through the last parameter.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    (!sum & 0xFF) as u8
}

/// Frame builder for one bus. Family and endianness are fixed at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    family: ProtocolFamily,
    endianness: Endianness,
}

impl PacketCodec {
    pub fn new(family: ProtocolFamily) -> Self {
        Self {
            family,
            endianness: family.default_endianness(),
        }
    }

    pub fn with_endianness(family: ProtocolFamily, endianness: Endianness) -> Self {
        Self { family, endianness }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Encode a register value into exactly `out.len()` wire bytes.
    pub fn encode_value_into(&self, value: u32, out: &mut [u8]) {
        let le = value.to_le_bytes();
        match self.endianness {
            Endianness::Little => out.copy_from_slice(&le[..out.len()]),
            Endianness::Big => {
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = le[out.len() - 1 - i];
                }
            }
        }
    }

    /// Append a register value as `width` wire bytes.
    pub fn encode_value(&self, value: u32, width: u8, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + width as usize, 0);
        self.encode_value_into(value, &mut out[start..]);
    }

    /// Decode wire bytes into an unsigned register value.
    pub fn decode_value(&self, bytes: &[u8]) -> u32 {
        match self.endianness {
            Endianness::Little => bytes
                .iter()
                .enumerate()
                .fold(0u32, |v, (i, &b)| v | (b as u32) << (8 * i)),
            Endianness::Big => bytes.iter().fold(0u32, |v, &b| (v << 8) | b as u32),
        }
    }

    /// Build an instruction frame with header and checksum.
    pub fn instruction_frame(&self, id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8;
        let mut frame = Vec::with_capacity(6 + params.len());

        frame.extend_from_slice(&HEADER);
        frame.push(id);
        frame.push(length);
        frame.push(self.family.instruction_code(instruction));
        frame.extend_from_slice(params);
        frame.push(checksum(&frame[2..]));

        frame
    }

    pub fn ping_frame(&self, id: u8) -> Vec<u8> {
        self.instruction_frame(id, Instruction::Ping, &[])
    }

    pub fn read_frame(&self, id: u8, address: u16, width: u8) -> Vec<u8> {
        self.instruction_frame(id, Instruction::Read, &[address as u8, width])
    }

    pub fn write_frame(&self, id: u8, address: u16, width: u8, value: u32) -> Vec<u8> {
        let mut params = Vec::with_capacity(1 + width as usize);
        params.push(address as u8);
        self.encode_value(value, width, &mut params);
        self.instruction_frame(id, Instruction::Write, &params)
    }

    /// Stage a write to be committed later by `action_frame`.
    pub fn reg_write_frame(&self, id: u8, address: u16, width: u8, value: u32) -> Vec<u8> {
        let mut params = Vec::with_capacity(1 + width as usize);
        params.push(address as u8);
        self.encode_value(value, width, &mut params);
        self.instruction_frame(id, Instruction::RegWrite, &params)
    }

    pub fn action_frame(&self, id: u8) -> Vec<u8> {
        self.instruction_frame(id, Instruction::Action, &[])
    }

    /// Broadcast sync-read: `start_address, data_length` then the id
    /// list.
    pub fn sync_read_frame(&self, address: u16, width: u8, ids: &[u8]) -> Vec<u8> {
        let mut params = Vec::with_capacity(2 + ids.len());
        params.push(address as u8);
        params.push(width);
        params.extend_from_slice(ids);
        self.instruction_frame(BROADCAST_ID, Instruction::SyncRead, &params)
    }

    /// Broadcast sync-write: `start_address, data_length` then one
    /// `(id, data[width])` block per motor.
    pub fn sync_write_frame(&self, address: u16, width: u8, entries: &[(u8, u32)]) -> Vec<u8> {
        let mut params = Vec::with_capacity(2 + entries.len() * (1 + width as usize));
        params.push(address as u8);
        params.push(width);
        for &(id, value) in entries {
            params.push(id);
            self.encode_value(value, width, &mut params);
        }
        self.instruction_frame(BROADCAST_ID, Instruction::SyncWrite, &params)
    }
}

/// A parsed status frame: the response a servo returns after an
/// instruction, carrying a device error byte and optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    pub id: u8,
    pub error: u8,
    pub params: Vec<u8>,
}

/// Frame-level decode fault. The bus layer folds this into the
/// communication error taxonomy together with timeout context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// A declared frame arrived in full but its checksum does not match.
    Checksum { id: u8 },
}

/// Byte-accumulation state machine for status frames.
///
/// Accumulates until at least six bytes are buffered (the minimum
/// header + id + length + error + checksum), rescans for the 0xFF 0xFF
/// marker whenever the putative header is implausible (id above 0xFD,
/// declared length out of range, error byte with the high bit set),
/// then waits until the declared length completes the frame and
/// verifies the checksum. A single dropped or injected byte
/// desynchronizes the reader for at most one frame.
#[derive(Debug, Default)]
pub struct StatusDecoder {
    buf: Vec<u8>,
    header_seen: bool,
}

impl StatusDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.header_seen = false;
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Whether a plausible frame header has been located since the last
    /// reset. Distinguishes a partial frame from pure line noise when a
    /// deadline expires.
    pub fn header_seen(&self) -> bool {
        self.header_seen
    }

    /// Try to extract one complete frame from the accumulator.
    pub fn poll(&mut self) -> Result<Option<StatusFrame>, FrameError> {
        loop {
            let Some(start) = self.buf.windows(2).position(|w| w == HEADER) else {
                // Drop noise, keeping a trailing 0xFF that may be the
                // first half of a marker still in flight.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                self.buf.drain(..self.buf.len() - keep);
                return Ok(None);
            };
            self.buf.drain(..start);

            // Judge as much of the header as has arrived; an implausible
            // byte means this marker was payload noise, so skip it and
            // rescan. This is what bounds desynchronization to a single
            // frame.
            let id_ok = self.buf.get(2).is_none_or(|&id| id <= MAX_STATUS_ID);
            let len_ok = self
                .buf
                .get(3)
                .is_none_or(|&l| (2..=MAX_DECLARED_LEN).contains(&l));
            let err_ok = self.buf.get(4).is_none_or(|&e| e & 0x80 == 0);
            if !(id_ok && len_ok && err_ok) {
                // Advance one byte, not two: the real marker may overlap
                // the tail of the false one.
                self.buf.drain(..1);
                continue;
            }
            self.header_seen = true;

            if self.buf.len() < 6 {
                return Ok(None);
            }

            let id = self.buf[2];
            let length = self.buf[3];
            let error = self.buf[4];
            let total = 4 + length as usize;
            if self.buf.len() < total {
                return Ok(None);
            }

            let expected = checksum(&self.buf[2..total - 1]);
            let received = self.buf[total - 1];
            if expected != received {
                self.buf.drain(..total);
                return Err(FrameError::Checksum { id });
            }

            let frame = StatusFrame {
                id,
                error,
                params: self.buf[5..total - 1].to_vec(),
            };
            self.buf.drain(..total);
            return Ok(Some(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_bytes(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8;
        let mut frame = vec![0xFF, 0xFF, id, length, error];
        frame.extend_from_slice(params);
        frame.push(checksum(&frame[2..]));
        frame
    }

    #[test]
    fn checksum_inverted_sum() {
        // ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        let data = [1u8, 4, 0x03, 30, 0, 2];
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum(&data), 215);
    }

    #[test]
    fn ping_frame_layout() {
        let codec = PacketCodec::new(ProtocolFamily::Feetech);
        let frame = codec.ping_frame(1);
        assert_eq!(frame.len(), 6);
        assert_eq!(&frame[..2], &HEADER);
        assert_eq!(frame[2], 1);
        assert_eq!(frame[3], 2); // instruction + checksum
        assert_eq!(frame[4], 0x01);
        assert_eq!(frame[5], checksum(&frame[2..5]));
    }

    #[test]
    fn write_frame_encodes_value_little_endian() {
        let codec = PacketCodec::new(ProtocolFamily::Dynamixel);
        let frame = codec.write_frame(3, 116, 4, 0x0004_0302);
        assert_eq!(&frame[..2], &HEADER);
        assert_eq!(frame[2], 3);
        assert_eq!(frame[3], 7); // addr + 4 data + instruction + checksum
        assert_eq!(frame[4], 0x03);
        assert_eq!(frame[5], 116);
        assert_eq!(&frame[6..10], &[0x02, 0x03, 0x04, 0x00]);
        assert_eq!(frame[10], checksum(&frame[2..10]));
    }

    #[test]
    fn sync_instruction_codes_differ_per_family() {
        let dxl = PacketCodec::new(ProtocolFamily::Dynamixel);
        let scs = PacketCodec::new(ProtocolFamily::Feetech);

        assert_eq!(dxl.sync_read_frame(132, 4, &[1])[4], 130);
        assert_eq!(scs.sync_read_frame(56, 2, &[1])[4], 132);
        assert_eq!(dxl.sync_write_frame(116, 4, &[(1, 0)])[4], 131);
        assert_eq!(scs.sync_write_frame(42, 2, &[(1, 0)])[4], 83);
    }

    #[test]
    fn sync_write_frame_layout() {
        let codec = PacketCodec::new(ProtocolFamily::Feetech);
        let frame = codec.sync_write_frame(42, 2, &[(1, 0x0102), (2, 0x0304)]);

        assert_eq!(frame[2], BROADCAST_ID);
        assert_eq!(frame[5], 42); // start address
        assert_eq!(frame[6], 2); // data length
        assert_eq!(&frame[7..10], &[1, 0x02, 0x01]);
        assert_eq!(&frame[10..13], &[2, 0x04, 0x03]);
        assert_eq!(*frame.last().unwrap(), checksum(&frame[2..frame.len() - 1]));
    }

    #[test]
    fn value_round_trip_both_endiannesses() {
        for endianness in [Endianness::Little, Endianness::Big] {
            let codec = PacketCodec::with_endianness(ProtocolFamily::Dynamixel, endianness);
            for (value, width) in [(0xABu32, 1u8), (0xBEEF, 2), (0xDEAD_BEEF, 4)] {
                let mut out = Vec::new();
                codec.encode_value(value, width, &mut out);
                assert_eq!(out.len(), width as usize);
                assert_eq!(codec.decode_value(&out), value);
            }
        }
    }

    #[test]
    fn decoder_accepts_clean_frame() {
        let mut decoder = StatusDecoder::new();
        decoder.feed(&status_bytes(2, 0, &[0x10, 0x20]));

        let frame = decoder.poll().unwrap().unwrap();
        assert_eq!(frame.id, 2);
        assert_eq!(frame.error, 0);
        assert_eq!(frame.params, vec![0x10, 0x20]);
    }

    #[test]
    fn decoder_skips_leading_noise() {
        let mut decoder = StatusDecoder::new();
        let mut stream = vec![0x00, 0x37, 0xFF, 0x12];
        stream.extend_from_slice(&status_bytes(5, 0, &[9]));
        decoder.feed(&stream);

        let frame = decoder.poll().unwrap().unwrap();
        assert_eq!(frame.id, 5);
        assert_eq!(frame.params, vec![9]);
    }

    #[test]
    fn decoder_resyncs_past_implausible_header() {
        // 0xFF 0xFF followed by an impossible id, then a real frame.
        let mut decoder = StatusDecoder::new();
        let mut stream = vec![0xFF, 0xFF, 0xFF, 0x00];
        stream.extend_from_slice(&status_bytes(1, 0, &[7, 8]));
        decoder.feed(&stream);

        let frame = decoder.poll().unwrap().unwrap();
        assert_eq!(frame.id, 1);
        assert_eq!(frame.params, vec![7, 8]);
    }

    #[test]
    fn decoder_recovers_after_injected_byte() {
        // An injected byte corrupts frame one; frame two still decodes.
        let mut decoder = StatusDecoder::new();
        let mut corrupted = status_bytes(1, 0, &[1, 2]);
        corrupted.insert(5, 0x55);
        decoder.feed(&corrupted);
        decoder.feed(&status_bytes(1, 0, &[3, 4]));

        let mut frames = Vec::new();
        loop {
            match decoder.poll() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(_) => {} // corrupted frame reported, keep going
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].params, vec![3, 4]);
    }

    #[test]
    fn decoder_handles_split_feeds() {
        let mut decoder = StatusDecoder::new();
        let stream = status_bytes(3, 0, &[0xAA, 0xBB, 0xCC]);

        for byte in &stream[..stream.len() - 1] {
            decoder.feed(&[*byte]);
            assert!(decoder.poll().unwrap().is_none());
        }
        decoder.feed(&[*stream.last().unwrap()]);
        let frame = decoder.poll().unwrap().unwrap();
        assert_eq!(frame.params, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn decoder_reports_checksum_mismatch_for_any_flipped_byte() {
        let clean = status_bytes(4, 0, &[1, 2, 3, 4]);

        // Flip each payload byte position in turn; every flip must be
        // caught (the checksum itself flipped also mismatches).
        for position in 2..clean.len() {
            let mut corrupted = clean.clone();
            corrupted[position] ^= 0x01;
            let mut decoder = StatusDecoder::new();
            decoder.feed(&corrupted);
            match decoder.poll() {
                Err(FrameError::Checksum { .. }) => {}
                // A flip in id or length leaves the frame implausible or
                // incomplete instead; either way no clean frame emerges.
                Ok(None) => {}
                other => panic!("flip at {position} not detected: {other:?}"),
            }
        }
    }

    #[test]
    fn decoder_waits_for_declared_length() {
        let mut decoder = StatusDecoder::new();
        let stream = status_bytes(1, 0, &[1, 2, 3, 4]);
        decoder.feed(&stream[..7]);
        assert!(decoder.poll().unwrap().is_none());
        assert!(decoder.header_seen());
    }
}
