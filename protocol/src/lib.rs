//! Wire format for the scheduler trace stream.
//!
//! Every packet is one frame: a 4-byte header (`version`, `packet_type`,
//! little-endian `total_length` including the header) followed by a fixed
//! little-endian payload selected by the packet type. Frames are
//! reassembled from arbitrary byte chunks by [`Decoder`].

use thiserror::Error;

pub use decoder::{Decoder, FrameSink};

pub(crate) mod decoder;

/// Current protocol version, first byte of every frame.
pub const VERSION: u8 = 1;

/// Bytes of `version`, `packet_type` and `total_length` before the payload.
pub const HEADER_SIZE: usize = 4;

/// Upper bound on a whole frame; reassembly buffers are pre-sized to this
/// so steady-state decoding never allocates.
pub const MAX_FRAME_SIZE: usize = 256;

/// Identifies a connected trace consumer on the fan-out side.
pub type ClientId = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("declared frame length {0} out of bounds")]
    FrameLength(u16),
    #[error("payload truncated: needed {needed} bytes, had {had}")]
    PayloadTruncated { needed: usize, had: usize },
    #[error("stream ended with {0} buffered bytes of an incomplete frame")]
    IncompleteStream(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    SchedSwitch = 0,
    SchedWakeup = 1,
    LostEvents = 2,
    TraceOn = 3,
    TraceOff = 4,
}

impl PacketType {
    fn from_u8(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(PacketType::SchedSwitch),
            1 => Ok(PacketType::SchedWakeup),
            2 => Ok(PacketType::LostEvents),
            3 => Ok(PacketType::TraceOn),
            4 => Ok(PacketType::TraceOff),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// One context switch observed on a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedSwitch {
    pub timestamp_ns: u64,
    pub cpu: i32,
    pub out_tid: i32,
    pub in_tid: i32,
    /// Syscall the switched-out thread was in, -1 if none.
    pub syscall_nr: i64,
    pub voluntary: bool,
}

/// A thread made runnable, targeted at a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedWakeup {
    pub timestamp_ns: u64,
    pub tid: i32,
    pub target_cpu: i32,
}

/// Events the source discarded before they could be shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostEvents {
    pub cpu: i32,
    pub count: u64,
}

/// Start delivering events for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOn {
    pub tid: i32,
}

/// Stop delivering events for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOff {
    pub tid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    SchedSwitch(SchedSwitch),
    SchedWakeup(SchedWakeup),
    LostEvents(LostEvents),
    TraceOn(TraceOn),
    TraceOff(TraceOff),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::SchedSwitch(_) => PacketType::SchedSwitch,
            Packet::SchedWakeup(_) => PacketType::SchedWakeup,
            Packet::LostEvents(_) => PacketType::LostEvents,
            Packet::TraceOn(_) => PacketType::TraceOn,
            Packet::TraceOff(_) => PacketType::TraceOff,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Packet::SchedSwitch(_) => 8 + 4 + 4 + 4 + 8 + 1,
            Packet::SchedWakeup(_) => 8 + 4 + 4,
            Packet::LostEvents(_) => 4 + 8,
            Packet::TraceOn(_) | Packet::TraceOff(_) => 4,
        }
    }

    /// Whole frame length, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Append one complete frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let total = self.frame_len() as u16;
        out.push(VERSION);
        out.push(self.packet_type() as u8);
        out.extend_from_slice(&total.to_le_bytes());
        match self {
            Packet::SchedSwitch(p) => {
                out.extend_from_slice(&p.timestamp_ns.to_le_bytes());
                out.extend_from_slice(&p.cpu.to_le_bytes());
                out.extend_from_slice(&p.out_tid.to_le_bytes());
                out.extend_from_slice(&p.in_tid.to_le_bytes());
                out.extend_from_slice(&p.syscall_nr.to_le_bytes());
                out.push(p.voluntary as u8);
            }
            Packet::SchedWakeup(p) => {
                out.extend_from_slice(&p.timestamp_ns.to_le_bytes());
                out.extend_from_slice(&p.tid.to_le_bytes());
                out.extend_from_slice(&p.target_cpu.to_le_bytes());
            }
            Packet::LostEvents(p) => {
                out.extend_from_slice(&p.cpu.to_le_bytes());
                out.extend_from_slice(&p.count.to_le_bytes());
            }
            Packet::TraceOn(p) => out.extend_from_slice(&p.tid.to_le_bytes()),
            Packet::TraceOff(p) => out.extend_from_slice(&p.tid.to_le_bytes()),
        }
    }

    pub(crate) fn decode_payload(
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<Packet, ProtocolError> {
        let mut reader = PayloadReader::new(payload);
        let packet = match packet_type {
            PacketType::SchedSwitch => Packet::SchedSwitch(SchedSwitch {
                timestamp_ns: reader.u64()?,
                cpu: reader.i32()?,
                out_tid: reader.i32()?,
                in_tid: reader.i32()?,
                syscall_nr: reader.i64()?,
                voluntary: reader.u8()? != 0,
            }),
            PacketType::SchedWakeup => Packet::SchedWakeup(SchedWakeup {
                timestamp_ns: reader.u64()?,
                tid: reader.i32()?,
                target_cpu: reader.i32()?,
            }),
            PacketType::LostEvents => Packet::LostEvents(LostEvents {
                cpu: reader.i32()?,
                count: reader.u64()?,
            }),
            PacketType::TraceOn => Packet::TraceOn(TraceOn { tid: reader.i32()? }),
            PacketType::TraceOff => Packet::TraceOff(TraceOff { tid: reader.i32()? }),
        };
        Ok(packet)
    }
}

/// Outbound fan-out capability exposed by whoever owns the client
/// connections; the event source drives it with typed packets.
pub trait PacketListener {
    fn unicast(&mut self, destination: ClientId, packet: &Packet);
    fn multicast(&mut self, packet: &Packet);
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        PayloadReader { payload, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + count > self.payload.len() {
            return Err(ProtocolError::PayloadTruncated {
                needed: self.pos + count,
                had: self.payload.len(),
            });
        }
        let bytes = &self.payload[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }
}
