use std::fmt::{Display, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// Every framed packet starts with these bytes.
pub const SYNC: [u8; 3] = [0xA3, 0x9D, 0x7A];

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 16;

/// The largest frame (header included) the size field can describe.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// The largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

const CHECKSUM_OFFSET: usize = 6;

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// The kind of a packet, i.e. where it came from or what it is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketType {
    /// Origin unknown, e.g. bytes written by a sniffer.
    Unknown,
    /// Data read from the instrument.
    FromInstrument,
    /// Data written by a driver, destined for the instrument.
    FromDriver,
    /// A command line received on the command port.
    PaCommand,
    /// Agent status, `CONNECTED` or `DISCONNECTED`.
    PaStatus,
    /// Something went wrong handling a command.
    PaFault,
    /// Agent configuration or version.
    PaConfig,
    /// A command for the auxiliary command channel.
    DigiCmd,
    /// A response from the auxiliary command channel.
    DigiRsp,
    /// Periodic liveness packet.
    PaHeartbeat,
    /// Instrument data which has already been pickled upstream.
    PickledFromInstrument,
}

impl PacketType {
    /// Every concrete packet type, in wire code order.
    pub const ALL: [PacketType; 11] = [
        PacketType::Unknown,
        PacketType::FromInstrument,
        PacketType::FromDriver,
        PacketType::PaCommand,
        PacketType::PaStatus,
        PacketType::PaFault,
        PacketType::PaConfig,
        PacketType::DigiCmd,
        PacketType::DigiRsp,
        PacketType::PaHeartbeat,
        PacketType::PickledFromInstrument,
    ];

    /// The code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            PacketType::Unknown => 0,
            PacketType::FromInstrument => 1,
            PacketType::FromDriver => 2,
            PacketType::PaCommand => 3,
            PacketType::PaStatus => 4,
            PacketType::PaFault => 5,
            PacketType::PaConfig => 6,
            PacketType::DigiCmd => 7,
            PacketType::DigiRsp => 8,
            PacketType::PaHeartbeat => 9,
            PacketType::PickledFromInstrument => 10,
        }
    }

    /// Look up a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// The name used in log output.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Unknown => "UNKNOWN",
            PacketType::FromInstrument => "DATA_FROM_INSTRUMENT",
            PacketType::FromDriver => "DATA_FROM_DRIVER",
            PacketType::PaCommand => "PORT_AGENT_COMMAND",
            PacketType::PaStatus => "PORT_AGENT_STATUS",
            PacketType::PaFault => "PORT_AGENT_FAULT",
            PacketType::PaConfig => "PORT_AGENT_CONFIG",
            PacketType::DigiCmd => "DIGI_CMD",
            PacketType::DigiRsp => "DIGI_RSP",
            PacketType::PaHeartbeat => "PORT_AGENT_HEARTBEAT",
            PacketType::PickledFromInstrument => "PICKLED_FROM_INSTRUMENT",
        }
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// NTP style 32.32 fixed point timestamp.
///
/// The high 32 bits count seconds since 1900-01-01, the low 32 bits are a
/// binary fraction of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The current time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Wrap raw wire bits.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The raw wire bits.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Whole seconds since the NTP epoch.
    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Binary fraction of a second.
    pub fn fraction(&self) -> u32 {
        self.0 as u32
    }

    /// Convert from a point in time. Times before 1900 saturate to the epoch.
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let seconds = (time.timestamp() + NTP_UNIX_OFFSET as i64).max(0) as u64;
        let fraction = ((time.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;

        Self((seconds << 32) | fraction)
    }

    /// Convert to a point in time, with nanosecond precision.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let unix_seconds = self.seconds() as i64 - NTP_UNIX_OFFSET as i64;
        let nanos = ((self.fraction() as u64 * 1_000_000_000) >> 32) as u32;

        Utc.timestamp_opt(unix_seconds, nanos)
            .single()
            .unwrap_or_default()
    }
}

/// Problems finding a frame in a byte stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The buffer does not start with the sync sequence.
    #[error("Frame does not start with the sync sequence")]
    BadSync,

    /// The size field is smaller than the header.
    #[error("Frame size {0} is smaller than the header")]
    BadSize(u16),

    /// Header and payload do not sum to the checksum in the header.
    #[error("Checksum mismatch, header says {expected:#06x} but frame sums to {computed:#06x}")]
    Checksum {
        /// From the header.
        expected: u16,
        /// Computed over the received frame.
        computed: u16,
    },

    /// The type code is not one we know.
    #[error("Unknown packet type code {0}")]
    UnknownType(u8),

    /// A single frame can not carry this much.
    #[error("Payload of {0} bytes does not fit in a single frame")]
    PayloadTooLarge(usize),
}

/// A timestamped, typed unit of data.
///
/// Packets are immutable. They are created when data arrives, when the agent
/// has something to say (status, heartbeat, config) and as command responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    timestamp: Timestamp,
    payload: Bytes,
}

impl Packet {
    /// Build a single frame.
    pub fn new(
        packet_type: PacketType,
        timestamp: Timestamp,
        payload: Bytes,
    ) -> Result<Self, FramingError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FramingError::PayloadTooLarge(payload.len()));
        }

        Ok(Self {
            packet_type,
            timestamp,
            payload,
        })
    }

    /// Create packets holding `payload`, timestamped now.
    ///
    /// See [`Packet::create_at`].
    pub fn create(payload: impl Into<Bytes>, packet_type: PacketType) -> Vec<Packet> {
        Self::create_at(payload, packet_type, Timestamp::now())
    }

    /// Create packets holding `payload`.
    ///
    /// Payloads larger than [`MAX_PAYLOAD_SIZE`] are split into consecutive
    /// packets sharing type and timestamp. An empty payload still gives one packet.
    pub fn create_at(
        payload: impl Into<Bytes>,
        packet_type: PacketType,
        timestamp: Timestamp,
    ) -> Vec<Packet> {
        let mut payload = payload.into();

        if payload.is_empty() {
            return vec![Packet {
                packet_type,
                timestamp,
                payload,
            }];
        }

        let mut packets = Vec::with_capacity(payload.len().div_ceil(MAX_PAYLOAD_SIZE));
        while !payload.is_empty() {
            let chunk = payload.split_to(payload.len().min(MAX_PAYLOAD_SIZE));
            packets.push(Packet {
                packet_type,
                timestamp,
                payload: chunk,
            });
        }

        packets
    }

    /// Join the payloads of packets made by [`Packet::create`].
    pub fn reassemble(packets: &[Packet]) -> Bytes {
        match packets {
            [single] => single.payload.clone(),
            many => {
                let mut joined = BytesMut::with_capacity(many.iter().map(Packet::len).sum());
                for packet in many {
                    joined.extend_from_slice(&packet.payload);
                }
                joined.freeze()
            }
        }
    }

    /// What kind of packet this is.
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// When the packet was made.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The data carried.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Size of the serialized frame.
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// The exact wire representation.
    pub fn serialize(&self) -> Bytes {
        let size = self.frame_size();
        let mut frame = BytesMut::with_capacity(size);

        frame.put_slice(&SYNC);
        frame.put_u8(self.packet_type.code());
        frame.put_u16(size as u16);
        frame.put_u16(0);
        frame.put_u64(self.timestamp.bits());
        frame.put_slice(&self.payload);

        let sum = checksum(&frame);
        frame[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());

        frame.freeze()
    }

    /// Take one frame off the front of `buffer`.
    ///
    /// Gives `Ok(None)` and leaves the buffer alone if a full frame has not
    /// arrived yet. On error the buffer is also left alone; see [`resynchronize`].
    pub fn parse(buffer: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
        let prefix = buffer.len().min(SYNC.len());
        if buffer[..prefix] != SYNC[..prefix] {
            return Err(FramingError::BadSync);
        }

        if buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = u16::from_be_bytes([buffer[4], buffer[5]]);
        if (size as usize) < HEADER_SIZE {
            return Err(FramingError::BadSize(size));
        }

        let size = size as usize;
        if buffer.len() < size {
            return Ok(None);
        }

        let expected = u16::from_be_bytes([buffer[CHECKSUM_OFFSET], buffer[CHECKSUM_OFFSET + 1]]);
        let computed = checksum(&buffer[..size]);
        if expected != computed {
            return Err(FramingError::Checksum { expected, computed });
        }

        let code = buffer[3];
        let packet_type = PacketType::from_code(code).ok_or(FramingError::UnknownType(code))?;

        let mut frame = buffer.split_to(size).freeze();
        frame.advance(8);
        let timestamp = Timestamp::from_bits(frame.get_u64());

        Ok(Some(Packet {
            packet_type,
            timestamp,
            payload: frame,
        }))
    }

    /// A single human readable line describing the packet.
    ///
    /// Payload bytes outside printable ASCII are escaped.
    pub fn logstring(&self) -> String {
        let time = self
            .timestamp
            .to_datetime()
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let mut line = String::with_capacity(self.payload.len() + 80);
        let _ = write!(
            line,
            "<packet type=\"{}\" time=\"{time}\" length=\"{}\">",
            self.packet_type,
            self.payload.len()
        );
        escape_into(&mut line, &self.payload);
        line.push_str("</packet>\n");

        line
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} bytes)", self.packet_type, self.payload.len())
    }
}

fn escape_into(out: &mut String, bytes: &[u8]) {
    for &byte in bytes {
        match byte {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
}

/// Wrapping 16-bit sum over a whole frame, with the checksum field counted as zero.
fn checksum(frame: &[u8]) -> u16 {
    frame
        .iter()
        .enumerate()
        .filter(|(index, _)| !(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2).contains(index))
        .fold(0u16, |sum, (_, &byte)| sum.wrapping_add(byte as u16))
}

/// Drop bytes from the front of `buffer` up to the next possible frame start.
///
/// The first byte is always dropped (it started the frame which failed).
/// A trailing partial sync sequence is kept since the rest of it may be in flight.
/// Returns how many bytes were dropped.
pub fn resynchronize(buffer: &mut BytesMut) -> usize {
    if buffer.is_empty() {
        return 0;
    }

    let found = buffer[1..]
        .windows(SYNC.len())
        .position(|window| window == SYNC)
        .map(|position| position + 1);

    let drop = found.unwrap_or_else(|| {
        let len = buffer.len();
        (len.saturating_sub(SYNC.len() - 1).max(1)..len)
            .find(|&start| SYNC.starts_with(&buffer[start..]))
            .unwrap_or(len)
    });

    buffer.advance(drop);
    drop
}
