//! Wire packet format
//!
//! Every datagram starts with a fixed 29-byte header in network byte
//! order, followed by a kind-specific trailer and the payload:
//!
//! ```text
//! offset size  field
//!   0     4    magic = 0x5354524D ("STRM")
//!   4     2    version = 0x0100
//!   6     4    session_id
//!  10     4    sequence
//!  14     8    capture_timestamp_us
//!  22     1    packet_kind
//!  23     1    frame_class
//!  24     1    flags (bit0 first-of-frame, bit1 last-of-frame)
//!  25     2    payload_length
//!  27     2    header_checksum (one's complement over bytes 0..27, field zeroed)
//! ```
//!
//! VIDEO and RETRANSMIT packets carry a 12-byte fragmentation trailer,
//! FEC packets a 16-byte group trailer, CONTROL packets a 5-byte command
//! trailer, AUDIO packets a 6-byte sample trailer. The checksum covers the
//! fixed header only; payload integrity is the transport's problem.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::codec::frame::FrameClass;

/// Wire magic, "STRM"
pub const PROTOCOL_MAGIC: u32 = 0x5354_524D;

/// Protocol version 1.0
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Fixed header length in bytes
pub const HEADER_SIZE: usize = 29;

/// Fixed header plus the video fragmentation trailer
pub const VIDEO_HEADER_SIZE: usize = HEADER_SIZE + 12;

/// Largest datagram the engine will emit
pub const MAX_PACKET_SIZE: usize = 1400;

/// Smallest MTU that leaves room for a video trailer and any payload
pub const MIN_MTU: usize = VIDEO_HEADER_SIZE + 16;

/// First-of-frame flag bit
pub const FLAG_FIRST_OF_FRAME: u8 = 0b0000_0001;

/// Last-of-frame flag bit
pub const FLAG_LAST_OF_FRAME: u8 = 0b0000_0010;

/// Errors while parsing a datagram
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Too few bytes for the fixed header or declared payload
    #[error("datagram truncated: {got} bytes, needed {needed}")]
    Truncated {
        /// Bytes available
        got: usize,
        /// Bytes required
        needed: usize,
    },

    /// Magic mismatch
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),

    /// Unsupported protocol version
    #[error("unsupported version 0x{0:04X}")]
    BadVersion(u16),

    /// Header checksum mismatch
    #[error("header checksum mismatch: computed 0x{computed:04X}, carried 0x{carried:04X}")]
    ChecksumMismatch {
        /// Checksum computed over the received header
        computed: u16,
        /// Checksum carried in the header
        carried: u16,
    },

    /// Unknown packet kind byte
    #[error("unknown packet kind 0x{0:02X}")]
    UnknownKind(u8),

    /// Unknown frame class byte
    #[error("unknown frame class 0x{0:02X}")]
    UnknownClass(u8),
}

/// Datagram kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Encoded video fragment
    Video = 0x10,
    /// Pre-encoded audio payload
    Audio = 0x20,
    /// Session control command
    Control = 0x30,
    /// Forward-error-correction recovery data
    Fec = 0x40,
    /// Retransmission of a previously sent video fragment
    Retransmit = 0x50,
}

impl PacketKind {
    /// Parse the wire byte
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::Video),
            0x20 => Some(Self::Audio),
            0x30 => Some(Self::Control),
            0x40 => Some(Self::Fec),
            0x50 => Some(Self::Retransmit),
            _ => None,
        }
    }
}

/// Control command types carried in CONTROL packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    /// Session open request
    Handshake = 0x01,
    /// Session open acknowledgment
    HandshakeAck = 0x02,
    /// Cumulative acknowledgment; datum is the highest contiguous seq
    Ack = 0x03,
    /// Negative acknowledgment; datum is the missing seq
    Nack = 0x04,
    /// Liveness refresh for an idle session
    Keepalive = 0x05,
    /// Orderly session close
    Close = 0x06,
    /// Receiver-side bitrate hint, datum in bits per second
    BitrateHint = 0x07,
}

impl ControlType {
    /// Parse the wire byte
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::Ack),
            0x04 => Some(Self::Nack),
            0x05 => Some(Self::Keepalive),
            0x06 => Some(Self::Close),
            0x07 => Some(Self::BitrateHint),
            _ => None,
        }
    }
}

/// FEC algorithm identifier on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FecAlgorithm {
    /// Single-parity XOR
    Xor = 0x01,
    /// GF(256) Reed-Solomon
    ReedSolomon = 0x02,
}

impl FecAlgorithm {
    /// Parse the wire byte
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Xor),
            0x02 => Some(Self::ReedSolomon),
            _ => None,
        }
    }
}

/// The fixed 29-byte header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Session this packet belongs to
    pub session_id: u32,
    /// Wire sequence number, assigned by the pacer at send time
    pub seq: u32,
    /// Capture timestamp of the carried frame, microseconds
    pub capture_ts_us: u64,
    /// Datagram kind
    pub kind: PacketKind,
    /// Frame classification
    pub frame_class: FrameClass,
    /// Flag bits
    pub flags: u8,
    /// Payload length in bytes
    pub payload_len: u16,
}

/// Fragmentation trailer on VIDEO / RETRANSMIT packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTrailer {
    /// Frame the fragment belongs to
    pub frame_id: u32,
    /// Fragment index within the frame, `0..packet_count`
    pub packet_index: u16,
    /// Total fragments in the frame
    pub packet_count: u16,
    /// Byte offset of this fragment in the encoded frame
    pub fragment_offset: u32,
}

/// Group trailer on FEC packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecTrailer {
    /// Sender-scoped group identifier
    pub group_id: u16,
    /// Recovery algorithm
    pub algorithm: FecAlgorithm,
    /// Index of this recovery packet within the group, `0..m`
    pub recovery_index: u8,
    /// Source packets protected
    pub k: u16,
    /// Recovery packets produced
    pub m: u16,
    /// Frame the protected packets belong to
    pub frame_id: u32,
    /// `packet_index` of the first protected source packet
    pub base_index: u16,
    /// Length the group's payloads were padded to
    pub protected_len: u16,
}

/// Command trailer on CONTROL packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTrailer {
    /// Command
    pub control_type: ControlType,
    /// Command-specific datum
    pub datum: u32,
}

/// Sample trailer on AUDIO packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTrailer {
    /// Samples per channel in the payload
    pub sample_count: u32,
    /// Channel count
    pub channels: u8,
    /// Collaborator-defined payload format tag
    pub format: u8,
}

/// Kind-specific trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    /// VIDEO / RETRANSMIT fragmentation info
    Video(VideoTrailer),
    /// FEC group info
    Fec(FecTrailer),
    /// Control command
    Control(ControlTrailer),
    /// Audio sample info
    Audio(AudioTrailer),
}

impl Trailer {
    fn wire_len(&self) -> usize {
        match self {
            Trailer::Video(_) => 12,
            Trailer::Fec(_) => 16,
            Trailer::Control(_) => 5,
            Trailer::Audio(_) => 6,
        }
    }
}

/// One transmittable packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Fixed header
    pub header: PacketHeader,
    /// Kind-specific trailer
    pub trailer: Trailer,
    /// Payload bytes
    pub payload: Bytes,
}

impl Packet {
    /// Total serialized size
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.trailer.wire_len() + self.payload.len()
    }

    /// Serialize to wire bytes, computing the header checksum
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u32(PROTOCOL_MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u32(self.header.session_id);
        buf.put_u32(self.header.seq);
        buf.put_u64(self.header.capture_ts_us);
        buf.put_u8(self.header.kind as u8);
        buf.put_u8(self.header.frame_class as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(self.header.payload_len);
        let checksum = internet_checksum(&buf[..HEADER_SIZE - 2]);
        buf.put_u16(checksum);

        match &self.trailer {
            Trailer::Video(t) => {
                buf.put_u32(t.frame_id);
                buf.put_u16(t.packet_index);
                buf.put_u16(t.packet_count);
                buf.put_u32(t.fragment_offset);
            }
            Trailer::Fec(t) => {
                buf.put_u16(t.group_id);
                buf.put_u8(t.algorithm as u8);
                buf.put_u8(t.recovery_index);
                buf.put_u16(t.k);
                buf.put_u16(t.m);
                buf.put_u32(t.frame_id);
                buf.put_u16(t.base_index);
                buf.put_u16(t.protected_len);
            }
            Trailer::Control(t) => {
                buf.put_u8(t.control_type as u8);
                buf.put_u32(t.datum);
            }
            Trailer::Audio(t) => {
                buf.put_u32(t.sample_count);
                buf.put_u8(t.channels);
                buf.put_u8(t.format);
            }
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a datagram, validating magic, version and header checksum
    pub fn decode(data: &[u8]) -> Result<Packet, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::Truncated { got: data.len(), needed: HEADER_SIZE });
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != PROTOCOL_MAGIC {
            return Err(PacketError::BadMagic(magic));
        }
        let version = buf.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let session_id = buf.get_u32();
        let seq = buf.get_u32();
        let capture_ts_us = buf.get_u64();
        let kind_byte = buf.get_u8();
        let class_byte = buf.get_u8();
        let flags = buf.get_u8();
        let payload_len = buf.get_u16();
        let carried = buf.get_u16();

        let computed = internet_checksum(&data[..HEADER_SIZE - 2]);
        if carried != computed {
            return Err(PacketError::ChecksumMismatch { computed, carried });
        }

        let kind = PacketKind::from_wire(kind_byte).ok_or(PacketError::UnknownKind(kind_byte))?;
        let frame_class =
            FrameClass::from_wire(class_byte).ok_or(PacketError::UnknownClass(class_byte))?;

        let trailer = match kind {
            PacketKind::Video | PacketKind::Retransmit => {
                need(buf.remaining(), 12, data.len())?;
                Trailer::Video(VideoTrailer {
                    frame_id: buf.get_u32(),
                    packet_index: buf.get_u16(),
                    packet_count: buf.get_u16(),
                    fragment_offset: buf.get_u32(),
                })
            }
            PacketKind::Fec => {
                need(buf.remaining(), 16, data.len())?;
                let group_id = buf.get_u16();
                let algo_byte = buf.get_u8();
                let algorithm = FecAlgorithm::from_wire(algo_byte)
                    .ok_or(PacketError::UnknownKind(algo_byte))?;
                Trailer::Fec(FecTrailer {
                    group_id,
                    algorithm,
                    recovery_index: buf.get_u8(),
                    k: buf.get_u16(),
                    m: buf.get_u16(),
                    frame_id: buf.get_u32(),
                    base_index: buf.get_u16(),
                    protected_len: buf.get_u16(),
                })
            }
            PacketKind::Control => {
                need(buf.remaining(), 5, data.len())?;
                let type_byte = buf.get_u8();
                let control_type = ControlType::from_wire(type_byte)
                    .ok_or(PacketError::UnknownKind(type_byte))?;
                Trailer::Control(ControlTrailer { control_type, datum: buf.get_u32() })
            }
            PacketKind::Audio => {
                need(buf.remaining(), 6, data.len())?;
                Trailer::Audio(AudioTrailer {
                    sample_count: buf.get_u32(),
                    channels: buf.get_u8(),
                    format: buf.get_u8(),
                })
            }
        };

        need(buf.remaining(), usize::from(payload_len), data.len())?;
        let payload = Bytes::copy_from_slice(&buf[..usize::from(payload_len)]);

        Ok(Packet {
            header: PacketHeader {
                session_id,
                seq,
                capture_ts_us,
                kind,
                frame_class,
                flags,
                payload_len,
            },
            trailer,
            payload,
        })
    }
}

fn need(remaining: usize, wanted: usize, total: usize) -> Result<(), PacketError> {
    if remaining < wanted {
        Err(PacketError::Truncated { got: total, needed: total + wanted - remaining })
    } else {
        Ok(())
    }
}

/// Internet-style 16-bit one's-complement checksum
///
/// Odd trailing byte is padded with zero, RFC 1071 style.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_packet() -> Packet {
        Packet {
            header: PacketHeader {
                session_id: 0xAABB_CCDD,
                seq: 42,
                capture_ts_us: 1_234_567,
                kind: PacketKind::Video,
                frame_class: FrameClass::Key,
                flags: FLAG_FIRST_OF_FRAME,
                payload_len: 5,
            },
            trailer: Trailer::Video(VideoTrailer {
                frame_id: 7,
                packet_index: 0,
                packet_count: 3,
                fragment_offset: 0,
            }),
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn test_video_roundtrip() {
        let packet = video_packet();
        let wire = packet.encode();
        assert_eq!(wire.len(), VIDEO_HEADER_SIZE + 5);
        let parsed = Packet::decode(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_layout_offsets() {
        let wire = video_packet().encode();
        assert_eq!(&wire[0..4], &0x5354_524Du32.to_be_bytes());
        assert_eq!(&wire[4..6], &0x0100u16.to_be_bytes());
        assert_eq!(&wire[10..14], &42u32.to_be_bytes());
        assert_eq!(wire[22], 0x10); // VIDEO
        assert_eq!(wire[23], 0x01); // KEY
        assert_eq!(wire[24], FLAG_FIRST_OF_FRAME);
        assert_eq!(&wire[25..27], &5u16.to_be_bytes());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let wire = video_packet().encode();
        let mut corrupted = wire.to_vec();
        corrupted[11] ^= 0x40; // flip a bit inside seq
        assert!(matches!(
            Packet::decode(&corrupted),
            Err(PacketError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_of_header_verifies() {
        let wire = video_packet().encode();
        // Recomputing over bytes 0..27 with the carried checksum appended
        // must produce the complement relationship of RFC 1071
        let computed = internet_checksum(&wire[..HEADER_SIZE - 2]);
        let carried = u16::from_be_bytes([wire[27], wire[28]]);
        assert_eq!(computed, carried);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut wire = video_packet().encode().to_vec();
        wire[0] = 0x00;
        assert!(matches!(Packet::decode(&wire), Err(PacketError::BadMagic(_))));
    }

    #[test]
    fn test_truncated_rejected() {
        let wire = video_packet().encode();
        assert!(matches!(
            Packet::decode(&wire[..10]),
            Err(PacketError::Truncated { .. })
        ));
        // Payload cut short
        assert!(matches!(
            Packet::decode(&wire[..wire.len() - 2]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_control_roundtrip() {
        let packet = Packet {
            header: PacketHeader {
                session_id: 1,
                seq: 0,
                capture_ts_us: 0,
                kind: PacketKind::Control,
                frame_class: FrameClass::Audio,
                flags: 0,
                payload_len: 0,
            },
            trailer: Trailer::Control(ControlTrailer {
                control_type: ControlType::Ack,
                datum: 9_999,
            }),
            payload: Bytes::new(),
        };
        let parsed = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_fec_roundtrip() {
        let packet = Packet {
            header: PacketHeader {
                session_id: 3,
                seq: 100,
                capture_ts_us: 55,
                kind: PacketKind::Fec,
                frame_class: FrameClass::Predicted,
                flags: 0,
                payload_len: 4,
            },
            trailer: Trailer::Fec(FecTrailer {
                group_id: 12,
                algorithm: FecAlgorithm::ReedSolomon,
                recovery_index: 1,
                k: 10,
                m: 2,
                frame_id: 77,
                base_index: 0,
                protected_len: 4,
            }),
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let parsed = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_retransmit_carries_video_trailer() {
        let mut packet = video_packet();
        packet.header.kind = PacketKind::Retransmit;
        let parsed = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(parsed.header.kind, PacketKind::Retransmit);
        assert!(matches!(parsed.trailer, Trailer::Video(_)));
    }

    #[test]
    fn test_internet_checksum_known_values() {
        // All zeros sum to zero, complement is all ones
        assert_eq!(internet_checksum(&[0, 0, 0, 0]), 0xFFFF);
        // Carry wraps around: 0xFFFF + 0x0001 folds to 0x0001
        assert_eq!(internet_checksum(&[0xFF, 0xFF, 0x00, 0x01]), 0xFFFE);
    }
}
