//! Real-time transport core
//!
//! Everything between an [`crate::codec::frame::EncodedFrame`] and the
//! wire: fragmentation, forward error correction, congestion control,
//! priority-paced egress with selective retransmission, and per-peer
//! session state.

pub mod congestion;
pub mod fec;
pub mod packet;
pub mod packetizer;
pub mod send_queue;
pub mod session;

pub use congestion::{CongestionConfig, CongestionController, CongestionPhase, RateUpdate};
pub use fec::{FecEncoder, FecReceiver, RecoveredFragment};
pub use packet::{Packet, PacketError, PacketHeader, PacketKind};
pub use packetizer::{AssembledFrame, FrameAssembler, Packetizer};
pub use send_queue::{ArqTracker, Priority, SendQueue};
pub use session::{Session, SessionRegistry};
