//! # strm-engine
//!
//! Low-latency live media streaming engine: block-based video codecs, a
//! deadline-governed encoder, and a UDP transport core with forward error
//! correction, selective retransmission and closed-loop congestion
//! control that continuously re-targets the encoder bitrate.
//!
//! # Architecture
//!
//! ```text
//! [raw frame] → Encoder Governor → Codec Inner Loop → Packetizer → FEC
//!                     ↑                                             │
//!                     │                                       Send Queue
//!                     │                                             │
//!                     │                                           Pacer → Wire
//!                     │                                             │
//!                     └── target bitrate ── Congestion Controller ←─┘
//!                                           (RTT / loss / bandwidth)
//! ```
//!
//! # Data Flow
//!
//! **Video path:** capture → [`Engine::submit`] → governor (drop / QP
//! policy) → codec inner loop (partition, predict, transform, entropy) →
//! packetizer (MTU fragments) → FEC group builder → priority send queue →
//! pacer → UDP socket.
//!
//! **Feedback path:** ACK/NACK → congestion controller → target bitrate
//! and pacing interval, published as atomics to the governor and pacer.
//!
//! The renderer, server containers (HTTP-FLV / HLS / RTMP), muxers and
//! capture devices are external collaborators; this crate is the
//! transport and codec core between them.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Block-based codec core: bitstream, transform, motion, entropy, the
/// shared inner loop and the deadline governor
pub mod codec;

/// Engine configuration loading and validation
pub mod config;

/// Engine orchestration: workers, callbacks, lifecycle
pub mod engine;

/// Statistics counters and snapshots
pub mod telemetry;

/// Packetization, FEC, congestion control, paced egress, sessions
pub mod transport;

pub use codec::frame::{EncodedFrame, FrameClass, RawFrame};
pub use codec::governor::{EncodeOutcome, EncoderGovernor, GovernorConfig};
pub use codec::{CodecError, CodecVariant, ComplexityPreset};
pub use config::{Config, ConfigError};
pub use engine::{AudioPayload, Engine, EngineCallbacks, EngineError};
pub use telemetry::StatsSnapshot;
