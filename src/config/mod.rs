//! Engine configuration
//!
//! Typed sections deserialized from TOML (every field has a default, so a
//! partial file works), validated before any worker starts. Validation
//! failures are the fatal error class: the engine refuses to construct
//! and emits exactly one error callback.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecVariant;
use crate::transport::packet::MIN_MTU;

/// Configuration errors; all fatal at engine construction
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Bitrate clamps are inconsistent
    #[error("invalid bitrates: min {min} must be <= initial {initial} <= max {max}")]
    InvalidBitrates {
        /// Lower clamp
        min: u64,
        /// Starting value
        initial: u64,
        /// Upper clamp
        max: u64,
    },

    /// MTU leaves no room for headers
    #[error("mtu {mtu} below minimum {min}")]
    MtuTooSmall {
        /// Configured MTU
        mtu: usize,
        /// Smallest workable MTU
        min: usize,
    },

    /// Frame geometry missing or zero
    #[error("invalid frame geometry {width}x{height}")]
    InvalidGeometry {
        /// Configured width
        width: usize,
        /// Configured height
        height: usize,
    },

    /// GOP must contain at least the KEY frame itself
    #[error("gop_size must be >= 1")]
    InvalidGopSize,

    /// Complexity presets run 0 through 9
    #[error("complexity {0} out of range 0..=9")]
    InvalidComplexity(u8),
}

/// Destination and datagram sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Peer host
    pub remote_host: String,
    /// Peer UDP port
    pub remote_port: u16,
    /// Datagram budget per packet
    pub mtu: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            remote_host: "127.0.0.1".to_string(),
            remote_port: 9710,
            mtu: 1400,
        }
    }
}

/// Congestion controller clamps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    /// Bitrate before any feedback, bits per second
    pub initial_bitrate: u64,
    /// Lower clamp
    pub min_bitrate: u64,
    /// Upper clamp
    pub max_bitrate: u64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 2_000_000,
            min_bitrate: 100_000,
            max_bitrate: 20_000_000,
        }
    }
}

/// Codec selection and picture geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Which codec variant runs the inner loop
    pub variant: CodecVariant,
    /// KEY frame interval in frames
    pub gop_size: u32,
    /// Speed/quality preset, 0 (thorough) through 9 (fastest)
    pub complexity: u8,
    /// Hint only; the software loop ignores it but collaborators may not
    pub hardware_acceleration: bool,
    /// Picture width in pixels
    pub width: usize,
    /// Picture height in pixels
    pub height: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            variant: CodecVariant::Narrow,
            gop_size: 30,
            complexity: 5,
            hardware_acceleration: false,
            width: 1280,
            height: 720,
        }
    }
}

/// Loss recovery and latency policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Produce FEC recovery packets
    pub enable_fec: bool,
    /// Retransmit on NACK / timeout
    pub enable_retransmission: bool,
    /// PREDICTED frames older than this are never retransmitted, ms
    pub max_latency_ms: u64,
    /// Send-queue depth expressed as milliseconds at the target bitrate
    pub max_queue_latency_ms: u64,
    /// Idle session expiry, seconds
    pub session_idle_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enable_fec: true,
            enable_retransmission: true,
            max_latency_ms: 200,
            max_queue_latency_ms: 500,
            session_idle_timeout_secs: 30,
        }
    }
}

/// Encoder governor timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Hard deadline per encode call, ms
    pub max_encoding_time_ms: u64,
    /// Target frame period (1000 / fps), ms
    pub target_frame_period_ms: u64,
    /// Starting QP
    pub initial_qp: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_encoding_time_ms: 16,
            target_frame_period_ms: 33,
            initial_qp: 30,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Destination and MTU
    pub network: NetworkConfig,
    /// Bitrate clamps
    pub bitrate: BitrateConfig,
    /// Codec variant and geometry
    pub codec: CodecConfig,
    /// FEC / ARQ / latency policy
    pub transport: TransportConfig,
    /// Governor timing
    pub encoder: EncoderConfig,
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject fatal misconfigurations before the engine starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bitrate = &self.bitrate;
        if bitrate.min_bitrate > bitrate.initial_bitrate
            || bitrate.initial_bitrate > bitrate.max_bitrate
        {
            return Err(ConfigError::InvalidBitrates {
                min: bitrate.min_bitrate,
                initial: bitrate.initial_bitrate,
                max: bitrate.max_bitrate,
            });
        }
        if self.network.mtu < MIN_MTU {
            return Err(ConfigError::MtuTooSmall { mtu: self.network.mtu, min: MIN_MTU });
        }
        if self.codec.width == 0 || self.codec.height == 0 {
            return Err(ConfigError::InvalidGeometry {
                width: self.codec.width,
                height: self.codec.height,
            });
        }
        if self.codec.gop_size == 0 {
            return Err(ConfigError::InvalidGopSize);
        }
        if self.codec.complexity > 9 {
            return Err(ConfigError::InvalidComplexity(self.codec.complexity));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            remote_host = "10.0.0.2"
            remote_port = 5000

            [codec]
            variant = "hevc-like"
            gop_size = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.network.remote_host, "10.0.0.2");
        assert_eq!(config.codec.variant, CodecVariant::HevcLike);
        assert_eq!(config.codec.gop_size, 60);
        // Untouched sections keep defaults
        assert_eq!(config.network.mtu, 1400);
        assert_eq!(config.bitrate.initial_bitrate, 2_000_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_bitrates_rejected() {
        let mut config = Config::default();
        config.bitrate.min_bitrate = 5_000_000;
        config.bitrate.max_bitrate = 1_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBitrates { .. })
        ));
    }

    #[test]
    fn test_tiny_mtu_rejected() {
        let mut config = Config::default();
        config.network.mtu = 40;
        assert!(matches!(config.validate(), Err(ConfigError::MtuTooSmall { .. })));
    }

    #[test]
    fn test_unknown_variant_rejected_by_parser() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [codec]
            variant = "h266-but-better"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_gop_rejected() {
        let mut config = Config::default();
        config.codec.gop_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidGopSize)));
    }

    #[test]
    fn test_complexity_range() {
        let mut config = Config::default();
        config.codec.complexity = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidComplexity(10))
        ));
    }
}
