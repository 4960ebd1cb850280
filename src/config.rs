//! Receiver configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `FRAME_RX_`; nested keys are
//!    separated by a double underscore (`FRAME_RX_DECODER__KIND=packetized`)
//!
//! Every field has a default, so an empty file yields a working dummy-decoder
//! receiver on UDP port 8989.
//!
//! # Example
//! ```no_run
//! use frame_receiver::config::ReceiverConfig;
//!
//! let config = ReceiverConfig::load_from("config/frame_receiver.toml")?;
//! config.validate()?;
//! println!("Listening on {}:{}", config.rx_address, config.rx_port);
//! # Ok::<(), frame_receiver::ReceiverError>(())
//! ```

use crate::decoder::DecoderConfig;
use crate::error::{ReceiverError, ReceiverResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FRAME_RX_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Complete configuration of one receiver pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// IP address the UDP socket binds to.
    pub rx_address: IpAddr,
    /// UDP port (0 picks an ephemeral port).
    pub rx_port: u16,
    /// Requested kernel receive buffer size in bytes (advisory, logged).
    pub rx_recv_buffer_size: usize,
    /// Largest datagram read from the socket; 0 uses the decoder's maximum.
    pub max_packet_size: usize,
    /// Control channel endpoint shared by the receive thread, its owner and
    /// any other control clients (`tcp://`, `ipc://` or `inproc://`).
    pub ctrl_endpoint: String,
    /// When set, every completed frame's `frame_ready` notification is
    /// republished on this PUB endpoint.
    pub frame_ready_endpoint: Option<String>,
    /// When set, the pool is backed by a named file in the shared-memory
    /// directory so other processes can map it.
    pub shared_buffer_name: Option<String>,
    /// Memory budget for the pool when `buffer_count` is 0.
    pub max_buffer_mem: usize,
    /// Number of buffers; 0 derives it from `max_buffer_mem / buffer_size`.
    pub buffer_count: usize,
    /// Bytes per buffer; 0 uses the decoder's frame size.
    pub buffer_size: usize,
    /// Empty buffers requested at startup and after exhaustion.
    pub precharge_count: usize,
    /// Bound on each socket/control poll.
    pub poll_interval_ms: u64,
    /// Maximum time spent draining in-flight frames on stop.
    pub drain_timeout_ms: u64,
    /// Bound on controller request/acknowledgement round trips.
    pub status_timeout_ms: u64,
    /// Decoder variant and geometry.
    pub decoder: DecoderConfig,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            rx_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rx_port: 8989,
            rx_recv_buffer_size: 30_000_000,
            max_packet_size: 0,
            ctrl_endpoint: "inproc://rx_channel".to_string(),
            frame_ready_endpoint: None,
            shared_buffer_name: None,
            max_buffer_mem: 64 * 1024 * 1024,
            buffer_count: 0,
            buffer_size: 0,
            precharge_count: 4,
            poll_interval_ms: 100,
            drain_timeout_ms: 1000,
            status_timeout_ms: 1000,
            decoder: DecoderConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from a TOML file and `FRAME_RX_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ReceiverResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ReceiverConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Render the configuration as TOML, in the form `load_from` reads.
    pub fn to_toml(&self) -> ReceiverResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ReceiverError::Configuration(format!("Cannot serialize config: {}", e)))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> ReceiverResult<()> {
        let invalid = |msg: String| Err(ReceiverError::Configuration(msg));

        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        let decoder = self.decoder.build()?;
        let frame_size = decoder.buffer_size_for_frame();
        let buffer_size = self.effective_buffer_size(frame_size);
        if buffer_size < frame_size {
            return invalid(format!(
                "buffer_size {} is smaller than the {} decoder frame size {}",
                buffer_size,
                decoder.name(),
                frame_size
            ));
        }

        let buffer_count = self.effective_buffer_count(frame_size);
        if buffer_count == 0 {
            return invalid(format!(
                "max_buffer_mem {} holds no buffers of {} bytes",
                self.max_buffer_mem, buffer_size
            ));
        }

        if self.precharge_count == 0 || self.precharge_count > buffer_count {
            return invalid(format!(
                "precharge_count {} must be within 1..={}",
                self.precharge_count, buffer_count
            ));
        }

        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
            ("status_timeout_ms", self.status_timeout_ms),
        ] {
            if value == 0 {
                return invalid(format!("{} must be > 0", name));
            }
        }

        if self.max_packet_size != 0 && self.max_packet_size < decoder.max_packet_size() {
            return invalid(format!(
                "max_packet_size {} is smaller than the {} decoder's {} byte packets",
                self.max_packet_size,
                decoder.name(),
                decoder.max_packet_size()
            ));
        }

        frame_ipc::validate_endpoint(&self.ctrl_endpoint)
            .or_else(|e| invalid(format!("ctrl_endpoint: {}", e)))?;
        if let Some(endpoint) = &self.frame_ready_endpoint {
            frame_ipc::validate_endpoint(endpoint)
                .or_else(|e| invalid(format!("frame_ready_endpoint: {}", e)))?;
            if *endpoint == self.ctrl_endpoint {
                return invalid(format!(
                    "frame_ready_endpoint and ctrl_endpoint are both '{}'",
                    endpoint
                ));
            }
        }

        Ok(())
    }

    /// Buffer size in use, given the decoder's frame size.
    pub fn effective_buffer_size(&self, frame_size: usize) -> usize {
        if self.buffer_size == 0 {
            frame_size
        } else {
            self.buffer_size
        }
    }

    /// Buffer count in use, given the decoder's frame size.
    pub fn effective_buffer_count(&self, frame_size: usize) -> usize {
        if self.buffer_count != 0 {
            return self.buffer_count;
        }
        match self.effective_buffer_size(frame_size) {
            0 => 0,
            size => self.max_buffer_mem / size,
        }
    }

    /// Socket address for the UDP receiver.
    pub fn rx_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.rx_address, self.rx_port)
    }

    /// Receive poll bound.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stop drain bound.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Controller round-trip bound.
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}
