//! Protocol configuration

use crate::error::{ProtocolError, Result};
use std::borrow::Cow;
use std::time::Duration;

/// Top-level configuration for a PeerLink node
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Negotiation stage timeouts
    pub negotiation: NegotiationConfig,

    /// Secure channel pipeline sizing
    pub channel: ChannelConfig,

    /// Heartbeat program timing
    pub heartbeat: HeartbeatConfig,
}

impl NodeConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidConfig`] for zero durations or capacities.
    pub fn validate(&self) -> Result<()> {
        self.negotiation.validate()?;
        self.channel.validate()?;
        self.heartbeat.validate()
    }
}

/// Negotiation timeouts
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// First wait of each role, longer to absorb peer-side setup latency
    pub first_response_timeout: Duration,

    /// Waits for identity and messaging key stages
    pub stage_timeout: Duration,

    /// Wait for the peer's encrypted extra data
    pub extra_data_timeout: Duration,

    /// Each wait inside a handshake challenge
    pub handshake_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            first_response_timeout: Duration::from_secs(10),
            stage_timeout: Duration::from_secs(5),
            extra_data_timeout: Duration::from_secs(4),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl NegotiationConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("first_response_timeout", self.first_response_timeout),
            ("stage_timeout", self.stage_timeout),
            ("extra_data_timeout", self.extra_data_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ] {
            if value.is_zero() {
                return Err(ProtocolError::InvalidConfig(Cow::Owned(format!(
                    "negotiation.{name} must be non-zero"
                ))));
            }
        }
        Ok(())
    }
}

/// Secure channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Frames that may be decrypting or awaiting delivery at once
    pub pipeline_depth: usize,

    /// Delivered events buffered for the consumer
    pub event_buffer: usize,

    /// Consecutive undecryptable frames after which the link is closed
    pub max_decrypt_failures: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 256,
            event_buffer: 256,
            max_decrypt_failures: 3,
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> Result<()> {
        if self.pipeline_depth == 0 {
            return Err(ProtocolError::InvalidConfig(Cow::Borrowed(
                "channel.pipeline_depth must be non-zero",
            )));
        }
        if self.event_buffer == 0 {
            return Err(ProtocolError::InvalidConfig(Cow::Borrowed(
                "channel.event_buffer must be non-zero",
            )));
        }
        if self.max_decrypt_failures == 0 {
            return Err(ProtocolError::InvalidConfig(Cow::Borrowed(
                "channel.max_decrypt_failures must be non-zero",
            )));
        }
        Ok(())
    }
}

/// Heartbeat program configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between outgoing heartbeats
    pub interval: Duration,

    /// Silence after which the channel is closed
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(ProtocolError::InvalidConfig(Cow::Borrowed(
                "heartbeat interval and timeout must be non-zero",
            )));
        }
        if self.timeout <= self.interval {
            return Err(ProtocolError::InvalidConfig(Cow::Borrowed(
                "heartbeat.timeout must exceed heartbeat.interval",
            )));
        }
        Ok(())
    }
}
