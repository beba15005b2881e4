//! Configuration file for the PeerLink CLI.

use peerlink_core::config::{ChannelConfig, HeartbeatConfig, NegotiationConfig, NodeConfig};
use peerlink_crypto::KeyEncryptionParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// PeerLink CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity storage
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Negotiation timeouts
    #[serde(default)]
    pub negotiation: NegotiationSection,
    /// Secure channel sizing
    #[serde(default)]
    pub channel: ChannelSection,
    /// Heartbeat timing
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Sealed identity file
    #[serde(default = "default_identity_path")]
    pub identity_file: PathBuf,
    /// Passphrase stretching profile: `default` or `low`
    #[serde(default = "default_kdf")]
    pub kdf: String,
}

/// Negotiation timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSection {
    /// First wait of each role
    #[serde(default = "default_first_response_ms")]
    pub first_response_timeout_ms: u64,
    /// Identity and messaging key stage waits
    #[serde(default = "default_stage_ms")]
    pub stage_timeout_ms: u64,
    /// Extra data wait
    #[serde(default = "default_extra_data_ms")]
    pub extra_data_timeout_ms: u64,
    /// Each handshake challenge wait
    #[serde(default = "default_stage_ms")]
    pub handshake_timeout_ms: u64,
}

/// Secure channel sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    /// Frames decrypting or awaiting delivery
    #[serde(default = "default_depth")]
    pub pipeline_depth: usize,
    /// Buffered delivered events
    #[serde(default = "default_depth")]
    pub event_buffer: usize,
    /// Consecutive decrypt failures before closing
    #[serde(default = "default_max_decrypt_failures")]
    pub max_decrypt_failures: u32,
}

/// Heartbeat timing in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    /// Send interval
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Silence timeout
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_identity_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("peerlink/identity.plk")
}

fn default_kdf() -> String {
    "default".to_string()
}

fn default_first_response_ms() -> u64 {
    10_000
}

fn default_stage_ms() -> u64 {
    5_000
}

fn default_extra_data_ms() -> u64 {
    4_000
}

fn default_depth() -> usize {
    256
}

fn default_max_decrypt_failures() -> u32 {
    3
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identity_file: default_identity_path(),
            kdf: default_kdf(),
        }
    }
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            first_response_timeout_ms: default_first_response_ms(),
            stage_timeout_ms: default_stage_ms(),
            extra_data_timeout_ms: default_extra_data_ms(),
            handshake_timeout_ms: default_stage_ms(),
        }
    }
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            pipeline_depth: default_depth(),
            event_buffer: default_depth(),
            max_decrypt_failures: default_max_decrypt_failures(),
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("peerlink/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Protocol configuration for the core.
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        let ms = Duration::from_millis;
        NodeConfig {
            negotiation: NegotiationConfig {
                first_response_timeout: ms(self.negotiation.first_response_timeout_ms),
                stage_timeout: ms(self.negotiation.stage_timeout_ms),
                extra_data_timeout: ms(self.negotiation.extra_data_timeout_ms),
                handshake_timeout: ms(self.negotiation.handshake_timeout_ms),
            },
            channel: ChannelConfig {
                pipeline_depth: self.channel.pipeline_depth,
                event_buffer: self.channel.event_buffer,
                max_decrypt_failures: self.channel.max_decrypt_failures,
            },
            heartbeat: HeartbeatConfig {
                interval: ms(self.heartbeat.interval_ms),
                timeout: ms(self.heartbeat.timeout_ms),
            },
        }
    }

    /// Passphrase stretching parameters for sealing identities.
    #[must_use]
    pub fn key_params(&self) -> KeyEncryptionParams {
        match self.identity.kdf.as_str() {
            "low" => KeyEncryptionParams::low_security(),
            _ => KeyEncryptionParams::default(),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_kdf = ["default", "low"];
        if !valid_kdf.contains(&self.identity.kdf.as_str()) {
            anyhow::bail!(
                "Invalid kdf profile: {}. Must be one of: {}",
                self.identity.kdf,
                valid_kdf.join(", ")
            );
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.node_config().validate()?;
        Ok(())
    }
}
