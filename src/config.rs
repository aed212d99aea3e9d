//! Configuration surface.
//!
//! One plain struct, handed to the orchestrator at construction. Runtime
//! changes travel as [`Signal::ConfigChanged`](crate::engine::Signal) rather
//! than through a shared mutable settings object.

use crate::engine::Transport;
use crate::error::{Error, Result};
use crate::peer::HardwareAddress;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    Beacon,
    Session,
    BeaconAndSession,
}

impl DiscoveryMode {
    pub fn uses_beacon(self) -> bool {
        matches!(self, Self::Beacon | Self::BeaconAndSession)
    }

    pub fn uses_session(self) -> bool {
        matches!(self, Self::Session | Self::BeaconAndSession)
    }

    pub fn uses(self, transport: Transport) -> bool {
        match transport {
            Transport::Beacon => self.uses_beacon(),
            Transport::Session => self.uses_session(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

/// How the outbound socket picks its remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStrategy {
    /// Whatever the peer advertised / the system resolves.
    SystemAssigned,
    /// Next port of a rotating well-known range.
    Rotating,
    Explicit(u16),
}

impl PortStrategy {
    pub fn is_default(self) -> bool {
        self == Self::SystemAssigned
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconSettings {
    pub advertise_mode: AdvertiseMode,
    pub tx_power_level: TxPowerLevel,
    pub scan_mode: ScanMode,
    pub scan_report_delay_ms: u64,
}

impl Default for BeaconSettings {
    fn default() -> Self {
        Self {
            advertise_mode: AdvertiseMode::Balanced,
            tx_power_level: TxPowerLevel::High,
            scan_mode: ScanMode::Balanced,
            scan_report_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub service_type: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            service_type: "_peerlink._tcp.local.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 0 means a single attempt.
    pub max_retries: u32,
    pub port_strategy: PortStrategy,
    pub retry_backoff_ms: u64,
    /// First port of the rotating range used by [`PortStrategy::Rotating`].
    pub rotating_port_base: u16,
    pub rotating_port_span: u16,
}

impl ConnectionConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            port_strategy: PortStrategy::SystemAssigned,
            retry_backoff_ms: 300,
            rotating_port_base: 47100,
            rotating_port_span: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub discovery_mode: DiscoveryMode,
    pub beacon: BeaconSettings,
    pub session: SessionSettings,
    pub peer_expiration_ms: u64,
    pub automate_address_resolution: bool,
    pub assistance_timeout_ms: u64,
    pub connection: ConnectionConfig,
    /// Statically configured own address; normally learned at runtime and
    /// persisted through the settings store instead.
    pub own_address: Option<HardwareAddress>,
}

impl DiscoveryConfig {
    pub fn peer_expiration(&self) -> Duration {
        Duration::from_millis(self.peer_expiration_ms)
    }

    pub fn assistance_timeout(&self) -> Duration {
        Duration::from_millis(self.assistance_timeout_ms)
    }

    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: DiscoveryConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), mode = ?config.discovery_mode, "Loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_expiration_ms == 0 {
            return Err(Error::Config("peer_expiration_ms must be positive".into()));
        }
        if self.connection.port_strategy == PortStrategy::Rotating
            && self.connection.rotating_port_span == 0
        {
            return Err(Error::Config(
                "rotating port strategy needs a non-empty port span".into(),
            ));
        }
        if let Some(address) = &self.own_address {
            if !address.is_valid() {
                return Err(Error::InvalidAddress(address.to_string()));
            }
        }
        Ok(())
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_mode: DiscoveryMode::BeaconAndSession,
            beacon: BeaconSettings::default(),
            session: SessionSettings::default(),
            peer_expiration_ms: 60_000,
            automate_address_resolution: true,
            assistance_timeout_ms: 30_000,
            connection: ConnectionConfig::default(),
            own_address: None,
        }
    }
}
