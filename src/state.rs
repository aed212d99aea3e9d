use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    NotStarted,
    /// The desired transport is switched off at the platform level.
    WaitingForTransport,
    /// Beacon transport is up but we don't know our own hardware address.
    WaitingForOwnAddress,
    /// Helping a nearby peer learn its hardware address.
    AssistingPeerAddressResolution,
    RunningBeacon,
    RunningSession,
    RunningBeaconAndSession,
}

impl OrchestratorState {
    pub fn is_running(self) -> bool {
        !matches!(self, Self::NotStarted | Self::WaitingForTransport)
    }
}

/// Live activity of one discovery engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineStatus {
    pub scanning: bool,
    pub advertising: bool,
}

impl EngineStatus {
    pub const IDLE: EngineStatus = EngineStatus {
        scanning: false,
        advertising: false,
    };

    pub fn is_idle(self) -> bool {
        !self.scanning && !self.advertising
    }
}

/// What the host can observe; notifications fire only when this changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observable {
    pub state: OrchestratorState,
    pub is_discovering: bool,
    pub is_advertising: bool,
}

/// Orchestrator bookkeeping. Only the orchestrator writes to it.
#[derive(Debug, Clone)]
pub struct DiscoveryState {
    pub current: OrchestratorState,
    pub beacon_status: EngineStatus,
    pub session_status: EngineStatus,
    /// Intent, kept apart from what is actually running so a transport that
    /// comes back can be resumed.
    pub should_be_scanning: bool,
    pub should_be_advertising: bool,
    pub missing_permission: Option<String>,
    pub last_notified: Observable,
}

impl DiscoveryState {
    pub fn wants_anything(&self) -> bool {
        self.should_be_scanning || self.should_be_advertising
    }
}

impl Default for DiscoveryState {
    fn default() -> Self {
        Self {
            current: OrchestratorState::NotStarted,
            beacon_status: EngineStatus::IDLE,
            session_status: EngineStatus::IDLE,
            should_be_scanning: false,
            should_be_advertising: false,
            missing_permission: None,
            last_notified: Observable {
                state: OrchestratorState::NotStarted,
                is_discovering: false,
                is_advertising: false,
            },
        }
    }
}
