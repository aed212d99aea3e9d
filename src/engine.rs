//! Narrow interfaces to the radio stack and the platform.
//!
//! Engines never see the orchestrator. They get a [`SignalSink`] and report
//! everything through it; the orchestrator owns the engines outright.

use crate::config::{BeaconSettings, DiscoveryConfig};
use crate::error::Result;
use crate::peer::PeerIdentity;
use crate::protocol::{AssistanceBeacon, RequestId};
use crate::state::EngineStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Low-energy advertise/scan transport.
    Beacon,
    /// Session / peer-list transport.
    Session,
}

impl Transport {
    pub fn other(self) -> Transport {
        match self {
            Transport::Beacon => Transport::Session,
            Transport::Session => Transport::Beacon,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Beacon => f.write_str("beacon"),
            Transport::Session => f.write_str("session"),
        }
    }
}

/// Device seen in the session transport's peer list. Usually carries no
/// hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerListEntry {
    pub name: String,
    pub secondary_address: String,
}

/// Everything that flows into the orchestrator from outside a method call.
#[derive(Debug, Clone)]
pub enum Signal {
    EngineStatusChanged {
        transport: Transport,
        status: EngineStatus,
    },
    PeerDiscovered(PeerIdentity),
    PeerListChanged(Vec<PeerListEntry>),
    /// A nearby device advertised "need help" with this request id.
    AssistanceRequested(RequestId),
    /// A helper advertised that it is ready to serve our request.
    HelperReady(RequestId),
    /// Helper side: the assistance session for `request_id` ended.
    AssistanceFinished {
        request_id: RequestId,
        completed: bool,
    },
    /// Requester side: a helper answer was observed.
    AddressAnswerObserved {
        request_id: RequestId,
        address: String,
    },
    TransportToggled {
        transport: Transport,
        enabled: bool,
    },
    ConfigChanged(Box<DiscoveryConfig>),
}

impl Signal {
    /// Translates a received assistance payload. Requests carry no address;
    /// answers carry the address the helper observed for the requester.
    pub fn from_beacon(payload: &[u8]) -> Option<Signal> {
        let beacon = AssistanceBeacon::decode(payload)?;
        Some(match beacon.address {
            Some(address) => Signal::AddressAnswerObserved {
                request_id: beacon.request_id,
                address,
            },
            None => Signal::AssistanceRequested(beacon.request_id),
        })
    }
}

#[derive(Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            tracing::debug!("Signal dropped, orchestrator is gone");
        }
    }
}

/// What an engine is built with.
#[derive(Clone)]
pub struct EngineContext {
    pub sink: SignalSink,
    /// Our identity as advertised on this transport.
    pub local: PeerIdentity,
    /// Id advertised in our "need help" beacon while our address is unknown.
    pub request_id: RequestId,
    pub beacon: BeaconSettings,
}

/// One transport's discovery engine.
pub trait DiscoveryEngine: Send {
    /// Starts the requested activities. Already running ones are left alone.
    fn start(&mut self, scan: bool, advertise: bool) -> Result<()>;
    fn stop_scanning(&mut self);
    fn stop_advertising(&mut self);

    fn stop(&mut self) {
        self.stop_scanning();
        self.stop_advertising();
    }

    fn status(&self) -> EngineStatus;

    fn apply_beacon_settings(&mut self, _settings: &BeaconSettings) {}
}

/// Builds engines for one transport; the orchestrator decides when.
pub trait EngineFactory: Send + Sync {
    fn create(&self, context: EngineContext) -> Result<Box<dyn DiscoveryEngine>>;
}

/// Radio operations the assistance protocol needs.
pub trait AssistanceRadio: Send {
    /// Requester: answer helpers that found our "need help" beacon.
    fn start_request_responder(&mut self, request_id: RequestId) -> bool;
    fn stop_request_responder(&mut self);
    /// Helper: advertise readiness for `request_id` and scan for the requester.
    fn start_providing(&mut self, request_id: RequestId) -> bool;
    fn stop_providing(&mut self);
    /// Requester: become discoverable at the lower level so a helper can see us.
    fn start_receiving(&mut self, request_id: RequestId) -> bool;
    fn stop_receiving(&mut self);
}

/// Platform services consumed by the orchestrator.
pub trait Platform: Send + Sync {
    fn is_enabled(&self, transport: Transport) -> bool;

    /// Asks the host whether `capability` is granted.
    fn check_permission(&self, capability: &str) -> bool;

    fn make_discoverable(&self, _duration: Duration) {}
}

/// Capability the platform is asked about before starting an engine.
pub fn required_capability(transport: Transport) -> &'static str {
    match transport {
        Transport::Beacon => "location.coarse",
        Transport::Session => "network.local",
    }
}
