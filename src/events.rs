//! Host notifications and their serialized delivery queue.
//!
//! Every component enqueues into one unbounded channel; a single worker
//! drains it into the host's handler. Handlers therefore run one at a time,
//! in enqueue order, and never while a component lock is held.

use crate::engine::Transport;
use crate::peer::{HardwareAddress, PeerIdentity};
use crate::protocol::RequestId;
use crate::state::OrchestratorState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum HostEvent {
    TransportEnabledChanged {
        transport: Transport,
        enabled: bool,
    },
    StateChanged {
        state: OrchestratorState,
        is_discovering: bool,
        is_advertising: bool,
    },
    PeerDiscovered(PeerIdentity),
    PeerUpdated(PeerIdentity),
    PeerLost(PeerIdentity),
    /// A nearby device asked for help resolving its address. Only emitted
    /// when automated resolution is off.
    AssistanceRequested(RequestId),
    /// A helper is ready; the host should make this device discoverable.
    /// Only emitted when automated resolution is off.
    PeerReadyToHelp,
    OwnAddressResolved(HardwareAddress),
    PermissionDenied {
        transport: Transport,
        capability: String,
    },
}

/// Cheap to clone sending side of the delivery queue.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl EventQueue {
    /// Queue whose events the caller drains itself.
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue drained by a spawned worker calling `handler` for each event.
    pub fn spawn<F>(handler: F) -> (Self, JoinHandle<()>)
    where
        F: Fn(HostEvent) + Send + 'static,
    {
        let (queue, mut rx) = Self::unbounded();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
            tracing::debug!("Host event queue closed");
        });
        (queue, worker)
    }

    pub fn emit(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Host event dropped, no receiver");
        }
    }
}
