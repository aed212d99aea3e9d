//! Peer-assisted resolution of our own hardware address.
//!
//! A device that doesn't know its address advertises a "need help" beacon
//! carrying a request id. A helper that sees it advertises readiness, the
//! requester becomes discoverable, and the helper answers with the address it
//! observed. One request is serviced at a time.

use crate::events::{EventQueue, HostEvent};
use crate::engine::AssistanceRadio;
use crate::peer::HardwareAddress;
use crate::protocol::RequestId;
use crate::storage::SettingsStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    /// Helping a peer that advertised `request_id`.
    Providing { request_id: RequestId, since: Instant },
    /// Waiting for a helper to answer our own request.
    Receiving { since: Instant },
}

/// What the orchestrator has to do after a coordinator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Nothing,
    /// Helper mode started.
    Assisting,
    /// Receiving started; beacon scanning should pause.
    Receiving,
    /// Our address is known now; restart with the stored intent.
    Resolved(HardwareAddress),
    /// A session ended (completed, failed or timed out); restart.
    Finished,
}

pub struct AddressResolutionCoordinator {
    radio: Box<dyn AssistanceRadio>,
    store: Arc<dyn SettingsStore>,
    events: EventQueue,
    automate: bool,
    timeout: Duration,
    request_id: RequestId,
    responder_armed: bool,
    role: Role,
}

impl AddressResolutionCoordinator {
    pub fn new(
        radio: Box<dyn AssistanceRadio>,
        store: Arc<dyn SettingsStore>,
        events: EventQueue,
        automate: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            radio,
            store,
            events,
            automate,
            timeout,
            request_id: RequestId::generate(),
            responder_armed: false,
            role: Role::Idle,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_active(&self) -> bool {
        self.role != Role::Idle
    }

    pub fn is_responder_armed(&self) -> bool {
        self.responder_armed
    }

    pub fn set_automate(&mut self, automate: bool) {
        self.automate = automate;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Starts answering helpers for our pending request. Idempotent.
    pub fn arm_responder(&mut self) -> bool {
        if !self.responder_armed {
            self.responder_armed = self.radio.start_request_responder(self.request_id);
            if self.responder_armed {
                tracing::info!(request_id = %self.request_id, "Request responder armed");
            } else {
                tracing::warn!(request_id = %self.request_id, "Failed to arm request responder");
            }
        }
        self.responder_armed
    }

    pub fn disarm_responder(&mut self) {
        if self.responder_armed {
            self.radio.stop_request_responder();
            self.responder_armed = false;
        }
    }

    /// A nearby device asked for help.
    pub fn on_assistance_requested(&mut self, request_id: RequestId, now: Instant) -> Resolution {
        if let Role::Providing { request_id: current, .. } = self.role {
            if current != request_id {
                tracing::info!(
                    ignored = %request_id,
                    current = %current,
                    "Already servicing another request"
                );
            }
            return Resolution::Nothing;
        }

        if !self.automate {
            tracing::debug!(%request_id, "Forwarding assistance request to host");
            self.events.emit(HostEvent::AssistanceRequested(request_id));
            return Resolution::Nothing;
        }

        if self.role != Role::Idle {
            tracing::debug!(%request_id, "Busy with our own request, not helping");
            return Resolution::Nothing;
        }

        if self.radio.start_providing(request_id) {
            tracing::info!(%request_id, "Providing address resolution");
            self.role = Role::Providing { request_id, since: now };
            Resolution::Assisting
        } else {
            tracing::warn!(%request_id, "Failed to start providing");
            Resolution::Nothing
        }
    }

    /// A helper is ready for our request. `beacon_present` tells whether there
    /// is a beacon engine that could be paused while we receive.
    pub fn on_helper_ready(
        &mut self,
        request_id: RequestId,
        beacon_present: bool,
        now: Instant,
    ) -> Resolution {
        if request_id != self.request_id {
            tracing::debug!(%request_id, "Helper ready for someone else");
            return Resolution::Nothing;
        }

        if !self.automate || !beacon_present {
            self.events.emit(HostEvent::PeerReadyToHelp);
            return Resolution::Nothing;
        }

        if matches!(self.role, Role::Receiving { .. }) {
            return Resolution::Nothing;
        }

        if self.radio.start_receiving(self.request_id) {
            tracing::info!(request_id = %self.request_id, "Receiving address from helper");
            self.role = Role::Receiving { since: now };
            Resolution::Receiving
        } else {
            tracing::warn!("Failed to start receiving");
            Resolution::Nothing
        }
    }

    /// A helper answered with the address it observed for us.
    pub fn on_answer(&mut self, request_id: RequestId, address: &str) -> Resolution {
        if request_id != self.request_id {
            tracing::debug!(%request_id, "Answer for a different request, ignoring");
            return Resolution::Nothing;
        }

        let address = match HardwareAddress::parse(address) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!("Ignoring answer: {}", e);
                return Resolution::Nothing;
            }
        };

        tracing::info!(%address, "Own hardware address resolved");
        if let Err(e) = self.store.save_own_address(&address) {
            tracing::warn!("Failed to persist own address: {}", e);
        }
        self.events.emit(HostEvent::OwnAddressResolved(address.clone()));

        self.stop_all();
        self.request_id = RequestId::generate();
        Resolution::Resolved(address)
    }

    /// Helper side: the session for `request_id` is over.
    pub fn on_assistance_finished(&mut self, request_id: RequestId, completed: bool) -> Resolution {
        match self.role {
            Role::Providing { request_id: current, .. } if current == request_id => {
                tracing::info!(%request_id, completed, "Finished providing");
                self.radio.stop_providing();
                self.role = Role::Idle;
                Resolution::Finished
            }
            _ => {
                tracing::debug!(%request_id, "Completion for a request we're not servicing");
                Resolution::Nothing
            }
        }
    }

    /// Gives up on a session that ran past the timeout.
    pub fn tick(&mut self, now: Instant) -> Resolution {
        match self.role {
            Role::Providing { request_id, since } if now.duration_since(since) > self.timeout => {
                tracing::info!(%request_id, "Providing timed out");
                self.radio.stop_providing();
                self.role = Role::Idle;
                Resolution::Finished
            }
            Role::Receiving { since } if now.duration_since(since) > self.timeout => {
                tracing::info!(request_id = %self.request_id, "Receiving timed out");
                self.radio.stop_receiving();
                self.role = Role::Idle;
                Resolution::Finished
            }
            _ => Resolution::Nothing,
        }
    }

    pub fn stop_all(&mut self) {
        match self.role {
            Role::Providing { .. } => self.radio.stop_providing(),
            Role::Receiving { .. } => self.radio.stop_receiving(),
            Role::Idle => {}
        }
        self.role = Role::Idle;
        self.disarm_responder();
    }
}
