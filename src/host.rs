//! Platform glue for hosts without a beacon radio, such as a desktop running
//! only the mDNS session transport.

use crate::engine::{
    AssistanceRadio, DiscoveryEngine, EngineContext, EngineFactory, Platform, Transport,
};
use crate::error::{Error, Result};
use crate::protocol::RequestId;
use std::time::Duration;

/// Reports the beacon transport as switched off and grants every capability.
pub struct DesktopPlatform {
    beacon_enabled: bool,
}

impl DesktopPlatform {
    pub fn new() -> Self {
        Self {
            beacon_enabled: false,
        }
    }
}

impl Default for DesktopPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for DesktopPlatform {
    fn is_enabled(&self, transport: Transport) -> bool {
        match transport {
            Transport::Beacon => self.beacon_enabled,
            Transport::Session => true,
        }
    }

    fn check_permission(&self, _capability: &str) -> bool {
        true
    }

    fn make_discoverable(&self, duration: Duration) {
        tracing::info!(?duration, "Discoverability is always on for the session transport");
    }
}

/// Factory for a transport this host has no radio for.
pub struct UnsupportedEngineFactory {
    transport: Transport,
}

impl UnsupportedEngineFactory {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

impl EngineFactory for UnsupportedEngineFactory {
    fn create(&self, _context: EngineContext) -> Result<Box<dyn DiscoveryEngine>> {
        Err(Error::Engine(format!(
            "no {} radio on this host",
            self.transport
        )))
    }
}

/// Assistance radio that can't do anything; every start fails.
#[derive(Default)]
pub struct NoAssistanceRadio;

impl AssistanceRadio for NoAssistanceRadio {
    fn start_request_responder(&mut self, request_id: RequestId) -> bool {
        tracing::debug!(%request_id, "No beacon radio, cannot answer helpers");
        false
    }

    fn stop_request_responder(&mut self) {}

    fn start_providing(&mut self, request_id: RequestId) -> bool {
        tracing::debug!(%request_id, "No beacon radio, cannot help");
        false
    }

    fn stop_providing(&mut self) {}

    fn start_receiving(&mut self, _request_id: RequestId) -> bool {
        false
    }

    fn stop_receiving(&mut self) {}
}
