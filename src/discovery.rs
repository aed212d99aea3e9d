//! Session transport over mDNS: advertise our identity as a service instance
//! and report resolved instances of the same service type as peers.

use crate::config::SessionSettings;
use crate::engine::{DiscoveryEngine, EngineContext, EngineFactory, Signal, SignalSink, Transport};
use crate::error::{Error, Result};
use crate::peer::{DiscoveryMethod, HardwareAddress, PeerIdentity, NO_PEER_NAME};
use crate::state::EngineStatus;
use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::net::{IpAddr, SocketAddr};
use tokio::task::JoinHandle;

const PROP_ID: &str = "id";
const PROP_NAME: &str = "n";
const PROP_ADDRESS: &str = "a";
const PROP_HOST: &str = "h";

fn engine_error(e: impl std::fmt::Display) -> Error {
    Error::Engine(e.to_string())
}

pub struct MdnsEngine {
    daemon: ServiceDaemon,
    service_type: String,
    instance_id: String,
    port: u16,
    local: PeerIdentity,
    sink: SignalSink,
    registered_service: Option<String>,
    browse_task: Option<JoinHandle<()>>,
}

impl MdnsEngine {
    pub fn new(
        context: EngineContext,
        service_type: &str,
        instance_id: &str,
        port: u16,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(engine_error)?;
        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            instance_id: instance_id.to_string(),
            port,
            local: context.local,
            sink: context.sink,
            registered_service: None,
            browse_task: None,
        })
    }

    fn register(&mut self) -> Result<()> {
        let ip = local_ip().map_err(engine_error)?;
        let m_hostname = format!("{}.local.", self.instance_id);

        let system_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "Unknown Device".to_string());
        let address = self
            .local
            .hardware_address
            .clone()
            .unwrap_or_else(HardwareAddress::unknown)
            .to_string();

        let properties = [
            (PROP_ID, self.instance_id.as_str()),
            (PROP_NAME, self.local.name.as_str()),
            (PROP_ADDRESS, address.as_str()),
            (PROP_HOST, system_hostname.as_str()),
        ];

        let service_info = ServiceInfo::new(
            &self.service_type,
            &self.instance_id,
            &m_hostname,
            &ip.to_string(),
            self.port,
            &properties[..],
        )
        .map_err(engine_error)?;

        let fullname = service_info.get_fullname().to_string();
        self.daemon.register(service_info).map_err(engine_error)?;
        tracing::info!(
            "Registered service: {} ({}) on {}:{}",
            self.local.name,
            fullname,
            ip,
            self.port
        );

        self.registered_service = Some(fullname);
        Ok(())
    }

    fn browse(&mut self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(engine_error)?;
        let receiver = self.daemon.browse(&self.service_type).map_err(engine_error)?;
        let sink = self.sink.clone();
        let own_id = self.instance_id.clone();
        let service_type = self.service_type.clone();

        self.browse_task = Some(runtime.spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let id = info.get_property_val_str(PROP_ID).unwrap_or("unknown");
                        if id == own_id {
                            continue;
                        }
                        let Some(ip) = info.get_addresses().iter().next() else {
                            continue;
                        };
                        let Ok(ip) = ip.to_string().parse::<IpAddr>() else {
                            tracing::debug!("Unparseable address for {}", id);
                            continue;
                        };

                        let hardware_address = info
                            .get_property_val_str(PROP_ADDRESS)
                            .and_then(|value| HardwareAddress::parse(value).ok());
                        let name = info
                            .get_property_val_str(PROP_NAME)
                            .filter(|name| !name.is_empty())
                            .unwrap_or(NO_PEER_NAME);

                        let peer = PeerIdentity {
                            hardware_address,
                            name: name.to_string(),
                            service_type: service_type.clone(),
                            secondary_address: SocketAddr::new(ip, info.get_port()).to_string(),
                            secondary_name: info.get_hostname().to_string(),
                            discovery_method: DiscoveryMethod::Session,
                            merge_count: 0,
                        };
                        tracing::debug!(peer = %peer, "Service resolved");
                        sink.send(Signal::PeerDiscovered(peer));
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        // Removal is left to registry expiry.
                        tracing::debug!("Service removed: {}", fullname);
                    }
                    _ => {}
                }
            }
            tracing::debug!("mDNS browse ended");
        }));
        Ok(())
    }

    fn report_status(&self) {
        self.sink.send(Signal::EngineStatusChanged {
            transport: Transport::Session,
            status: self.status(),
        });
    }
}

impl DiscoveryEngine for MdnsEngine {
    fn start(&mut self, scan: bool, advertise: bool) -> Result<()> {
        if advertise && self.registered_service.is_none() {
            self.register()?;
        }
        if scan && self.browse_task.is_none() {
            self.browse()?;
        }
        self.report_status();
        Ok(())
    }

    fn stop_scanning(&mut self) {
        if let Some(task) = self.browse_task.take() {
            if let Err(e) = self.daemon.stop_browse(&self.service_type) {
                tracing::debug!("Failed to stop browsing: {}", e);
            }
            task.abort();
            self.report_status();
        }
    }

    fn stop_advertising(&mut self) {
        if let Some(fullname) = self.registered_service.take() {
            tracing::info!("Unregistering service: {}", fullname);
            if let Err(e) = self.daemon.unregister(&fullname) {
                tracing::error!("Failed to unregister service: {}", e);
            }
            self.report_status();
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            scanning: self.browse_task.is_some(),
            advertising: self.registered_service.is_some(),
        }
    }
}

impl Drop for MdnsEngine {
    fn drop(&mut self) {
        self.stop_scanning();
        self.stop_advertising();
        if let Err(e) = self.daemon.shutdown() {
            tracing::debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

/// Builds [`MdnsEngine`]s advertising the given listening port.
pub struct MdnsEngineFactory {
    settings: SessionSettings,
    instance_id: String,
    port: u16,
}

impl MdnsEngineFactory {
    pub fn new(settings: SessionSettings, instance_id: impl Into<String>, port: u16) -> Self {
        Self {
            settings,
            instance_id: instance_id.into(),
            port,
        }
    }
}

impl EngineFactory for MdnsEngineFactory {
    fn create(&self, context: EngineContext) -> Result<Box<dyn DiscoveryEngine>> {
        let engine = MdnsEngine::new(
            context,
            &self.settings.service_type,
            &self.instance_id,
            self.port,
        )?;
        Ok(Box::new(engine))
    }
}
