pub mod config;
pub mod connector;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod handshake;
pub mod host;
pub mod orchestrator;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod resolution;
pub mod state;
pub mod storage;
pub mod transport;

use config::DiscoveryConfig;
use connector::{ConnectionEvent, ConnectionInitiator};
use discovery::MdnsEngineFactory;
use engine::{SignalSink, Transport};
use events::{EventQueue, HostEvent};
use host::{DesktopPlatform, NoAssistanceRadio, UnsupportedEngineFactory};
use orchestrator::{Collaborators, DiscoveryOrchestrator};
use peer::{PeerIdentity, NO_PEER_NAME};
use protocol::IdentityRecord;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::JsonFileStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use transport::{Acceptor, TcpConnector};

pub use error::{Error, Result};

/// Everything the `peerlink` binary resolves from its command line.
pub struct NodeOptions {
    pub config: DiscoveryConfig,
    pub name: String,
    pub listen: SocketAddr,
    pub settings_path: PathBuf,
    /// Peers to dial once discovery is up, as `ip:port`.
    pub connect: Vec<SocketAddr>,
}

fn log_host_event(event: &HostEvent) {
    match event {
        HostEvent::StateChanged {
            state,
            is_discovering,
            is_advertising,
        } => tracing::info!(?state, is_discovering, is_advertising, "Discovery state"),
        HostEvent::PeerDiscovered(peer) => tracing::info!("Peer discovered: {}", peer),
        HostEvent::PeerUpdated(peer) => tracing::info!("Peer updated: {}", peer),
        HostEvent::PeerLost(peer) => tracing::info!("Peer lost: {}", peer),
        HostEvent::TransportEnabledChanged { transport, enabled } => {
            tracing::info!(%transport, enabled, "Transport toggled")
        }
        HostEvent::AssistanceRequested(request_id) => {
            tracing::info!(%request_id, "Peer asks for address resolution help")
        }
        HostEvent::PeerReadyToHelp => tracing::info!("Helper ready, make this device discoverable"),
        HostEvent::OwnAddressResolved(address) => tracing::info!(%address, "Own address resolved"),
        HostEvent::PermissionDenied {
            transport,
            capability,
        } => tracing::warn!(%transport, %capability, "Permission denied"),
    }
}

/// Runs a node until Ctrl-C: mDNS session discovery, a TCP acceptor and
/// outbound connections to `options.connect`.
pub async fn run(options: NodeOptions) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let NodeOptions {
        config,
        name,
        listen,
        settings_path,
        connect,
    } = options;

    let acceptor = Acceptor::bind(listen).await?;
    let listen_addr = acceptor.local_addr()?;
    let advertised_addr = local_ip_address::local_ip()
        .map(|ip| SocketAddr::new(ip, listen_addr.port()))
        .unwrap_or(listen_addr);
    tracing::info!("TCP acceptor listening on {} ({})", listen_addr, advertised_addr);

    let instance_id = format!("peerlink-{}", uuid::Uuid::new_v4().simple());
    let (events, event_worker) = EventQueue::spawn(|event| log_host_event(&event));
    let (sink, signals) = SignalSink::channel();

    let orchestrator = Arc::new(DiscoveryOrchestrator::new(
        config.clone(),
        PeerIdentity {
            name,
            secondary_address: advertised_addr.to_string(),
            ..Default::default()
        },
        Collaborators {
            beacon: Arc::new(UnsupportedEngineFactory::new(Transport::Beacon)),
            session: Arc::new(MdnsEngineFactory::new(
                config.session.clone(),
                instance_id,
                listen_addr.port(),
            )),
            platform: Arc::new(DesktopPlatform::new()),
            radio: Box::new(NoAssistanceRadio),
            store: Arc::new(JsonFileStore::new(settings_path)),
        },
        events,
        sink,
    ));

    let shutdown = CancellationToken::new();
    let pump = orchestrator.spawn_signal_pump(signals);
    let maintenance = orchestrator.spawn_maintenance(Duration::from_secs(1), shutdown.child_token());

    let local = IdentityRecord::from_identity(&orchestrator.local_identity());
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let listener = acceptor.start_listening(local.clone(), conn_tx.clone(), shutdown.child_token());
    let initiator = ConnectionInitiator::new(
        Arc::new(TcpConnector::new(&config.connection)),
        config.connection.clone(),
        local,
        conn_tx,
    );

    if !orchestrator.start(true, true) {
        tracing::warn!("Discovery did not start, only direct connections will work");
    }

    let attempts: Vec<_> = connect
        .into_iter()
        .map(|addr| {
            initiator.connect(PeerIdentity {
                name: NO_PEER_NAME.to_string(),
                secondary_address: addr.to_string(),
                ..Default::default()
            })
        })
        .collect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            Some(event) = conn_rx.recv() => match event {
                ConnectionEvent::SocketConnected { peer } => {
                    tracing::info!("Socket connected to {}", peer.secondary_address)
                }
                ConnectionEvent::HandshakeSucceeded { peer, .. } => {
                    tracing::info!("Connected to {}", peer);
                    orchestrator.registry().add_or_update(peer);
                }
                ConnectionEvent::IncomingHandshake { peer, .. } => {
                    orchestrator.on_incoming_handshake(peer);
                }
                ConnectionEvent::ConnectionFailed { peer, reason } => {
                    tracing::warn!("Connection with {} failed: {}", peer.secondary_address, reason)
                }
            },
        }
    }

    for attempt in attempts.iter().filter(|attempt| !attempt.is_finished()) {
        tracing::info!(
            peer = %attempt.target().secondary_address,
            elapsed = ?attempt.started_at().elapsed(),
            "Abandoning connection attempt"
        );
    }
    initiator.shutdown();
    shutdown.cancel();
    orchestrator.stop();
    let _ = listener.await;
    let _ = maintenance.await;
    pump.abort();
    event_worker.abort();
    Ok(())
}
