//! TCP sockets for the connection path: an outbound [`Connector`] and an
//! inbound [`Acceptor`] that runs the answering side of the handshake.

use crate::config::{ConnectionConfig, PortStrategy};
use crate::connector::{ConnectionEvent, ConnectionEvents, Connector};
use crate::error::Result;
use crate::handshake;
use crate::peer::PeerIdentity;
use crate::protocol::IdentityRecord;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connects to the `ip:port` a peer advertised as its secondary address.
pub struct TcpConnector {
    rotating_base: u16,
    rotating_span: u16,
    next_rotation: AtomicU16,
}

impl TcpConnector {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            rotating_base: config.rotating_port_base,
            rotating_span: config.rotating_port_span.max(1),
            next_rotation: AtomicU16::new(0),
        }
    }

    fn remote_addr(&self, peer: &PeerIdentity, strategy: PortStrategy) -> io::Result<SocketAddr> {
        let advertised: SocketAddr = peer.secondary_address.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("peer has no usable address: {:?}", peer.secondary_address),
            )
        })?;

        let port = match strategy {
            PortStrategy::SystemAssigned => advertised.port(),
            PortStrategy::Explicit(port) => port,
            PortStrategy::Rotating => {
                let offset = self.next_rotation.fetch_add(1, Ordering::Relaxed) % self.rotating_span;
                self.rotating_base.wrapping_add(offset)
            }
        };
        Ok(SocketAddr::new(advertised.ip(), port))
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, peer: &PeerIdentity, strategy: PortStrategy) -> io::Result<TcpStream> {
        let addr = self.remote_addr(peer, strategy)?;
        tracing::debug!(%addr, "Opening socket");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Listening socket. Each accepted connection gets its own handshake task.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until `shutdown` fires, answering each handshake with `local`.
    /// Successful handshakes are reported as
    /// [`ConnectionEvent::IncomingHandshake`], failed ones as
    /// [`ConnectionEvent::ConnectionFailed`] keyed by the remote socket address.
    pub fn start_listening(
        self,
        local: IdentityRecord,
        events: ConnectionEvents<TcpStream>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = self.listener.accept() => accepted,
                };

                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                tracing::debug!(%remote, "Incoming connection");

                let local = local.clone();
                let events = events.clone();
                let cancel = shutdown.child_token();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = handshake::accept(stream, Some(&local)) => result,
                    };
                    let event = match result {
                        Ok((stream, peer)) => {
                            tracing::info!(peer = %peer, %remote, "Incoming handshake succeeded");
                            ConnectionEvent::IncomingHandshake { stream, peer }
                        }
                        Err(e) => {
                            tracing::info!(%remote, "Incoming handshake failed: {}", e);
                            ConnectionEvent::ConnectionFailed {
                                peer: PeerIdentity {
                                    secondary_address: remote.to_string(),
                                    ..Default::default()
                                },
                                reason: e.to_string(),
                            }
                        }
                    };
                    if events.send(event).is_err() {
                        tracing::debug!(%remote, "Connection event dropped, no receiver");
                    }
                });
            }
            tracing::debug!("Acceptor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::HardwareAddress;

    fn peer_at(addr: &str) -> PeerIdentity {
        PeerIdentity {
            secondary_address: addr.into(),
            ..PeerIdentity::new("B", HardwareAddress::parse("AA:BB:CC:DD:EE:FF").unwrap())
        }
    }

    #[test]
    fn port_strategies_pick_the_remote_port() {
        let connector = TcpConnector::new(&ConnectionConfig {
            rotating_port_base: 5000,
            rotating_port_span: 2,
            ..Default::default()
        });
        let peer = peer_at("10.0.0.7:4000");

        let port = |strategy| connector.remote_addr(&peer, strategy).unwrap().port();
        assert_eq!(port(PortStrategy::SystemAssigned), 4000);
        assert_eq!(port(PortStrategy::Explicit(4100)), 4100);
        assert_eq!(port(PortStrategy::Rotating), 5000);
        assert_eq!(port(PortStrategy::Rotating), 5001);
        assert_eq!(port(PortStrategy::Rotating), 5000);
    }

    #[test]
    fn peer_without_socket_address_is_rejected() {
        let connector = TcpConnector::new(&ConnectionConfig::default());
        let err = connector
            .remote_addr(&peer_at("not-an-address"), PortStrategy::SystemAssigned)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
