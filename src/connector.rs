//! Outbound connections: connect with retry and port fallback, then run the
//! identity handshake before handing the stream to the caller.

use crate::config::{ConnectionConfig, PortStrategy};
use crate::handshake;
use crate::peer::PeerIdentity;
use crate::protocol::IdentityRecord;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens raw sockets to peers.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        peer: &PeerIdentity,
        strategy: PortStrategy,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

pub enum ConnectionEvent<S> {
    SocketConnected {
        peer: PeerIdentity,
    },
    /// The stream now belongs to whoever receives this event.
    HandshakeSucceeded {
        stream: S,
        peer: PeerIdentity,
    },
    ConnectionFailed {
        peer: PeerIdentity,
        reason: String,
    },
    /// A remote peer connected to us and identified itself.
    IncomingHandshake {
        stream: S,
        peer: PeerIdentity,
    },
}

pub type ConnectionEvents<S> = mpsc::UnboundedSender<ConnectionEvent<S>>;

pub struct ConnectionInitiator<C: Connector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    local: IdentityRecord,
    events: ConnectionEvents<C::Stream>,
    shutdown: CancellationToken,
}

impl<C: Connector> ConnectionInitiator<C> {
    pub fn new(
        connector: Arc<C>,
        config: ConnectionConfig,
        local: IdentityRecord,
        events: ConnectionEvents<C::Stream>,
    ) -> Self {
        Self {
            connector,
            config,
            local,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns one attempt to reach `target`. Results arrive on the event channel.
    ///
    /// The initiator is single use: after [`Self::shutdown`] every attempt
    /// fails straight away with "connection initiator shut down".
    pub fn connect(&self, target: PeerIdentity) -> ConnectionAttempt {
        if self.shutdown.is_cancelled() {
            tracing::warn!(peer = %target, "Connect requested after shutdown");
            let event = ConnectionEvent::ConnectionFailed {
                peer: target.clone(),
                reason: "connection initiator shut down".into(),
            };
            if self.events.send(event).is_err() {
                tracing::debug!(peer = %target, "Connection event dropped, no receiver");
            }
        }

        let cancel = self.shutdown.child_token();
        let started_at = Instant::now();
        let task = AttemptTask {
            connector: self.connector.clone(),
            target: target.clone(),
            strategy: self.config.port_strategy,
            max_retries: self.config.max_retries,
            backoff: self.config.retry_backoff(),
            local: self.local.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };

        ConnectionAttempt {
            target,
            started_at,
            cancel,
            handle: tokio::spawn(task.run()),
        }
    }

    /// Cancels every attempt spawned by this initiator.
    pub fn shutdown(&self) {
        tracing::debug!("Shutting down connection initiator");
        self.shutdown.cancel();
    }
}

/// Handle to one in-flight outbound attempt.
pub struct ConnectionAttempt {
    target: PeerIdentity,
    started_at: Instant,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionAttempt {
    pub fn target(&self) -> &PeerIdentity {
        &self.target
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Stops the attempt. Whatever it was blocked on is dropped, which closes
    /// the socket; no failure is reported for it.
    pub fn shutdown(&self) {
        tracing::debug!(peer = %self.target, "Shutting down connection attempt");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!("Connection attempt task failed: {}", e);
        }
    }
}

struct AttemptTask<C: Connector> {
    connector: Arc<C>,
    target: PeerIdentity,
    strategy: PortStrategy,
    max_retries: u32,
    backoff: Duration,
    local: IdentityRecord,
    events: ConnectionEvents<C::Stream>,
    cancel: CancellationToken,
}

impl<C: Connector> AttemptTask<C> {
    async fn run(self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!(peer = %self.target, strategy = ?self.strategy, "Trying to connect");

        let mut attempt: u32 = 1;
        let stream = loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.connect_once() => result,
            };

            match result {
                Ok(stream) => {
                    tracing::info!(
                        peer = %self.target,
                        attempts = attempt,
                        "Socket connection succeeded"
                    );
                    break stream;
                }
                Err(e) => {
                    let reason = format!("Failed to connect (tried {attempt} time(s)): {e}");
                    tracing::debug!(peer = %self.target, "{}", reason);

                    if attempt > self.max_retries {
                        tracing::debug!(
                            max_retries = self.max_retries,
                            "Maximum number of allowed retries reached, giving up"
                        );
                        self.report(ConnectionEvent::ConnectionFailed {
                            peer: self.target.clone(),
                            reason,
                        });
                        return;
                    }

                    tracing::debug!(backoff = ?self.backoff, "Trying to connect again");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                    attempt += 1;
                }
            }
        };

        self.report(ConnectionEvent::SocketConnected {
            peer: self.target.clone(),
        });

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = handshake::initiate(stream, &self.local) => result,
        };

        match result {
            Ok((stream, mut peer)) => {
                peer.discovery_method = self.target.discovery_method;
                tracing::info!(peer = %peer, "Handshake succeeded");
                self.report(ConnectionEvent::HandshakeSucceeded { stream, peer });
            }
            Err(e) => {
                tracing::warn!(peer = %self.target, "{}", e);
                self.report(ConnectionEvent::ConnectionFailed {
                    peer: self.target.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// One connect with the configured strategy, falling back once to the
    /// system assigned port if a custom one fails.
    async fn connect_once(&self) -> io::Result<C::Stream> {
        match self.connector.connect(&self.target, self.strategy).await {
            Ok(stream) => Ok(stream),
            Err(e) if !self.strategy.is_default() => {
                tracing::debug!(
                    strategy = ?self.strategy,
                    "Connect failed ({}), falling back to system assigned port",
                    e
                );
                self.connector
                    .connect(&self.target, PortStrategy::SystemAssigned)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    fn report(&self, event: ConnectionEvent<C::Stream>) {
        // A shutdown that raced with completion still counts as a shutdown.
        if self.cancel.is_cancelled() {
            return;
        }
        if self.events.send(event).is_err() {
            tracing::debug!(peer = %self.target, "Connection event dropped, no receiver");
        }
    }
}
