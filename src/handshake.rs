//! One-shot identity exchange over a freshly connected stream.
//!
//! A message is a 2-byte big-endian length followed by the JSON identity
//! record. Reading exactly one frame means no application bytes are ever
//! consumed before the stream is handed back to the caller.

use crate::peer::{DiscoveryMethod, PeerIdentity};
use crate::protocol::{IdentityRecord, MAX_IDENTITY_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("socket disconnected: {0}")]
    Disconnected(String),

    #[error("handshake failed, invalid identity: {0}")]
    InvalidIdentity(String),
}

/// Wraps a connected stream for exactly one read and at most one write.
pub struct HandshakeChannel<S> {
    stream: S,
    exit_after_read: bool,
    finished: bool,
    written: bool,
}

impl<S> HandshakeChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            exit_after_read: true,
            finished: false,
            written: false,
        }
    }

    pub fn set_exit_after_read(&mut self, exit_after_read: bool) {
        self.exit_after_read = exit_after_read;
    }

    /// Reads one frame. I/O errors and closed streams become `Disconnected`.
    pub async fn read_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.finished {
            return Err(HandshakeError::Disconnected("channel finished".into()));
        }

        let len = self
            .stream
            .read_u16()
            .await
            .map_err(|e| HandshakeError::Disconnected(e.to_string()))? as usize;
        if len > MAX_IDENTITY_LEN {
            return Err(HandshakeError::InvalidIdentity(format!(
                "frame of {len} bytes exceeds {MAX_IDENTITY_LEN}"
            )));
        }

        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| HandshakeError::Disconnected(e.to_string()))?;
        tracing::debug!(bytes = len, "Handshake message read");

        if self.exit_after_read {
            self.finished = true;
        }
        Ok(buf)
    }

    /// Writes the one frame this channel allows. Failures, including a second
    /// write, are logged and reported as `false`; a peer that never completes
    /// the handshake is cleaned up by expiry elsewhere.
    pub async fn write(&mut self, bytes: &[u8]) -> bool {
        if self.written {
            tracing::warn!(bytes = bytes.len(), "Handshake message already written, dropping");
            return false;
        }
        self.written = true;

        let Ok(len) = u16::try_from(bytes.len()) else {
            tracing::warn!(bytes = bytes.len(), "Handshake message too large to frame");
            return false;
        };

        let result = async {
            self.stream.write_u16(len).await?;
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(bytes = bytes.len(), "Handshake message written");
                true
            }
            Err(e) => {
                tracing::info!("Handshake write failed: {}", e);
                false
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn parse_identity(bytes: &[u8], method: DiscoveryMethod) -> Result<PeerIdentity, HandshakeError> {
    IdentityRecord::decode(bytes)
        .and_then(|record| record.into_identity(method))
        .map_err(|e| HandshakeError::InvalidIdentity(e.to_string()))
}

/// Outbound side: write our record, then read theirs.
pub async fn initiate<S>(stream: S, local: &IdentityRecord) -> Result<(S, PeerIdentity), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = local
        .encode()
        .map_err(|e| HandshakeError::InvalidIdentity(e.to_string()))?;

    let mut channel = HandshakeChannel::new(stream);
    if !channel.write(&payload).await {
        return Err(HandshakeError::Disconnected(
            "failed to send our identity".into(),
        ));
    }

    let reply = channel.read_message().await?;
    let peer = parse_identity(&reply, DiscoveryMethod::Unknown)?;
    Ok((channel.into_inner(), peer))
}

/// Inbound side: read and validate theirs, then optionally answer with ours.
pub async fn accept<S>(
    stream: S,
    local: Option<&IdentityRecord>,
) -> Result<(S, PeerIdentity), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel = HandshakeChannel::new(stream);
    let request = channel.read_message().await?;
    let peer = parse_identity(&request, DiscoveryMethod::IncomingHandshake)?;

    if let Some(local) = local {
        match local.encode() {
            Ok(payload) => {
                channel.write(&payload).await;
            }
            Err(e) => tracing::warn!("Not answering handshake, bad local identity: {}", e),
        }
    }

    Ok((channel.into_inner(), peer))
}
