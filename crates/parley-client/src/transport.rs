use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_core::ids::SessionId;
use parley_core::wire::{ClientMessage, ServerEvent};

use crate::backoff::Backoff;
use crate::error::ClientError;

/// One live connection to the session authority.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ClientError>;

    /// Next event from the authority, or `None` once the connection is gone.
    async fn recv(&mut self) -> Option<ServerEvent>;
}

/// Dials fresh connections. Abstract so tests can hand out channel-backed
/// transports instead of sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn Transport>, ClientError>;
}

/// Dial until connected, then run the admission handshake: send `connect`,
/// wait for `connected`, request a full sync. Every successful dial goes
/// through the same handshake, so a reconnect always lands on a freshly
/// synced state rather than a merged one. Fails once the backoff budget
/// is spent.
pub async fn establish(
    connector: &dyn Connector,
    backoff: &mut Backoff,
    session_id: &SessionId,
    name: &str,
) -> Result<Box<dyn Transport>, ClientError> {
    loop {
        match try_handshake(connector, session_id, name).await {
            Ok(transport) => {
                backoff.reset();
                return Ok(transport);
            }
            Err(e) => {
                tracing::warn!(attempt = backoff.attempt() + 1, error = %e, "dial failed");
            }
        }

        match backoff.next_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                return Err(ClientError::ReconnectExhausted {
                    attempts: backoff.max_attempts(),
                })
            }
        }
    }
}

async fn try_handshake(
    connector: &dyn Connector,
    session_id: &SessionId,
    name: &str,
) -> Result<Box<dyn Transport>, ClientError> {
    let mut transport = connector.dial().await?;

    transport
        .send(ClientMessage::Connect {
            session_id: session_id.clone(),
            name: name.to_string(),
        })
        .await?;

    match transport.recv().await {
        Some(ServerEvent::Connected { .. }) => {}
        Some(other) => {
            return Err(ClientError::Transport(format!(
                "expected connected, got {}",
                other.event_type()
            )))
        }
        None => return Err(ClientError::Disconnected),
    }

    transport.send(ClientMessage::SyncRequest).await?;
    Ok(transport)
}

/// Channel-backed transport for tests: messages sent by the client land on
/// the paired [`TransportHarness`], which scripts the authority's side.
pub struct ChannelTransport {
    outbound: mpsc::Sender<ClientMessage>,
    inbound: mpsc::Receiver<ServerEvent>,
}

pub struct TransportHarness {
    /// What the client sent, in order.
    pub sent: mpsc::Receiver<ClientMessage>,
    /// Feed events to the client through this.
    pub events: mpsc::Sender<ServerEvent>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, TransportHarness) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            TransportHarness {
                sent: out_rx,
                events: in_tx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ClientError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    async fn recv(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }
}
