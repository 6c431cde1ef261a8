//! The transport seam.
//!
//! A [`PeerSession`] is a reliable, ordered, point-to-point channel that can
//! carry short text commands and stream whole resources. Everything the
//! transport reports back is funnelled into a single [`SessionEvent`] stream
//! so each machine has exactly one place where transitions happen.

use crate::error::SessionError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection state of the remote peer as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    NotConnected,
}

/// Inbound transport events.
#[derive(Debug)]
pub enum SessionEvent {
    TextReceived(String),
    ResourceStarted { name: String },
    ResourceProgress { name: String, fraction: f64 },
    /// `Ok` carries the location of the fully received payload.
    ResourceFinished { name: String, result: Result<PathBuf, SessionError> },
    PeerStateChanged(PeerState),
}

/// Updates for one outbound resource: any number of `Progress` followed by
/// exactly one `Finished`.
#[derive(Debug)]
pub enum ResourceUpdate {
    Progress(f64),
    Finished(Result<(), SessionError>),
}

/// Handle on an outbound resource that is being streamed to the peer.
#[derive(Debug)]
pub struct ResourceTransfer {
    updates: mpsc::Receiver<ResourceUpdate>,
}

impl ResourceTransfer {
    pub fn new(updates: mpsc::Receiver<ResourceUpdate>) -> Self {
        Self { updates }
    }

    /// Next update. A transport that drops the channel without reporting
    /// completion is treated as a failed transfer.
    pub async fn next(&mut self) -> ResourceUpdate {
        self.updates
            .recv()
            .await
            .unwrap_or(ResourceUpdate::Finished(Err(SessionError::Closed)))
    }
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Display name of the connected peer.
    fn peer_name(&self) -> String;

    async fn send_text(&self, payload: &str) -> Result<(), SessionError>;

    /// Start streaming the resource at `locator` to the peer under `name`.
    async fn send_resource(&self, locator: &Path, name: &str)
        -> Result<ResourceTransfer, SessionError>;

    /// Close the session. Calling this more than once is harmless.
    async fn disconnect(&self);
}

/// A connected session together with the events it produces.
pub struct BoundSession {
    pub session: Arc<dyn PeerSession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

impl BoundSession {
    pub fn new(session: Arc<dyn PeerSession>, events: mpsc::Receiver<SessionEvent>) -> Self {
        Self { session, events }
    }
}

/// Sender-side discovery and invitation: yields a session once a peer has
/// accepted, or [`SessionError::Cancelled`] if no peer was selected.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, service_id: &str) -> Result<BoundSession, SessionError>;
}

/// Receiver-side advertising: makes this device discoverable and delivers
/// each accepted incoming session on the returned channel.
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn start(&self, service_id: &str) -> Result<mpsc::Receiver<BoundSession>, SessionError>;

    /// Stop advertising. Calling this while not advertising is harmless.
    async fn stop(&self);
}

/// Await the next item of an optional channel. Pends forever when there is
/// no channel so it can sit in a `select!` next to live branches; `None`
/// still means the channel closed.
pub(crate) async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
