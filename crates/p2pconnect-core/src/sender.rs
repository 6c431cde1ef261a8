//! Outbound side of a transfer.
//!
//! The sender drives the handshake (`ver.` -> `tid.` -> `cnt.`) and then
//! streams the batch one resource at a time. A transfer runs as a single
//! task owning all of the machine's state: session events and updates of the
//! in-flight resource are multiplexed in one loop, so every transition is
//! applied whole and in arrival order.

use crate::config::{validate_service_id, TransferConfig};
use crate::error::{SendError, SessionError};
use crate::message::ProtocolMessage;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::resource::TransferBatch;
use crate::session::{
    BoundSession, Connector, PeerSession, PeerState, ResourceTransfer, ResourceUpdate,
    SessionEvent,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    None,
    Browsing,
    WaitingForVersion,
    WaitingForTransferId,
    WaitingForCount,
    Transmitting,
}

/// Terminal result of a send operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SendError>,
}

impl SendOutcome {
    pub fn success() -> Self {
        Self { success: true, error: None }
    }

    pub fn failure(error: SendError) -> Self {
        Self { success: false, error: Some(error) }
    }

    pub fn into_result(self) -> Result<(), SendError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct SenderMachine {
    config: TransferConfig,
    state: SenderState,
    batch: Option<TransferBatch>,
    /// Index of the resource in flight; `None` before the first one.
    current_resource: Option<usize>,
    session: Option<Arc<dyn PeerSession>>,
    in_flight: Option<ResourceTransfer>,
    progress: ProgressReporter,
    outcome: Option<SendOutcome>,
}

impl SenderMachine {
    pub fn new(config: TransferConfig, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            config,
            state: SenderState::None,
            batch: None,
            current_resource: None,
            session: None,
            in_flight: None,
            progress: ProgressReporter::new(progress),
            outcome: None,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Find a peer through `connector`, then run the whole transfer.
    pub async fn send<C>(&mut self, batch: TransferBatch, connector: &C) -> SendOutcome
    where
        C: Connector + ?Sized,
    {
        self.reset();

        if let Err(reason) = validate_service_id(&self.config.service_id) {
            tracing::warn!("Refusing to browse: {}", reason);
            return SendOutcome::failure(SendError::Cancelled);
        }

        self.state = SenderState::Browsing;
        tracing::info!("Browsing for peers on service {}", self.config.service_id);

        match connector.connect(&self.config.service_id).await {
            Ok(bound) => self.start(batch, bound).await,
            Err(err) => {
                match err {
                    SessionError::Cancelled => tracing::info!("Peer selection cancelled"),
                    other => tracing::warn!("Could not connect to a peer: {}", other),
                }
                self.state = SenderState::None;
                SendOutcome::failure(SendError::Cancelled)
            }
        }
    }

    /// Run the transfer of `batch` over an already connected session.
    /// Resolves exactly once.
    pub async fn start(&mut self, batch: TransferBatch, bound: BoundSession) -> SendOutcome {
        self.reset();

        let BoundSession { session, events } = bound;
        tracing::info!(
            "Starting transfer {} ({} resources) to {}",
            batch.transfer_id,
            batch.len(),
            session.peer_name()
        );

        self.batch = Some(batch);
        self.session = Some(session);
        self.state = SenderState::WaitingForVersion;
        self.progress.set(Some("handshake"), Some("Synchronizing..."), 0.25);

        let version = ProtocolMessage::Version(self.config.supported_version.clone());
        if let Err(err) = self.send_message(version).await {
            self.fail(err).await;
        }

        self.run(events).await
    }

    fn reset(&mut self) {
        self.state = SenderState::None;
        self.batch = None;
        self.current_resource = None;
        self.session = None;
        self.in_flight = None;
        self.outcome = None;
    }

    async fn run(&mut self, mut events: mpsc::Receiver<SessionEvent>) -> SendOutcome {
        while self.outcome.is_none() {
            // A finished resource must be seen before the hang-up that the
            // receiver sends once it has it.
            tokio::select! {
                biased;
                update = next_update(&mut self.in_flight) => self.on_resource_update(update).await,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => self.on_peer_disconnected().await,
                },
            }
        }

        self.outcome
            .take()
            .unwrap_or_else(|| SendOutcome::failure(SendError::InternalError))
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TextReceived(text) => self.on_message(&text).await,
            SessionEvent::ResourceStarted { name }
            | SessionEvent::ResourceProgress { name, .. }
            | SessionEvent::ResourceFinished { name, .. } => {
                tracing::warn!("Peer pushed resource {} to the sending side", name);
                self.fail(SendError::InternalError).await;
            }
            SessionEvent::PeerStateChanged(PeerState::NotConnected) => {
                self.on_peer_disconnected().await
            }
            SessionEvent::PeerStateChanged(state) => {
                tracing::debug!("Peer state changed to {:?}", state);
            }
        }
    }

    async fn on_message(&mut self, text: &str) {
        tracing::debug!("Received {:?} in state {:?}", text, self.state);

        let msg = match text.parse::<ProtocolMessage>() {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!("Unreadable command from peer: {}", err);
                return self.fail(SendError::InternalError).await;
            }
        };

        let step = match (self.state, msg) {
            (SenderState::WaitingForVersion, ProtocolMessage::VersionAccept) => {
                self.send_transfer_id().await
            }
            (SenderState::WaitingForVersion, ProtocolMessage::VersionDeny) => {
                Err(SendError::VersionMismatch)
            }
            (SenderState::WaitingForTransferId, ProtocolMessage::TransferIdAccept) => {
                self.send_count().await
            }
            (SenderState::WaitingForTransferId, ProtocolMessage::TransferIdDeny) => {
                Err(SendError::TransferDenied)
            }
            (SenderState::WaitingForCount, ProtocolMessage::CountAccept) => {
                self.state = SenderState::Transmitting;
                self.current_resource = None;
                self.send_next_resource().await
            }
            (state, msg) => {
                tracing::warn!("Unexpected {} in state {:?}", msg, state);
                Err(SendError::InternalError)
            }
        };

        if let Err(err) = step {
            self.fail(err).await;
        }
    }

    async fn send_transfer_id(&mut self) -> Result<(), SendError> {
        let transfer_id = self.batch()?.transfer_id.clone();
        self.state = SenderState::WaitingForTransferId;
        self.progress.fraction(0.5);
        self.send_message(ProtocolMessage::TransferId(transfer_id)).await
    }

    async fn send_count(&mut self) -> Result<(), SendError> {
        let count = self.batch()?.len();
        self.state = SenderState::WaitingForCount;
        self.progress.fraction(0.75);
        self.send_message(ProtocolMessage::Count(count)).await
    }

    /// Advance to the next resource, or resolve if the batch is exhausted.
    async fn send_next_resource(&mut self) -> Result<(), SendError> {
        let next = self.current_resource.map_or(0, |i| i + 1);
        let batch = self.batch()?;
        let total = batch.len();

        if next >= total {
            tracing::info!("Transfer {} complete", batch.transfer_id);
            self.finish(SendOutcome::success()).await;
            return Ok(());
        }

        let resource = batch.resources[next].clone();
        self.current_resource = Some(next);
        self.progress
            .set(Some(&format!("{}/{}", next + 1, total)), Some("Transferring..."), 0.0);

        tracing::debug!("Sending resource {} ({}/{})", resource.id, next + 1, total);
        let session = self.session()?;
        match session.send_resource(&resource.uri, &resource.id).await {
            Ok(transfer) => {
                self.in_flight = Some(transfer);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Could not start sending {}: {}", resource.id, err);
                Err(SendError::InternalError)
            }
        }
    }

    async fn on_resource_update(&mut self, update: ResourceUpdate) {
        match update {
            ResourceUpdate::Progress(fraction) => self.progress.fraction(fraction),
            ResourceUpdate::Finished(Ok(())) => {
                self.in_flight = None;
                if let Err(err) = self.send_next_resource().await {
                    self.fail(err).await;
                }
            }
            ResourceUpdate::Finished(Err(err)) => {
                self.in_flight = None;
                tracing::warn!("Resource transfer failed: {}", err);
                self.fail(SendError::TransferInterrupted).await;
            }
        }
    }

    async fn on_peer_disconnected(&mut self) {
        tracing::info!("Peer disconnected in state {:?}", self.state);
        self.in_flight = None;
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
        if self.state != SenderState::None {
            self.fail(SendError::TransferInterrupted).await;
        }
    }

    async fn send_message(&mut self, msg: ProtocolMessage) -> Result<(), SendError> {
        let session = self.session()?;
        let payload = msg.encode();
        tracing::debug!("Sending {:?}", payload);
        session.send_text(&payload).await.map_err(|err| {
            tracing::warn!("Sending {:?} failed: {}", payload, err);
            SendError::TransferInterrupted
        })
    }

    async fn fail(&mut self, error: SendError) {
        tracing::warn!("Transfer failed: {}", error.kind());
        self.finish(SendOutcome::failure(error)).await;
    }

    /// Record the outcome, release the session and dismiss progress. Only the
    /// first call has any effect.
    async fn finish(&mut self, outcome: SendOutcome) {
        if self.outcome.is_some() {
            return;
        }
        self.state = SenderState::None;
        self.in_flight = None;
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
        self.progress.dismiss();
        self.outcome = Some(outcome);
    }

    fn batch(&self) -> Result<&TransferBatch, SendError> {
        self.batch.as_ref().ok_or_else(|| {
            tracing::error!("No batch bound in state {:?}", self.state);
            SendError::InternalError
        })
    }

    fn session(&self) -> Result<Arc<dyn PeerSession>, SendError> {
        self.session.clone().ok_or_else(|| {
            tracing::error!("No session bound in state {:?}", self.state);
            SendError::InternalError
        })
    }
}

async fn next_update(transfer: &mut Option<ResourceTransfer>) -> ResourceUpdate {
    match transfer {
        Some(transfer) => transfer.next().await,
        None => std::future::pending().await,
    }
}
