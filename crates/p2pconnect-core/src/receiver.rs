//! Inbound side of a transfer.
//!
//! The receiver advertises itself, answers the handshake, asks the
//! application for consent and then reassembles the announced number of
//! resources in arrival order. It runs as an actor: the application drives it
//! through a [`ReceiverHandle`], while incoming sessions, session events and
//! the acceptance timer feed the same loop, so no two transitions interleave.

use crate::config::{validate_service_id, TransferConfig};
use crate::error::{ReceiveError, SessionError};
use crate::message::ProtocolMessage;
use crate::notifier::Notifier;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::resource::{ResourceDescriptor, TransferResult};
use crate::session::{
    recv_or_pending, Advertiser, BoundSession, PeerSession, PeerState, SessionEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use storage::Storage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// `current_resource_number` before the first resource has started.
pub const NOTHING_RECEIVED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    None,
    Advertising,
    WaitingForTransferId,
    WaitingForAccept,
    WaitingForCount,
    Receiving,
}

enum Command {
    Start {
        service_id: String,
        reply: oneshot::Sender<Result<(), ReceiveError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Decide {
        transfer_id: String,
        accept: bool,
    },
    State {
        reply: oneshot::Sender<ReceiverState>,
    },
}

/// Cloneable handle to a running [`ReceiverMachine`].
#[derive(Clone)]
pub struct ReceiverHandle {
    tx: mpsc::Sender<Command>,
}

impl ReceiverHandle {
    /// Reset all transfer state and begin advertising under `service_id`.
    pub async fn start(&self, service_id: &str) -> Result<(), ReceiveError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Start {
            service_id: service_id.to_string(),
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return Err(ReceiveError::Advertising("receiver has shut down".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(ReceiveError::Advertising("receiver has shut down".into())))
    }

    /// Stop advertising and drop any peer. Harmless when already stopped.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Answer an accept-transfer request. Ignored unless the receiver is
    /// still waiting for exactly this decision.
    pub async fn decide_acceptance(&self, transfer_id: &str, accept: bool) {
        let command = Command::Decide {
            transfer_id: transfer_id.to_string(),
            accept,
        };
        if self.tx.send(command).await.is_err() {
            tracing::debug!("Decision for {} dropped, receiver has shut down", transfer_id);
        }
    }

    pub async fn state(&self) -> ReceiverState {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::State { reply }).await.is_err() {
            return ReceiverState::None;
        }
        rx.await.unwrap_or(ReceiverState::None)
    }
}

struct AcceptTimer {
    epoch: u64,
    task: JoinHandle<()>,
}

pub struct ReceiverMachine {
    config: TransferConfig,
    advertiser: Arc<dyn Advertiser>,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    progress: ProgressReporter,

    state: ReceiverState,
    advertising: bool,
    incoming: Option<mpsc::Receiver<BoundSession>>,
    session: Option<Arc<dyn PeerSession>>,
    events: Option<mpsc::Receiver<SessionEvent>>,

    resource_count: usize,
    current_resource_number: i64,
    current_resource_name: Option<String>,
    transfer_id: String,
    received: Vec<ResourceDescriptor>,

    accept_timer: Option<AcceptTimer>,
    timer_epoch: u64,
    timer_tx: mpsc::Sender<u64>,
    timer_rx: mpsc::Receiver<u64>,
}

impl ReceiverMachine {
    pub fn new(
        config: TransferConfig,
        advertiser: Arc<dyn Advertiser>,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::channel(4);
        Self {
            config,
            advertiser,
            storage,
            notifier,
            progress: ProgressReporter::new(progress),
            state: ReceiverState::None,
            advertising: false,
            incoming: None,
            session: None,
            events: None,
            resource_count: 0,
            current_resource_number: NOTHING_RECEIVED,
            current_resource_name: None,
            transfer_id: String::new(),
            received: Vec::new(),
            accept_timer: None,
            timer_epoch: 0,
            timer_tx,
            timer_rx,
        }
    }

    /// Move the machine onto its own task. It runs until every handle is
    /// dropped, then cleans up.
    pub fn spawn(self) -> ReceiverHandle {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(self.run(rx));
        ReceiverHandle { tx }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            // Sessions are bound before commands are looked at, so a command
            // issued after a peer connected always sees that peer.
            tokio::select! {
                biased;

                Some(epoch) = self.timer_rx.recv() => self.on_accept_timeout(epoch).await,
                incoming = recv_or_pending(&mut self.incoming) => match incoming {
                    Some(bound) => self.bind(bound).await,
                    None => {
                        tracing::debug!("Advertiser stopped delivering sessions");
                        self.incoming = None;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = recv_or_pending(&mut self.events) => match event {
                    Some(event) => self.dispatch(event).await,
                    None => self.on_peer_disconnected().await,
                },
            }
        }

        tracing::debug!("Receiver handles dropped, shutting down");
        self.clean_up(true).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { service_id, reply } => {
                let result = self.start(&service_id).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Decide { transfer_id, accept } => {
                self.decide_acceptance(&transfer_id, accept).await
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    async fn start(&mut self, service_id: &str) -> Result<(), ReceiveError> {
        validate_service_id(service_id).map_err(ReceiveError::Advertising)?;

        self.clean_up(true).await;
        self.resource_count = 0;
        self.current_resource_number = NOTHING_RECEIVED;
        self.transfer_id.clear();
        self.received.clear();

        tracing::info!("Starting advertiser for service {}", service_id);
        let incoming = self
            .advertiser
            .start(service_id)
            .await
            .map_err(|err| ReceiveError::Advertising(err.to_string()))?;

        self.incoming = Some(incoming);
        self.advertising = true;
        self.state = ReceiverState::Advertising;
        Ok(())
    }

    async fn stop(&mut self) {
        tracing::info!("Stopping receiver");
        self.clean_up(true).await;
    }

    /// Return to `None`: cancel the acceptance timer, stop advertising, drop
    /// the peer if asked to, and dismiss progress. Safe to call repeatedly.
    async fn clean_up(&mut self, dismiss_session: bool) {
        tracing::debug!("Cleaning up (dismiss session: {})", dismiss_session);

        self.state = ReceiverState::None;
        self.cancel_accept_timer();
        self.dismiss_advertiser().await;

        if dismiss_session {
            if let Some(session) = self.session.take() {
                session.disconnect().await;
            }
            self.events = None;
        }

        self.current_resource_name = None;
        self.progress.dismiss();
    }

    async fn dismiss_advertiser(&mut self) {
        self.incoming = None;
        if self.advertising {
            tracing::debug!("Dismissing advertiser");
            self.advertising = false;
            self.advertiser.stop().await;
        }
    }

    async fn bind(&mut self, bound: BoundSession) {
        let peer = bound.session.peer_name();

        if self.session.is_some() || self.state != ReceiverState::Advertising {
            tracing::warn!("Rejecting session from {} in state {:?}", peer, self.state);
            bound.session.disconnect().await;
            return;
        }

        tracing::info!("Peer {} connected", peer);
        self.session = Some(bound.session);
        self.events = Some(bound.events);
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TextReceived(text) => self.on_message(&text).await,
            SessionEvent::ResourceStarted { name } => self.on_resource_started(name).await,
            SessionEvent::ResourceProgress { name, fraction } => {
                self.on_resource_progress(&name, fraction)
            }
            SessionEvent::ResourceFinished { name, result } => {
                self.on_resource_finished(name, result).await
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

        // The peer is talking to us; nobody else needs to find this device.
        self.dismiss_advertiser().await;

        let msg = match text.parse::<ProtocolMessage>() {
            Ok(msg) => msg,
            Err(err) => return self.abort(ReceiveError::ProtocolViolation(err.to_string())).await,
        };

        let step = match (self.state, msg) {
            (ReceiverState::Advertising, ProtocolMessage::Version(version)) => {
                self.on_version(version).await
            }
            (ReceiverState::WaitingForTransferId, ProtocolMessage::TransferId(transfer_id)) => {
                self.on_transfer_id(transfer_id);
                Ok(())
            }
            (ReceiverState::WaitingForCount, ProtocolMessage::Count(count)) => {
                self.on_count(count).await
            }
            (state, msg) => Err(ReceiveError::ProtocolViolation(format!(
                "{} in state {:?}",
                msg, state
            ))),
        };

        if let Err(err) = step {
            self.abort(err).await;
        }
    }

    async fn on_version(&mut self, version: String) -> Result<(), ReceiveError> {
        if version != self.config.supported_version {
            tracing::warn!(
                "Peer speaks version {:?}, expected {:?}",
                version,
                self.config.supported_version
            );
            self.progress.fraction(1.0);
            if let Err(err) = self.send(ProtocolMessage::VersionDeny).await {
                tracing::warn!("Could not deny version: {}", err);
            }
            self.clean_up(false).await;
            self.notifier.transfer_failed(ReceiveError::VersionMismatch(version));
            return Ok(());
        }

        self.state = ReceiverState::WaitingForTransferId;
        self.progress.set(Some("handshake"), Some("Synchronizing..."), 0.75);
        self.send(ProtocolMessage::VersionAccept).await
    }

    fn on_transfer_id(&mut self, transfer_id: String) {
        tracing::info!("Peer requests transfer {}", transfer_id);
        self.state = ReceiverState::WaitingForAccept;
        self.transfer_id = transfer_id;
        self.arm_accept_timer();
        self.notifier.accept_transfer_requested(&self.transfer_id);
    }

    async fn on_count(&mut self, count: usize) -> Result<(), ReceiveError> {
        tracing::info!("Awaiting {} resources", count);
        self.resource_count = count;
        self.current_resource_number = NOTHING_RECEIVED;
        self.state = ReceiverState::Receiving;
        self.progress
            .set(Some(&format!("0/{}", count)), Some("Transferring..."), 0.0);
        self.send(ProtocolMessage::CountAccept).await?;

        if count == 0 {
            self.complete().await;
        }
        Ok(())
    }

    async fn decide_acceptance(&mut self, transfer_id: &str, accept: bool) {
        tracing::info!("Decision for transfer {}: accept = {}", transfer_id, accept);

        if self.state != ReceiverState::WaitingForAccept {
            tracing::debug!("Not waiting for acceptance, ignoring decision");
            return;
        }
        self.cancel_accept_timer();

        if accept && transfer_id == self.transfer_id {
            self.state = ReceiverState::WaitingForCount;
            self.progress.fraction(1.0);
            if let Err(err) = self.send(ProtocolMessage::TransferIdAccept).await {
                self.abort(err).await;
            }
            return;
        }

        if transfer_id != self.transfer_id {
            tracing::warn!(
                "Decision names transfer {}, tracking {}; denying",
                transfer_id,
                self.transfer_id
            );
        }
        self.progress.fraction(1.0);
        if let Err(err) = self.send(ProtocolMessage::TransferIdDeny).await {
            tracing::warn!("Could not deny transfer: {}", err);
        }
        self.clean_up(false).await;
        self.notifier
            .transfer_failed(ReceiveError::TransferDenied(self.transfer_id.clone()));
    }

    fn arm_accept_timer(&mut self) {
        self.cancel_accept_timer();

        self.timer_epoch += 1;
        let epoch = self.timer_epoch;
        let timeout = self.config.accept_timeout();
        let tx = self.timer_tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(epoch).await;
        });
        self.accept_timer = Some(AcceptTimer { epoch, task });
    }

    fn cancel_accept_timer(&mut self) {
        if let Some(timer) = self.accept_timer.take() {
            timer.task.abort();
        }
    }

    async fn on_accept_timeout(&mut self, epoch: u64) {
        match &self.accept_timer {
            Some(timer) if timer.epoch == epoch => self.accept_timer = None,
            _ => {
                tracing::debug!("Ignoring stale acceptance timer {}", epoch);
                return;
            }
        }
        if self.state != ReceiverState::WaitingForAccept {
            return;
        }

        tracing::warn!(
            "No decision for transfer {} within {:?}",
            self.transfer_id,
            self.config.accept_timeout()
        );
        if self.config.deny_on_accept_timeout {
            if let Err(err) = self.send(ProtocolMessage::TransferIdDeny).await {
                tracing::warn!("Could not deny transfer: {}", err);
            }
        }
        self.clean_up(false).await;
        self.notifier
            .transfer_failed(ReceiveError::AcceptTimeout(self.transfer_id.clone()));
    }

    async fn on_resource_started(&mut self, name: String) {
        if self.state != ReceiverState::Receiving {
            let err = format!("resource {} started in state {:?}", name, self.state);
            return self.abort(ReceiveError::ProtocolViolation(err)).await;
        }

        // Never below NOTHING_RECEIVED, so the next index is non-negative
        let index = usize::try_from(self.current_resource_number + 1).unwrap_or(usize::MAX);
        self.current_resource_number += 1;
        if index >= self.resource_count {
            tracing::warn!("Too many resources sent, {} was not announced", name);
            return self.abort(ReceiveError::TooManyResources(self.resource_count)).await;
        }

        tracing::debug!("Receiving {} ({}/{})", name, index + 1, self.resource_count);
        self.current_resource_name = Some(name);
        let title = format!("{}/{}", index + 1, self.resource_count);
        self.progress.set(Some(&title), None, 0.0);
    }

    fn on_resource_progress(&mut self, name: &str, fraction: f64) {
        if self.current_resource_name.as_deref() == Some(name) {
            self.progress.fraction(fraction);
        }
    }

    async fn on_resource_finished(&mut self, name: String, result: Result<PathBuf, SessionError>) {
        if self.state != ReceiverState::Receiving
            || self.received.len() as i64 != self.current_resource_number
        {
            let err = format!("resource {} finished out of order in state {:?}", name, self.state);
            return self.abort(ReceiveError::ProtocolViolation(err)).await;
        }
        if self.current_resource_name.as_deref() != Some(name.as_str()) {
            let err = format!(
                "resource {} finished while {} was in progress",
                name,
                self.current_resource_name.as_deref().unwrap_or("nothing")
            );
            return self.abort(ReceiveError::ProtocolViolation(err)).await;
        }
        self.current_resource_name = None;

        let staged = match result {
            Ok(path) => path,
            Err(err) => return self.abort(ReceiveError::Transmission(err.to_string())).await,
        };

        let storage = self.storage.clone();
        let location = match storage.persist(&name, &staged).await {
            Ok(location) => location,
            Err(err) => {
                if let Err(e) = tokio::fs::remove_file(&staged).await {
                    tracing::debug!("Could not remove {}: {}", staged.display(), e);
                }
                return self.abort(ReceiveError::Io(format!("{:#}", err))).await;
            }
        };

        tracing::info!("Received {} -> {}", name, location.display());
        self.received.push(ResourceDescriptor::new(name, location));

        if self.received.len() == self.resource_count {
            self.complete().await;
        }
    }

    async fn complete(&mut self) {
        tracing::info!(
            "Transfer {} complete ({} resources)",
            self.transfer_id,
            self.received.len()
        );
        let result = TransferResult {
            transfer_id: self.transfer_id.clone(),
            resources: std::mem::take(&mut self.received),
        };
        self.clean_up(false).await;
        self.notifier.transfer_complete(result);
    }

    async fn on_peer_disconnected(&mut self) {
        tracing::info!("Peer disconnected in state {:?}", self.state);
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
        self.events = None;

        match self.state {
            ReceiverState::None | ReceiverState::Advertising => {}
            _ => {
                self.clean_up(false).await;
                self.notifier.transfer_failed(ReceiveError::TransferInterrupted);
            }
        }
    }

    async fn send(&mut self, msg: ProtocolMessage) -> Result<(), ReceiveError> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| ReceiveError::Transmission("no peer session bound".into()))?;
        let payload = msg.encode();
        tracing::debug!("Sending {:?}", payload);
        session
            .send_text(&payload)
            .await
            .map_err(|err| ReceiveError::Transmission(err.to_string()))
    }

    /// Terminal failure: tear everything down, including the peer session.
    async fn abort(&mut self, error: ReceiveError) {
        tracing::warn!("Aborting reception: {}", error);
        self.clean_up(true).await;
        self.notifier.transfer_failed(error);
    }
}
