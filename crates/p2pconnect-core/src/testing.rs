//! Test doubles for the transport, discovery and presentation seams.

use crate::error::SessionError;
use crate::progress::{Progress, ProgressSink};
use crate::session::{
    Advertiser, BoundSession, Connector, PeerSession, PeerState, ResourceTransfer,
    ResourceUpdate, SessionEvent,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What a [`RecordingSession`] put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Resource(String),
}

/// How a [`RecordingSession`] completes outbound resources.
#[derive(Debug, Clone, Copy)]
pub enum ResourceScript {
    Succeed,
    /// Fail the resource with this zero-based index.
    FailAt(usize),
}

pub struct RecordingSession {
    wire: mpsc::UnboundedSender<Outbound>,
    script: ResourceScript,
    resources_sent: AtomicUsize,
    disconnects: AtomicUsize,
}

impl RecordingSession {
    pub fn new(script: ResourceScript) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (wire, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            wire,
            script,
            resources_sent: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        (session, rx)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for RecordingSession {
    fn peer_name(&self) -> String {
        "recording-peer".to_string()
    }

    async fn send_text(&self, payload: &str) -> Result<(), SessionError> {
        self.wire
            .send(Outbound::Text(payload.to_string()))
            .map_err(|_| SessionError::Closed)
    }

    async fn send_resource(&self, _locator: &Path, name: &str)
        -> Result<ResourceTransfer, SessionError> {
        let index = self.resources_sent.fetch_add(1, Ordering::SeqCst);
        let _ = self.wire.send(Outbound::Resource(name.to_string()));

        let (tx, rx) = mpsc::channel(4);
        let result = match self.script {
            ResourceScript::FailAt(at) if at == index => Err(SessionError::Closed),
            _ => Ok(()),
        };
        let _ = tx.send(ResourceUpdate::Progress(0.5)).await;
        let _ = tx.send(ResourceUpdate::Finished(result)).await;
        Ok(ResourceTransfer::new(rx))
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pair `session` with a fresh event channel; the returned sender plays the
/// remote peer.
pub fn bind(session: Arc<RecordingSession>) -> (BoundSession, mpsc::Sender<SessionEvent>) {
    let (tx, rx) = mpsc::channel(16);
    (BoundSession::new(session, rx), tx)
}

pub fn text(payload: &str) -> SessionEvent {
    SessionEvent::TextReceived(payload.to_string())
}

pub fn started(name: &str) -> SessionEvent {
    SessionEvent::ResourceStarted { name: name.to_string() }
}

pub fn finished(name: &str, result: Result<PathBuf, SessionError>) -> SessionEvent {
    SessionEvent::ResourceFinished { name: name.to_string(), result }
}

#[derive(Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<Progress>>,
    dismissals: AtomicUsize,
}

impl RecordingProgress {
    pub fn updates(&self) -> Vec<Progress> {
        self.updates.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.updates().into_iter().map(|p| p.title).collect()
    }

    pub fn dismissals(&self) -> usize {
        self.dismissals.load(Ordering::SeqCst)
    }
}

impl ProgressSink for RecordingProgress {
    fn update(&self, progress: &Progress) {
        self.updates.lock().unwrap().push(progress.clone());
    }

    fn dismiss(&self) {
        self.dismissals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector that hands out prepared sessions, then reports cancellation.
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<Vec<BoundSession>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn cancelled() -> Self {
        Self::default()
    }

    pub fn with_session(bound: BoundSession) -> Self {
        Self {
            sessions: Mutex::new(vec![bound]),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _service_id: &str) -> Result<BoundSession, SessionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().pop().ok_or(SessionError::Cancelled)
    }
}

/// Advertiser whose incoming sessions are pushed in by the test.
#[derive(Default)]
pub struct TestAdvertiser {
    incoming: tokio::sync::Mutex<Option<mpsc::Sender<BoundSession>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl TestAdvertiser {
    pub async fn offer(&self, bound: BoundSession) {
        let tx = self.incoming.lock().await.clone();
        match tx {
            Some(tx) => {
                let _ = tx.send(bound).await;
            }
            None => panic!("offered a session while not advertising"),
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Advertiser for TestAdvertiser {
    async fn start(&self, _service_id: &str) -> Result<mpsc::Receiver<BoundSession>, SessionError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        *self.incoming.lock().await = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.incoming.lock().await.take();
    }
}

/// One end of an in-memory link. Text and resources are delivered to the
/// other end's event channel in the order they were sent.
pub struct MemorySession {
    name: String,
    peer: mpsc::Sender<SessionEvent>,
    staging: PathBuf,
    closed: AtomicBool,
}

impl MemorySession {
    /// Two connected ends; resources arrive as copies under `staging`.
    pub fn pair(staging: &Path) -> (BoundSession, BoundSession) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        let a = Arc::new(Self {
            name: "a".into(),
            peer: b_tx,
            staging: staging.to_path_buf(),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(Self {
            name: "b".into(),
            peer: a_tx,
            staging: staging.to_path_buf(),
            closed: AtomicBool::new(false),
        });
        (BoundSession::new(a, a_rx), BoundSession::new(b, b_rx))
    }
}

#[async_trait]
impl PeerSession for MemorySession {
    fn peer_name(&self) -> String {
        self.name.clone()
    }

    async fn send_text(&self, payload: &str) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        self.peer
            .send(SessionEvent::TextReceived(payload.to_string()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn send_resource(&self, locator: &Path, name: &str)
        -> Result<ResourceTransfer, SessionError> {
        let (tx, rx) = mpsc::channel(4);
        let peer = self.peer.clone();
        let name = name.to_string();
        let source = locator.to_path_buf();
        let staged = self.staging.join(format!("{}.{}.part", self.name, name));

        tokio::spawn(async move {
            let _ = peer.send(SessionEvent::ResourceStarted { name: name.clone() }).await;
            let copied = tokio::fs::copy(&source, &staged).await;
            let _ = peer
                .send(SessionEvent::ResourceProgress { name: name.clone(), fraction: 1.0 })
                .await;
            let _ = tx.send(ResourceUpdate::Progress(1.0)).await;

            let (remote, local) = match copied {
                Ok(_) => (Ok(staged), Ok(())),
                Err(err) => (Err(SessionError::Aborted(err.to_string())), Err(SessionError::Io(err))),
            };
            let _ = peer.send(SessionEvent::ResourceFinished { name, result: remote }).await;
            let _ = tx.send(ResourceUpdate::Finished(local)).await;
        });

        Ok(ResourceTransfer::new(rx))
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self
                .peer
                .send(SessionEvent::PeerStateChanged(PeerState::NotConnected))
                .await;
        }
    }
}
