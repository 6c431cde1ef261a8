//! A [`PeerSession`] over one TCP stream.

use crate::frame::{read_frame, write_frame, Frame, CHUNK_SIZE};
use async_trait::async_trait;
use p2pconnect_core::{
    BoundSession, PeerSession, PeerState, ResourceTransfer, ResourceUpdate, SessionError,
    SessionEvent,
};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

pub struct TcpPeerSession {
    peer: String,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    closed: AtomicBool,
    reader: AbortHandle,
}

impl TcpPeerSession {
    /// Greet an accepting peer and ask for `service_id`.
    pub async fn initiate(
        mut stream: TcpStream,
        device: &str,
        service_id: &str,
        staging: PathBuf,
    ) -> Result<BoundSession, SessionError> {
        let hello = Frame::Hello { device: device.to_string(), service_id: service_id.to_string() };
        write_frame(&mut stream, &hello).await?;

        match read_frame(&mut stream).await? {
            Some(Frame::Hello { device: peer, service_id: theirs }) if theirs == service_id => {
                tracing::info!("Connected to {}", peer);
                Ok(Self::spawn(stream, peer, staging))
            }
            Some(Frame::Hello { service_id: theirs, .. }) => {
                Err(SessionError::Frame(format!("peer offers service {}", theirs)))
            }
            Some(other) => Err(SessionError::Frame(format!("expected hello, got {:?}", other))),
            // The acceptor hangs up on a service it does not offer
            None => Err(SessionError::NotConnected),
        }
    }

    /// Answer a connecting peer's greeting. Peers looking for another
    /// service are refused by closing the stream.
    pub async fn respond(
        mut stream: TcpStream,
        device: &str,
        service_id: &str,
        staging: PathBuf,
    ) -> Result<BoundSession, SessionError> {
        let peer = match read_frame(&mut stream).await? {
            Some(Frame::Hello { device: peer, service_id: wanted }) if wanted == service_id => peer,
            Some(Frame::Hello { device: peer, service_id: wanted }) => {
                return Err(SessionError::Frame(format!(
                    "{} asked for service {}",
                    peer, wanted
                )));
            }
            Some(other) => {
                return Err(SessionError::Frame(format!("expected hello, got {:?}", other)))
            }
            None => return Err(SessionError::NotConnected),
        };

        let hello = Frame::Hello { device: device.to_string(), service_id: service_id.to_string() };
        write_frame(&mut stream, &hello).await?;

        tracing::info!("Accepted session from {}", peer);
        Ok(Self::spawn(stream, peer, staging))
    }

    fn spawn(stream: TcpStream, peer: String, staging: PathBuf) -> BoundSession {
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::channel(64);

        let inbound = Inbound { events: tx, staging, current: None, sequence: 0 };
        let reader = tokio::spawn(inbound.run(BufReader::new(read))).abort_handle();

        let session = Arc::new(Self {
            peer,
            writer: Arc::new(Mutex::new(write)),
            closed: AtomicBool::new(false),
            reader,
        });
        BoundSession::new(session, rx)
    }
}

impl Drop for TcpPeerSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl PeerSession for TcpPeerSession {
    fn peer_name(&self) -> String {
        self.peer.clone()
    }

    async fn send_text(&self, payload: &str) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &Frame::Text(payload.to_string())).await
    }

    async fn send_resource(&self, locator: &Path, name: &str)
        -> Result<ResourceTransfer, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let file = File::open(locator).await?;
        let size = file.metadata().await?.len();

        let (tx, rx) = mpsc::channel(16);
        let writer = self.writer.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let result = stream_resource(&writer, file, &name, size, &tx).await;
            if let Err(err) = &result {
                tracing::warn!("Sending {} failed: {}", name, err);
                let abort = Frame::ResourceAbort { reason: err.to_string() };
                let _ = write_frame(&mut *writer.lock().await, &abort).await;
            }
            let _ = tx.send(ResourceUpdate::Finished(result)).await;
        });

        Ok(ResourceTransfer::new(rx))
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!("Shutdown of session with {} failed: {}", self.peer, e);
        }
        self.reader.abort();
        tracing::info!("Disconnected from {}", self.peer);
    }
}

fn fraction(done: u64, size: u64) -> f64 {
    if size == 0 {
        1.0
    } else {
        (done as f64 / size as f64).min(1.0)
    }
}

async fn stream_resource(
    writer: &Mutex<OwnedWriteHalf>,
    mut file: File,
    name: &str,
    size: u64,
    updates: &mpsc::Sender<ResourceUpdate>,
) -> Result<(), SessionError> {
    let begin = Frame::ResourceBegin { name: name.to_string(), size };
    write_frame(&mut *writer.lock().await, &begin).await?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        write_frame(&mut *writer.lock().await, &Frame::ResourceChunk(buf[..n].to_vec())).await?;
        sent += n as u64;
        let _ = updates.send(ResourceUpdate::Progress(fraction(sent, size))).await;
    }

    let end = Frame::ResourceEnd { sha256: hex::encode(hasher.finalize()) };
    write_frame(&mut *writer.lock().await, &end).await?;
    tracing::debug!("Sent {} ({} bytes)", name, sent);
    Ok(())
}

/// A resource being written to the staging directory.
struct Partial {
    name: String,
    file: File,
    hasher: Sha256,
    size: u64,
    received: u64,
    // Declared after `file` so the handle is closed before removal.
    staged: Staged,
}

/// Staged file that is removed on drop unless handed over.
struct Staged {
    path: PathBuf,
    keep: bool,
}

impl Staged {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

struct Inbound {
    events: mpsc::Sender<SessionEvent>,
    staging: PathBuf,
    current: Option<Partial>,
    sequence: u64,
}

impl Inbound {
    async fn run(mut self, mut read: BufReader<OwnedReadHalf>) {
        loop {
            let frame = match read_frame(&mut read).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Closing session after read error: {}", e);
                    break;
                }
            };
            if !self.on_frame(frame).await {
                return;
            }
        }

        // A resource cut off by the disconnect is not reported on its own;
        // the state change below covers it.
        self.current = None;
        let _ = self.events.send(SessionEvent::PeerStateChanged(PeerState::NotConnected)).await;
    }

    /// Returns false once nobody is listening any more.
    async fn emit(&self, event: SessionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn on_frame(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Text(payload) => self.emit(SessionEvent::TextReceived(payload)).await,
            Frame::ResourceBegin { name, size } => self.on_begin(name, size).await,
            Frame::ResourceChunk(bytes) => self.on_chunk(&bytes).await,
            Frame::ResourceEnd { sha256 } => self.on_end(&sha256).await,
            Frame::ResourceAbort { reason } => match self.current.take() {
                Some(partial) => {
                    let name = partial.name.clone();
                    drop(partial);
                    let result = Err(SessionError::Aborted(reason));
                    self.emit(SessionEvent::ResourceFinished { name, result }).await
                }
                None => true,
            },
            Frame::Hello { .. } => {
                tracing::debug!("Ignoring repeated hello");
                true
            }
        }
    }

    async fn on_begin(&mut self, name: String, size: u64) -> bool {
        if let Some(previous) = self.current.take() {
            let previous_name = previous.name.clone();
            drop(previous);
            let result = Err(SessionError::Frame(format!("{} was never finished", previous_name)));
            if !self.emit(SessionEvent::ResourceFinished { name: previous_name, result }).await {
                return false;
            }
        }

        self.sequence += 1;
        let local = Path::new(&name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("resource");
        let path = self.staging.join(format!("{}-{}.part", self.sequence, local));

        match File::create(&path).await {
            Ok(file) => {
                self.current = Some(Partial {
                    name: name.clone(),
                    file,
                    hasher: Sha256::new(),
                    size,
                    received: 0,
                    staged: Staged::new(path),
                });
                self.emit(SessionEvent::ResourceStarted { name }).await
            }
            Err(e) => {
                tracing::warn!("Cannot stage {}: {}", name, e);
                self.emit(SessionEvent::ResourceStarted { name: name.clone() }).await
                    && self
                        .emit(SessionEvent::ResourceFinished { name, result: Err(e.into()) })
                        .await
            }
        }
    }

    async fn on_chunk(&mut self, bytes: &[u8]) -> bool {
        let Some(partial) = self.current.as_mut() else {
            // Tail of a resource that already failed locally
            return true;
        };

        if let Err(e) = partial.file.write_all(bytes).await {
            let Some(partial) = self.current.take() else { return true };
            let name = partial.name.clone();
            drop(partial);
            return self.emit(SessionEvent::ResourceFinished { name, result: Err(e.into()) }).await;
        }

        partial.hasher.update(bytes);
        partial.received += bytes.len() as u64;
        let event = SessionEvent::ResourceProgress {
            name: partial.name.clone(),
            fraction: fraction(partial.received, partial.size),
        };
        self.emit(event).await
    }

    async fn on_end(&mut self, sha256: &str) -> bool {
        let Some(mut partial) = self.current.take() else {
            return true;
        };
        let name = partial.name.clone();
        let received = partial.received;

        let digest = hex::encode(partial.hasher.clone().finalize());
        let result = if digest != sha256 || partial.received != partial.size {
            Err(SessionError::Integrity(name.clone()))
        } else {
            match partial.file.flush().await {
                Ok(()) => {
                    let Partial { file, staged, .. } = partial;
                    drop(file);
                    Ok(staged.keep())
                }
                Err(e) => Err(e.into()),
            }
        };

        let kept = result.as_ref().ok().cloned();
        if kept.is_some() {
            tracing::debug!("Received {} ({} bytes)", name, received);
        }
        let delivered = self.emit(SessionEvent::ResourceFinished { name, result }).await;
        if let (false, Some(path)) = (delivered, kept) {
            let _ = tokio::fs::remove_file(path).await;
        }
        delivered
    }
}
