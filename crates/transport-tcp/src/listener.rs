//! Establishing TCP sessions: dialing a known address and accepting
//! incoming connections while advertising.

use crate::session::TcpPeerSession;
use async_trait::async_trait;
use p2pconnect_core::{Advertiser, BoundSession, Connector, SessionError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// How long an incoming connection may take to say hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a peer at a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    device: String,
    staging: PathBuf,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, device: impl Into<String>, staging: PathBuf) -> Self {
        Self { addr, device: device.into(), staging }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, service_id: &str) -> Result<BoundSession, SessionError> {
        tracing::info!("Connecting to {} for service {}", self.addr, service_id);
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        TcpPeerSession::initiate(stream, &self.device, service_id, self.staging.clone()).await
    }
}

/// Accepts sessions on a bound listener while advertising.
pub struct TcpAdvertiser {
    listener: Arc<TcpListener>,
    device: String,
    staging: PathBuf,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpAdvertiser {
    pub async fn bind(addr: SocketAddr, device: impl Into<String>, staging: PathBuf)
        -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener: Arc::new(listener),
            device: device.into(),
            staging,
            accept_task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Drop for TcpAdvertiser {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Advertiser for TcpAdvertiser {
    async fn start(&self, service_id: &str) -> Result<mpsc::Receiver<BoundSession>, SessionError> {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(accept_loop(
            self.listener.clone(),
            self.device.clone(),
            service_id.to_string(),
            self.staging.clone(),
            tx,
        ));

        if let Some(previous) = self.accept_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            tracing::debug!("Stopped accepting sessions");
        }
    }
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    device: String,
    service_id: String,
    staging: PathBuf,
    sessions: mpsc::Sender<BoundSession>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        tracing::debug!("Incoming connection from {}", addr);
        let _ = stream.set_nodelay(true);

        let greeting = TcpPeerSession::respond(stream, &device, &service_id, staging.clone());
        match tokio::time::timeout(HELLO_TIMEOUT, greeting).await {
            Ok(Ok(bound)) => {
                if sessions.send(bound).await.is_err() {
                    return;
                }
            }
            Ok(Err(e)) => tracing::warn!("Rejected connection from {}: {}", addr, e),
            Err(_) => tracing::warn!("Connection from {} never said hello", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame, Frame};
    use p2pconnect_core::{PeerState, ResourceUpdate, SessionEvent};
    use std::path::Path;
    use tempfile::TempDir;

    async fn advertiser(staging: PathBuf) -> TcpAdvertiser {
        TcpAdvertiser::bind("127.0.0.1:0".parse().unwrap(), "receiver", staging)
            .await
            .unwrap()
    }

    async fn connected(temp: &TempDir) -> (BoundSession, BoundSession, TcpAdvertiser) {
        let adv = advertiser(temp.path().to_path_buf()).await;
        let mut incoming = adv.start("p2pconnect").await.unwrap();

        let connector = TcpConnector::new(adv.local_addr().unwrap(), "sender", temp.path().to_path_buf());
        let outbound = connector.connect("p2pconnect").await.unwrap();
        let inbound = incoming.recv().await.unwrap();
        (outbound, inbound, adv)
    }

    #[tokio::test]
    async fn text_flows_both_ways() {
        let temp = TempDir::new().unwrap();
        let (mut sender, mut receiver, _adv) = connected(&temp).await;

        assert_eq!(sender.session.peer_name(), "receiver");
        assert_eq!(receiver.session.peer_name(), "sender");

        sender.session.send_text("ver.1").await.unwrap();
        sender.session.send_text("tid.t1").await.unwrap();
        receiver.session.send_text("ver.accept").await.unwrap();

        for expected in ["ver.1", "tid.t1"] {
            match receiver.events.recv().await.unwrap() {
                SessionEvent::TextReceived(text) => assert_eq!(text, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        match sender.events.recv().await.unwrap() {
            SessionEvent::TextReceived(text) => assert_eq!(text, "ver.accept"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn resource_arrives_staged_and_verified() {
        let temp = TempDir::new().unwrap();
        let (sender, mut receiver, _adv) = connected(&temp).await;

        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let source = temp.path().join("big.bin");
        std::fs::write(&source, &body).unwrap();

        let mut transfer = sender.session.send_resource(&source, "big.bin").await.unwrap();
        loop {
            match transfer.next().await {
                ResourceUpdate::Progress(f) => assert!((0.0..=1.0).contains(&f)),
                ResourceUpdate::Finished(result) => {
                    result.unwrap();
                    break;
                }
            }
        }

        let mut fractions = Vec::new();
        let staged = loop {
            match receiver.events.recv().await.unwrap() {
                SessionEvent::ResourceStarted { name } => assert_eq!(name, "big.bin"),
                SessionEvent::ResourceProgress { fraction, .. } => fractions.push(fraction),
                SessionEvent::ResourceFinished { name, result } => {
                    assert_eq!(name, "big.bin");
                    break result.unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(std::fs::read(staged).unwrap(), body);
        assert_eq!(fractions.last().copied(), Some(1.0));
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn missing_source_fails_before_streaming() {
        let temp = TempDir::new().unwrap();
        let (sender, _receiver, _adv) = connected(&temp).await;

        let result = sender.session.send_resource(&temp.path().join("nope"), "nope").await;
        assert!(matches!(result, Err(SessionError::Io(_))));
    }

    #[tokio::test]
    async fn disconnect_is_seen_by_the_peer() {
        let temp = TempDir::new().unwrap();
        let (sender, mut receiver, _adv) = connected(&temp).await;

        sender.session.disconnect().await;
        sender.session.disconnect().await;
        assert!(matches!(sender.session.send_text("x").await, Err(SessionError::Closed)));

        match receiver.events.recv().await.unwrap() {
            SessionEvent::PeerStateChanged(state) => assert_eq!(state, PeerState::NotConnected),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_service_is_refused() {
        let temp = TempDir::new().unwrap();
        let adv = advertiser(temp.path().to_path_buf()).await;
        let _incoming = adv.start("p2pconnect").await.unwrap();

        let connector = TcpConnector::new(adv.local_addr().unwrap(), "sender", temp.path().to_path_buf());
        assert!(connector.connect("otherapp").await.is_err());
    }

    #[tokio::test]
    async fn corrupted_resource_fails_integrity_check() {
        let temp = TempDir::new().unwrap();
        let adv = advertiser(temp.path().to_path_buf()).await;
        let mut incoming = adv.start("p2pconnect").await.unwrap();

        // Speak the wire protocol by hand to forge a bad digest
        let mut raw = TcpStream::connect(adv.local_addr().unwrap()).await.unwrap();
        let hello = Frame::Hello { device: "forger".into(), service_id: "p2pconnect".into() };
        write_frame(&mut raw, &hello).await.unwrap();
        assert!(matches!(read_frame(&mut raw).await.unwrap(), Some(Frame::Hello { .. })));

        let mut receiver = incoming.recv().await.unwrap();
        write_frame(&mut raw, &Frame::ResourceBegin { name: "a.txt".into(), size: 3 }).await.unwrap();
        write_frame(&mut raw, &Frame::ResourceChunk(b"abc".to_vec())).await.unwrap();
        write_frame(&mut raw, &Frame::ResourceEnd { sha256: "00".repeat(32) }).await.unwrap();

        let result = loop {
            if let SessionEvent::ResourceFinished { result, .. } = receiver.events.recv().await.unwrap() {
                break result;
            }
        };
        assert!(matches!(result, Err(SessionError::Integrity(name)) if name == "a.txt"));
    }

    fn part_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".part"))
            .collect()
    }

    async fn wait_for_no_parts(dir: &Path) -> Vec<String> {
        for _ in 0..100 {
            let left = part_files(dir);
            if left.is_empty() {
                return left;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        part_files(dir)
    }

    /// Hand-driven sender that has begun `a.txt` and sent part of it.
    async fn half_sent(staging: &Path) -> (TcpStream, BoundSession, TcpAdvertiser) {
        let adv = advertiser(staging.to_path_buf()).await;
        let mut incoming = adv.start("p2pconnect").await.unwrap();

        let mut raw = TcpStream::connect(adv.local_addr().unwrap()).await.unwrap();
        let hello = Frame::Hello { device: "sender".into(), service_id: "p2pconnect".into() };
        write_frame(&mut raw, &hello).await.unwrap();
        assert!(matches!(read_frame(&mut raw).await.unwrap(), Some(Frame::Hello { .. })));

        let mut receiver = incoming.recv().await.unwrap();
        write_frame(&mut raw, &Frame::ResourceBegin { name: "a.txt".into(), size: 100 }).await.unwrap();
        write_frame(&mut raw, &Frame::ResourceChunk(vec![7u8; 10])).await.unwrap();
        loop {
            match receiver.events.recv().await.unwrap() {
                SessionEvent::ResourceProgress { .. } => break,
                SessionEvent::ResourceStarted { name } => assert_eq!(name, "a.txt"),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(part_files(staging), ["1-a.txt.part"]);
        (raw, receiver, adv)
    }

    #[tokio::test]
    async fn local_disconnect_removes_partial_resource() {
        let temp = TempDir::new().unwrap();
        let (_raw, receiver, _adv) = half_sent(temp.path()).await;

        receiver.session.disconnect().await;
        drop(receiver);

        assert!(wait_for_no_parts(temp.path()).await.is_empty());
    }

    #[tokio::test]
    async fn abandoned_listener_removes_partial_resource() {
        let temp = TempDir::new().unwrap();
        let (mut raw, receiver, _adv) = half_sent(temp.path()).await;

        // Nobody reads events any more; the next chunk ends the session
        let BoundSession { session, events } = receiver;
        drop(events);
        write_frame(&mut raw, &Frame::ResourceChunk(vec![7u8; 10])).await.unwrap();

        assert!(wait_for_no_parts(temp.path()).await.is_empty());
        drop(session);
    }

    #[tokio::test]
    async fn peer_abort_removes_partial_resource() {
        let temp = TempDir::new().unwrap();
        let (mut raw, mut receiver, _adv) = half_sent(temp.path()).await;

        write_frame(&mut raw, &Frame::ResourceAbort { reason: "cancelled".into() }).await.unwrap();
        match receiver.events.recv().await.unwrap() {
            SessionEvent::ResourceFinished { name, result } => {
                assert_eq!(name, "a.txt");
                assert!(matches!(result, Err(SessionError::Aborted(reason)) if reason == "cancelled"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(part_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn stop_refuses_new_sessions() {
        let temp = TempDir::new().unwrap();
        let adv = advertiser(temp.path().to_path_buf()).await;
        let mut incoming = adv.start("p2pconnect").await.unwrap();
        adv.stop().await;

        assert!(incoming.recv().await.is_none());
    }
}
