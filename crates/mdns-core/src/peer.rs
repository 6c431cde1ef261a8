//! Discovery-backed [`Connector`] and [`Advertiser`] on top of the TCP transport.

use crate::announce::{host_label, Announcer};
use crate::discover::{browse_blocking, matching_service};
use crate::model::{ServiceAnnouncement, TxtRecord};
use crate::net::{choose_announce_ip, list_interface_ips_result};
use crate::{SERVICE_TYPE, TXT_DEVICE, TXT_SERVICE};
use async_trait::async_trait;
use p2pconnect_core::{Advertiser, BoundSession, Connector, SessionError};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use transport_tcp::{TcpAdvertiser, TcpConnector};

fn discovery_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::Io(std::io::Error::new(ErrorKind::Other, e.to_string()))
}

/// Accepts TCP sessions and announces them over mDNS while advertising.
pub struct MdnsAdvertiser {
    tcp: TcpAdvertiser,
    device: String,
    interface: Option<String>,
    announcer: Mutex<Option<Announcer>>,
}

impl MdnsAdvertiser {
    pub fn new(tcp: TcpAdvertiser, device: impl Into<String>, interface: Option<String>) -> Self {
        Self {
            tcp,
            device: device.into(),
            interface,
            announcer: Mutex::new(None),
        }
    }

    fn announcement(&self, service_id: &str) -> Result<ServiceAnnouncement, SessionError> {
        let ips = list_interface_ips_result()?;
        let ip = choose_announce_ip(&ips, self.interface.as_deref()).ok_or_else(|| {
            discovery_error(format!(
                "no usable address on interface {}",
                self.interface.as_deref().unwrap_or("(any)")
            ))
        })?;

        let txt = vec![
            (TXT_SERVICE.to_string(), service_id.to_string()),
            (TXT_DEVICE.to_string(), self.device.clone()),
        ];
        Ok(ServiceAnnouncement {
            service_type: SERVICE_TYPE.to_string(),
            instance_name: self.device.clone(),
            host_name: format!("{}.local.", host_label(&self.device)),
            ip_addr: ip.to_string(),
            port: self.tcp.local_addr()?.port(),
            txt: Some(TxtRecord(txt)),
        })
    }
}

#[async_trait]
impl Advertiser for MdnsAdvertiser {
    async fn start(&self, service_id: &str) -> Result<mpsc::Receiver<BoundSession>, SessionError> {
        let announcement = self.announcement(service_id)?;
        let incoming = self.tcp.start(service_id).await?;

        let announcer = match Announcer::register(announcement) {
            Ok(announcer) => announcer,
            Err(e) => {
                self.tcp.stop().await;
                return Err(discovery_error(e));
            }
        };
        if let Some(previous) = self.announcer.lock().await.replace(announcer) {
            previous.unregister();
        }
        Ok(incoming)
    }

    async fn stop(&self) {
        self.tcp.stop().await;
        if let Some(announcer) = self.announcer.lock().await.take() {
            announcer.unregister();
        }
    }
}

/// Browses for a receiver offering the requested service and dials the
/// first one found.
#[derive(Debug, Clone)]
pub struct MdnsConnector {
    device: String,
    staging: PathBuf,
    timeout: Duration,
}

impl MdnsConnector {
    pub fn new(device: impl Into<String>, staging: PathBuf, timeout: Duration) -> Self {
        Self { device: device.into(), staging, timeout }
    }
}

#[async_trait]
impl Connector for MdnsConnector {
    async fn connect(&self, service_id: &str) -> Result<BoundSession, SessionError> {
        let timeout = self.timeout;
        let found = tokio::task::spawn_blocking(move || browse_blocking(SERVICE_TYPE, timeout))
            .await
            .map_err(discovery_error)?
            .map_err(discovery_error)?;

        let peer = matching_service(found, service_id)
            .into_iter()
            .find_map(|svc| svc.socket_addr().map(|addr| (svc.instance_name, addr)));

        let Some((name, addr)) = peer else {
            tracing::info!("No peer offering {} found within {:?}", service_id, timeout);
            return Err(SessionError::Cancelled);
        };

        tracing::info!("Inviting {} at {}", name, addr);
        TcpConnector::new(addr, self.device.clone(), self.staging.clone())
            .connect(service_id)
            .await
    }
}
