use crate::model::ServiceAnnouncement;
use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};

/// Handle so the service stays registered while this is alive.
pub struct Announcer {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcer {
    pub fn register(ann: ServiceAnnouncement) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let properties = ann.txt.unwrap_or_default().into_properties();

        // Ensure trailing dots as mdns-sd expects FQDNs.
        let service_type = ensure_dot(&ann.service_type);
        let host_name = ensure_dot(&ann.host_name);

        let info = ServiceInfo::new(
            &service_type,
            &ann.instance_name,
            &host_name,
            ann.ip_addr.as_str(),
            ann.port,
            properties,
        )?;

        daemon.register(info.clone())?;
        tracing::info!("Announcing {} on {}:{}", info.get_fullname(), ann.ip_addr, ann.port);
        Ok(Self {
            daemon,
            fullname: info.get_fullname().to_string(),
        })
    }

    /// Withdraw the announcement and stop the daemon.
    pub fn unregister(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            tracing::debug!("Unregister of {} failed: {}", self.fullname, e);
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::debug!("mDNS daemon shutdown failed: {}", e);
        }
        tracing::info!("Stopped announcing {}", self.fullname);
    }
}

pub(crate) fn ensure_dot(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{}.", s)
    }
}

/// Turn a free-form device name into a usable mDNS host label.
pub fn host_label(device: &str) -> String {
    let mut label = String::new();
    for c in device.chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c.to_ascii_lowercase());
        } else if !label.ends_with('-') && !label.is_empty() {
            label.push('-');
        }
    }
    let label = label.trim_end_matches('-');
    if label.is_empty() {
        "p2pconnect".to_string()
    } else {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dot() {
        assert_eq!(ensure_dot("_p2pconnect._tcp.local"), "_p2pconnect._tcp.local.");
        assert_eq!(ensure_dot("desk.local."), "desk.local.");
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("Kitchen Laptop"), "kitchen-laptop");
        assert_eq!(host_label("  Bob's  iPad!! "), "bob-s-ipad");
        assert_eq!(host_label("???"), "p2pconnect");
    }
}
