use crate::announce::ensure_dot;
use crate::model::DiscoveredService;
use crate::TXT_SERVICE;
use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::time::{Duration, Instant};

/// One poll of the browse channel.
enum Browse {
    Event(ServiceEvent),
    Idle,
    Closed,
}

/// Browse for `service_type` until `timeout` elapses, returning every
/// resolved instance once.
pub fn browse_blocking(service_type: &str, timeout: Duration) -> Result<Vec<DiscoveredService>> {
    let daemon = ServiceDaemon::new()?;
    let service_type = ensure_dot(service_type);

    let receiver = daemon.browse(&service_type)?;
    let out = collect_resolved(&service_type, timeout, |wait| match receiver.recv_timeout(wait) {
        Ok(event) => Browse::Event(event),
        Err(_) if receiver.is_disconnected() => Browse::Closed,
        Err(_) => Browse::Idle,
    });

    if let Err(e) = daemon.shutdown() {
        tracing::debug!("mDNS daemon shutdown failed: {}", e);
    }
    Ok(out)
}

fn collect_resolved(
    service_type: &str,
    timeout: Duration,
    mut next: impl FnMut(Duration) -> Browse,
) -> Vec<DiscoveredService> {
    let mut out: Vec<DiscoveredService> = Vec::new();

    let deadline = Instant::now() + timeout;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let event = match next(remaining.min(Duration::from_millis(500))) {
            Browse::Event(event) => event,
            Browse::Idle => continue,
            Browse::Closed => {
                tracing::debug!("Browse channel for {} closed", service_type);
                break;
            }
        };
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let fullname = info.get_fullname().to_string();
                if out.iter().any(|svc| svc.fullname == fullname) {
                    continue;
                }
                let txt = info
                    .get_properties()
                    .iter()
                    .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
                    .collect::<Vec<_>>();

                tracing::debug!("Resolved {}", fullname);
                out.push(DiscoveredService {
                    instance_name: instance_of(&fullname, service_type),
                    fullname,
                    service_type: service_type.to_string(),
                    host_name: info.get_hostname().to_string(),
                    port: info.get_port(),
                    addresses: info.get_addresses().iter().copied().collect(),
                    txt,
                });
            }
            ServiceEvent::ServiceFound(service_type, fullname) => {
                tracing::debug!("Found {} ({})", fullname, service_type);
            }
            _ => {}
        }
    }
    out
}

/// Keep only peers announcing `service_id`.
pub fn matching_service(found: Vec<DiscoveredService>, service_id: &str) -> Vec<DiscoveredService> {
    found
        .into_iter()
        .filter(|svc| svc.txt_value(TXT_SERVICE) == Some(service_id))
        .collect()
}

fn instance_of(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}
