use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxtRecord(pub Vec<(String, String)>);

impl TxtRecord {
    pub fn into_properties(self) -> HashMap<String, String> {
        self.0.into_iter().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    /// e.g. "_p2pconnect._tcp.local."
    pub service_type: String,
    /// e.g. "Kitchen Laptop"
    pub instance_name: String,
    /// e.g. "kitchen-laptop.local."
    pub host_name: String,
    pub ip_addr: String,
    pub port: u16,
    pub txt: Option<TxtRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub fullname: String,
    pub instance_name: String,
    pub service_type: String,
    pub host_name: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: Vec<(String, String)>,
}

impl DiscoveredService {
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Where to dial this peer, preferring IPv4.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addresses.first())
            .map(|ip| SocketAddr::new(*ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub family: &'static str,  //ipv4 or ipv6
    pub is_loopback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(addresses: Vec<IpAddr>) -> DiscoveredService {
        DiscoveredService {
            fullname: "desk._p2pconnect._tcp.local.".into(),
            instance_name: "desk".into(),
            service_type: "_p2pconnect._tcp.local.".into(),
            host_name: "desk.local.".into(),
            port: 9876,
            addresses,
            txt: vec![("svc".into(), "p2pconnect".into()), ("dev".into(), "Desk".into())],
        }
    }

    #[test]
    fn socket_addr_prefers_ipv4() {
        let svc = service(vec!["fe80::1".parse().unwrap(), "192.168.1.20".parse().unwrap()]);
        assert_eq!(svc.socket_addr(), Some("192.168.1.20:9876".parse().unwrap()));

        let v6_only = service(vec!["fe80::1".parse().unwrap()]);
        assert!(v6_only.socket_addr().unwrap().is_ipv6());

        assert_eq!(service(vec![]).socket_addr(), None);
    }

    #[test]
    fn txt_lookup_and_json_shape() {
        let svc = service(vec![]);
        assert_eq!(svc.txt_value("dev"), Some("Desk"));
        assert_eq!(svc.txt_value("missing"), None);

        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["port"], 9876);
        assert_eq!(json["txt"][0][0], "svc");
    }
}
