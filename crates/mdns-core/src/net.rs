use std::io::Error;
use std::net::IpAddr;
use crate::model::InterfaceIp;

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            let family = if ip.is_ipv4() { "ipv4" } else { "ipv6" };
            let is_loopback = ip.is_loopback();

            InterfaceIp {
                name: ifa.name,
                ip,
                family,
                is_loopback,
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Address to announce: the first address of `interface` when given,
/// otherwise the first non-loopback IPv4 address.
pub fn choose_announce_ip(ips: &[InterfaceIp], interface: Option<&str>) -> Option<IpAddr> {
    match interface {
        Some(name) => ips
            .iter()
            .filter(|item| item.name == name)
            .min_by_key(|item| item.family != "ipv4")
            .map(|item| item.ip),
        None => ips
            .iter()
            .find(|item| !item.is_loopback && item.family == "ipv4")
            .map(|item| item.ip),
    }
}
