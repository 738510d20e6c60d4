//! Advertise-address selection.

use crate::TransportError;
use std::net::{IpAddr, Ipv4Addr};

/// RFC 1918 private ranges plus the RFC 6598 shared address space.
pub fn is_private(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_private() || (o[0] == 100 && (o[1] & 0xc0) == 64)
}

/// First private IPv4 address among the host's interfaces.
pub fn private_ip() -> Result<IpAddr, TransportError> {
    let ifaces = get_if_addrs::get_if_addrs().map_err(TransportError::Interfaces)?;
    ifaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(v4) if is_private(&v4) => Some(IpAddr::V4(v4)),
            _ => None,
        })
        .ok_or(TransportError::NoPrivateIp)
}
