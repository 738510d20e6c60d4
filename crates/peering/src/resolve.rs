use crate::PeeringError;
use std::net::SocketAddr;

/// Resolve `host:port` entries to socket addresses. Anything that does not
/// split into exactly a host and a port is rejected.
pub async fn resolve_list(hosts: &[String]) -> Result<Vec<SocketAddr>, PeeringError> {
    let mut out = Vec::with_capacity(hosts.len());
    for entry in hosts {
        let (host, port) = match entry.split(':').collect::<Vec<_>>().as_slice() {
            [host, port] if !host.is_empty() => (host.to_string(), *port),
            _ => return Err(PeeringError::BadPeerAddress(entry.clone())),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| PeeringError::BadPeerAddress(entry.clone()))?;

        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| PeeringError::Resolve {
                host: host.clone(),
                source,
            })?
            .collect::<Vec<_>>();
        // Prefer IPv4, as the packet endpoint is usually bound there.
        addrs.sort_by_key(|a| !a.is_ipv4());
        match addrs.into_iter().next() {
            Some(addr) => out.push(addr),
            None => {
                return Err(PeeringError::Resolve {
                    host,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
                })
            }
        }
    }
    Ok(out)
}
