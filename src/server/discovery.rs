//! Local address discovery
//!
//! Finds the address other machines on the LAN should use to reach the
//! simulator. Used for the startup banner only.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

/// Public address used to pick the outbound interface. Nothing is sent to it.
pub const DEFAULT_PROBE_TARGET: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Best-effort lookup of the outbound-facing local IP address
pub async fn local_ip() -> Option<IpAddr> {
    probe_local_ip(DEFAULT_PROBE_TARGET).await
}

/// Ask the OS which local address it would route `target` through.
///
/// Connecting a UDP socket only selects a route, so this works offline as
/// long as a route exists. Any failure yields `None`.
pub async fn probe_local_ip(target: SocketAddr) -> Option<IpAddr> {
    let bind_addr: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let probe = async {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        Ok::<_, std::io::Error>(socket.local_addr()?.ip())
    };

    match probe.await {
        Ok(ip) if !ip.is_unspecified() => Some(ip),
        Ok(_) => None,
        Err(e) => {
            debug!("Local address probe via {} failed: {}", target, e);
            None
        }
    }
}

/// URL clients should connect to, falling back to `localhost`
pub fn endpoint_url(ip: Option<IpAddr>, port: u16, path: &str) -> String {
    match ip {
        Some(IpAddr::V6(ip)) => format!("ws://[{}]:{}{}", ip, port, path),
        Some(ip) => format!("ws://{}:{}{}", ip, port, path),
        None => format!("ws://localhost:{}{}", port, path),
    }
}
