//! Single-port liveness probes used by service verification.

use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
    Open,
    /// Refused, reset, or filtered beyond the timeout.
    Closed(String),
}

pub async fn tcp_probe(host: &str, port: u16, limit: Duration) -> ProbeOutcome {
    let addr = render_addr(host, port);
    match timeout(limit, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            ProbeOutcome::Open
        }
        Ok(Err(err)) => ProbeOutcome::Closed(format!("connect: {err}")),
        Err(_) => ProbeOutcome::Closed(format!("timeout after {}ms", limit.as_millis())),
    }
}

/// Best-effort UDP probe: a response means open; an ICMP unreachable surfaces
/// as a recv error; silence beyond the timeout counts as closed/filtered.
pub async fn udp_probe(host: &str, port: u16, limit: Duration) -> ProbeOutcome {
    let addr = render_addr(host, port);
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(err) => return ProbeOutcome::Closed(format!("bind: {err}")),
    };
    if let Err(err) = socket.connect(&addr).await {
        return ProbeOutcome::Closed(format!("connect: {err}"));
    }
    if let Err(err) = socket.send(&[0u8; 1]).await {
        return ProbeOutcome::Closed(format!("send: {err}"));
    }
    let mut buf = [0u8; 64];
    match timeout(limit, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => ProbeOutcome::Open,
        Ok(Err(err)) => ProbeOutcome::Closed(format!("recv: {err}")),
        Err(_) => ProbeOutcome::Closed(format!("timeout after {}ms", limit.as_millis())),
    }
}

fn render_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_sees_listening_socket_as_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let outcome = tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await;
        assert_eq!(outcome, ProbeOutcome::Open);
    }

    #[tokio::test]
    async fn tcp_probe_reports_refused_as_closed() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let outcome = tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(matches!(outcome, ProbeOutcome::Closed(_)));
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(render_addr("2001:db8::1", 443), "[2001:db8::1]:443");
        assert_eq!(render_addr("example.com", 80), "example.com:80");
    }
}
