use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Length of the relay header prepended to every forwarded datagram.
const RELAY_HEADER_LEN: usize = 6;

/// The real-time position relay: a UDP echo-to-others.
///
/// Racers exchange positions peer-to-peer through this socket; the server
/// never interprets the payload. Peers are learned from traffic, and every
/// datagram is forwarded to every other known peer with a 6-byte header
/// whose third u16 is 1.
pub async fn run_relay(addr: SocketAddr) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(addr).await?;
    info!(addr = %socket.local_addr()?, "position relay listening");

    let mut peers: HashSet<SocketAddr> = HashSet::new();
    let mut buf = [0u8; 1024];
    let mut out = [0u8; 1024 + RELAY_HEADER_LEN];

    loop {
        let (len, sender) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(err = %e, "relay receive failed");
                continue;
            }
        };

        out[0..2].copy_from_slice(&0u16.to_le_bytes());
        out[2..4].copy_from_slice(&0u16.to_le_bytes());
        out[4..6].copy_from_slice(&1u16.to_le_bytes());
        out[RELAY_HEADER_LEN..RELAY_HEADER_LEN + len].copy_from_slice(&buf[..len]);

        for peer in &peers {
            if *peer == sender {
                continue;
            }
            if let Err(e) = socket.send_to(&out[..RELAY_HEADER_LEN + len], peer).await {
                debug!(peer = %peer, err = %e, "relay forward failed");
            }
        }

        peers.insert(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn echoes_to_other_peers_only() {
        let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay_socket.local_addr().unwrap();
        drop(relay_socket);
        tokio::spawn(run_relay(relay_addr));
        // Give the relay a moment to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // First datagrams teach the relay both peers.
        a.send_to(b"hello-from-a", relay_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.send_to(b"hello-from-b", relay_addr).await.unwrap();

        // A hears B's datagram with the relay header prepended.
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[RELAY_HEADER_LEN..len], b"hello-from-b");
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 1);

        // B must not hear its own datagram.
        let echoed = tokio::time::timeout(Duration::from_millis(200), b.recv_from(&mut buf)).await;
        assert!(echoed.is_err());
    }
}
