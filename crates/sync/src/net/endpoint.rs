use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::protocol::{MAX_DATAGRAM_SIZE, Message, PacketError, decode, encode};
use super::stats::NetworkStats;

/// Non-blocking UDP socket speaking the drift protocol, one message per
/// datagram. Used by the relay (many peers) and by clients (one remote).
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    stats: NetworkStats,
    recv_buffer: Box<[u8]>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            stats: NetworkStats::default(),
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn send_to(&mut self, message: &Message, addr: SocketAddr) -> io::Result<usize> {
        let data = encode(message).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Serialization error: {}", e),
            )
        })?;

        match self.socket.send_to(&data, addr) {
            Ok(bytes) => {
                self.stats.record_sent(bytes);
                Ok(bytes)
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e)
            }
        }
    }

    pub fn send(&mut self, message: &Message) -> io::Result<usize> {
        let addr = self
            .remote_addr
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "No remote address set"))?;
        self.send_to(message, addr)
    }

    /// Drains every datagram that is ready without blocking. Malformed
    /// datagrams are returned as errors so the caller can choose a policy.
    pub fn receive_raw(&mut self) -> io::Result<Vec<(Result<Message, PacketError>, SocketAddr)>> {
        let mut packets = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if self.remote_addr.is_some_and(|remote| remote != addr) {
                        log::debug!("Ignoring datagram from unexpected peer {}", addr);
                        continue;
                    }

                    let decoded = decode(&self.recv_buffer[..size]);
                    match &decoded {
                        Ok(_) => self.stats.record_received(size),
                        Err(_) => self.stats.record_malformed(),
                    }
                    packets.push((decoded, addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port-unreachable surfaces here on some platforms.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(packets)
    }

    /// Like `receive_raw`, dropping malformed datagrams.
    pub fn receive(&mut self) -> io::Result<Vec<(Message, SocketAddr)>> {
        let packets = self
            .receive_raw()?
            .into_iter()
            .filter_map(|(decoded, addr)| match decoded {
                Ok(message) => Some((message, addr)),
                Err(e) => {
                    log::warn!("Dropping malformed datagram from {}: {}", addr, e);
                    None
                }
            })
            .collect();
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::entity::{EntityId, Position};

    fn wait_for(endpoint: &mut NetworkEndpoint) -> Vec<(Message, SocketAddr)> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            let received = endpoint.receive().unwrap();
            if !received.is_empty() {
                return received;
            }
            thread::sleep(Duration::from_millis(1));
        }
        Vec::new()
    }

    #[test]
    fn test_send_and_receive() {
        let mut a = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let mut b = NetworkEndpoint::bind("127.0.0.1:0").unwrap();

        let message = Message::update(EntityId::new("p1").unwrap(), 1, Position::new(3.0, 4.0));
        a.send_to(&message, b.local_addr()).unwrap();

        let received = wait_for(&mut b);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, message);
        assert_eq!(received[0].1, a.local_addr());
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[test]
    fn test_malformed_datagram_dropped() {
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();

        raw.send_to(b"not a drift packet", endpoint.local_addr())
            .unwrap();
        let ping = Message::Ping {
            identifier: EntityId::new("p1").unwrap(),
        };
        let bytes = encode(&ping).unwrap();
        raw.send_to(&bytes, endpoint.local_addr()).unwrap();

        let received = wait_for(&mut endpoint);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, ping);
        assert_eq!(endpoint.stats().packets_malformed, 1);
    }

    #[test]
    fn test_send_without_remote() {
        let mut endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let err = endpoint
            .send(&Message::PlayerListSnapshot { entries: vec![] })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_remote_filter() {
        let mut client = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let mut server = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let mut stranger = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        client.set_remote(server.local_addr());

        let msg = Message::Pong {
            identifier: EntityId::server(),
        };
        stranger.send_to(&msg, client.local_addr()).unwrap();
        server.send_to(&msg, client.local_addr()).unwrap();

        let received = wait_for(&mut client);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, server.local_addr());
    }
}
