// Client-side transports. The sync loop only needs "send one message" and
// "give me whatever arrived", so both UDP and TCP links sit behind the same
// small trait. Malformed inbound messages are surfaced as `Err` items so the
// caller can decide whether to drop them; a TCP link closes itself after the
// first one because the byte stream can no longer be trusted.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::endpoint::NetworkEndpoint;
use super::framing::{read_message, write_message};
use super::protocol::{Message, PacketError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transport closed")]
    Closed,
    #[error("malformed message: {0}")]
    Packet(#[from] PacketError),
}

pub type Inbound = Result<Message, PacketError>;

pub trait Transport {
    fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Returns everything received since the last call without blocking.
    fn poll(&mut self) -> Result<Vec<Inbound>, TransportError>;

    fn close(&mut self);
}

pub struct DatagramLink {
    endpoint: NetworkEndpoint,
    closed: bool,
}

impl DatagramLink {
    pub fn connect(server: SocketAddr) -> Result<Self, TransportError> {
        let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let mut endpoint = NetworkEndpoint::bind(bind_addr)?;
        endpoint.set_remote(server);
        log::info!("UDP link {} -> {}", endpoint.local_addr(), server);
        Ok(Self {
            endpoint,
            closed: false,
        })
    }
}

impl Transport for DatagramLink {
    fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.endpoint.send(message)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Inbound>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let packets = self.endpoint.receive_raw()?;
        Ok(packets.into_iter().map(|(decoded, _)| decoded).collect())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// TCP link: the calling thread writes, a background thread blocks on reads
/// and hands decoded messages over a channel.
pub struct StreamLink {
    writer: BufWriter<TcpStream>,
    control: TcpStream,
    inbox: Receiver<Inbound>,
    reader_thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl StreamLink {
    pub fn connect(server: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&server, timeout)?;
        stream.set_nodelay(true)?;

        let reader_stream = stream.try_clone()?;
        let control = stream.try_clone()?;
        let writer = BufWriter::new(stream);

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(BufReader::new(reader_stream), tx);
        });

        log::info!("TCP link connected to {}", server);

        Ok(Self {
            writer,
            control,
            inbox: rx,
            reader_thread: Some(reader_thread),
            closed: false,
        })
    }
}

impl Transport for StreamLink {
    fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        write_message(&mut self.writer, message)
    }

    fn poll(&mut self) -> Result<Vec<Inbound>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut messages = Vec::new();
        loop {
            match self.inbox.try_recv() {
                Ok(item) => messages.push(item),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Hand over what arrived before the reader stopped.
                    self.close();
                    if messages.is_empty() {
                        return Err(TransportError::Closed);
                    }
                    break;
                }
            }
        }
        Ok(messages)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<Inbound>) {
    loop {
        match read_message(&mut reader) {
            Ok(message) => {
                if tx.send(Ok(message)).is_err() {
                    break;
                }
            }
            Err(TransportError::Packet(e)) => {
                let _ = tx.send(Err(e));
                break;
            }
            Err(TransportError::Closed) => break,
            Err(TransportError::Io(e)) => {
                log::debug!("TCP reader stopped: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Instant;

    use super::*;
    use crate::entity::EntityId;

    fn poll_until<T: Transport>(link: &mut T) -> Result<Vec<Inbound>, TransportError> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            let items = link.poll()?;
            if !items.is_empty() {
                return Ok(items);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(Vec::new())
    }

    #[test]
    fn test_stream_link_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            let received = read_message(&mut reader).unwrap();
            write_message(&mut writer, &Message::PlayerListSnapshot { entries: vec![] })
                .unwrap();
            received
        });

        let mut link = StreamLink::connect(addr, Duration::from_secs(1)).unwrap();
        let intro = Message::Introduce {
            identifier: EntityId::new("p1").unwrap(),
        };
        link.send(&intro).unwrap();

        let items = poll_until(&mut link).unwrap();
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Ok(Message::PlayerListSnapshot { .. })
        ));
        assert_eq!(server.join().unwrap(), intro);
    }

    #[test]
    fn test_stream_link_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut link = StreamLink::connect(addr, Duration::from_secs(1)).unwrap();
        server.join().unwrap();

        let start = Instant::now();
        let mut result = link.poll();
        while matches!(result, Ok(ref items) if items.is_empty())
            && start.elapsed() < Duration::from_millis(500)
        {
            thread::sleep(Duration::from_millis(1));
            result = link.poll();
        }
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(
            link.send(&Message::PlayerListSnapshot { entries: vec![] }),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_datagram_link_closed() {
        let mut link = DatagramLink::connect("127.0.0.1:9".parse().unwrap()).unwrap();
        link.close();
        assert!(matches!(link.poll(), Err(TransportError::Closed)));
    }
}
