mod endpoint;
mod framing;
mod protocol;
mod stats;
mod transport;

pub use endpoint::NetworkEndpoint;
pub use framing::{FrameDecoder, read_message, write_message};
pub use protocol::{
    DEFAULT_PORT, HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE, Message, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, PacketError, PlayerEntry, decode, encode, parse_header,
    sequence_greater_than,
};
pub use stats::NetworkStats;
pub use transport::{DatagramLink, Inbound, StreamLink, Transport, TransportError};
