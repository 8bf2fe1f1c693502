pub mod entity;
pub mod interpolation;
pub mod net;
pub mod registry;
pub mod relay;
pub mod sync;

pub use entity::{EntityId, InvalidIdentifier, Position, SERVER_IDENTIFIER};
pub use interpolation::{InterpolatedEntity, RemoteEntities, Sample};
pub use net::{
    DEFAULT_PORT, DatagramLink, FrameDecoder, Message, NetworkEndpoint, NetworkStats,
    PacketError, PlayerEntry, StreamLink, Transport, TransportError, sequence_greater_than,
};
pub use registry::{RegistryError, Session, SessionHandle, SessionRegistry};
pub use relay::{LeaveReason, LivenessPolicy, Outbound, RelayConfig, RelayEngine, RelayEvent};
pub use sync::{DisconnectReason, EntityView, SyncClient, SyncConfig, SyncError, SyncState};
