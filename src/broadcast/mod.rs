mod coordinator;
mod event;
mod transport;

pub use coordinator::{BroadcastCoordinator, BroadcastStatus, SyncListener};
pub use event::{SyncEvent, SyncEventType};
pub use transport::{
    BroadcastError, ChannelRegistry, RelayHub, SameOriginChannel, StorageSignal, Transport,
    TransportKind, TransportProvider,
};
