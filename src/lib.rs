//! Local-first synchronization for study-shelf books.
//!
//! Content lives in an origin-scoped key-value cache and is mirrored to a
//! cloud store per book. Other tabs on the same origin hear about changes
//! through the broadcast coordinator.

pub mod broadcast;
pub mod cloud;
pub mod engine;
pub mod identity;
pub mod keys;
pub mod storage;
pub mod subscription;
pub mod sync;

pub use engine::{EngineParts, EngineStatus, SyncEngine};
pub use identity::{IdentityProvider, SessionIdentity};
pub use storage::{LocalCache, OriginStorage};
pub use subscription::Subscription;
pub use sync::{EngineConfig, SyncError};
