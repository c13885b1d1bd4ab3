// Peerview - reactive views over peer-synchronized objects

pub mod discovery;
pub mod entity;
pub mod resources;
pub mod space;
pub mod sync;
pub mod watch;

pub use entity::{
    EntityError, EntityStore, HashedEntity, MutableEntity, MutationEvent, ObjectHash, ObserverId,
    PeerGroupId, StoredObject, SyncEntity, SyncEvent, SyncState,
};
pub use resources::{PeerEndpoint, Resources, ResourcesConfig};
pub use watch::{EntityCell, WatchHandle, WatchOptions, WatchSource};
