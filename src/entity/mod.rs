//! Capability contracts for replicated objects
//!
//! This module defines the traits and core types through which the view
//! layer talks to externally-owned replicated objects: content hashes,
//! mutation and sync events, observer registration, and the object store.
//! Implementations live in the replication engine; this crate only consumes
//! them (and provides simulated doubles for tests).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod simulated;

/// Error types for entity and store operations
#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Object not found: {0}")]
    NotFound(ObjectHash),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Replication error: {0}")]
    ReplicationError(String),
}

/// Named set of remote participants an object synchronizes against.
pub type PeerGroupId = String;

/// Number of trailing hash bits broadcast for discovery lookups.
pub const DEFAULT_SUFFIX_BITS: u32 = 36;

/// Content hash identifying the current state of a replicated object.
///
/// The hash changes every time a mutation is accepted; the view layer
/// treats it as the object's identity at subscription time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash(String);

impl ObjectHash {
    /// Wrap an already-computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hash arbitrary bytes. Used by the simulated entities; real objects
    /// arrive with their hash already assigned by the replication engine.
    pub fn of_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing `bits` of the hash as a hex suffix, as broadcast by
    /// peers answering discovery queries.
    pub fn hex_suffix(&self, bits: u32) -> String {
        let chars = (bits as usize + 3) / 4;
        if self.0.len() <= chars {
            self.0.clone()
        } else {
            self.0[self.0.len() - chars..].to_string()
        }
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration token returned when attaching an observer.
///
/// Removal is keyed by token, so callback identity never matters and a
/// remove after the entity already dropped the observer is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

/// Notification that an object's state changed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Hash of the object that emitted the event.
    pub emitter: ObjectHash,
    /// What kind of mutation was applied (engine-defined).
    pub action: String,
    /// Optional engine-defined payload describing the change.
    pub data: Option<serde_json::Value>,
}

/// Synchronization status of one object against one peer group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Hash of the locally materialized state.
    pub local_state: ObjectHash,
    /// Last known state hash per remote peer.
    pub remote_states: HashMap<String, ObjectHash>,
    /// Whether every peer in the group has converged on the local state.
    pub all_peers_in_sync: bool,
    /// Operations announced by peers but not yet fetched.
    pub ops_to_fetch: u64,
}

/// A sync status change notification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncEvent {
    pub emitter: ObjectHash,
    pub peer_group: PeerGroupId,
    pub state: SyncState,
    /// When the replication engine observed the status change.
    pub observed_at: DateTime<Utc>,
}

/// Callback invoked once per accepted mutation event.
pub type MutationObserver = Box<dyn Fn(&MutationEvent) + Send + Sync>;

/// Callback invoked on each sync status change.
pub type SyncObserver = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Anything addressable by content hash.
pub trait HashedEntity: Send + Sync {
    fn current_hash(&self) -> ObjectHash;
}

/// A replicated object that emits mutation events.
#[async_trait]
pub trait MutableEntity: HashedEntity {
    /// Register a mutation observer. The returned token removes it.
    fn add_mutation_observer(&self, observer: MutationObserver) -> ObserverId;

    /// Remove a previously registered observer. Unknown tokens are ignored.
    fn remove_mutation_observer(&self, id: ObserverId);

    /// Activate replication for objects that require it. Objects that
    /// replicate unconditionally keep the default no-op.
    async fn load_and_watch_for_changes(&self) -> Result<(), EntityError> {
        Ok(())
    }

    /// Deactivate replication started by `load_and_watch_for_changes`.
    fn stop_watching_for_changes(&self) {}
}

/// A mutable entity that reports synchronization progress per peer group.
#[async_trait]
pub trait SyncEntity: MutableEntity {
    /// Fetch the current sync state against one peer group, if known yet.
    async fn sync_state(&self, peer_group: &str) -> Result<Option<SyncState>, EntityError>;

    /// Register an observer for status changes against one peer group.
    fn add_sync_observer(&self, observer: SyncObserver, peer_group: &str) -> ObserverId;

    /// Remove a sync observer. Unknown tokens are ignored.
    fn remove_sync_observer(&self, id: ObserverId);
}

/// A store-loaded object, tagged once at load time by what it supports.
#[derive(Clone)]
pub enum StoredObject {
    /// Emits mutation events and can be watched live.
    Watchable(Arc<dyn MutableEntity>),
    /// Immutable or non-replicating; has no change stream.
    Plain(Arc<dyn HashedEntity>),
}

impl StoredObject {
    pub fn current_hash(&self) -> ObjectHash {
        match self {
            StoredObject::Watchable(entity) => entity.current_hash(),
            StoredObject::Plain(entity) => entity.current_hash(),
        }
    }

    pub fn as_watchable(&self) -> Option<&Arc<dyn MutableEntity>> {
        match self {
            StoredObject::Watchable(entity) => Some(entity),
            StoredObject::Plain(_) => None,
        }
    }
}

impl fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredObject::Watchable(entity) => {
                write!(f, "StoredObject::Watchable({})", entity.current_hash())
            }
            StoredObject::Plain(entity) => {
                write!(f, "StoredObject::Plain({})", entity.current_hash())
            }
        }
    }
}

/// The distributed object store, keyed by content hash.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Load an object. `Ok(None)` means the store has never seen the hash.
    async fn load(&self, hash: &ObjectHash) -> Result<Option<StoredObject>, EntityError>;

    /// Persist an object so peers can load it by hash.
    async fn save(&self, object: &dyn MutableEntity) -> Result<(), EntityError>;
}
