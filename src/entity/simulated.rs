//! In-process simulated replicated objects
//!
//! Provides a simulated entity and an in-memory store implementing the
//! capability contracts entirely in-process. Used for testing the view
//! layer without a real replication engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    EntityError, EntityStore, HashedEntity, MutableEntity, MutationEvent, MutationObserver,
    ObjectHash, ObserverId, PeerGroupId, StoredObject, SyncEntity, SyncEvent, SyncObserver,
    SyncState,
};

/// A simulated replicated object.
///
/// Mutations are applied locally with `apply_mutation`; each one advances
/// the content hash and notifies registered mutation observers, the way the
/// replication engine would after accepting an op. Sync status is scripted
/// with `set_sync_state`.
pub struct SimulatedEntity {
    hash: Mutex<ObjectHash>,
    mutation_observers: Mutex<HashMap<ObserverId, MutationObserver>>,
    sync_observers: Mutex<HashMap<ObserverId, (PeerGroupId, SyncObserver)>>,
    sync_states: Mutex<HashMap<PeerGroupId, SyncState>>,
    watching: AtomicBool,
    fail_sync_fetch: AtomicBool,
    fail_replication: AtomicBool,
    activation_delay_ms: AtomicU64,
}

impl SimulatedEntity {
    pub fn new(seed: &str) -> Arc<Self> {
        Arc::new(Self {
            hash: Mutex::new(ObjectHash::of_bytes(seed.as_bytes())),
            mutation_observers: Mutex::new(HashMap::new()),
            sync_observers: Mutex::new(HashMap::new()),
            sync_states: Mutex::new(HashMap::new()),
            watching: AtomicBool::new(false),
            fail_sync_fetch: AtomicBool::new(false),
            fail_replication: AtomicBool::new(false),
            activation_delay_ms: AtomicU64::new(0),
        })
    }

    /// Apply a mutation: advance the content hash and notify observers.
    pub fn apply_mutation(&self, action: &str) {
        self.apply_mutation_with(action, None);
    }

    /// Apply a mutation carrying an engine-defined payload.
    pub fn apply_mutation_with(&self, action: &str, data: Option<serde_json::Value>) {
        let new_hash = {
            let mut hash = self.hash.lock().unwrap();
            let chained = format!("{}:{}", hash.as_str(), action);
            *hash = ObjectHash::of_bytes(chained.as_bytes());
            hash.clone()
        };

        let event = MutationEvent {
            emitter: new_hash,
            action: action.to_string(),
            data,
        };

        let observers = self.mutation_observers.lock().unwrap();
        for observer in observers.values() {
            observer(&event);
        }
    }

    /// Script a sync status change for one peer group and notify observers
    /// registered against that group.
    pub fn set_sync_state(&self, peer_group: &str, state: SyncState) {
        self.sync_states
            .lock()
            .unwrap()
            .insert(peer_group.to_string(), state.clone());

        let event = SyncEvent {
            emitter: self.current_hash(),
            peer_group: peer_group.to_string(),
            state,
            observed_at: Utc::now(),
        };

        let observers = self.sync_observers.lock().unwrap();
        for (group, observer) in observers.values() {
            if group == peer_group {
                observer(&event);
            }
        }
    }

    /// Build a sync state snapshot rooted at this entity's current hash.
    pub fn current_sync_state(&self, all_peers_in_sync: bool, ops_to_fetch: u64) -> SyncState {
        SyncState {
            local_state: self.current_hash(),
            remote_states: HashMap::new(),
            all_peers_in_sync,
            ops_to_fetch,
        }
    }

    /// Make the next `sync_state` fetches fail (until cleared).
    pub fn set_sync_fetch_failure(&self, fail: bool) {
        self.fail_sync_fetch.store(fail, Ordering::SeqCst);
    }

    /// Make `load_and_watch_for_changes` fail (until cleared).
    pub fn set_replication_failure(&self, fail: bool) {
        self.fail_replication.store(fail, Ordering::SeqCst);
    }

    /// Make `load_and_watch_for_changes` take this long, simulating
    /// operation replay. Uses tokio time, so paused clocks apply.
    pub fn set_activation_delay(&self, ms: u64) {
        self.activation_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn mutation_observer_count(&self) -> usize {
        self.mutation_observers.lock().unwrap().len()
    }

    pub fn sync_observer_count(&self) -> usize {
        self.sync_observers.lock().unwrap().len()
    }

    /// Whether replication watching is currently active.
    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }
}

impl HashedEntity for SimulatedEntity {
    fn current_hash(&self) -> ObjectHash {
        self.hash.lock().unwrap().clone()
    }
}

#[async_trait]
impl MutableEntity for SimulatedEntity {
    fn add_mutation_observer(&self, observer: MutationObserver) -> ObserverId {
        let id = ObserverId::new();
        self.mutation_observers.lock().unwrap().insert(id, observer);
        id
    }

    fn remove_mutation_observer(&self, id: ObserverId) {
        self.mutation_observers.lock().unwrap().remove(&id);
    }

    async fn load_and_watch_for_changes(&self) -> Result<(), EntityError> {
        if self.fail_replication.load(Ordering::SeqCst) {
            return Err(EntityError::ReplicationError(
                "simulated activation failure".to_string(),
            ));
        }
        let delay = self.activation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
        }
        self.watching.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_watching_for_changes(&self) {
        self.watching.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncEntity for SimulatedEntity {
    async fn sync_state(&self, peer_group: &str) -> Result<Option<SyncState>, EntityError> {
        if self.fail_sync_fetch.load(Ordering::SeqCst) {
            return Err(EntityError::SyncError(
                "simulated fetch failure".to_string(),
            ));
        }
        Ok(self.sync_states.lock().unwrap().get(peer_group).cloned())
    }

    fn add_sync_observer(&self, observer: SyncObserver, peer_group: &str) -> ObserverId {
        let id = ObserverId::new();
        self.sync_observers
            .lock()
            .unwrap()
            .insert(id, (peer_group.to_string(), observer));
        id
    }

    fn remove_sync_observer(&self, id: ObserverId) {
        self.sync_observers.lock().unwrap().remove(&id);
    }
}

/// A plain (non-watchable) simulated object.
pub struct SimulatedPlainObject {
    hash: ObjectHash,
}

impl SimulatedPlainObject {
    pub fn new(seed: &str) -> Arc<Self> {
        Arc::new(Self {
            hash: ObjectHash::of_bytes(seed.as_bytes()),
        })
    }
}

impl HashedEntity for SimulatedPlainObject {
    fn current_hash(&self) -> ObjectHash {
        self.hash.clone()
    }
}

/// An in-memory entity store.
pub struct SimulatedStore {
    objects: Mutex<HashMap<ObjectHash, StoredObject>>,
    saved: Mutex<Vec<ObjectHash>>,
    fail_loads: AtomicBool,
}

impl SimulatedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            saved: Mutex::new(Vec::new()),
            fail_loads: AtomicBool::new(false),
        })
    }

    /// Seed the store with an object, keyed by its current hash.
    pub fn insert(&self, object: StoredObject) -> ObjectHash {
        let hash = object.current_hash();
        self.objects.lock().unwrap().insert(hash.clone(), object);
        hash
    }

    /// Hashes passed to `save`, in order.
    pub fn saved_hashes(&self) -> Vec<ObjectHash> {
        self.saved.lock().unwrap().clone()
    }

    pub fn set_load_failure(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }
}

impl Default for SimulatedStore {
    fn default() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            saved: Mutex::new(Vec::new()),
            fail_loads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EntityStore for SimulatedStore {
    async fn load(&self, hash: &ObjectHash) -> Result<Option<StoredObject>, EntityError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(EntityError::StoreError("simulated load failure".to_string()));
        }
        Ok(self.objects.lock().unwrap().get(hash).cloned())
    }

    async fn save(&self, object: &dyn MutableEntity) -> Result<(), EntityError> {
        self.saved.lock().unwrap().push(object.current_hash());
        Ok(())
    }
}
