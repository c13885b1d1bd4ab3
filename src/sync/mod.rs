//! Sync status aggregation
//!
//! Tracks, per (entity, peer-group) pair, the last known synchronization
//! status, and merges the statuses of many watched entities into one
//! table keyed by current hash. The input set can change between calls;
//! the aggregator diffs it against what it already tracks, so unchanged
//! entities keep their observer and departed entities lose observer and
//! table entry in the same pass.

mod single;

pub use single::{watch_sync_state, SyncWatchHandle};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::entity::{ObjectHash, ObserverId, PeerGroupId, SyncEntity, SyncObserver, SyncState};

/// Latest known sync status per watched entity, keyed by current hash.
pub type SyncStateTable = HashMap<ObjectHash, SyncState>;

struct TrackedPair {
    entity: Arc<dyn SyncEntity>,
    observer: ObserverId,
}

/// Aggregates sync status over a changing set of (entity, peer group)
/// pairs. The table is owned here; consumers receive immutable snapshots
/// through `table()`.
pub struct SyncStateAggregator {
    tracked: Arc<Mutex<HashMap<ObjectHash, TrackedPair>>>,
    table_tx: Arc<watch::Sender<SyncStateTable>>,
}

impl SyncStateAggregator {
    pub fn new() -> Self {
        let (table_tx, _) = watch::channel(SyncStateTable::new());
        Self {
            tracked: Arc::new(Mutex::new(HashMap::new())),
            table_tx: Arc::new(table_tx),
        }
    }

    /// Subscribe to table snapshots.
    pub fn table(&self) -> watch::Receiver<SyncStateTable> {
        self.table_tx.subscribe()
    }

    /// The current table snapshot.
    pub fn current(&self) -> SyncStateTable {
        self.table_tx.borrow().clone()
    }

    /// Re-evaluate the watched set.
    ///
    /// Newly seen hashes get a live sync observer immediately and an
    /// initial state fetch in the background; the fetch seeds the table
    /// when it resolves, overwriting a racing observer event (last
    /// writer wins). Hashes absent from `inputs` lose their observer,
    /// tracked entry, and table entry before this call returns. A failed
    /// initial fetch is logged and leaves only that pair unseeded.
    pub fn observe(&self, inputs: &[(Arc<dyn SyncEntity>, PeerGroupId)]) {
        let mut tracked = self.tracked.lock().unwrap();

        let incoming: HashSet<ObjectHash> =
            inputs.iter().map(|(entity, _)| entity.current_hash()).collect();

        let stale: Vec<ObjectHash> = tracked
            .keys()
            .filter(|hash| !incoming.contains(*hash))
            .cloned()
            .collect();
        for hash in &stale {
            if let Some(pair) = tracked.remove(hash) {
                pair.entity.remove_sync_observer(pair.observer);
            }
        }
        if !stale.is_empty() {
            self.table_tx.send_modify(|table| {
                for hash in &stale {
                    table.remove(hash);
                }
            });
        }

        for (entity, peer_group) in inputs {
            let hash = entity.current_hash();
            if tracked.contains_key(&hash) {
                continue;
            }

            let observer: SyncObserver = {
                let table_tx = Arc::clone(&self.table_tx);
                let hash = hash.clone();
                Box::new(move |event| {
                    let state = event.state.clone();
                    let hash = hash.clone();
                    table_tx.send_modify(|table| {
                        table.insert(hash, state);
                    });
                })
            };
            let observer = entity.add_sync_observer(observer, peer_group);
            tracked.insert(
                hash.clone(),
                TrackedPair {
                    entity: Arc::clone(entity),
                    observer,
                },
            );

            let entity = Arc::clone(entity);
            let peer_group = peer_group.clone();
            let tracked_map = Arc::clone(&self.tracked);
            let table_tx = Arc::clone(&self.table_tx);
            tokio::spawn(async move {
                match entity.sync_state(&peer_group).await {
                    Ok(Some(state)) => {
                        let tracked = tracked_map.lock().unwrap();
                        if tracked.contains_key(&hash) {
                            table_tx.send_modify(|table| {
                                table.insert(hash.clone(), state);
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("Error retrieving initial sync state for {}: {}", hash, e);
                    }
                }
            });
        }
    }

    /// Remove every remaining observer and clear the table.
    pub fn shutdown(&self) {
        let mut tracked = self.tracked.lock().unwrap();
        for (_, pair) in tracked.drain() {
            pair.entity.remove_sync_observer(pair.observer);
        }
        self.table_tx.send_replace(SyncStateTable::new());
    }
}

impl Default for SyncStateAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncStateAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::simulated::SimulatedEntity;
    use crate::entity::HashedEntity;
    use tokio::time::{sleep, Duration};

    fn pair(
        entity: &Arc<SimulatedEntity>,
        group: &str,
    ) -> (Arc<dyn SyncEntity>, PeerGroupId) {
        (entity.clone() as Arc<dyn SyncEntity>, group.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_keys_track_the_input_set() {
        let a = SimulatedEntity::new("a");
        let b = SimulatedEntity::new("b");
        a.set_sync_state("home", a.current_sync_state(true, 0));
        b.set_sync_state("home", b.current_sync_state(false, 2));

        let aggregator = SyncStateAggregator::new();
        aggregator.observe(&[pair(&a, "home"), pair(&b, "home")]);
        sleep(Duration::from_millis(1)).await;

        let table = aggregator.current();
        let mut keys: Vec<ObjectHash> = table.keys().cloned().collect();
        keys.sort();
        let mut expected = vec![a.current_hash(), b.current_hash()];
        expected.sort();
        assert_eq!(keys, expected);

        // Dropping b removes its observer and table entry in one pass.
        aggregator.observe(&[pair(&a, "home")]);
        assert_eq!(b.sync_observer_count(), 0);
        assert!(!aggregator.current().contains_key(&b.current_hash()));

        // The empty input empties everything.
        aggregator.observe(&[]);
        assert_eq!(a.sync_observer_count(), 0);
        assert!(aggregator.current().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_hashes_are_not_resubscribed() {
        let a = SimulatedEntity::new("a");
        let aggregator = SyncStateAggregator::new();

        aggregator.observe(&[pair(&a, "home")]);
        aggregator.observe(&[pair(&a, "home")]);
        assert_eq!(a.sync_observer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_events_update_the_table() {
        let a = SimulatedEntity::new("a");
        let aggregator = SyncStateAggregator::new();
        let mut table_rx = aggregator.table();

        aggregator.observe(&[pair(&a, "home")]);
        sleep(Duration::from_millis(1)).await;

        a.set_sync_state("home", a.current_sync_state(false, 5));
        table_rx.changed().await.unwrap();
        let state = table_rx.borrow_and_update()[&a.current_hash()].clone();
        assert_eq!(state.ops_to_fetch, 5);

        a.set_sync_state("home", a.current_sync_state(true, 0));
        table_rx.changed().await.unwrap();
        let state = table_rx.borrow_and_update()[&a.current_hash()].clone();
        assert!(state.all_peers_in_sync);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_fetch_seeds_the_table() {
        let a = SimulatedEntity::new("a");
        a.set_sync_state("home", a.current_sync_state(true, 0));

        let aggregator = SyncStateAggregator::new();
        aggregator.observe(&[pair(&a, "home")]);
        sleep(Duration::from_millis(1)).await;

        assert!(aggregator.current()[&a.current_hash()].all_peers_in_sync);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_skips_only_that_pair() {
        let a = SimulatedEntity::new("a");
        let b = SimulatedEntity::new("b");
        a.set_sync_fetch_failure(true);
        b.set_sync_state("home", b.current_sync_state(true, 0));

        let aggregator = SyncStateAggregator::new();
        aggregator.observe(&[pair(&a, "home"), pair(&b, "home")]);
        sleep(Duration::from_millis(1)).await;

        let table = aggregator.current();
        assert!(!table.contains_key(&a.current_hash()));
        assert!(table.contains_key(&b.current_hash()));

        // The failed pair still has its live observer and can recover.
        assert_eq!(a.sync_observer_count(), 1);
        a.set_sync_state("home", a.current_sync_state(false, 1));
        assert!(aggregator.current().contains_key(&a.current_hash()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fetch_for_a_dropped_hash_is_discarded() {
        let a = SimulatedEntity::new("a");
        a.set_sync_state("home", a.current_sync_state(true, 0));

        let aggregator = SyncStateAggregator::new();
        aggregator.observe(&[pair(&a, "home")]);
        // Drop the pair before the fetch task has run.
        aggregator.observe(&[]);
        sleep(Duration::from_millis(1)).await;

        assert!(aggregator.current().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_removes_all_observers() {
        let a = SimulatedEntity::new("a");
        let b = SimulatedEntity::new("b");
        let aggregator = SyncStateAggregator::new();
        aggregator.observe(&[pair(&a, "home"), pair(&b, "work")]);

        aggregator.shutdown();
        assert_eq!(a.sync_observer_count(), 0);
        assert_eq!(b.sync_observer_count(), 0);
        assert!(aggregator.current().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_removes_all_observers() {
        let a = SimulatedEntity::new("a");
        {
            let aggregator = SyncStateAggregator::new();
            aggregator.observe(&[pair(&a, "home")]);
            assert_eq!(a.sync_observer_count(), 1);
        }
        assert_eq!(a.sync_observer_count(), 0);
    }
}
