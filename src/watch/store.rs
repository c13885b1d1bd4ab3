//! Store-backed watches
//!
//! `watch_stored` loads an object from the entity store by hash and, when
//! the load resolves to a watchable object, activates replication watching
//! and keeps publishing snapshots until teardown. Plain objects publish a
//! single cell; a hash the store has never seen publishes an empty cell.

use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};

use super::cell::EntityCell;
use super::subscription::MutationSubscription;
use crate::entity::{EntityStore, MutableEntity, MutationObserver, ObjectHash, StoredObject};

/// Options for `watch_stored`.
#[derive(Clone, Copy, Default)]
pub struct StoreWatchOptions {
    /// Attach the mutation observer before replication activation
    /// completes, so snapshots are published while operations replay.
    /// Off by default: one snapshot when loading finishes.
    pub publish_during_load: bool,
}

struct StoreWatchShared {
    state: Mutex<StoreWatchState>,
    cancel_notify: Notify,
}

struct StoreWatchState {
    cancelled: bool,
    subscription: Option<MutationSubscription<dyn MutableEntity>>,
    /// Set once replication activation has been requested; teardown then
    /// owes the entity a `stop_watching_for_changes`.
    replicating: Option<Arc<dyn MutableEntity>>,
}

/// Teardown handle for a store-backed watch. Idempotent; runs on drop.
pub struct StoreWatchHandle {
    shared: Arc<StoreWatchShared>,
}

impl StoreWatchHandle {
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if let Some(mut subscription) = state.subscription.take() {
            subscription.detach();
        }
        let replicating = state.replicating.take();
        drop(state);
        if let Some(entity) = replicating {
            entity.stop_watching_for_changes();
        }
        self.shared.cancel_notify.notify_waiters();
    }
}

impl Drop for StoreWatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn snapshot_observer(
    tx: Arc<watch::Sender<EntityCell<StoredObject>>>,
    entity: Arc<dyn MutableEntity>,
) -> MutationObserver {
    Box::new(move |_ev| {
        let cell = EntityCell::new(Some(StoredObject::Watchable(Arc::clone(&entity))), None);
        let _ = tx.send(cell);
    })
}

/// Load `hash` from the store and watch it for changes.
///
/// Load failures are logged and publish nothing; a missing object
/// publishes an empty cell. Activation failures keep the snapshots already
/// published (and the observer, when attached during load).
pub fn watch_stored(
    store: Arc<dyn EntityStore>,
    hash: ObjectHash,
    options: StoreWatchOptions,
) -> (watch::Receiver<EntityCell<StoredObject>>, StoreWatchHandle) {
    let (tx, rx) = watch::channel(EntityCell::new(None, None));
    let tx = Arc::new(tx);

    let shared = Arc::new(StoreWatchShared {
        state: Mutex::new(StoreWatchState {
            cancelled: false,
            subscription: None,
            replicating: None,
        }),
        cancel_notify: Notify::new(),
    });

    {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let loaded = tokio::select! {
                _ = shared.cancel_notify.notified() => return,
                loaded = store.load(&hash) => loaded,
            };

            let object = match loaded {
                Ok(object) => object,
                Err(e) => {
                    log::warn!("Failed to load object {}: {}", hash, e);
                    return;
                }
            };

            let entity = match object {
                None => {
                    let _ = tx.send(EntityCell::new(None, None));
                    return;
                }
                Some(StoredObject::Plain(object)) => {
                    let _ = tx.send(EntityCell::new(Some(StoredObject::Plain(object)), None));
                    return;
                }
                Some(StoredObject::Watchable(entity)) => entity,
            };

            {
                let mut state = shared.state.lock().unwrap();
                if state.cancelled {
                    return;
                }
                state.replicating = Some(Arc::clone(&entity));
                if options.publish_during_load {
                    let observer = snapshot_observer(Arc::clone(&tx), Arc::clone(&entity));
                    state.subscription =
                        Some(MutationSubscription::attach(Arc::clone(&entity), observer));
                }
            }
            let _ = tx.send(EntityCell::new(
                Some(StoredObject::Watchable(Arc::clone(&entity))),
                None,
            ));

            let activated = tokio::select! {
                _ = shared.cancel_notify.notified() => return,
                activated = entity.load_and_watch_for_changes() => activated,
            };

            match activated {
                Ok(()) => {
                    {
                        let mut state = shared.state.lock().unwrap();
                        if state.cancelled {
                            return;
                        }
                        if !options.publish_during_load {
                            let observer =
                                snapshot_observer(Arc::clone(&tx), Arc::clone(&entity));
                            state.subscription = Some(MutationSubscription::attach(
                                Arc::clone(&entity),
                                observer,
                            ));
                        }
                    }
                    let _ = tx.send(EntityCell::new(
                        Some(StoredObject::Watchable(Arc::clone(&entity))),
                        None,
                    ));
                }
                Err(e) => {
                    shared.state.lock().unwrap().replicating = None;
                    log::warn!("Replication activation failed for {}: {}", hash, e);
                }
            }
        });
    }

    (rx, StoreWatchHandle { shared })
}
