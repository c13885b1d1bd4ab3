//! Space activation
//!
//! A space is the shared context for one collaboration: it resolves to an
//! entry point object that peers load, replicate, and discover.
//! `activate_space` brings a space online for this process: resolve the
//! entry point, optionally start answering discovery broadcasts, persist
//! the entry point to the store, start sync, and publish the resolved
//! object. Teardown reverses whatever was started.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use crate::entity::{EntityError, MutableEntity};
use crate::resources::Resources;

/// The object a space resolves to once its replication context is ready.
#[async_trait]
pub trait SpaceEntryPoint: MutableEntity {
    /// Begin synchronizing with the space's peers.
    async fn start_sync(&self) -> Result<(), EntityError>;

    /// Stop synchronizing. Stopping a sync that never started is a no-op.
    async fn stop_sync(&self) -> Result<(), EntityError>;
}

/// A space definition: how to reach the entry point, and whether the
/// space is addressed by a broadcastable word code.
#[async_trait]
pub trait Space<E: SpaceEntryPoint>: Send + Sync {
    /// Resolve the entry point object for this space.
    async fn entry_point(&self) -> Result<Arc<E>, EntityError>;

    /// Begin answering discovery queries for this space's hash suffix.
    fn start_broadcast(&self) -> Result<(), EntityError>;

    /// Stop answering discovery queries. No-op when not broadcasting.
    fn stop_broadcast(&self);

    /// Whether this space was addressed by word code. Broadcast defaults
    /// to on exactly for word-coded spaces.
    fn word_coded(&self) -> bool;
}

/// Options for `activate_space`.
#[derive(Clone, Copy, Debug)]
pub struct SpaceOptions {
    /// Answer discovery broadcasts. `None` means "iff word-coded".
    pub broadcast: Option<bool>,
    /// Start synchronizing once the entry point resolves.
    pub sync: bool,
}

impl Default for SpaceOptions {
    fn default() -> Self {
        Self {
            broadcast: None,
            sync: true,
        }
    }
}

struct Activated<E> {
    entry: Arc<E>,
    broadcasting: bool,
    syncing: bool,
}

struct SpaceShared<S: ?Sized, E> {
    space: Arc<S>,
    state: Mutex<SpaceState<E>>,
    cancel_notify: Notify,
}

struct SpaceState<E> {
    cancelled: bool,
    activated: Option<Activated<E>>,
}

/// Teardown handle for an activated space. Idempotent; runs on drop.
/// Stops broadcast and sync only if activation got far enough to start
/// them.
pub struct SpaceHandle<S, E>
where
    S: Space<E> + ?Sized,
    E: SpaceEntryPoint + 'static,
{
    shared: Arc<SpaceShared<S, E>>,
}

impl<S, E> SpaceHandle<S, E>
where
    S: Space<E> + ?Sized,
    E: SpaceEntryPoint + 'static,
{
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        let activated = state.activated.take();
        drop(state);
        self.shared.cancel_notify.notify_waiters();

        if let Some(activated) = activated {
            if activated.broadcasting {
                self.shared.space.stop_broadcast();
            }
            if activated.syncing {
                let entry = activated.entry;
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = entry.stop_sync().await {
                                log::warn!("Failed to stop space sync: {}", e);
                            }
                        });
                    }
                    Err(_) => {
                        log::warn!("No runtime left to stop space sync on");
                    }
                }
            }
        }
    }
}

impl<S, E> Drop for SpaceHandle<S, E>
where
    S: Space<E> + ?Sized,
    E: SpaceEntryPoint + 'static,
{
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Bring a space online and publish its entry point once ready.
///
/// Ordering on success: broadcast (when requested), save to the store,
/// start sync, publish. Save and sync failures are logged and do not
/// abort activation. Cancellation before the entry point resolves
/// publishes nothing and tears down to a no-op.
pub fn activate_space<S, E>(
    space: Arc<S>,
    resources: Arc<Resources>,
    options: SpaceOptions,
) -> (watch::Receiver<Option<Arc<E>>>, SpaceHandle<S, E>)
where
    S: Space<E> + ?Sized + 'static,
    E: SpaceEntryPoint + 'static,
{
    let (tx, rx) = watch::channel(None);

    let shared = Arc::new(SpaceShared {
        space: Arc::clone(&space),
        state: Mutex::new(SpaceState {
            cancelled: false,
            activated: None,
        }),
        cancel_notify: Notify::new(),
    });

    {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let entry = tokio::select! {
                _ = shared.cancel_notify.notified() => return,
                entry = space.entry_point() => entry,
            };
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Failed to resolve space entry point: {}", e);
                    return;
                }
            };

            let do_broadcast = options.broadcast.unwrap_or_else(|| space.word_coded());

            {
                let mut state = shared.state.lock().unwrap();
                if state.cancelled {
                    return;
                }
                state.activated = Some(Activated {
                    entry: Arc::clone(&entry),
                    broadcasting: do_broadcast,
                    syncing: options.sync,
                });
            }

            if do_broadcast {
                if let Err(e) = space.start_broadcast() {
                    log::warn!("Failed to start space broadcast: {}", e);
                }
            }

            if let Err(e) = resources.store.save(entry.as_ref()).await {
                log::warn!("Failed to save space entry point: {}", e);
            }

            if options.sync {
                if let Err(e) = entry.start_sync().await {
                    log::warn!("Failed to start space sync: {}", e);
                }
            }

            let state = shared.state.lock().unwrap();
            if !state.cancelled {
                let _ = tx.send(Some(entry));
            }
        });
    }

    (rx, SpaceHandle { shared })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::simulated::SimulatedMesh;
    use crate::entity::simulated::{SimulatedEntity, SimulatedStore};
    use crate::entity::{HashedEntity, MutationObserver, ObjectHash, ObserverId};
    use crate::resources::ResourcesConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{sleep, Duration};

    struct SimEntryPoint {
        inner: Arc<SimulatedEntity>,
        syncing: AtomicBool,
    }

    impl SimEntryPoint {
        fn new(seed: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: SimulatedEntity::new(seed),
                syncing: AtomicBool::new(false),
            })
        }

        fn is_syncing(&self) -> bool {
            self.syncing.load(Ordering::SeqCst)
        }
    }

    impl HashedEntity for SimEntryPoint {
        fn current_hash(&self) -> ObjectHash {
            self.inner.current_hash()
        }
    }

    #[async_trait]
    impl MutableEntity for SimEntryPoint {
        fn add_mutation_observer(&self, observer: MutationObserver) -> ObserverId {
            self.inner.add_mutation_observer(observer)
        }

        fn remove_mutation_observer(&self, id: ObserverId) {
            self.inner.remove_mutation_observer(id)
        }
    }

    #[async_trait]
    impl SpaceEntryPoint for SimEntryPoint {
        async fn start_sync(&self) -> Result<(), EntityError> {
            self.syncing.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_sync(&self) -> Result<(), EntityError> {
            self.syncing.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SimSpace {
        entry: Arc<SimEntryPoint>,
        broadcasting: AtomicBool,
        word_coded: bool,
        resolve_delay_ms: u64,
    }

    impl SimSpace {
        fn new(word_coded: bool, resolve_delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                entry: SimEntryPoint::new("space-entry"),
                broadcasting: AtomicBool::new(false),
                word_coded,
                resolve_delay_ms,
            })
        }

        fn is_broadcasting(&self) -> bool {
            self.broadcasting.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Space<SimEntryPoint> for SimSpace {
        async fn entry_point(&self) -> Result<Arc<SimEntryPoint>, EntityError> {
            if self.resolve_delay_ms > 0 {
                sleep(Duration::from_millis(self.resolve_delay_ms)).await;
            }
            Ok(Arc::clone(&self.entry))
        }

        fn start_broadcast(&self) -> Result<(), EntityError> {
            self.broadcasting.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop_broadcast(&self) {
            self.broadcasting.store(false, Ordering::SeqCst);
        }

        fn word_coded(&self) -> bool {
            self.word_coded
        }
    }

    fn test_resources() -> (Arc<Resources>, Arc<SimulatedStore>) {
        let store = SimulatedStore::new();
        let resources = Arc::new(Resources::new(
            Arc::clone(&store) as Arc<dyn crate::entity::EntityStore>,
            SimulatedMesh::new(),
            ResourcesConfig::default(),
        ));
        (resources, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_word_coded_space_broadcasts_saves_and_syncs() {
        let space = SimSpace::new(true, 0);
        let (resources, store) = test_resources();
        let (mut rx, _handle) =
            activate_space(Arc::clone(&space), resources, SpaceOptions::default());

        rx.changed().await.unwrap();
        let entry = rx.borrow().clone().unwrap();
        assert!(space.is_broadcasting());
        assert!(entry.is_syncing());
        assert_eq!(store.saved_hashes(), vec![entry.current_hash()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_defaults_off_without_word_code() {
        let space = SimSpace::new(false, 0);
        let (resources, _store) = test_resources();
        let (mut rx, _handle) =
            activate_space(Arc::clone(&space), resources, SpaceOptions::default());

        rx.changed().await.unwrap();
        assert!(!space.is_broadcasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_resolution_activates_nothing() {
        let space = SimSpace::new(true, 500);
        let (resources, store) = test_resources();
        let (rx, handle) =
            activate_space(Arc::clone(&space), resources, SpaceOptions::default());

        handle.cancel();
        sleep(Duration::from_millis(600)).await;

        assert!(rx.borrow().is_none());
        assert!(!space.is_broadcasting());
        assert!(!space.entry.is_syncing());
        assert!(store.saved_hashes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_broadcast_and_sync() {
        let space = SimSpace::new(true, 0);
        let (resources, _store) = test_resources();
        let (mut rx, handle) =
            activate_space(Arc::clone(&space), resources, SpaceOptions::default());

        rx.changed().await.unwrap();
        handle.cancel();
        handle.cancel();
        sleep(Duration::from_millis(1)).await;

        assert!(!space.is_broadcasting());
        assert!(!space.entry.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_disabled_leaves_entry_unsynced() {
        let space = SimSpace::new(false, 0);
        let (resources, _store) = test_resources();
        let (mut rx, _handle) = activate_space(
            Arc::clone(&space),
            resources,
            SpaceOptions {
                broadcast: Some(false),
                sync: false,
            },
        );

        rx.changed().await.unwrap();
        assert!(!space.entry.is_syncing());
    }
}
