//! Single-entity sync status watch
//!
//! The one-entity counterpart of the aggregator: resolve a (possibly
//! pending) sync-capable entity, observe one peer group, and expose the
//! latest known `SyncState`.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::{watch, Notify};

use crate::entity::{ObserverId, PeerGroupId, SyncEntity, SyncObserver, SyncState};
use crate::watch::WatchSource;

struct SyncWatchShared<E: SyncEntity + ?Sized> {
    state: Mutex<SyncWatchState<E>>,
    cancel_notify: Notify,
}

struct SyncWatchState<E: SyncEntity + ?Sized> {
    cancelled: bool,
    attached: Option<(Arc<E>, ObserverId)>,
}

/// Teardown handle for a single sync status watch. Idempotent; runs on
/// drop. A watch whose source never resolved tears down to a no-op.
pub struct SyncWatchHandle<E: SyncEntity + ?Sized> {
    shared: Arc<SyncWatchShared<E>>,
}

impl<E: SyncEntity + ?Sized> SyncWatchHandle<E> {
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if let Some((entity, observer)) = state.attached.take() {
            entity.remove_sync_observer(observer);
        }
        drop(state);
        self.shared.cancel_notify.notify_waiters();
    }
}

impl<E: SyncEntity + ?Sized> Drop for SyncWatchHandle<E> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Watch one entity's sync status against one peer group.
///
/// The observer is attached as soon as the entity resolves; the initial
/// fetch result is published afterwards, so a racing status event is
/// overwritten by the fetch (last writer wins). Fetch errors are logged
/// and leave the last published value in place.
pub fn watch_sync_state<E>(
    source: WatchSource<E>,
    peer_group: impl Into<PeerGroupId>,
) -> (watch::Receiver<Option<SyncState>>, SyncWatchHandle<E>)
where
    E: SyncEntity + ?Sized + 'static,
{
    let peer_group = peer_group.into();
    let (tx, rx) = watch::channel(None);
    let tx = Arc::new(tx);

    let shared = Arc::new(SyncWatchShared {
        state: Mutex::new(SyncWatchState {
            cancelled: false,
            attached: None,
        }),
        cancel_notify: Notify::new(),
    });

    let future: BoxFuture<'static, Option<Arc<E>>> = match source {
        WatchSource::Ready(entity) => Box::pin(async move { Some(entity) }),
        WatchSource::Pending(future) => future,
    };

    {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let resolved = tokio::select! {
                _ = shared.cancel_notify.notified() => return,
                resolved = future => resolved,
            };
            let entity = match resolved {
                Some(entity) => entity,
                None => return,
            };

            {
                let mut state = shared.state.lock().unwrap();
                if state.cancelled {
                    return;
                }
                let observer: SyncObserver = {
                    let tx = Arc::clone(&tx);
                    Box::new(move |event| {
                        log::debug!(
                            "New sync state for {} against {}",
                            event.emitter,
                            event.peer_group
                        );
                        let _ = tx.send(Some(event.state.clone()));
                    })
                };
                let observer = entity.add_sync_observer(observer, &peer_group);
                state.attached = Some((Arc::clone(&entity), observer));
            }

            match entity.sync_state(&peer_group).await {
                Ok(initial) => {
                    let state = shared.state.lock().unwrap();
                    if !state.cancelled {
                        let _ = tx.send(initial);
                    }
                }
                Err(e) => {
                    log::warn!("Error retrieving initial sync state: {}", e);
                }
            }
        });
    }

    (rx, SyncWatchHandle { shared })
}
