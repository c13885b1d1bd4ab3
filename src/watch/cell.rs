//! Object state cells
//!
//! `watch_object` materializes a (possibly still resolving) entity into a
//! stream of `EntityCell` snapshots: an initial cell as soon as the entity
//! resolves, then one cell per accepted mutation event, routed through the
//! debounce scheduler. The returned handle owns teardown and runtime
//! debounce adjustment.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use std::future::Future;
use tokio::sync::{watch, Notify};

use super::debounce::DebounceScheduler;
use super::subscription::MutationSubscription;
use crate::entity::{MutableEntity, MutationEvent, MutationObserver};

/// Immutable snapshot of a watched entity's state.
#[derive(Clone, Debug)]
pub struct EntityCell<T: Clone> {
    value: Option<T>,
    debounce_freq: Option<u64>,
}

impl<T: Clone> EntityCell<T> {
    pub(crate) fn new(value: Option<T>, debounce_freq: Option<u64>) -> Self {
        Self {
            value,
            debounce_freq,
        }
    }

    /// The latest materialized value, if the source has resolved to one.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The debounce window this cell was published under.
    pub fn debounce_freq(&self) -> Option<u64> {
        self.debounce_freq
    }
}

/// Decides whether a mutation event should count towards publishing.
pub type MutationFilter = Arc<dyn Fn(&MutationEvent) -> bool + Send + Sync>;

/// Options for `watch_object`.
#[derive(Clone, Default)]
pub struct WatchOptions {
    /// Events rejected by the filter publish nothing and start no timer.
    pub filter: Option<MutationFilter>,
    /// Debounce window in milliseconds; `None` publishes immediately.
    pub debounce_freq: Option<u64>,
}

/// The entity to watch: already resolved, or still being obtained.
pub enum WatchSource<E: ?Sized> {
    Ready(Arc<E>),
    Pending(BoxFuture<'static, Option<Arc<E>>>),
}

impl<E: ?Sized> WatchSource<E> {
    pub fn ready(entity: Arc<E>) -> Self {
        WatchSource::Ready(entity)
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Option<Arc<E>>> + Send + 'static,
    {
        WatchSource::Pending(Box::pin(future))
    }
}

struct WatchShared<E: MutableEntity + ?Sized> {
    scheduler: Arc<DebounceScheduler>,
    state: Mutex<WatchState<E>>,
    cancel_notify: Notify,
}

struct WatchState<E: MutableEntity + ?Sized> {
    cancelled: bool,
    subscription: Option<MutationSubscription<E>>,
}

/// Owner-held teardown and tuning handle for one watch.
///
/// Cancellation is idempotent and also runs on drop. It detaches the
/// native observer (if one was ever attached) and discards any pending
/// debounce timer; a watch whose source never resolved tears down to a
/// no-op.
pub struct WatchHandle<E: MutableEntity + ?Sized> {
    shared: Arc<WatchShared<E>>,
}

impl<E: MutableEntity + ?Sized> WatchHandle<E> {
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if let Some(mut subscription) = state.subscription.take() {
            subscription.detach();
        }
        drop(state);
        self.shared.scheduler.cancel();
        self.shared.cancel_notify.notify_waiters();
    }

    /// Adjust the debounce window at runtime. A pending timer is replaced
    /// by a zero-delay re-publish of the current value.
    pub fn set_debounce_freq(&self, freq: Option<u64>) {
        self.shared.scheduler.set_frequency(freq);
    }

    pub fn debounce_freq(&self) -> Option<u64> {
        self.shared.scheduler.frequency()
    }
}

impl<E: MutableEntity + ?Sized> Drop for WatchHandle<E> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Begin watching an entity for mutations.
///
/// An initial cell is published as soon as the entity resolves (seeded
/// immediately for a `Ready` source); each accepted mutation event then
/// republishes through the debounce scheduler. A source that resolves to
/// no value publishes an empty cell; a source that never resolves leaves
/// the initial empty cell in place and makes teardown a no-op.
pub fn watch_object<E>(
    source: WatchSource<E>,
    options: WatchOptions,
) -> (watch::Receiver<EntityCell<Arc<E>>>, WatchHandle<E>)
where
    E: MutableEntity + ?Sized + 'static,
{
    let freq = Arc::new(Mutex::new(options.debounce_freq));
    let latest: Arc<Mutex<Option<Arc<E>>>> = Arc::new(Mutex::new(None));

    let initial = match &source {
        WatchSource::Ready(entity) => {
            *latest.lock().unwrap() = Some(Arc::clone(entity));
            Some(Arc::clone(entity))
        }
        WatchSource::Pending(_) => None,
    };
    let (tx, rx) = watch::channel(EntityCell::new(initial, options.debounce_freq));
    let tx = Arc::new(tx);

    let publish: Arc<dyn Fn() + Send + Sync> = {
        let tx = Arc::clone(&tx);
        let latest = Arc::clone(&latest);
        let freq = Arc::clone(&freq);
        Arc::new(move || {
            let value = latest.lock().unwrap().clone();
            let cell = EntityCell::new(value, *freq.lock().unwrap());
            let _ = tx.send(cell);
        })
    };

    let scheduler = DebounceScheduler::new(freq, Arc::clone(&publish));
    let shared = Arc::new(WatchShared {
        scheduler: Arc::clone(&scheduler),
        state: Mutex::new(WatchState {
            cancelled: false,
            subscription: None,
        }),
        cancel_notify: Notify::new(),
    });

    let observer: MutationObserver = {
        let scheduler = Arc::clone(&scheduler);
        let filter = options.filter.clone();
        Box::new(move |event: &MutationEvent| {
            if let Some(filter) = &filter {
                if !(*filter.as_ref())(event) {
                    return;
                }
            }
            scheduler.trigger();
        })
    };

    match source {
        WatchSource::Ready(entity) => {
            let mut state = shared.state.lock().unwrap();
            state.subscription = Some(MutationSubscription::attach(entity, observer));
        }
        WatchSource::Pending(future) => {
            let shared = Arc::clone(&shared);
            let latest = Arc::clone(&latest);
            tokio::spawn(async move {
                let resolved = tokio::select! {
                    _ = shared.cancel_notify.notified() => return,
                    resolved = future => resolved,
                };

                // Attach under the same lock cancellation uses, so a
                // cancel racing the resolution can never leak an observer.
                let mut state = shared.state.lock().unwrap();
                if state.cancelled {
                    return;
                }
                match resolved {
                    Some(entity) => {
                        *latest.lock().unwrap() = Some(Arc::clone(&entity));
                        state.subscription =
                            Some(MutationSubscription::attach(entity, observer));
                        drop(state);
                        (*publish)();
                    }
                    None => {
                        drop(state);
                        (*publish)();
                    }
                }
            });
        }
    }

    (rx, WatchHandle { shared })
}
