//! Mutation observer attachment
//!
//! Pairs an entity with one registered mutation observer. Attach and
//! detach are symmetric: whatever happens in between, detaching leaves the
//! entity's observer list as it was found.

use std::sync::Arc;

use crate::entity::{MutableEntity, MutationObserver, ObserverId};

/// An attached mutation observer and the entity it watches.
///
/// Detach is idempotent, and runs on drop if never called explicitly. A
/// watch whose source never resolved simply never constructs one of these,
/// which is what makes its teardown total.
pub struct MutationSubscription<E: MutableEntity + ?Sized> {
    entity: Arc<E>,
    observer: Option<ObserverId>,
}

impl<E: MutableEntity + ?Sized> MutationSubscription<E> {
    /// Register `observer` with the entity's native change stream.
    pub fn attach(entity: Arc<E>, observer: MutationObserver) -> Self {
        let id = entity.add_mutation_observer(observer);
        Self {
            entity,
            observer: Some(id),
        }
    }

    pub fn entity(&self) -> &Arc<E> {
        &self.entity
    }

    pub fn is_attached(&self) -> bool {
        self.observer.is_some()
    }

    /// Remove the native registration. Safe to call more than once.
    pub fn detach(&mut self) {
        if let Some(id) = self.observer.take() {
            self.entity.remove_mutation_observer(id);
        }
    }
}

impl<E: MutableEntity + ?Sized> Drop for MutationSubscription<E> {
    fn drop(&mut self) {
        self.detach();
    }
}
