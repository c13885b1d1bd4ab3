//! Reactive watches over mutable entities
//!
//! A watch turns an entity's mutation stream into a stream of immutable
//! state snapshots (`EntityCell`) published through a `tokio::sync::watch`
//! channel. Publishing is optionally debounced, the caller can filter
//! events before they count, and every watch returns a handle that owns
//! teardown: dropping or cancelling the handle detaches the native
//! observer and cancels any pending timer, exactly once. A consumer
//! switching to a different source cancels the old handle first (or lets
//! it drop), so no entity ever carries two registrations from one
//! consumer.

mod cell;
mod debounce;
mod store;
mod subscription;

pub use cell::{watch_object, EntityCell, MutationFilter, WatchHandle, WatchOptions, WatchSource};
pub use store::{watch_stored, StoreWatchHandle, StoreWatchOptions};
pub use subscription::MutationSubscription;
