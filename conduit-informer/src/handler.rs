//! Event callbacks invoked by the watcher

/// Receives cache changes for one collection
///
/// Callbacks run synchronously on the watcher's dispatch loop, in store
/// revision order, after the cache has been updated. They must not block.
pub trait EventHandler<T>: Send + Sync {
    /// Object seen for the first time
    fn on_add(&self, obj: &T);

    /// Cached object replaced by a newer revision
    fn on_update(&self, old: &T, new: &T);

    /// Object removed from the store, or no longer matching the filter
    fn on_delete(&self, obj: &T);
}
