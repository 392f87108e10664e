//! Key-namespace views over an [`EventHub`]
//!
//! Views own no listeners. Every operation goes straight to the hub after
//! the key has been fixed or mapped, so a listener registered through a
//! view is visible on the hub and vice versa.

use crate::hub::EventHub;
use crate::listener::{ListenerCtx, Subscription};
use crate::options::{FireMeta, ListenOptions};
use std::fmt;
use std::sync::Arc;

/// Key mapping used by [`MappedHub`]
pub type KeyMap = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A view of one hub key
pub struct SingleChannel<E> {
    hub: EventHub<E>,
    key: String,
    original: String,
}

impl<E> Clone for SingleChannel<E> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            key: self.key.clone(),
            original: self.original.clone(),
        }
    }
}

impl<E> fmt::Debug for SingleChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleChannel")
            .field("key", &self.key)
            .field("original", &self.original)
            .finish()
    }
}

impl<E: Clone + Send + Sync + 'static> SingleChannel<E> {
    pub(crate) fn new(hub: EventHub<E>, key: String, original: String) -> Self {
        Self { hub, key, original }
    }

    /// Key on the underlying hub
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn on(
        &self,
        handler: impl Fn(&E, &ListenerCtx<'_, E>) + Send + Sync + 'static,
        options: ListenOptions<E>,
    ) -> Subscription<E> {
        self.hub.on(&self.key, handler, options)
    }

    pub fn once(
        &self,
        handler: impl Fn(&E, &ListenerCtx<'_, E>) + Send + Sync + 'static,
    ) -> Subscription<E> {
        self.hub.once(&self.key, handler)
    }

    pub fn fire(&self, event: E, meta: impl Into<FireMeta>) -> usize {
        self.hub
            .fire_mapped(&self.key, &self.original, event, meta.into())
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count(&self.key)
    }

    /// Dispose every listener on this key
    pub fn clear(&self) -> usize {
        self.hub.clear_key(&self.key)
    }
}

/// A view that rewrites keys before they reach the hub
pub struct MappedHub<E> {
    hub: EventHub<E>,
    map: KeyMap,
}

impl<E> Clone for MappedHub<E> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            map: Arc::clone(&self.map),
        }
    }
}

impl<E> fmt::Debug for MappedHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedHub").finish_non_exhaustive()
    }
}

impl<E: Clone + Send + Sync + 'static> MappedHub<E> {
    pub(crate) fn new(hub: EventHub<E>, map: KeyMap) -> Self {
        Self { hub, map }
    }

    /// A view that prepends `prefix` to every key
    pub fn prefixed(hub: &EventHub<E>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        hub.mapped(move |key| format!("{prefix}{key}"))
    }

    /// The hub key `key` maps to
    pub fn mapped_key(&self, key: &str) -> String {
        (self.map)(key)
    }

    pub fn on(
        &self,
        key: &str,
        handler: impl Fn(&E, &ListenerCtx<'_, E>) + Send + Sync + 'static,
        options: ListenOptions<E>,
    ) -> Subscription<E> {
        self.hub.on(&self.mapped_key(key), handler, options)
    }

    pub fn once(
        &self,
        key: &str,
        handler: impl Fn(&E, &ListenerCtx<'_, E>) + Send + Sync + 'static,
    ) -> Subscription<E> {
        self.hub.once(&self.mapped_key(key), handler)
    }

    /// Fire on the mapped key; listeners see `key` as their original key
    pub fn fire(&self, key: &str, event: E, meta: impl Into<FireMeta>) -> usize {
        self.hub
            .fire_mapped(&self.mapped_key(key), key, event, meta.into())
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.hub.listener_count(&self.mapped_key(key))
    }

    pub fn clear_key(&self, key: &str) -> usize {
        self.hub.clear_key(&self.mapped_key(key))
    }

    /// A single-key view through this mapping
    pub fn single(&self, key: &str) -> SingleChannel<E> {
        SingleChannel::new(self.hub.clone(), self.mapped_key(key), key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propflow_timing::ManualScheduler;
    use std::sync::Mutex;

    #[test]
    fn test_single_channel_delegates_to_hub() {
        let scheduler = ManualScheduler::new();
        let hub: EventHub<u8> = EventHub::new(scheduler.shared());
        let channel = hub.single("volume");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.on(
            move |v, _ctx| sink.lock().unwrap().push(*v),
            ListenOptions::default(),
        );

        assert_eq!(hub.listener_count("volume"), 1);
        hub.fire("volume", 3, FireMeta::default());
        channel.fire(4, FireMeta::default());
        assert_eq!(*seen.lock().unwrap(), vec![3, 4]);

        assert_eq!(channel.clear(), 1);
        assert_eq!(hub.listener_count("volume"), 0);
    }

    #[test]
    fn test_prefixed_view_maps_keys_and_reports_original() {
        let scheduler = ManualScheduler::new();
        let hub: EventHub<u8> = EventHub::new(scheduler.shared());
        let view = MappedHub::prefixed(&hub, "player.");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        view.on(
            "score",
            move |v, ctx| {
                sink.lock()
                    .unwrap()
                    .push((ctx.key().to_string(), ctx.original_key().to_string(), *v))
            },
            ListenOptions::default(),
        );

        assert_eq!(hub.keys(), vec!["player.score".to_string()]);
        view.fire("score", 1, FireMeta::default());
        view.single("score").fire(2, FireMeta::default());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("player.score".to_string(), "score".to_string(), 1),
                ("player.score".to_string(), "score".to_string(), 2),
            ]
        );
    }
}
