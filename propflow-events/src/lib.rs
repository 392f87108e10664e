//! Keyed publish/subscribe for propflow
//!
//! An [`EventHub`] maps string keys to listeners. Each listener owns a
//! [`HitTask`](propflow_timing::HitTask) that applies the listener's own
//! delay and coalescing policy, so a debounced listener never slows down
//! the others registered on the same key.
//!
//! Listeners may dispose themselves, dispose other listeners, or register
//! new ones while handling an event; see [`hub`] for the guarantees.
//!
//! ```rust
//! use propflow_events::{EventHub, FireMeta, ListenOptions};
//! use propflow_timing::ManualScheduler;
//! use std::sync::{Arc, Mutex};
//!
//! let scheduler = ManualScheduler::new();
//! let hub: EventHub<String> = EventHub::new(scheduler.shared());
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! hub.on("greeting", move |text, ctx| {
//!     sink.lock().unwrap().push(format!("{}={text}", ctx.key()));
//! }, ListenOptions::default());
//!
//! hub.fire("greeting", "hello".to_string(), FireMeta::default());
//! assert_eq!(*seen.lock().unwrap(), vec!["greeting=hello"]);
//! ```

pub mod hub;
pub mod listener;
pub mod options;
pub mod views;

pub use hub::{Disposer, EventHub};
pub use listener::{EventHandler, ListenerCtx, ListenerId, Subscription};
pub use options::{FireMeta, InvalidPredicate, Invalidation, ListenOptions};
pub use views::{KeyMap, MappedHub, SingleChannel};
