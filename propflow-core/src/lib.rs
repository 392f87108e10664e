//! Keyed reactive state slots
//!
//! A [`PropStore`] holds named slots of JSON values. Every write goes
//! through a change protocol (see [`protocol`]) that announces the proposal
//! on `changing`, lets registered [`ChangeFlow`]s observe or veto it,
//! formats and validates the value, and finally commits it or reports the
//! failure on `failed`. A later write to the same slot cancels an earlier
//! one still in flight.
//!
//! Besides writes, a store offers cached reads with expiry ([`read`]),
//! aggregate writes ([`batch`]), named request handlers ([`request`]) and
//! notify/broadcast side channels.
//!
//! ```rust
//! use propflow_core::{ChangeAction, ChangeMessage, PropStore};
//! use propflow_timing::ManualScheduler;
//! use serde_json::json;
//!
//! let store = PropStore::new(ManualScheduler::new().shared());
//! store.set_validator(|_, value| value.as_i64().is_some_and(|n| n >= 0));
//!
//! let record = store.set("count", json!(3), "initial");
//! assert_eq!(record.action, ChangeAction::Add);
//!
//! let record = store.set("count", json!(-1), ChangeMessage::default());
//! assert!(!record.success);
//! assert_eq!(store.get("count"), Some(json!(3)));
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod flow;
pub mod message;
pub mod prop_ref;
pub mod protocol;
pub mod read;
pub mod record;
pub mod request;
mod slot;
pub mod store;

pub use batch::{BatchAction, BatchInput};
pub use config::{ConfigError, StoreConfig};
pub use error::{ChangeError, StoreError, StoreResult};
pub use flow::{ChangeFlow, FlowInput, FlowOutcome, FlowRegistration};
pub use message::{CacheInfo, CacheOptions, ChangeMessage, EvictHandler, Expiry};
pub use prop_ref::PropRef;
pub use protocol::CustomChange;
pub use read::{ExpiryCheck, InspectFn, ReadOptions};
pub use record::{ChangeAction, ChangeHint, ChangeProposal, ChangeRecord, ChangeResolution};
pub use request::{Request, RequestHandler, RequestRegistration, RequestScope};
pub use slot::{CacheDetails, SlotDetails};
pub use store::{Formatter, PropStore, StoreEvents, Validator, BATCH_KEY, GLOBAL_KEY};
