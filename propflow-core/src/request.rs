//! Named request handlers
//!
//! A fire-and-forget command table per slot plus one global table. Requests
//! never touch slot values unless a handler chooses to.

use crate::store::StoreInner;
use crate::PropStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Handler invoked with the owning store and the request
pub type RequestHandler = Arc<dyn Fn(&PropStore, &Request) + Send + Sync>;

/// Which table a handler lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestScope {
    Global,
    Prop(String),
}

impl From<&str> for RequestScope {
    fn from(key: &str) -> Self {
        RequestScope::Prop(key.to_string())
    }
}

/// One request as handed to its handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub kind: String,
    /// Key the request was sent to, `None` for global requests
    pub key: Option<String>,
    pub payload: Value,
}

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub id: u64,
    pub handler: RequestHandler,
}

/// Handle to one registered request handler
#[derive(Clone)]
pub struct RequestRegistration {
    pub(crate) store: Weak<StoreInner>,
    pub(crate) scope: RequestScope,
    pub(crate) kind: String,
    pub(crate) id: u64,
    pub(crate) disposed: Arc<AtomicBool>,
}

impl fmt::Debug for RequestRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRegistration")
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl RequestRegistration {
    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Unregister the handler unless it has since been replaced
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            PropStore { inner }.unregister_request_handler(&self.scope, &self.kind, self.id);
        }
    }
}
