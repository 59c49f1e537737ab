//! The capability service: issuance and redemption over one store and one
//! dispatcher.
//!
//! The protocol steps live in `issuance.rs` and `redemption.rs`; this
//! module only holds the shared handles.

use crate::config::ServiceConfig;
use crate::executor::Dispatch;
use crate::store::KeyStore;
use std::time::Duration;

pub struct CapabilityService<D> {
    pub(crate) store: KeyStore,
    pub(crate) dispatcher: D,
    pub(crate) exec_timeout: Duration,
}

impl<D: Dispatch> CapabilityService<D> {
    pub fn new(store: KeyStore, dispatcher: D, config: &ServiceConfig) -> Self {
        Self {
            store,
            dispatcher,
            exec_timeout: config.exec_timeout(),
        }
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout
    }
}
