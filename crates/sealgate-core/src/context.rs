//! Process-scoped context: one store handle, one service, built at startup
//! and closed at shutdown.

use crate::config::ServiceConfig;
use crate::executor::Dispatch;
use crate::service::CapabilityService;
use crate::store::{KeyStore, StoreError};
use crate::sweeper::Sweeper;
use std::sync::Arc;

pub struct ServiceContext<D> {
    config: ServiceConfig,
    service: Arc<CapabilityService<D>>,
}

impl<D: Dispatch> ServiceContext<D> {
    /// Open the store `config` points at (Redis when `store_host` is set,
    /// otherwise the file at `store_path`), check it answers, and wire the
    /// service around it.
    pub fn init(config: ServiceConfig, dispatcher: D) -> Result<Self, StoreError> {
        let store = KeyStore::from_config(&config)?;
        Self::with_store(config, store, dispatcher)
    }

    /// Same as [`init`](Self::init) over an already-open store.
    pub fn with_store(
        config: ServiceConfig,
        store: KeyStore,
        dispatcher: D,
    ) -> Result<Self, StoreError> {
        store.ping()?;
        tracing::info!(
            event = "store.ready",
            backend = store.kv().backend(),
            location = %config.store_location(),
            prefix = %store.prefix(),
        );

        let service = CapabilityService::new(store, dispatcher, &config);
        Ok(Self {
            config,
            service: Arc::new(service),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn service(&self) -> Arc<CapabilityService<D>> {
        Arc::clone(&self.service)
    }

    pub fn store(&self) -> &KeyStore {
        self.service.store()
    }

    /// A sweeper over this context's store and schedule.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.store().clone(), &self.config)
    }

    /// Close the store. Requests still in flight fail with `Closed`.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.store().close()?;
        tracing::info!(event = "store.closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutorDispatcher;

    #[test]
    fn test_init_opens_file_store_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::default()
            .with_store_path(dir.path().join("keys.db"))
            .with_store_prefix("test:");

        let ctx = ServiceContext::init(config, ExecutorDispatcher).unwrap();

        assert_eq!(ctx.store().prefix(), "test:");
        assert_eq!(ctx.store().kv().backend(), "sqlite");
        let key = ctx.store().mint(b"k", 1, 0).unwrap();
        let (records, _) = ctx.store().kv().scan(0, "test:*", 10).unwrap();
        assert_eq!(records, vec![format!("test:{}", key.key_id)]);
    }

    #[test]
    fn test_init_fails_when_remote_store_unreachable() {
        let config = ServiceConfig::default().with_store_host("127.0.0.1", 1);

        let result = ServiceContext::init(config, ExecutorDispatcher);
        assert!(matches!(result, Err(StoreError::Unavailable)));
    }

    #[test]
    fn test_shutdown_closes_store() {
        let ctx = ServiceContext::with_store(
            ServiceConfig::default(),
            KeyStore::memory().unwrap(),
            ExecutorDispatcher,
        )
        .unwrap();

        ctx.shutdown().unwrap();

        assert!(matches!(ctx.store().ping(), Err(StoreError::Closed)));
        // idempotent
        ctx.shutdown().unwrap();
    }

    #[test]
    fn test_with_store_refuses_closed_store() {
        let store = KeyStore::memory().unwrap();
        store.close().unwrap();

        let result = ServiceContext::with_store(ServiceConfig::default(), store, ExecutorDispatcher);
        assert!(matches!(result, Err(StoreError::Closed)));
    }
}
