//! # Sync Environment
//!
//! Everything an operation needs besides its own inputs: the record
//! controller, the backend, and the configuration.

use std::sync::Arc;

use harmony_db::RecordController;

use crate::config::SyncConfig;
use crate::operation::{RetryPolicy, ServiceRetry};
use crate::service::Service;

/// Shared handles passed to every operation. Cheap to clone.
#[derive(Clone)]
pub struct SyncEnvironment {
    pub controller: Arc<RecordController>,
    pub service: ServiceRetry,
    pub config: Arc<SyncConfig>,
}

impl SyncEnvironment {
    pub fn new(
        controller: Arc<RecordController>,
        service: Arc<dyn Service>,
        config: Arc<SyncConfig>,
    ) -> Self {
        let policy = RetryPolicy::from(&config.sync);
        SyncEnvironment {
            controller,
            service: ServiceRetry::new(service, policy),
            config,
        }
    }

    /// Per-record operations a batch may run at once (at least one).
    pub fn max_concurrent_operations(&self) -> usize {
        self.config.sync.max_concurrent_operations.max(1)
    }
}
