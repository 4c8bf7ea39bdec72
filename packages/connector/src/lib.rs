pub mod abi;
pub mod args;
pub mod blocks; // ordered, gap-filled block streams per chain
pub mod config;
pub mod connection;
pub mod pool; // shared connections, one per chain
pub mod submission; // where calls become mined transactions
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod triggers; // event and transaction watchers

use std::sync::Arc;

use config::Config;
use pool::ConnectionPool;
use submission::{SubmissionEngine, VaultSigner};
use triggers::{LogCache, TriggerFactory};

/// Everything a process needs to watch chains and submit calls,
/// built once from config and shared
pub struct Connector {
    pub pool: ConnectionPool,
    pub triggers: TriggerFactory,
    /// `None` without a vault signer, the connector is then read-only
    pub submission: Option<Arc<SubmissionEngine>>,
}

impl Connector {
    pub fn new(config: &Config) -> Self {
        let pool = ConnectionPool::from_config(config);

        let triggers = TriggerFactory::new(
            pool.clone(),
            Arc::new(LogCache::default()),
            config.confirmation_lag,
        );

        let submission = match &config.vault_signer_url {
            Some(url) => Some(Arc::new(SubmissionEngine::new(
                pool.clone(),
                Arc::new(VaultSigner::new(url.clone())),
                config.submission_settings(),
            ))),
            None => {
                tracing::warn!("No vault signer configured, submitting calls is disabled");
                None
            }
        };

        Self {
            pool,
            triggers,
            submission,
        }
    }
}
