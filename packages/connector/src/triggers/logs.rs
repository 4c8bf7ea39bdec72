use std::{sync::Arc, time::Duration};

use alloy_rpc_types_eth::{Filter, Log};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::OnceCell;
use utils::evm_client::ChainRpc;

use super::{filter::LogQueryKey, TriggerError};

#[derive(Clone, Debug)]
pub struct LogFetchSettings {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
    /// Results older than this many blocks behind the newest query are dropped
    pub retain_blocks: u64,
}

impl Default for LogFetchSettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            timeout: Duration::from_secs(10),
            retain_blocks: 16,
        }
    }
}

/// Shares `eth_getLogs` results between triggers with the same filter
///
/// Concurrent requests for the same key wait on the one in flight.
/// Failures are not cached, the next request tries again.
#[derive(Default)]
pub struct LogCache {
    settings: LogFetchSettings,
    entries: DashMap<LogQueryKey, Arc<OnceCell<Arc<Vec<Log>>>>>,
}

impl LogCache {
    pub fn new(settings: LogFetchSettings) -> Self {
        Self {
            settings,
            entries: DashMap::new(),
        }
    }

    pub async fn fetch(
        &self,
        rpc: &dyn ChainRpc,
        key: LogQueryKey,
        filter: &Filter,
    ) -> Result<Arc<Vec<Log>>, TriggerError> {
        // the dashmap guard must be gone before awaiting
        let cell = self.entries.entry(key.clone()).or_default().clone();

        let logs = cell
            .get_or_try_init(|| async {
                fetch_with_retry(rpc, filter, &self.settings)
                    .await
                    .map(Arc::new)
            })
            .await?
            .clone();

        self.prune(&key);

        Ok(logs)
    }

    fn prune(&self, newest: &LogQueryKey) {
        let horizon = newest
            .block_number
            .saturating_sub(self.settings.retain_blocks);
        self.entries
            .retain(|key, _| key.chain != newest.chain || key.block_number >= horizon);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Full jitter: a random delay between zero and the capped exponential backoff
fn jittered_delay(settings: &LogFetchSettings, attempt: u32) -> Duration {
    let cap = settings
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(settings.max_delay);
    let millis = cap.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

async fn fetch_with_retry(
    rpc: &dyn ChainRpc,
    filter: &Filter,
    settings: &LogFetchSettings,
) -> Result<Vec<Log>, TriggerError> {
    let mut last_error = String::new();

    for attempt in 0..settings.attempts {
        if attempt > 0 {
            tokio::time::sleep(jittered_delay(settings, attempt - 1)).await;
        }

        match tokio::time::timeout(settings.timeout, rpc.logs(filter)).await {
            Ok(Ok(logs)) => return Ok(logs),
            Ok(Err(err)) => last_error = err.to_string(),
            Err(_) => last_error = "timed out".to_string(),
        }

        tracing::warn!(
            "EVM: log fetch attempt {}/{} failed: {last_error}",
            attempt + 1,
            settings.attempts
        );
    }

    Err(TriggerError::Logs(last_error))
}

#[cfg(test)]
mod test {
    use alloy_primitives::{Address, B256};
    use connector_types::ChainKey;
    use utils::test_utils::mock_chain::MockChain;

    use super::*;

    fn key(block_number: u64) -> LogQueryKey {
        LogQueryKey {
            chain: ChainKey::eip155(5),
            block_number,
            block_hash: B256::with_last_byte(block_number as u8),
            address: Some(Address::with_last_byte(1)),
            topics: Vec::new(),
        }
    }

    #[test]
    fn jitter_stays_under_cap() {
        let settings = LogFetchSettings::default();
        for attempt in 0..10 {
            assert!(jittered_delay(&settings, attempt) <= settings.max_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shared_and_retried() {
        let chain = MockChain::new();
        chain.with_state(|state| state.log_failures = 2);
        let cache = LogCache::default();
        let filter = Filter::new().from_block(7).to_block(7);

        let (a, b) = tokio::join!(
            cache.fetch(&chain, key(7), &filter),
            cache.fetch(&chain, key(7), &filter)
        );
        assert!(a.is_ok() && b.is_ok());
        // two failures and one success, the second caller waited on the first
        assert_eq!(chain.with_state(|state| state.log_queries), 3);

        cache.fetch(&chain, key(7), &filter).await.unwrap();
        assert_eq!(chain.with_state(|state| state.log_queries), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface() {
        let chain = MockChain::new();
        chain.with_state(|state| state.log_failures = 10);
        let cache = LogCache::default();
        let filter = Filter::new().from_block(7).to_block(7);

        let err = cache.fetch(&chain, key(7), &filter).await.unwrap_err();
        assert!(matches!(err, TriggerError::Logs(_)));
        assert_eq!(chain.with_state(|state| state.log_queries), 5);
    }

    #[tokio::test]
    async fn old_blocks_are_pruned() {
        let chain = MockChain::new();
        let cache = LogCache::default();

        for block in [1, 2, 30] {
            let filter = Filter::new().from_block(block).to_block(block);
            cache.fetch(&chain, key(block), &filter).await.unwrap();
        }
        assert_eq!(cache.len(), 1);
    }
}
