use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use alloy_rpc_types_eth::{Block, Log};
use async_trait::async_trait;
use connector_types::{ChainKey, EventTriggerConfig, Notification};
use serde_json::{Map, Value};
use utils::evm_client::ChainRpc;

use super::{
    chain_id_string, filter::EventFilter, logs::LogCache, pending::PendingLogWindow, send,
    BlockHandler, NotificationSink, TriggerError,
};

/// Entries handled between two yields to the scheduler
const YIELD_EVERY: usize = 50;

/// Emits a notification per log matching an event trigger's declarations and filters
pub struct EventProcessor {
    chains: Vec<ChainKey>,
    filter: EventFilter,
    logs: Arc<LogCache>,
    window_depth: u64,
    windows: Mutex<HashMap<ChainKey, PendingLogWindow>>,
}

impl EventProcessor {
    pub fn new(
        config: &EventTriggerConfig,
        logs: Arc<LogCache>,
        confirmation_lag: u64,
    ) -> Result<Self, TriggerError> {
        if config.chains.is_empty() {
            return Err(TriggerError::InvalidParams("chain is required".to_string()));
        }

        Ok(Self {
            chains: config.chains.clone(),
            filter: EventFilter::new(config)?,
            logs,
            window_depth: confirmation_lag.max(1),
            windows: Mutex::new(HashMap::new()),
        })
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    fn with_window<T>(&self, chain: &ChainKey, f: impl FnOnce(&mut PendingLogWindow) -> T) -> T {
        f(self
            .windows
            .lock()
            .unwrap()
            .entry(chain.clone())
            .or_insert_with(|| PendingLogWindow::new(self.window_depth)))
    }
}

fn event_payload(chain: &ChainKey, log: &Log, params: Vec<(String, Value)>) -> Map<String, Value> {
    let mut payload = Map::new();

    payload.insert(
        "_rawEvent".to_string(),
        serde_json::to_value(log).unwrap_or(Value::Null),
    );
    payload.insert(
        "__transactionHash".to_string(),
        log.transaction_hash
            .map(|hash| Value::String(hash.to_string()))
            .unwrap_or(Value::Null),
    );
    payload.insert(
        "__chainId".to_string(),
        Value::String(chain_id_string(chain)),
    );
    payload.insert(
        "_grinderyContractAddress".to_string(),
        Value::String(log.address().to_checksum(None)),
    );
    payload.insert("_grinderyChain".to_string(), Value::String(chain.to_string()));

    payload.extend(params);
    payload
}

#[async_trait]
impl BlockHandler for EventProcessor {
    fn chains(&self) -> &[ChainKey] {
        &self.chains
    }

    async fn handle_block(
        &self,
        chain: &ChainKey,
        block: &Block,
        rpc: &Arc<dyn ChainRpc>,
        sink: &NotificationSink,
    ) -> Result<(), TriggerError> {
        let number = block.header.number;

        if self.filter.matches_bloom(&block.header.logs_bloom) {
            let key = self.filter.query_key(chain, number, block.header.hash);
            match self
                .logs
                .fetch(rpc.as_ref(), key, &self.filter.rpc_filter(number))
                .await
            {
                Ok(logs) => self.with_window(chain, |window| window.ingest(logs.iter().cloned())),
                // the block's events are lost, the trigger keeps watching
                Err(err) => tracing::error!("EVM: no logs for {chain} block {number}: {err}"),
            }
        }

        // every block moves the window, matching or not
        let logs = self.with_window(chain, |window| window.release(number));

        for (index, log) in logs.iter().enumerate() {
            if index > 0 && index % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }

            let Some(decoded) = self.filter.decode(log) else {
                continue;
            };

            tracing::debug!(
                "EVM: {} on {chain} in {:?}",
                decoded.event_name,
                log.transaction_hash
            );

            send(
                sink,
                Notification {
                    chain: chain.clone(),
                    payload: event_payload(chain, log, decoded.params),
                },
            )?;
        }

        Ok(())
    }
}
