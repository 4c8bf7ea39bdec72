use std::{sync::Arc, time::Duration};

use alloy_consensus::Transaction as _;
use alloy_primitives::{Address, U256};
use alloy_rpc_types_eth::{Block, Transaction};
use async_trait::async_trait;
use connector_types::{ChainKey, Notification, TransactionTriggerConfig};
use serde_json::{Map, Value};
use utils::evm_client::ChainRpc;

use super::{send, BlockHandler, NotificationSink, TriggerError};

const RECEIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Emits a notification per transaction sent from and/or to the configured addresses
pub struct TransactionProcessor {
    chains: Vec<ChainKey>,
    from: Option<Address>,
    to: Option<Address>,
}

impl TransactionProcessor {
    pub fn new(config: &TransactionTriggerConfig) -> Result<Self, TriggerError> {
        if config.chains.is_empty() {
            return Err(TriggerError::InvalidParams("chain is required".to_string()));
        }
        if config.from.is_none() && config.to.is_none() {
            return Err(TriggerError::InvalidParams(
                "from or to is required".to_string(),
            ));
        }

        Ok(Self {
            chains: config.chains.clone(),
            from: config.from,
            to: config.to,
        })
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        if let Some(from) = self.from {
            if tx.inner.signer() != from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if tx.to() != Some(to) {
                return false;
            }
        }
        true
    }
}

/// What the transaction actually cost, or its upper bound when the receipt isn't available
async fn transaction_fee(rpc: &dyn ChainRpc, tx: &Transaction) -> U256 {
    let hash = *tx.inner.tx_hash();

    match tokio::time::timeout(RECEIPT_TIMEOUT, rpc.transaction_receipt(hash)).await {
        Ok(Ok(Some(receipt))) => {
            return U256::from(receipt.gas_used) * U256::from(receipt.effective_gas_price);
        }
        Ok(Ok(None)) => tracing::warn!("EVM: no receipt for {hash}, estimating its fee"),
        Ok(Err(err)) => tracing::warn!("EVM: receipt of {hash}: {err}, estimating its fee"),
        Err(_) => tracing::warn!("EVM: receipt of {hash} timed out, estimating its fee"),
    }

    let gas_price = tx.gas_price().unwrap_or_else(|| tx.max_fee_per_gas());
    U256::from(tx.gas_limit()) * U256::from(gas_price)
}

fn transaction_payload(chain: &ChainKey, tx: &Transaction, fee: U256) -> Map<String, Value> {
    let mut payload = match serde_json::to_value(tx) {
        Ok(Value::Object(fields)) => fields,
        _ => Map::new(),
    };
    payload.insert("_grinderyChain".to_string(), Value::String(chain.to_string()));
    payload.insert("_fee".to_string(), Value::String(fee.to_string()));
    payload
}

#[async_trait]
impl BlockHandler for TransactionProcessor {
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
        for tx in block.transactions.txns() {
            if !self.matches(tx) {
                continue;
            }

            tracing::debug!("EVM: transaction {} on {chain}", tx.inner.tx_hash());
            let fee = transaction_fee(rpc.as_ref(), tx).await;

            send(
                sink,
                Notification {
                    chain: chain.clone(),
                    payload: transaction_payload(chain, tx, fee),
                },
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use utils::test_utils::mock_chain::{mock_transaction, MockChain};

    use super::*;

    fn config(from: Option<Address>, to: Option<Address>) -> TransactionTriggerConfig {
        TransactionTriggerConfig {
            chains: vec![ChainKey::eip155(5)],
            from,
            to,
        }
    }

    #[test]
    fn needs_an_address_and_a_chain() {
        assert!(matches!(
            TransactionProcessor::new(&config(None, None)),
            Err(TriggerError::InvalidParams(_))
        ));

        let mut no_chain = config(Some(Address::with_last_byte(1)), None);
        no_chain.chains.clear();
        assert!(TransactionProcessor::new(&no_chain).is_err());
    }

    #[test]
    fn matches_both_ends() {
        let alice = Address::with_last_byte(1);
        let bob = Address::with_last_byte(2);
        let processor = TransactionProcessor::new(&config(Some(alice), Some(bob))).unwrap();

        assert!(processor.matches(&mock_transaction(alice, Some(bob), 0, 21_000, 1)));
        assert!(!processor.matches(&mock_transaction(alice, Some(alice), 0, 21_000, 1)));
        assert!(!processor.matches(&mock_transaction(bob, Some(bob), 0, 21_000, 1)));
        assert!(!processor.matches(&mock_transaction(alice, None, 0, 21_000, 1)));
    }

    #[tokio::test]
    async fn fee_falls_back_to_the_limit() {
        let chain = MockChain::new();
        let tx = mock_transaction(Address::with_last_byte(1), None, 0, 50_000, 3);

        let payload = transaction_payload(
            &ChainKey::eip155(5),
            &tx,
            transaction_fee(&chain, &tx).await,
        );
        assert_eq!(payload["_fee"], Value::String("150000".to_string()));
        assert_eq!(payload["_grinderyChain"], Value::String("eip155:5".to_string()));
        // the transaction's own fields come first
        assert!(payload.len() > 2);
    }
}
