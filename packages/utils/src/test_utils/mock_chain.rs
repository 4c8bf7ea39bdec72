use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use alloy_consensus::{
    transaction::{Recovered, SignerRecoverable},
    Eip658Value, Receipt, ReceiptEnvelope, ReceiptWithBloom, SignableTransaction,
    Transaction as _, TxEnvelope, TxLegacy,
};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, Bloom, BloomInput, Bytes, LogData, Signature, TxKind, B256, U256};
use alloy_rpc_types_eth::{
    Block, BlockTransactions, Filter, Header, Log, Transaction, TransactionReceipt,
    TransactionRequest,
};
use async_trait::async_trait;

use crate::{error::EvmClientError, evm_client::ChainRpc};

/// Decides the outcome of an `eth_call`, after the gas check passed
pub type CallHandler = Arc<dyn Fn(&TransactionRequest) -> Result<Bytes, String> + Send + Sync>;

/// A transaction accepted by [`MockChain::send_raw_transaction`]
#[derive(Clone, Debug)]
pub struct SentTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: Option<u128>,
    pub input: Bytes,
}

pub struct MockChainState {
    pub chain_id: u64,
    pub height: u64,
    pub blocks: BTreeMap<u64, Block>,
    pub logs: Vec<Log>,
    pub code: HashMap<Address, Bytes>,
    /// calls carrying less gas than this fail as out of gas
    pub min_gas: u64,
    pub raw_estimate: u64,
    pub call_handler: Option<CallHandler>,
    /// the next N calls never reach the node
    pub call_failures: usize,
    pub base_fee: Option<u128>,
    pub gas_price: u128,
    pub priority_fee: u128,
    /// the next N sends are rejected as underpriced
    pub underpriced_failures: usize,
    /// the next N accepted sends never get a receipt
    pub stuck_sends: usize,
    /// the next N log queries fail
    pub log_failures: usize,
    /// heights that fail to fetch until removed
    pub failing_blocks: HashSet<u64>,
    pub block_number_failures: usize,
    pub nonces: HashMap<Address, u64>,
    pub sent: Vec<SentTransaction>,
    pub receipt_logs: HashMap<Address, Vec<(Vec<B256>, Bytes)>>,
    pub receipts: HashMap<B256, TransactionReceipt>,
    pub log_queries: usize,
    pub block_fetches: Vec<u64>,
}

impl Default for MockChainState {
    fn default() -> Self {
        Self {
            chain_id: 31337,
            height: 0,
            blocks: BTreeMap::new(),
            logs: Vec::new(),
            code: HashMap::new(),
            min_gas: 21_000,
            raw_estimate: 21_000,
            call_handler: None,
            call_failures: 0,
            base_fee: Some(1_000_000_000),
            gas_price: 1_000_000_000,
            priority_fee: 100_000_000,
            underpriced_failures: 0,
            stuck_sends: 0,
            log_failures: 0,
            failing_blocks: HashSet::new(),
            block_number_failures: 0,
            nonces: HashMap::new(),
            sent: Vec::new(),
            receipt_logs: HashMap::new(),
            receipts: HashMap::new(),
            log_queries: 0,
            block_fetches: Vec::new(),
        }
    }
}

/// An in-memory node, scripted through [`MockChain::with_state`]
#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<MockChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut MockChainState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Appends blocks up to `height`, each with no transactions
    pub fn advance_to(&self, height: u64) {
        self.with_state(|state| {
            for number in state.height + 1..=height {
                state
                    .blocks
                    .entry(number)
                    .or_insert_with(|| mock_block(number, Vec::new(), Bloom::default()));
            }
            state.height = state.height.max(height);
        });
    }

    pub fn insert_block(&self, block: Block) {
        self.with_state(|state| {
            let number = block.header.inner.number;
            state.height = state.height.max(number);
            state.blocks.insert(number, block);
        });
    }

    pub fn sent(&self) -> Vec<SentTransaction> {
        self.with_state(|state| state.sent.clone())
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn chain_id(&self) -> Result<u64, EvmClientError> {
        Ok(self.with_state(|state| state.chain_id))
    }

    async fn block_number(&self) -> Result<u64, EvmClientError> {
        self.with_state(|state| {
            if state.block_number_failures > 0 {
                state.block_number_failures -= 1;
                return Err(EvmClientError::BlockHeight(anyhow::anyhow!("mock failure")));
            }
            Ok(state.height)
        })
    }

    async fn block_with_transactions(&self, height: u64) -> Result<Option<Block>, EvmClientError> {
        self.with_state(|state| {
            state.block_fetches.push(height);
            if state.failing_blocks.contains(&height) {
                return Err(EvmClientError::Block(
                    height,
                    anyhow::anyhow!("mock failure"),
                ));
            }
            Ok(state.blocks.get(&height).cloned())
        })
    }

    async fn latest_base_fee(&self) -> Result<Option<u128>, EvmClientError> {
        Ok(self.with_state(|state| state.base_fee))
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, EvmClientError> {
        self.with_state(|state| {
            state.log_queries += 1;
            if state.log_failures > 0 {
                state.log_failures -= 1;
                return Err(EvmClientError::Logs(anyhow::anyhow!("mock failure")));
            }
            let from = filter.get_from_block().unwrap_or(0);
            let to = filter.get_to_block().unwrap_or(u64::MAX);
            Ok(state
                .logs
                .iter()
                .filter(|log| {
                    log.block_number
                        .map(|n| n >= from && n <= to)
                        .unwrap_or(false)
                        && filter.matches(&log.inner)
                })
                .cloned()
                .collect())
        })
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, EvmClientError> {
        Ok(self.with_state(|state| state.receipts.get(&hash).cloned()))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, EvmClientError> {
        Ok(self.with_state(|state| state.code.get(&address).cloned().unwrap_or_default()))
    }

    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, EvmClientError> {
        self.with_state(|state| {
            if state.call_failures > 0 {
                state.call_failures -= 1;
                return Err(EvmClientError::Call(anyhow::anyhow!("connection refused")));
            }
            if let Some(gas) = tx.gas {
                if gas < state.min_gas {
                    return Err(EvmClientError::CallReverted("out of gas".to_string()));
                }
            }
            match &state.call_handler {
                Some(handler) => handler(tx).map_err(EvmClientError::CallReverted),
                None => Ok(Bytes::new()),
            }
        })
    }

    async fn estimate_gas(&self, _tx: &TransactionRequest) -> Result<u64, EvmClientError> {
        Ok(self.with_state(|state| state.raw_estimate))
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, EvmClientError> {
        Ok(self.with_state(|state| state.nonces.get(&address).copied().unwrap_or_default()))
    }

    async fn gas_price(&self) -> Result<u128, EvmClientError> {
        Ok(self.with_state(|state| state.gas_price))
    }

    async fn max_priority_fee_per_gas(&self) -> Result<u128, EvmClientError> {
        Ok(self.with_state(|state| state.priority_fee))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, EvmClientError> {
        let envelope = TxEnvelope::decode_2718(&mut &raw[..])
            .map_err(|e| EvmClientError::SendTransaction(e.into()))?;
        let from = envelope
            .recover_signer()
            .map_err(|e| EvmClientError::SendTransaction(e.into()))?;

        self.with_state(|state| {
            if state.underpriced_failures > 0 {
                state.underpriced_failures -= 1;
                return Err(EvmClientError::from_send_error(
                    "replacement transaction underpriced",
                ));
            }

            let expected = state.nonces.get(&from).copied().unwrap_or_default();
            if envelope.nonce() != expected {
                return Err(EvmClientError::from_send_error(format!(
                    "invalid nonce: expected {expected}, got {}",
                    envelope.nonce()
                )));
            }
            state.nonces.insert(from, expected + 1);

            let hash = *envelope.tx_hash();
            let sent = SentTransaction {
                hash,
                from,
                to: envelope.to(),
                nonce: envelope.nonce(),
                gas_limit: envelope.gas_limit(),
                gas_price: envelope.gas_price(),
                max_fee_per_gas: envelope.max_fee_per_gas(),
                max_priority_fee_per_gas: envelope.max_priority_fee_per_gas(),
                input: envelope.input().clone(),
            };

            if state.stuck_sends > 0 {
                state.stuck_sends -= 1;
                // a stuck transaction doesn't consume the nonce
                state.nonces.insert(from, expected);
            } else {
                let logs = envelope
                    .to()
                    .and_then(|to| state.receipt_logs.get(&to).map(|logs| (to, logs.clone())))
                    .map(|(to, logs)| {
                        logs.into_iter()
                            .map(|(topics, data)| mock_log(to, topics, data, state.height + 1, 0))
                            .collect()
                    })
                    .unwrap_or_default();
                let receipt = mock_receipt(&sent, state.height + 1, state.min_gas, logs);
                state.receipts.insert(hash, receipt);
            }

            state.sent.push(sent);
            Ok(hash)
        })
    }
}

/// A block whose hash is derived from its number and `logs_bloom`
pub fn mock_block(number: u64, transactions: Vec<Transaction>, logs_bloom: Bloom) -> Block {
    mock_block_with_extra(number, transactions, logs_bloom, Bytes::new())
}

/// Same as [`mock_block`], `extra_data` varies the hash, e.g. for a reorged sibling
pub fn mock_block_with_extra(
    number: u64,
    transactions: Vec<Transaction>,
    logs_bloom: Bloom,
    extra_data: Bytes,
) -> Block {
    let header = Header::new(alloy_consensus::Header {
        number,
        logs_bloom,
        extra_data,
        gas_limit: 30_000_000,
        base_fee_per_gas: Some(1_000_000_000),
        ..Default::default()
    });
    Block::new(header, BlockTransactions::Full(transactions))
}

/// A legacy transaction, recovered to `from` without a real signature
pub fn mock_transaction(
    from: Address,
    to: Option<Address>,
    nonce: u64,
    gas_limit: u64,
    gas_price: u128,
) -> Transaction {
    let tx = TxLegacy {
        chain_id: Some(31337),
        nonce,
        gas_price,
        gas_limit,
        to: to.map(TxKind::Call).unwrap_or(TxKind::Create),
        value: U256::ZERO,
        input: Bytes::new(),
    };
    let envelope = TxEnvelope::from(tx.into_signed(Signature::test_signature()));

    Transaction {
        inner: Recovered::new_unchecked(envelope, from),
        block_hash: None,
        block_number: None,
        transaction_index: None,
        effective_gas_price: Some(gas_price),
    }
}

pub fn mock_log(
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: u64,
    log_index: u64,
) -> Log {
    Log {
        inner: alloy_primitives::Log {
            address,
            data: LogData::new_unchecked(topics, data),
        },
        block_hash: Some(B256::with_last_byte(block_number as u8)),
        block_number: Some(block_number),
        block_timestamp: None,
        transaction_hash: Some(B256::repeat_byte(0xaa)),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

/// The bloom a real node would compute over `logs`
pub fn bloom_for(logs: &[Log]) -> Bloom {
    let mut bloom = Bloom::default();
    for log in logs {
        bloom.accrue(BloomInput::Raw(log.inner.address.as_slice()));
        for topic in log.inner.data.topics() {
            bloom.accrue(BloomInput::Raw(topic.as_slice()));
        }
    }
    bloom
}

fn mock_receipt(
    sent: &SentTransaction,
    block_number: u64,
    gas_used: u64,
    logs: Vec<Log>,
) -> TransactionReceipt {
    let logs_bloom = bloom_for(&logs);
    let effective_gas_price = sent.gas_price.unwrap_or(sent.max_fee_per_gas);

    TransactionReceipt {
        inner: ReceiptEnvelope::Eip1559(ReceiptWithBloom {
            receipt: Receipt {
                status: Eip658Value::Eip658(true),
                cumulative_gas_used: gas_used,
                logs,
            },
            logs_bloom,
        }),
        transaction_hash: sent.hash,
        transaction_index: Some(0),
        block_hash: Some(B256::with_last_byte(block_number as u8)),
        block_number: Some(block_number),
        gas_used: gas_used.min(sent.gas_limit),
        effective_gas_price,
        blob_gas_used: None,
        blob_gas_price: None,
        from: sent.from,
        to: sent.to,
        contract_address: None,
    }
}
