pub mod signing;

use alloy_primitives::{Address, Bytes, B256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{
    Block, BlockNumberOrTag, Filter, Log, TransactionReceipt, TransactionRequest,
};
use alloy_transport::TransportError;
use async_trait::async_trait;
use std::str::FromStr;

use crate::error::EvmClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvmEndpoint {
    WebSocket(reqwest::Url),
    Http(reqwest::Url),
}

impl FromStr for EvmEndpoint {
    type Err = EvmClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url =
            reqwest::Url::parse(s).map_err(|e| EvmClientError::ParseEndpoint(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(EvmEndpoint::WebSocket(url)),
            "http" | "https" => Ok(EvmEndpoint::Http(url)),
            scheme => Err(EvmClientError::ParseEndpoint(format!(
                "could not determine endpoint from scheme {scheme} (full url: {s})"
            ))),
        }
    }
}

impl std::fmt::Display for EvmEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvmEndpoint::WebSocket(url) => write!(f, "{}", url),
            EvmEndpoint::Http(url) => write!(f, "{}", url),
        }
    }
}

impl EvmEndpoint {
    pub fn new_http(url: &str) -> Result<Self, EvmClientError> {
        match url.parse::<Self>()? {
            endpoint @ EvmEndpoint::Http(_) => Ok(endpoint),
            EvmEndpoint::WebSocket(_) => Err(EvmClientError::ParseEndpoint(
                "url scheme is not http or https".to_string(),
            )),
        }
    }
}

/// The request/response half of a chain connection
///
/// Everything the block subscriber, the triggers and the submission engine
/// ask of a node goes through here, so tests can swap in an in-memory chain.
#[async_trait]
pub trait ChainRpc: Send + Sync + 'static {
    async fn chain_id(&self) -> Result<u64, EvmClientError>;

    async fn block_number(&self) -> Result<u64, EvmClientError>;

    /// `None` when the node doesn't have the block (yet)
    async fn block_with_transactions(&self, height: u64) -> Result<Option<Block>, EvmClientError>;

    /// Base fee of the latest block, `None` on pre-London chains
    async fn latest_base_fee(&self) -> Result<Option<u128>, EvmClientError>;

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, EvmClientError>;

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, EvmClientError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, EvmClientError>;

    /// `eth_call`, a revert maps to [`EvmClientError::CallReverted`] with the decoded reason
    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, EvmClientError>;

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, EvmClientError>;

    async fn pending_nonce(&self, address: Address) -> Result<u64, EvmClientError>;

    async fn gas_price(&self) -> Result<u128, EvmClientError>;

    async fn max_priority_fee_per_gas(&self) -> Result<u128, EvmClientError>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, EvmClientError>;
}

#[derive(Clone)]
pub struct EvmQueryClient {
    pub endpoint: EvmEndpoint,
    pub provider: DynProvider,
}

impl EvmQueryClient {
    /// HTTP clients need no handshake, so this one doesn't need to be async
    pub fn new_http(url: &str) -> Result<Self, EvmClientError> {
        let EvmEndpoint::Http(url) = EvmEndpoint::new_http(url)? else {
            return Err(EvmClientError::ParseEndpoint(
                "url scheme is not http or https".to_string(),
            ));
        };

        Ok(Self {
            provider: DynProvider::new(ProviderBuilder::new().connect_http(url.clone())),
            endpoint: EvmEndpoint::Http(url),
        })
    }
}

impl std::fmt::Debug for EvmQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmQueryClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Only an error reply from the node means the call itself failed,
/// anything else never reached the EVM
fn call_error(err: TransportError) -> EvmClientError {
    match err.as_error_resp() {
        Some(payload) => EvmClientError::CallReverted(
            payload
                .as_revert_data()
                .and_then(|data| alloy_sol_types::decode_revert_reason(&data))
                .unwrap_or_else(|| payload.message.to_string()),
        ),
        None => EvmClientError::Call(err.into()),
    }
}

#[async_trait]
impl ChainRpc for EvmQueryClient {
    async fn chain_id(&self) -> Result<u64, EvmClientError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| EvmClientError::ChainId(e.into()))
    }

    async fn block_number(&self) -> Result<u64, EvmClientError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| EvmClientError::BlockHeight(e.into()))
    }

    async fn block_with_transactions(&self, height: u64) -> Result<Option<Block>, EvmClientError> {
        self.provider
            .get_block_by_number(BlockNumberOrTag::Number(height))
            .full()
            .await
            .map_err(|e| EvmClientError::Block(height, e.into()))
    }

    async fn latest_base_fee(&self) -> Result<Option<u128>, EvmClientError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(|e| EvmClientError::FeeData(e.into()))?;

        Ok(block.and_then(|block| block.header.base_fee_per_gas.map(u128::from)))
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, EvmClientError> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| EvmClientError::Logs(e.into()))
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, EvmClientError> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| EvmClientError::TransactionReceipt(e.into()))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, EvmClientError> {
        self.provider
            .get_code_at(address)
            .await
            .map_err(|e| EvmClientError::FailedGetCode(address, e.into()))
    }

    async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, EvmClientError> {
        self.provider
            .call(tx.clone())
            .await
            .map_err(call_error)
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, EvmClientError> {
        self.provider
            .estimate_gas(tx.clone())
            .await
            .map_err(|e| EvmClientError::GasEstimation(e.into()))
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, EvmClientError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| EvmClientError::Nonce(e.into()))
    }

    async fn gas_price(&self) -> Result<u128, EvmClientError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| EvmClientError::FeeData(e.into()))
    }

    async fn max_priority_fee_per_gas(&self) -> Result<u128, EvmClientError> {
        self.provider
            .get_max_priority_fee_per_gas()
            .await
            .map_err(|e| EvmClientError::FeeData(e.into()))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, EvmClientError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(EvmClientError::from_send_error)?;

        Ok(*pending.tx_hash())
    }
}
