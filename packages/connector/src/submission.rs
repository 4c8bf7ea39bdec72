mod error;
mod fees;
mod gas;
mod nonce;
mod routing;
mod vault;
mod webhook;

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy_primitives::{Address, Bytes, TxKind, B256, U256};
use alloy_rpc_types_eth::{TransactionInput, TransactionReceipt, TransactionRequest};
use connector_types::{CallPayload, CallRequest, ChainKey};
use serde_json::Value;
use tokio::{sync::OwnedMutexGuard, time::Instant};
use tracing::instrument;
use utils::{
    error::EvmClientError,
    evm_client::{signing::RemoteSigner, ChainRpc},
};

use crate::{abi, pool::ConnectionPool};

pub use error::SubmissionError;
pub use fees::{eip1559_fees, fee_cap, legacy_price, FeeQuote, Fees};
pub use gas::{GasProbe, ProbeFailure, ProbeStep, GAS_CEILING, GAS_FLOOR, GAS_TOLERANCE};
pub use nonce::NonceLocks;
pub use routing::{Route, RouteCache, RoutedCall, IDrone, IHub};
pub use vault::VaultSigner;
pub use webhook::{GasDebit, GasDebitWebhook};

/// How a chain is priced
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeeStrategy {
    /// Constants from config, no estimation at all
    Fixed {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    /// Pre-London, a single gas price
    Legacy,
    #[default]
    Eip1559,
}

#[derive(Debug, Clone, Default)]
pub struct ChainSubmissionSettings {
    pub fees: FeeStrategy,
    pub hub_address: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct SubmissionSettings {
    pub chains: HashMap<ChainKey, ChainSubmissionSettings>,
    /// Hub of chains without their own entry
    pub default_hub_address: Option<Address>,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Sends per call, bumped replacements included
    pub max_send_attempts: u32,
    pub gas_debit_webhook: Option<String>,
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            chains: HashMap::new(),
            default_hub_address: None,
            receipt_timeout: Duration::from_secs(120),
            receipt_poll_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(10),
            max_send_attempts: 10,
            gas_debit_webhook: None,
        }
    }
}

impl SubmissionSettings {
    pub fn chain(&self, chain: &ChainKey) -> ChainSubmissionSettings {
        self.chains
            .get(chain)
            .cloned()
            .unwrap_or_else(|| ChainSubmissionSettings {
                fees: FeeStrategy::Eip1559,
                hub_address: self.default_hub_address,
            })
    }
}

/// Turns "call this function with these parameters" into a mined (or simulated) transaction
///
/// The registries (routes, nonce locks) live here and are shared by every call made through it.
pub struct SubmissionEngine {
    pool: ConnectionPool,
    signer: Arc<dyn RemoteSigner>,
    settings: SubmissionSettings,
    routes: RouteCache,
    nonces: NonceLocks,
    webhook: Option<GasDebitWebhook>,
}

/// A call after parsing and encoding, before routing
struct PreparedCall {
    function: alloy_json_abi::Function,
    data: Bytes,
    read_only: bool,
}

impl SubmissionEngine {
    pub fn new(
        pool: ConnectionPool,
        signer: Arc<dyn RemoteSigner>,
        settings: SubmissionSettings,
    ) -> Self {
        Self {
            webhook: settings
                .gas_debit_webhook
                .as_ref()
                .map(GasDebitWebhook::new),
            pool,
            signer,
            settings,
            routes: RouteCache::new(),
            nonces: NonceLocks::new(),
        }
    }

    fn prepare(request: &CallRequest) -> Result<PreparedCall, SubmissionError> {
        let function = abi::parse_function(&request.function_declaration)
            .map_err(|e| SubmissionError::InvalidParams(e.to_string()))?;
        let data = abi::encode_call(&function, &request.parameters).map_err(|e| match e {
            abi::AbiError::MissingParameter(_) | abi::AbiError::InvalidValue { .. } => {
                SubmissionError::InvalidParams(e.to_string())
            }
            e => SubmissionError::Abi(e),
        })?;

        Ok(PreparedCall {
            read_only: abi::is_read_only(&function),
            function,
            data: data.into(),
        })
    }

    #[instrument(skip(self, request), fields(subsys = "Submission", chain = %request.chain))]
    pub async fn submit_call(&self, request: &CallRequest) -> Result<CallPayload, SubmissionError> {
        let prepared = Self::prepare(request)?;
        let simulation = prepared.read_only || request.dry_run;

        let connection = self.pool.acquire(&request.chain)?;
        let rpc = connection.rpc();
        let relayer = self
            .signer
            .address()
            .await
            .map_err(SubmissionError::Signing)?;

        // drone nonces are read under the same lock, so routed calls serialize too
        let nonce_lock = if simulation {
            None
        } else {
            Some(self.nonces.lock(&request.chain, relayer).await)
        };

        let chain_settings = self.settings.chain(&request.chain);
        let routed = if prepared.read_only {
            RoutedCall::direct(request.contract_address, prepared.data.clone())
        } else {
            self.routes
                .resolve(
                    rpc.as_ref(),
                    self.signer.as_ref(),
                    &request.chain,
                    chain_settings.hub_address,
                    request.user,
                    request.contract_address,
                    prepared.data.clone(),
                )
                .await?
        };

        let tx = TransactionRequest {
            from: Some(relayer),
            to: Some(TxKind::Call(routed.to)),
            input: TransactionInput::new(routed.data.clone()),
            value: Some(request.value),
            ..Default::default()
        };

        let return_data = match self.simulate(rpc.as_ref(), &routed, &tx).await {
            Ok(data) => data,
            Err(SubmissionError::Reverted(reason)) if request.dry_run && !prepared.read_only => {
                return Ok(CallPayload::Simulated {
                    return_value: Value::Null,
                    estimated_gas: 0,
                    min_fee: U256::ZERO,
                    dry_run_error: Some(format!(
                        "Can't confirm that the transaction can be executed \
                         due to the following error: {reason}"
                    )),
                });
            }
            Err(err) => return Err(err),
        };
        let return_value = abi::decode_output(&prepared.function, &return_data)?;

        let gas = self.estimate_gas(rpc.as_ref(), &routed, &tx).await?;
        let fees =
            fees::quote_fees(rpc.as_ref(), &chain_settings.fees, &request.fees, gas).await?;

        if simulation {
            return Ok(CallPayload::Simulated {
                return_value,
                estimated_gas: gas,
                min_fee: U256::from(fees.min_fee_per_gas) * U256::from(gas),
                dry_run_error: None,
            });
        }

        let mut tx = tx;
        tx.gas = Some(gas);
        tx.chain_id = Some(rpc.chain_id().await?);
        tx.nonce = Some(rpc.pending_nonce(relayer).await?);

        let receipt = self
            .send(
                rpc.as_ref(),
                tx,
                fees.quote,
                fees::fee_cap(&request.fees, gas),
                nonce_lock,
            )
            .await?;

        if !receipt.status() {
            return Err(SubmissionError::Reverted("transaction failed".to_string()));
        }

        let gas_cost = U256::from(receipt.gas_used) * U256::from(receipt.effective_gas_price);

        if let Some(webhook) = &self.webhook {
            webhook.notify(GasDebit::new(
                receipt.transaction_hash,
                receipt.block_number,
                request.chain.clone(),
                request.contract_address,
                request.user,
                gas_cost,
            ));
        } else {
            tracing::debug!("Gas debit webhook is disabled");
        }

        let return_value = if routed.is_routed() {
            abi::decode_output(&prepared.function, &routed.unwrap_receipt(&receipt)?)?
        } else {
            // direct calls leave no return data on chain, the simulation's result stands in
            return_value
        };

        Ok(CallPayload::Mined {
            transaction_hash: receipt.transaction_hash,
            return_value,
            gas_cost,
            receipt: Box::new(receipt),
        })
    }

    /// The inner call's return data, or its revert reason
    async fn simulate(
        &self,
        rpc: &dyn ChainRpc,
        routed: &RoutedCall,
        tx: &TransactionRequest,
    ) -> Result<Bytes, SubmissionError> {
        let output = rpc.call(tx).await.map_err(|err| match err {
            EvmClientError::CallReverted(reason) => SubmissionError::Reverted(reason),
            err => SubmissionError::Rpc(err),
        })?;

        routed.unwrap_output(output)
    }

    async fn estimate_gas(
        &self,
        rpc: &dyn ChainRpc,
        routed: &RoutedCall,
        tx: &TransactionRequest,
    ) -> Result<u64, SubmissionError> {
        let estimate = match rpc.estimate_gas(tx).await {
            Ok(estimate) => estimate,
            Err(err) => {
                tracing::debug!("EVM: node estimate failed, probing from the floor: {err}");
                GAS_FLOOR
            }
        };

        gas::search(estimate, self.settings.probe_timeout, |gas| {
            let mut probe = tx.clone();
            probe.gas = Some(gas);
            async move {
                match self.simulate(rpc, routed, &probe).await {
                    Ok(_) => Ok(true),
                    Err(SubmissionError::Reverted(_)) => Ok(false),
                    // an unreachable node says nothing about the gas limit
                    Err(err) => Err(err),
                }
            }
        })
        .await
    }

    /// Sends with one nonce, bumping fees on underpriced rejections and on
    /// transactions that aren't mined in time, until a receipt shows up
    async fn send(
        &self,
        rpc: &dyn ChainRpc,
        tx: TransactionRequest,
        mut quote: FeeQuote,
        cap: Option<u128>,
        mut nonce_lock: Option<OwnedMutexGuard<()>>,
    ) -> Result<TransactionReceipt, SubmissionError> {
        let mut sent: Vec<B256> = Vec::new();
        let mut last_failure = String::new();

        for attempt in 0..self.settings.max_send_attempts {
            if attempt > 0 {
                quote = quote.bumped();
                if let Some(cap) = cap {
                    if quote.max_per_gas() > cap {
                        return Err(SubmissionError::FeeCapExceeded {
                            needed: quote.max_per_gas(),
                            cap,
                        });
                    }
                }
                tracing::info!(
                    "EVM: resubmitting with {} wei per gas (attempt {})",
                    quote.max_per_gas(),
                    attempt + 1
                );
            }

            let raw = self
                .signer
                .sign_transaction(quote.apply(tx.clone()))
                .await
                .map_err(SubmissionError::Signing)?;

            match rpc.send_raw_transaction(&raw).await {
                Ok(hash) => {
                    // accepted, whoever is next may read the pending nonce now
                    nonce_lock.take();
                    tracing::debug!("EVM: sent {hash}");
                    sent.push(hash);
                }
                Err(EvmClientError::Underpriced(reason)) => {
                    tracing::warn!("EVM: underpriced: {reason}");
                    last_failure = reason;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            if let Some(receipt) = self.wait_for_receipt(rpc, &sent).await? {
                return Ok(receipt);
            }
            last_failure = format!(
                "not mined within {}s",
                self.settings.receipt_timeout.as_secs()
            );
            tracing::warn!("EVM: {last_failure}");
        }

        Err(if sent.is_empty() {
            SubmissionError::FeeTooLow(last_failure)
        } else {
            SubmissionError::Timeout(last_failure)
        })
    }

    /// Any of the sent hashes may get mined, replacements share a nonce
    async fn wait_for_receipt(
        &self,
        rpc: &dyn ChainRpc,
        sent: &[B256],
    ) -> Result<Option<TransactionReceipt>, SubmissionError> {
        let deadline = Instant::now() + self.settings.receipt_timeout;

        loop {
            for hash in sent.iter().rev() {
                match rpc.transaction_receipt(*hash).await {
                    Ok(Some(receipt)) => return Ok(Some(receipt)),
                    Ok(None) => {}
                    Err(err) => tracing::debug!("EVM: receipt of {hash}: {err}"),
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }
}
