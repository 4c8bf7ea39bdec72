use alloy_consensus::Transaction as _;
use alloy_primitives::U256;
use alloy_rpc_types_eth::TransactionRequest;
use connector_types::FeeHints;
use utils::evm_client::ChainRpc;

use super::{FeeStrategy, SubmissionError};

/// Per-gas prices of a transaction, in wei
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeQuote {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

/// The quote plus the lowest per-gas fee the chain is expected to accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fees {
    pub quote: FeeQuote,
    pub min_fee_per_gas: u128,
}

impl FeeQuote {
    /// The highest per-gas price the transaction may pay
    pub fn max_per_gas(&self) -> u128 {
        match self {
            FeeQuote::Legacy { gas_price } => *gas_price,
            FeeQuote::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Every price field +20%, and at least +1 so small values still move
    pub fn bumped(&self) -> Self {
        fn bump(value: u128) -> u128 {
            (value.saturating_mul(12) / 10).max(value.saturating_add(1))
        }

        match self {
            FeeQuote::Legacy { gas_price } => FeeQuote::Legacy {
                gas_price: bump(*gas_price),
            },
            FeeQuote::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeeQuote::Eip1559 {
                max_fee_per_gas: bump(*max_fee_per_gas),
                max_priority_fee_per_gas: bump(*max_priority_fee_per_gas),
            },
        }
    }

    pub fn apply(&self, mut tx: TransactionRequest) -> TransactionRequest {
        match self {
            FeeQuote::Legacy { gas_price } => {
                tx.gas_price = Some(*gas_price);
                tx.max_fee_per_gas = None;
                tx.max_priority_fee_per_gas = None;
            }
            FeeQuote::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                tx.gas_price = None;
                tx.max_fee_per_gas = Some(*max_fee_per_gas);
                tx.max_priority_fee_per_gas = Some(*max_priority_fee_per_gas);
            }
        }
        tx
    }
}

/// Budgets are totals in wei, spread over the gas limit
fn budget_per_gas(budget: U256, gas: u64) -> u128 {
    let per_gas = budget / U256::from(gas.max(1));
    u128::try_from(per_gas).unwrap_or(u128::MAX)
}

/// The per-gas ceiling bumping may not cross, `None` when the caller set no limit
pub fn fee_cap(hints: &FeeHints, gas: u64) -> Option<u128> {
    hints
        .fee_cap_per_gas
        .or_else(|| hints.gas_limit.map(|budget| budget_per_gas(budget, gas)))
}

pub async fn quote_fees(
    rpc: &dyn ChainRpc,
    strategy: &FeeStrategy,
    hints: &FeeHints,
    gas: u64,
) -> Result<Fees, SubmissionError> {
    match strategy {
        FeeStrategy::Fixed {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Ok(Fees {
            quote: FeeQuote::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas,
                max_priority_fee_per_gas: *max_priority_fee_per_gas,
            },
            min_fee_per_gas: *max_fee_per_gas,
        }),
        FeeStrategy::Legacy => {
            let gas_price = legacy_gas_price(rpc).await?;
            Ok(Fees {
                quote: FeeQuote::Legacy { gas_price },
                min_fee_per_gas: gas_price,
            })
        }
        FeeStrategy::Eip1559 => {
            let base_fee = rpc.latest_base_fee().await?;
            let node_priority_fee = rpc.max_priority_fee_per_gas().await?;
            let fallback = match base_fee {
                Some(_) => 0,
                None => rpc.gas_price().await?,
            };

            eip1559_fees(base_fee, fallback, node_priority_fee, hints, gas)
        }
    }
}

/// `node_max_fee` stands in for the base fee when the node doesn't report one
pub fn eip1559_fees(
    base_fee: Option<u128>,
    node_max_fee: u128,
    node_priority_fee: u128,
    hints: &FeeHints,
    gas: u64,
) -> Result<Fees, SubmissionError> {
    let min_fee = base_fee.unwrap_or(node_max_fee / 2).saturating_mul(3) / 2;

    let tip = hints
        .max_priority_fee_per_gas
        .unwrap_or_else(|| (min_fee / 2).saturating_add(node_priority_fee));

    let max_fee = match hints.gas_limit {
        Some(budget) => {
            let max_fee = budget_per_gas(budget, gas);
            if max_fee < min_fee {
                let needed = U256::from(min_fee) * U256::from(gas);
                return Err(SubmissionError::FeeTooLow(format!(
                    "Gas limit of {budget} is too low, need at least {needed}"
                )));
            }
            max_fee
        }
        None => min_fee.saturating_add(tip),
    };

    Ok(Fees {
        quote: FeeQuote::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: tip.min(max_fee),
        },
        min_fee_per_gas: min_fee,
    })
}

/// The greater of the node's price and the median paid in the latest block, +20%
async fn legacy_gas_price(rpc: &dyn ChainRpc) -> Result<u128, SubmissionError> {
    let node_price = rpc.gas_price().await?;

    let height = rpc.block_number().await?;
    let paid: Vec<u128> = match rpc.block_with_transactions(height).await {
        Ok(Some(block)) => block
            .transactions
            .txns()
            .map(|tx| tx.gas_price().unwrap_or_else(|| tx.max_fee_per_gas()))
            .collect(),
        Ok(None) => Vec::new(),
        Err(err) => {
            tracing::warn!("EVM: no gas price sample from block {height}: {err}");
            Vec::new()
        }
    };

    Ok(legacy_price(node_price, paid))
}

pub fn legacy_price(node_price: u128, mut paid: Vec<u128>) -> u128 {
    let median = if paid.is_empty() {
        0
    } else {
        paid.sort_unstable();
        paid[paid.len() / 2]
    };

    node_price.max(median).saturating_mul(12) / 10
}
