use alloy_primitives::{Address, B256, U256};
use alloy_rpc_types_eth::TransactionReceipt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ChainKey;

/// A logical "call this function with these parameters" request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub chain: ChainKey,
    /// The identity the call is made on behalf of, owner of the drone when routed
    pub user: Address,
    pub contract_address: Address,
    /// e.g. `"function transfer(address to, uint256 amount) returns (bool)"`
    pub function_declaration: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub fees: FeeHints,
    #[serde(default)]
    pub dry_run: bool,
}

/// Caller supplied fee hints, all in wei
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<u128>,
    /// Total budget for the transaction fee (gas * price)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<U256>,
    /// Hard per-gas ceiling that fee bumping may never cross
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_cap_per_gas: Option<u128>,
}

/// The caller-visible outcome of a submitted call
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallPayload {
    /// Dry runs and view/pure functions, nothing was sent
    Simulated {
        return_value: Value,
        estimated_gas: u64,
        min_fee: U256,
        /// Set when a dry run would have reverted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dry_run_error: Option<String>,
    },
    Mined {
        transaction_hash: B256,
        receipt: Box<TransactionReceipt>,
        return_value: Value,
        gas_cost: U256,
    },
}

impl CallPayload {
    pub fn return_value(&self) -> &Value {
        match self {
            CallPayload::Simulated { return_value, .. } => return_value,
            CallPayload::Mined { return_value, .. } => return_value,
        }
    }
}
