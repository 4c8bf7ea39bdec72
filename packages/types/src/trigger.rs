use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ChainKey;

/// What a trigger watches for, as received from the control plane
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Transaction(TransactionTriggerConfig),
    Event(EventTriggerConfig),
}

impl TriggerKind {
    pub fn chains(&self) -> &[ChainKey] {
        match self {
            TriggerKind::Transaction(config) => &config.chains,
            TriggerKind::Event(config) => &config.chains,
        }
    }
}

/// Matches transactions by sender and/or recipient
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionTriggerConfig {
    pub chains: Vec<ChainKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
}

/// Matches contract events by declaration, address and indexed parameter values
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTriggerConfig {
    pub chains: Vec<ChainKey>,
    /// Kept as a string, `"0x0"` and `""` mean "any contract"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    /// e.g. `"Transfer(address indexed from, address indexed to, uint256 value)"`
    pub events: Vec<String>,
    /// Parameter name to expected value, an empty string disables the filter
    #[serde(default)]
    pub parameter_filters: Map<String, Value>,
}

/// A single notification delivered to the trigger's sink
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub chain: ChainKey,
    pub payload: Map<String, Value>,
}
