use std::{collections::HashMap, str::FromStr};

use alloy_dyn_abi::{DynSolValue, EventExt, Specifier};
use alloy_json_abi::Event;
use alloy_primitives::{Address, Bloom, BloomInput, B256};
use alloy_rpc_types_eth::{Filter, Log};
use connector_types::{ChainKey, EventTriggerConfig};
use serde_json::{Map, Value};

use crate::abi::{self, coerce, topic_for};

use super::TriggerError;

/// Topic slots after topic0, `None` matches anything
pub type TopicSlots = Vec<Option<Vec<B256>>>;

/// Identifies one `eth_getLogs` query, triggers with the same filter share the result
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogQueryKey {
    pub chain: ChainKey,
    pub block_number: u64,
    pub block_hash: B256,
    pub address: Option<Address>,
    pub topics: TopicSlots,
}

/// How a decoded value is checked against a parameter filter
#[derive(Clone, Debug)]
enum Expected {
    /// indexed values are compared in topic form
    Topic(B256),
    /// everything else by canonical ABI encoding
    Encoded(Vec<u8>),
}

#[derive(Clone, Debug)]
struct DeclaredEvent {
    event: Event,
    num_indexed: usize,
    /// input name to expected value, inputs without a filter are absent
    expected: HashMap<String, Expected>,
}

/// Everything derived from an event trigger's declarations, computed once at setup
#[derive(Clone, Debug)]
pub struct EventFilter {
    address: Option<Address>,
    events: HashMap<B256, DeclaredEvent>,
    topics: TopicSlots,
}

/// A log that passed every filter, ready to become a notification
#[derive(Clone, Debug)]
pub struct DecodedLog {
    pub event_name: String,
    /// named parameters in declaration order
    pub params: Vec<(String, Value)>,
}

fn parse_contract_address(address: Option<&str>) -> Result<Option<Address>, TriggerError> {
    match address.map(str::trim) {
        None | Some("") | Some("0x0") => Ok(None),
        Some(address) => Address::from_str(address)
            .map(Some)
            .map_err(|e| TriggerError::InvalidParams(format!("Invalid contract address: {e}"))),
    }
}

fn is_active_filter(value: Option<&Value>) -> Option<&Value> {
    match value {
        None => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(value) => Some(value),
    }
}

impl EventFilter {
    pub fn new(config: &EventTriggerConfig) -> Result<Self, TriggerError> {
        if config.events.is_empty() {
            return Err(TriggerError::InvalidParams(
                "eventDeclaration is required".to_string(),
            ));
        }

        let address = parse_contract_address(config.contract_address.as_deref())?;

        let mut ordered = Vec::with_capacity(config.events.len());
        for declaration in &config.events {
            let event = abi::parse_event(declaration)?;
            let declared = Self::declare(event, &config.parameter_filters)?;
            ordered.push(declared);
        }

        let mut selectors: Vec<B256> = Vec::with_capacity(ordered.len());
        for declared in &ordered {
            let selector = declared.event.selector();
            if !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }

        // the indexed slots come from the first declaration
        let mut topics: TopicSlots = vec![Some(selectors)];
        for input in ordered[0].event.inputs.iter().filter(|input| input.indexed) {
            topics.push(match ordered[0].expected.get(&input.name) {
                Some(Expected::Topic(topic)) => Some(vec![*topic]),
                _ => None,
            });
        }
        while matches!(topics.last(), Some(None)) {
            topics.pop();
        }

        if topics.len() <= 1 && address.is_none() {
            return Err(TriggerError::InvalidParams(
                "No topics to filter on".to_string(),
            ));
        }

        let events = ordered
            .into_iter()
            .map(|declared| (declared.event.selector(), declared))
            .collect();

        Ok(Self {
            address,
            events,
            topics,
        })
    }

    fn declare(event: Event, filters: &Map<String, Value>) -> Result<DeclaredEvent, TriggerError> {
        let mut expected = HashMap::new();

        for input in &event.inputs {
            let Some(value) = is_active_filter(filters.get(&input.name)) else {
                continue;
            };
            let ty = input
                .resolve()
                .map_err(|e| TriggerError::InvalidParams(format!("{}: {e}", input.name)))?;
            let value = coerce(&ty, value).map_err(|reason| {
                TriggerError::InvalidParams(format!(
                    "Invalid filter value for {}: {reason}",
                    input.name
                ))
            })?;

            expected.insert(
                input.name.clone(),
                if input.indexed {
                    Expected::Topic(topic_for(&value))
                } else {
                    Expected::Encoded(value.abi_encode())
                },
            );
        }

        Ok(DeclaredEvent {
            num_indexed: event.inputs.iter().filter(|input| input.indexed).count(),
            event,
            expected,
        })
    }

    pub fn address(&self) -> Option<Address> {
        self.address
    }

    /// Topic slots as sent to the node, topic0 first, trailing wildcards trimmed
    pub fn topics(&self) -> &TopicSlots {
        &self.topics
    }

    /// False when the block's bloom rules out any matching log
    pub fn matches_bloom(&self, bloom: &Bloom) -> bool {
        if let Some(address) = self.address {
            if !bloom.contains_input(BloomInput::Raw(address.as_slice())) {
                return false;
            }
        }

        self.topics.iter().flatten().all(|candidates| {
            candidates
                .iter()
                .any(|topic| bloom.contains_input(BloomInput::Raw(topic.as_slice())))
        })
    }

    pub fn rpc_filter(&self, block_number: u64) -> Filter {
        let mut filter = Filter::new().from_block(block_number).to_block(block_number);
        if let Some(address) = self.address {
            filter = filter.address(address);
        }
        for (slot, topics) in self.topics.iter().enumerate() {
            if let Some(topics) = topics {
                filter.topics[slot] = topics.clone().into();
            }
        }
        filter
    }

    pub fn query_key(&self, chain: &ChainKey, block_number: u64, block_hash: B256) -> LogQueryKey {
        LogQueryKey {
            chain: chain.clone(),
            block_number,
            block_hash,
            address: self.address,
            topics: self.topics.clone(),
        }
    }

    /// `None` for logs that don't belong to this filter or can't be decoded
    pub fn decode(&self, log: &Log) -> Option<DecodedLog> {
        if let Some(address) = self.address {
            if log.address() != address {
                return None;
            }
        }

        let topics = log.topics();
        let Some(topic0) = topics.first() else {
            tracing::warn!(
                "EVM: log without topics in {:?}",
                log.transaction_hash
            );
            return None;
        };
        let declared = self.events.get(topic0)?;

        // non-standard indexing, we can't know how to decode it
        if declared.num_indexed != topics.len() - 1 {
            return None;
        }

        let decoded = match declared
            .event
            .decode_log_parts(topics.iter().copied(), &log.data().data)
        {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::error!(
                    "EVM: failed to decode {} log [{:?} - {:?}]: {err}",
                    declared.event.name,
                    log.transaction_hash,
                    log.log_index
                );
                return None;
            }
        };

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut indexed_topics = topics[1..].iter();
        let mut params = Vec::with_capacity(declared.event.inputs.len());

        for input in &declared.event.inputs {
            let (value, topic): (DynSolValue, Option<&B256>) = if input.indexed {
                (indexed.next()?, indexed_topics.next())
            } else {
                (body.next()?, None)
            };

            let matches = match declared.expected.get(&input.name) {
                None => true,
                Some(Expected::Topic(expected)) => topic == Some(expected),
                Some(Expected::Encoded(expected)) => &value.abi_encode() == expected,
            };
            if !matches {
                return None;
            }

            params.push((input.name.clone(), abi::to_json(&value)));
        }

        Some(DecodedLog {
            event_name: declared.event.name.clone(),
            params,
        })
    }
}

#[cfg(test)]
mod test {
    use alloy_primitives::{Bytes, U256};
    use serde_json::json;
    use utils::test_utils::mock_chain::{bloom_for, mock_log};

    use super::*;

    const TRANSFER: &str = "Transfer(address indexed from, address indexed to, uint256 value)";

    fn config(filters: Value, address: Option<&str>) -> EventTriggerConfig {
        EventTriggerConfig {
            chains: vec![ChainKey::eip155(5)],
            contract_address: address.map(str::to_string),
            events: vec![TRANSFER.to_string()],
            parameter_filters: filters.as_object().cloned().unwrap_or_default(),
        }
    }

    fn transfer_log(from: Address, to: Address, value: u64) -> Log {
        let event = abi::parse_event(TRANSFER).unwrap();
        mock_log(
            Address::with_last_byte(0xcc),
            vec![event.selector(), from.into_word(), to.into_word()],
            Bytes::from(U256::from(value).to_be_bytes_vec()),
            10,
            0,
        )
    }

    #[test]
    fn transfer_topics() {
        let unfiltered = EventFilter::new(&config(
            json!({}),
            Some("0x00000000000000000000000000000000000000cc"),
        ))
        .unwrap();
        assert_eq!(unfiltered.topics().len(), 1);

        let from = Address::with_last_byte(1);
        let filtered = EventFilter::new(&config(json!({"from": from.to_string()}), None)).unwrap();
        assert_eq!(filtered.topics().len(), 2);
        assert_eq!(filtered.topics()[1], Some(vec![from.into_word()]));

        // a `to` filter keeps the `from` slot as a wildcard
        let to = Address::with_last_byte(2);
        let filtered =
            EventFilter::new(&config(json!({"to": to.to_string(), "from": ""}), None)).unwrap();
        assert_eq!(filtered.topics().len(), 3);
        assert_eq!(filtered.topics()[1], None);
    }

    #[test]
    fn nothing_to_filter_on() {
        let err = EventFilter::new(&config(json!({"value": "5"}), Some("0x0"))).unwrap_err();
        assert!(matches!(err, TriggerError::InvalidParams(msg) if msg == "No topics to filter on"));

        let err = EventFilter::new(&config(json!({"from": "not an address"}), None)).unwrap_err();
        assert!(matches!(err, TriggerError::InvalidParams(_)));
    }

    #[test]
    fn bloom_prescreen() {
        let from = Address::with_last_byte(1);
        let filter = EventFilter::new(&config(json!({"from": from.to_string()}), None)).unwrap();

        let matching = transfer_log(from, Address::with_last_byte(2), 1);
        assert!(filter.matches_bloom(&bloom_for(&[matching])));

        let other = transfer_log(Address::with_last_byte(9), Address::with_last_byte(2), 1);
        assert!(!filter.matches_bloom(&bloom_for(&[other])));
        assert!(!filter.matches_bloom(&Bloom::default()));
    }

    #[test]
    fn decode_and_match_parameters() {
        let to = Address::with_last_byte(2);
        let filter =
            EventFilter::new(&config(json!({"to": to.to_string(), "value": 7}), None)).unwrap();

        let decoded = filter
            .decode(&transfer_log(Address::with_last_byte(1), to, 7))
            .unwrap();
        assert_eq!(decoded.event_name, "Transfer");
        assert_eq!(decoded.params[1], ("to".to_string(), json!(to.to_checksum(None))));
        assert_eq!(decoded.params[2], ("value".to_string(), json!("7")));

        assert!(filter
            .decode(&transfer_log(Address::with_last_byte(1), to, 8))
            .is_none());
        assert!(filter
            .decode(&transfer_log(Address::with_last_byte(1), Address::with_last_byte(3), 7))
            .is_none());
    }

    #[test]
    fn indexed_count_mismatch_is_skipped() {
        let filter = EventFilter::new(&config(
            json!({"from": Address::with_last_byte(1).to_string()}),
            None,
        ))
        .unwrap();
        let event = abi::parse_event(TRANSFER).unwrap();

        // ERC721 style Transfer with the amount indexed too
        let log = mock_log(
            Address::with_last_byte(0xcc),
            vec![
                event.selector(),
                Address::with_last_byte(1).into_word(),
                Address::with_last_byte(2).into_word(),
                B256::with_last_byte(3),
            ],
            Bytes::new(),
            10,
            0,
        );
        assert!(filter.decode(&log).is_none());
    }
}
