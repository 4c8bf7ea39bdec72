use std::sync::LazyLock;

use alloy_dyn_abi::{DynSolType, DynSolValue, FunctionExt, JsonAbiExt, Specifier};
use alloy_json_abi::{Event, Function, StateMutability};
use alloy_primitives::{keccak256, B256};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("Invalid event declaration: {0}")]
    InvalidEvent(String),

    #[error("Invalid function declaration: {0}")]
    InvalidFunction(String),

    #[error("Missing parameter {0}")]
    MissingParameter(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Unable to encode call: {0}")]
    Encode(String),

    #[error("Unable to decode: {0}")]
    Decode(String),
}

static EVENT_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:event\s+)?([A-Za-z_$][A-Za-z0-9_$]*)\s*\((.*)\)\s*;?\s*$")
        .expect("valid regex")
});

/// Parses `[event] Name(type [indexed] name, ...)`
///
/// Every parameter needs a name, it is what parameter filters and notifications refer to.
pub fn parse_event(declaration: &str) -> Result<Event, AbiError> {
    let captures = EVENT_DECLARATION
        .captures(declaration)
        .ok_or_else(|| AbiError::InvalidEvent(declaration.to_string()))?;
    let name = &captures[1];
    let params = captures[2].trim();

    if !params.is_empty() {
        for param in split_top_level(params, |c| c == ',') {
            let words = split_top_level(param, char::is_whitespace);
            let valid = match words.as_slice() {
                [_, name] => *name != "indexed",
                [_, "indexed", _] => true,
                _ => false,
            };
            if !valid {
                return Err(AbiError::InvalidEvent(format!(
                    "{declaration}: parameter `{}` must be `type [indexed] name`",
                    param.trim()
                )));
            }
        }
    }

    Event::parse(&format!("event {name}({params})"))
        .map_err(|e| AbiError::InvalidEvent(format!("{declaration}: {e}")))
}

/// Splits `s` on `sep` outside of parentheses, so tuple types stay whole
fn split_top_level(s: &str, sep: impl Fn(char) -> bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if depth == 0 && sep(c) => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);

    parts.retain(|part| !part.trim().is_empty());
    parts
}

/// Parses `[function] name(params) [view|pure|payable] [returns (...)]`
pub fn parse_function(declaration: &str) -> Result<Function, AbiError> {
    let trimmed = declaration.trim().trim_end_matches(';').trim();
    let full = if trimmed.starts_with("function ") {
        trimmed.to_string()
    } else {
        format!("function {trimmed}")
    };

    Function::parse(&full).map_err(|e| AbiError::InvalidFunction(format!("{declaration}: {e}")))
}

pub fn is_read_only(function: &Function) -> bool {
    matches!(
        function.state_mutability,
        StateMutability::View | StateMutability::Pure
    )
}

/// Converts a JSON value into an ABI value of type `ty`
///
/// Strings and numbers go through the ABI type's own string parser,
/// so `"0x..."`, `"1000"` and `1000` all work for a `uint256`.
pub fn coerce(ty: &DynSolType, value: &Value) -> Result<DynSolValue, String> {
    match (ty, value) {
        (DynSolType::Bool, Value::Bool(b)) => Ok(DynSolValue::Bool(*b)),
        (_, Value::String(s)) => ty.coerce_str(s).map_err(|e| e.to_string()),
        (_, Value::Number(n)) => ty.coerce_str(&n.to_string()).map_err(|e| e.to_string()),
        (_, Value::Bool(b)) => ty.coerce_str(&b.to_string()).map_err(|e| e.to_string()),
        (DynSolType::Array(inner), Value::Array(items)) => items
            .iter()
            .map(|item| coerce(inner, item))
            .collect::<Result<Vec<_>, _>>()
            .map(DynSolValue::Array),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) => {
            if items.len() != *len {
                return Err(format!("expected {len} items, got {}", items.len()));
            }
            items
                .iter()
                .map(|item| coerce(inner, item))
                .collect::<Result<Vec<_>, _>>()
                .map(DynSolValue::FixedArray)
        }
        (DynSolType::Tuple(types), Value::Array(items)) => {
            if items.len() != types.len() {
                return Err(format!(
                    "expected a tuple of {}, got {} items",
                    types.len(),
                    items.len()
                ));
            }
            types
                .iter()
                .zip(items)
                .map(|(ty, item)| coerce(ty, item))
                .collect::<Result<Vec<_>, _>>()
                .map(DynSolValue::Tuple)
        }
        (ty, value) => Err(format!("cannot convert {value} to {ty}")),
    }
}

/// The 32 byte topic an indexed parameter with `value` is logged as
///
/// Value types are the word itself. Strings and bytes hash their contents,
/// arrays and tuples hash the padded encoding of their elements without
/// offsets or lengths.
pub fn topic_for(value: &DynSolValue) -> B256 {
    if let Some(word) = value.as_word() {
        return word;
    }
    match value {
        DynSolValue::Bytes(bytes) => keccak256(bytes),
        DynSolValue::String(s) => keccak256(s.as_bytes()),
        _ => {
            let mut preimage = Vec::new();
            encode_in_place(value, &mut preimage);
            keccak256(preimage)
        }
    }
}

fn encode_in_place(value: &DynSolValue, out: &mut Vec<u8>) {
    match value {
        DynSolValue::Bytes(bytes) => pad_to_words(bytes, out),
        DynSolValue::String(s) => pad_to_words(s.as_bytes(), out),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            for item in items {
                encode_in_place(item, out);
            }
        }
        other => {
            if let Some(word) = other.as_word() {
                out.extend_from_slice(word.as_slice());
            }
        }
    }
}

fn pad_to_words(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes);
    out.resize(out.len() + (32 - bytes.len() % 32) % 32, 0);
}

/// Renders an ABI value as JSON, big numbers as decimal strings
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(const_hex::encode_prefixed(&word[..*size]))
        }
        DynSolValue::Bytes(bytes) => Value::String(const_hex::encode_prefixed(bytes)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        other => match other.as_word() {
            Some(word) => Value::String(word.to_string()),
            None => Value::String(const_hex::encode_prefixed(other.abi_encode())),
        },
    }
}

/// ABI encodes a call to `function`, parameters looked up by name
pub fn encode_call(
    function: &Function,
    parameters: &Map<String, Value>,
) -> Result<Vec<u8>, AbiError> {
    let mut values = Vec::with_capacity(function.inputs.len());

    for input in &function.inputs {
        let ty = input
            .resolve()
            .map_err(|e| AbiError::InvalidFunction(e.to_string()))?;
        let value = parameters
            .get(&input.name)
            .ok_or_else(|| AbiError::MissingParameter(input.name.clone()))?;
        let value = coerce(&ty, value).map_err(|reason| AbiError::InvalidValue {
            name: input.name.clone(),
            reason,
        })?;
        values.push(value);
    }

    function
        .abi_encode_input(&values)
        .map_err(|e| AbiError::Encode(e.to_string()))
}

/// Decodes return data: nothing is `null`, a single value is itself,
/// all-named outputs become an object and anything else an array
pub fn decode_output(function: &Function, data: &[u8]) -> Result<Value, AbiError> {
    if function.outputs.is_empty() {
        return Ok(Value::Null);
    }

    let values = function
        .abi_decode_output(data)
        .map_err(|e| AbiError::Decode(e.to_string()))?;

    if let [single] = values.as_slice() {
        return Ok(to_json(single));
    }

    if function.outputs.iter().all(|output| !output.name.is_empty()) {
        return Ok(Value::Object(
            function
                .outputs
                .iter()
                .zip(&values)
                .map(|(output, value)| (output.name.clone(), to_json(value)))
                .collect(),
        ));
    }

    Ok(Value::Array(values.iter().map(to_json).collect()))
}

#[cfg(test)]
mod test {
    use alloy_primitives::{address, Address, U256};
    use serde_json::json;

    use super::*;

    const TRANSFER: &str = "Transfer(address indexed from, address indexed to, uint256 value)";

    #[test]
    fn event_declarations() {
        let event = parse_event(TRANSFER).unwrap();
        assert_eq!(event.name, "Transfer");
        assert_eq!(
            event.selector(),
            alloy_primitives::b256!(
                "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
            )
        );
        assert_eq!(event.inputs.iter().filter(|i| i.indexed).count(), 2);

        assert!(parse_event("event Ping();").is_ok());
        assert!(parse_event(
            "  event  Approval(address indexed owner, address spender, uint256 value) "
        )
        .is_ok());

        assert!(matches!(
            parse_event("Transfer(address indexed, uint256 value)"),
            Err(AbiError::InvalidEvent(_))
        ));
        assert!(matches!(
            parse_event("Transfer(address from to, uint256 value)"),
            Err(AbiError::InvalidEvent(_))
        ));
        assert!(parse_event("not an event").is_err());
    }

    #[test]
    fn tuple_parameters_are_one_type() {
        let event = parse_event(
            "Settled((address maker, uint256 amount) indexed order, (uint8 a, uint8 b)[] legs)",
        )
        .unwrap();
        assert_eq!(event.inputs.len(), 2);
        assert_eq!(event.inputs[0].name, "order");
        assert!(event.inputs[0].indexed);
        assert_eq!(event.inputs[1].name, "legs");
        assert!(!event.inputs[1].indexed);

        assert!(matches!(
            parse_event("Settled((address maker, uint256 amount) indexed)"),
            Err(AbiError::InvalidEvent(_))
        ));
    }

    #[test]
    fn function_declarations() {
        let function = parse_function("balanceOf(address owner) view returns (uint256)").unwrap();
        assert!(is_read_only(&function));

        let function =
            parse_function("function transfer(address to, uint256 amount) returns (bool);")
                .unwrap();
        assert!(!is_read_only(&function));
        assert_eq!(function.outputs.len(), 1);
    }

    #[test]
    fn coerce_json_values() {
        assert_eq!(
            coerce(&DynSolType::Uint(256), &json!(1000)).unwrap(),
            DynSolValue::Uint(U256::from(1000), 256)
        );
        assert_eq!(
            coerce(&DynSolType::Uint(256), &json!("0x10")).unwrap(),
            DynSolValue::Uint(U256::from(16), 256)
        );
        assert_eq!(
            coerce(&DynSolType::Bool, &json!(true)).unwrap(),
            DynSolValue::Bool(true)
        );

        let addresses = DynSolType::Array(Box::new(DynSolType::Address));
        let value = coerce(
            &addresses,
            &json!(["0x0000000000000000000000000000000000000001"]),
        )
        .unwrap();
        assert_eq!(
            value,
            DynSolValue::Array(vec![DynSolValue::Address(Address::with_last_byte(1))])
        );

        assert!(coerce(&DynSolType::Address, &json!("nope")).is_err());
        assert!(coerce(&DynSolType::Uint(8), &json!(null)).is_err());
    }

    #[test]
    fn call_round_trip() {
        let function =
            parse_function("transfer(address to, uint256 amount) returns (bool success)").unwrap();
        let to = address!("0x00000000000000000000000000000000000000aa");

        let mut params = Map::new();
        params.insert("to".to_string(), json!(to.to_string()));
        params.insert("amount".to_string(), json!("5"));
        let data = encode_call(&function, &params).unwrap();
        assert_eq!(&data[..4], function.selector().as_slice());

        params.remove("amount");
        assert!(matches!(
            encode_call(&function, &params),
            Err(AbiError::MissingParameter(name)) if name == "amount"
        ));

        let output = DynSolValue::Bool(true).abi_encode();
        assert_eq!(decode_output(&function, &output).unwrap(), json!(true));
    }

    #[test]
    fn named_outputs_become_objects() {
        let function =
            parse_function("reserves() view returns (uint112 a, uint112 b)").unwrap();
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(1), 112),
            DynSolValue::Uint(U256::from(2), 112),
        ])
        .abi_encode_params();

        assert_eq!(
            decode_output(&function, &data).unwrap(),
            json!({"a": "1", "b": "2"})
        );
    }

    #[test]
    fn topics_for_static_and_dynamic_values() {
        let address = Address::with_last_byte(7);
        assert_eq!(
            topic_for(&DynSolValue::Address(address)),
            address.into_word()
        );
        assert_eq!(
            topic_for(&DynSolValue::String("abc".to_string())),
            keccak256("abc")
        );
    }

    #[test]
    fn topics_for_arrays_and_tuples_hash_padded_elements() {
        let numbers = DynSolValue::Array(vec![
            DynSolValue::Uint(U256::from(1), 8),
            DynSolValue::Uint(U256::from(2), 8),
        ]);
        let mut expected = [0u8; 64];
        expected[31] = 1;
        expected[63] = 2;
        assert_eq!(topic_for(&numbers), keccak256(expected));
        assert_ne!(topic_for(&numbers), keccak256(numbers.abi_encode_packed()));

        // nested strings are padded, without a length word
        let tuple = DynSolValue::Tuple(vec![
            DynSolValue::String("abc".to_string()),
            DynSolValue::Bool(true),
        ]);
        let mut expected = [0u8; 64];
        expected[..3].copy_from_slice(b"abc");
        expected[63] = 1;
        assert_eq!(topic_for(&tuple), keccak256(expected));
    }
}
