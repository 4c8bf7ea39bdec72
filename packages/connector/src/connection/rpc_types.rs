use std::sync::Arc;

use serde::{
    ser::{SerializeStruct, Serializer},
    Deserialize, Deserializer, Serialize,
};
use serde_json::Value;
use slotmap::{new_key_type, Key, KeyData, SlotMap};

new_key_type! {
    pub struct RpcId;
}

/// Remembers what each in-flight request was, responses only echo the id
#[derive(Clone, Default)]
pub struct RpcIds {
    lookup: Arc<std::sync::RwLock<SlotMap<RpcId, RpcRequestKind>>>,
}

impl RpcIds {
    pub fn insert(&self, kind: RpcRequestKind) -> RpcId {
        self.lookup.write().unwrap().insert(kind)
    }

    pub fn take(&self, id: RpcId) -> Option<RpcRequestKind> {
        self.lookup.write().unwrap().remove(id)
    }

    pub fn clear_all(&self) {
        self.lookup.write().unwrap().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequestKind {
    SubscribeNewHeads,
    Unsubscribe { subscription_id: String },
}

#[derive(Debug)]
pub enum RpcRequest {
    SubscribeNewHeads { id: RpcId },
    Unsubscribe { id: RpcId, subscription_id: String },
}

impl RpcRequest {
    pub fn new_heads(ids: &RpcIds) -> Self {
        Self::SubscribeNewHeads {
            id: ids.insert(RpcRequestKind::SubscribeNewHeads),
        }
    }

    pub fn unsubscribe(ids: &RpcIds, subscription_id: String) -> Self {
        Self::Unsubscribe {
            id: ids.insert(RpcRequestKind::Unsubscribe {
                subscription_id: subscription_id.clone(),
            }),
            subscription_id,
        }
    }
}

impl Serialize for RpcRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("RpcRequest", 4)?;
        state.serialize_field("jsonrpc", "2.0")?;

        // RpcId is a slotmap key, its ffi form is a plain u64 that round-trips in-process
        match self {
            RpcRequest::SubscribeNewHeads { id } => {
                state.serialize_field("id", &id.data().as_ffi())?;
                state.serialize_field("method", "eth_subscribe")?;
                state.serialize_field("params", &["newHeads"])?;
            }
            RpcRequest::Unsubscribe {
                id,
                subscription_id,
            } => {
                state.serialize_field("id", &id.data().as_ffi())?;
                state.serialize_field("method", "eth_unsubscribe")?;
                state.serialize_field("params", &[subscription_id])?;
            }
        }

        state.end()
    }
}

/// Inbound JSON-RPC messages on the push channel
#[derive(Debug)]
pub enum RpcInbound {
    /// Answer to a request we sent
    Response {
        id: RpcId,
        result: Result<RpcResponse, RpcError>,
    },

    /// A `newHeads` push
    NewHead {
        subscription_id: String,
        number: u64,
    },
}

// the shape alone doesn't prove what a response is, it has to be checked against the request
#[derive(Debug)]
pub enum RpcResponse {
    NewSubscription { subscription_id: String },
    UnsubscribeAck(bool),
    Other(Value),
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl<'de> Deserialize<'de> for RpcInbound {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v: Value = Deserialize::deserialize(deserializer)?;

        if let Some(id_val) = v.get("id") {
            let id: u64 =
                serde_json::from_value(id_val.clone()).map_err(serde::de::Error::custom)?;
            let id: RpcId = KeyData::from_ffi(id).into();

            if let Some(err_val) = v.get("error") {
                let err: RpcError =
                    serde_json::from_value(err_val.clone()).map_err(serde::de::Error::custom)?;
                return Ok(RpcInbound::Response {
                    id,
                    result: Err(err),
                });
            }

            let result = match v.get("result") {
                Some(Value::Bool(b)) => RpcResponse::UnsubscribeAck(*b),
                Some(Value::String(s)) => RpcResponse::NewSubscription {
                    subscription_id: s.clone(),
                },
                Some(other) => RpcResponse::Other(other.clone()),
                None => return Err(serde::de::Error::custom("missing result")),
            };

            return Ok(RpcInbound::Response {
                id,
                result: Ok(result),
            });
        }

        if v.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            let params = v
                .get("params")
                .ok_or_else(|| serde::de::Error::custom("missing params"))?;

            let subscription_id = params
                .get("subscription")
                .and_then(Value::as_str)
                .ok_or_else(|| serde::de::Error::custom("missing subscription id"))?
                .to_string();

            // only the height matters, the full block is fetched over http anyway
            let number = params
                .get("result")
                .and_then(|result| result.get("number"))
                .and_then(Value::as_str)
                .ok_or_else(|| serde::de::Error::custom("missing block number"))?;

            let number = u64::from_str_radix(number.trim_start_matches("0x"), 16)
                .map_err(serde::de::Error::custom)?;

            return Ok(RpcInbound::NewHead {
                subscription_id,
                number,
            });
        }

        Err(serde::de::Error::custom("unrecognized RpcInbound shape"))
    }
}
