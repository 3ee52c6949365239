//! Abstract request and response payloads exchanged between nodes.
//!
//! Framing and serialization are the transport's concern; these structs are
//! the shapes it has to carry. All of them derive serde so a wire transport
//! can encode them however it likes.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::{Contact, Id};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestTypeSpecific {
    Ping,
    Store(StoreRequestArguments),
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequestArguments {
    /// The key's Id (hex on the wire).
    pub idkey: Id,
    pub subkey: String,
    pub value: Bytes,
    /// Remaining time to live in milliseconds; the receiver applies its
    /// default when absent.
    pub expire: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindValueRequestArguments {
    pub target: Id,
    /// The key's Id (hex on the wire); equals `target` for well-formed
    /// requests but travels separately.
    pub idkey: Id,
    pub subkey: SubkeySelector,
}

/// Which subkeys a value operation addresses: one, a set, or all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubkeySelector {
    Single(String),
    Many(Vec<String>),
    All,
}

impl SubkeySelector {
    pub fn matches(&self, subkey: &str) -> bool {
        match self {
            SubkeySelector::Single(s) => s == subkey,
            SubkeySelector::Many(set) => set.iter().any(|s| s == subkey),
            SubkeySelector::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    Store(StoreResponseArguments),
    FindNode(FindNodeResponseArguments),
    FindValue(FindValueResponseArguments),
}

impl ResponseSpecific {
    pub fn responder_id(&self) -> &Id {
        match self {
            ResponseSpecific::Ping(args) => &args.responder_id,
            ResponseSpecific::Store(args) => &args.responder_id,
            ResponseSpecific::FindNode(args) => &args.responder_id,
            ResponseSpecific::FindValue(args) => &args.responder_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindValueResponseArguments {
    pub responder_id: Id,
    /// Closer contacts; may accompany values in all-subkeys mode.
    pub contacts: Vec<Contact>,
    /// Matching subkeys held by the responder; empty on a miss.
    pub values: BTreeMap<String, StoredValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Bytes,
    /// Remaining time to live in milliseconds; `None` marks an entry without
    /// TTL on the responder.
    pub expire: Option<u64>,
}
