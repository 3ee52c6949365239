#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod error;

pub mod dht;
pub mod rpc;
pub mod testnet;
pub mod transport;

pub use crate::common::{
    messages, Bucket, BucketInsert, Contact, Id, LookupList, Prefix, RoutingTable, StoreOutcome,
    DEFAULT_BUCKET_SIZE, ID_BITS, ID_BYTES,
};
pub use dht::{Dht, KeyInput};
pub use error::{Error, RpcError};
pub use rpc::{Config, Info, Rpc, StoreReceipt};
pub use testnet::Testnet;
pub use transport::{TransactionId, Transport, TransportEvent};

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
