//! The abstract RPC capability the node consumes.
//!
//! The core never frames, serializes, or delivers messages; it hands typed
//! payloads to a [Transport] and consumes the [TransportEvent]s the transport
//! surfaces. An in-memory implementation for tests and simulations lives in
//! [crate::testnet].

use std::net::SocketAddr;

use crate::common::messages::{
    FindNodeRequestArguments, FindValueRequestArguments, RequestSpecific, RequestTypeSpecific,
    ResponseSpecific, StoreRequestArguments,
};
use crate::common::Id;
use crate::error::RpcError;

/// Correlates a request with its eventual response event.
pub type TransactionId = u64;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A response, or a failure, for a request this node sent earlier.
    Response {
        transaction_id: TransactionId,
        from: SocketAddr,
        result: Result<ResponseSpecific, RpcError>,
    },
    /// An incoming request from a remote node, to be answered with
    /// [Transport::respond].
    Request {
        transaction_id: TransactionId,
        from: SocketAddr,
        request: RequestSpecific,
    },
}

/// A non-blocking RPC transport.
///
/// Every request returns immediately with a [TransactionId]; the outcome
/// arrives later as a [TransportEvent::Response] from [Transport::poll],
/// including timeouts, which the transport must turn into
/// [RpcError::Timeout] rather than leaving the request dangling.
pub trait Transport: Send + 'static {
    /// The endpoint remote nodes can reach this node at.
    fn local_endpoint(&self) -> SocketAddr;

    /// Send a request. Must not block.
    fn request(&mut self, to: SocketAddr, request: RequestSpecific) -> TransactionId;

    /// Answer a request previously surfaced by [Transport::poll].
    fn respond(
        &mut self,
        to: SocketAddr,
        transaction_id: TransactionId,
        response: ResponseSpecific,
    );

    /// Drain the next pending event, if any. Must not block.
    fn poll(&mut self) -> Option<TransportEvent>;

    // === Provided request helpers ===

    fn ping(&mut self, to: SocketAddr, requester_id: Id) -> TransactionId {
        self.request(
            to,
            RequestSpecific {
                requester_id,
                request_type: RequestTypeSpecific::Ping,
            },
        )
    }

    fn store(
        &mut self,
        to: SocketAddr,
        requester_id: Id,
        args: StoreRequestArguments,
    ) -> TransactionId {
        self.request(
            to,
            RequestSpecific {
                requester_id,
                request_type: RequestTypeSpecific::Store(args),
            },
        )
    }

    fn find_node(
        &mut self,
        to: SocketAddr,
        requester_id: Id,
        args: FindNodeRequestArguments,
    ) -> TransactionId {
        self.request(
            to,
            RequestSpecific {
                requester_id,
                request_type: RequestTypeSpecific::FindNode(args),
            },
        )
    }

    fn find_value(
        &mut self,
        to: SocketAddr,
        requester_id: Id,
        args: FindValueRequestArguments,
    ) -> TransactionId {
        self.request(
            to,
            RequestSpecific {
                requester_id,
                request_type: RequestTypeSpecific::FindValue(args),
            },
        )
    }
}
