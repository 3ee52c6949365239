//! In-memory transport hub, wiring any number of nodes together for tests
//! and simulations.
//!
//! Per-endpoint FIFO queues preserve arrival order; a node can be
//! disconnected to simulate a dead peer, after which requests to it fail
//! with [RpcError::Unreachable].

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::common::messages::{RequestSpecific, ResponseSpecific};
use crate::error::RpcError;
use crate::transport::{TransactionId, Transport, TransportEvent};

#[derive(Debug, Default)]
struct Hub {
    next_port: u16,
    next_transaction_id: TransactionId,
    queues: HashMap<SocketAddr, VecDeque<TransportEvent>>,
    down: HashSet<SocketAddr>,
}

#[derive(Debug, Clone)]
/// A hub of in-memory transports.
pub struct Testnet {
    hub: Arc<Mutex<Hub>>,
}

impl Testnet {
    pub fn new() -> Self {
        Testnet {
            hub: Arc::new(Mutex::new(Hub::default())),
        }
    }

    /// Allocate a fresh endpoint on this hub.
    pub fn transport(&self) -> MemoryTransport {
        let mut hub = self.hub.lock().expect("testnet lock");

        hub.next_port += 1;
        let address = SocketAddr::from(([127, 0, 0, 1], hub.next_port));
        hub.queues.insert(address, VecDeque::new());

        MemoryTransport {
            address,
            hub: self.hub.clone(),
        }
    }

    /// Take a node off the network; requests to it fail as unreachable.
    pub fn disconnect(&self, address: SocketAddr) {
        let mut hub = self.hub.lock().expect("testnet lock");

        hub.down.insert(address);
        hub.queues.remove(&address);
    }
}

impl Default for Testnet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
/// One endpoint on a [Testnet].
pub struct MemoryTransport {
    address: SocketAddr,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for MemoryTransport {
    fn local_endpoint(&self) -> SocketAddr {
        self.address
    }

    fn request(&mut self, to: SocketAddr, request: RequestSpecific) -> TransactionId {
        let mut hub = self.hub.lock().expect("testnet lock");

        let transaction_id = hub.next_transaction_id;
        hub.next_transaction_id += 1;

        if hub.down.contains(&to) || !hub.queues.contains_key(&to) {
            if let Some(own) = hub.queues.get_mut(&self.address) {
                own.push_back(TransportEvent::Response {
                    transaction_id,
                    from: to,
                    result: Err(RpcError::Unreachable),
                });
            }
        } else if let Some(queue) = hub.queues.get_mut(&to) {
            queue.push_back(TransportEvent::Request {
                transaction_id,
                from: self.address,
                request,
            });
        }

        transaction_id
    }

    fn respond(
        &mut self,
        to: SocketAddr,
        transaction_id: TransactionId,
        response: ResponseSpecific,
    ) {
        let mut hub = self.hub.lock().expect("testnet lock");
        let from = self.address;

        if let Some(queue) = hub.queues.get_mut(&to) {
            queue.push_back(TransportEvent::Response {
                transaction_id,
                from,
                result: Ok(response),
            });
        }
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        let mut hub = self.hub.lock().expect("testnet lock");

        hub.queues.get_mut(&self.address)?.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::messages::{PingResponseArguments, RequestTypeSpecific};
    use crate::common::Id;

    #[test]
    fn request_response_roundtrip() {
        let testnet = Testnet::new();

        let mut a = testnet.transport();
        let mut b = testnet.transport();

        let a_id = Id::random();
        let b_id = Id::random();

        let tid = a.ping(b.local_endpoint(), a_id);

        let Some(TransportEvent::Request {
            transaction_id,
            from,
            request,
        }) = b.poll()
        else {
            panic!("expected a request event");
        };

        assert_eq!(transaction_id, tid);
        assert_eq!(from, a.local_endpoint());
        assert_eq!(request.requester_id, a_id);
        assert_eq!(request.request_type, RequestTypeSpecific::Ping);

        b.respond(
            from,
            transaction_id,
            ResponseSpecific::Ping(PingResponseArguments { responder_id: b_id }),
        );

        let Some(TransportEvent::Response {
            transaction_id,
            result,
            ..
        }) = a.poll()
        else {
            panic!("expected a response event");
        };

        assert_eq!(transaction_id, tid);
        assert_eq!(
            result.unwrap().responder_id(),
            &b_id
        );
        assert!(a.poll().is_none());
    }

    #[test]
    fn disconnected_nodes_are_unreachable() {
        let testnet = Testnet::new();

        let mut a = testnet.transport();
        let b = testnet.transport();

        testnet.disconnect(b.local_endpoint());

        let tid = a.ping(b.local_endpoint(), Id::random());

        let Some(TransportEvent::Response {
            transaction_id,
            result,
            ..
        }) = a.poll()
        else {
            panic!("expected a failure event");
        };

        assert_eq!(transaction_id, tid);
        assert_eq!(result, Err(RpcError::Unreachable));
    }
}
