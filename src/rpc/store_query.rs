//! Store fan-out: once a lookup has determined the closest contacts to a
//! key, push the entries to each of them and count acknowledgements.

use flume::Sender;
use tracing::{debug, trace};

use crate::common::messages::{StoreRequestArguments, StoredValue};
use crate::common::{Contact, Id};
use crate::transport::{TransactionId, Transport};

#[derive(Debug, Clone)]
/// How a store fan-out went.
pub struct StoreReceipt {
    pub target: Id,
    /// How many contacts the entries were sent to.
    pub contacts: usize,
    /// How many store requests were acknowledged.
    pub stored_at: usize,
}

#[derive(Debug)]
/// A pending store fan-out, created alongside a FIND_NODE lookup for the
/// same target and started once that lookup completes.
pub struct StoreQuery {
    target: Id,
    entries: Vec<(String, StoredValue)>,
    inflight_requests: Vec<TransactionId>,
    contacts: usize,
    stored_at: usize,
    started: bool,
    sender: Option<Sender<StoreReceipt>>,
}

impl StoreQuery {
    /// `sender` is `None` for background replication, which is fire and
    /// forget; user-facing puts get the receipt.
    pub fn new(
        target: Id,
        entries: Vec<(String, StoredValue)>,
        sender: Option<Sender<StoreReceipt>>,
    ) -> Self {
        Self {
            target,
            entries,
            inflight_requests: Vec::new(),
            contacts: 0,
            stored_at: 0,
            started: false,
            sender,
        }
    }

    // === Getters ===

    pub fn started(&self) -> bool {
        self.started
    }

    /// True if a response with this transaction id belongs to this query.
    pub fn inflight(&self, transaction_id: TransactionId) -> bool {
        self.inflight_requests.contains(&transaction_id)
    }

    /// Done once started and every request was answered or failed.
    pub fn is_done(&self) -> bool {
        self.started && self.inflight_requests.is_empty()
    }

    // === Public Methods ===

    /// Send every entry to every contact.
    pub fn start<T: Transport>(
        &mut self,
        transport: &mut T,
        requester_id: Id,
        contacts: &[Contact],
    ) {
        debug_assert!(!self.started);

        self.started = true;
        self.contacts = contacts.len();

        trace!(target = ?self.target, contacts = contacts.len(), "StoreQuery start");

        for contact in contacts {
            for (subkey, value) in &self.entries {
                let transaction_id = transport.store(
                    contact.address(),
                    requester_id,
                    StoreRequestArguments {
                        idkey: self.target,
                        subkey: subkey.clone(),
                        value: value.value.clone(),
                        expire: value.expire,
                    },
                );
                self.inflight_requests.push(transaction_id);
            }
        }
    }

    /// Settle one request; returns `false` when the transaction id is not
    /// one of ours. Failures are swallowed, storing is best-effort.
    pub fn on_response(&mut self, transaction_id: TransactionId, acknowledged: bool) -> bool {
        let Some(index) = self
            .inflight_requests
            .iter()
            .position(|&tid| tid == transaction_id)
        else {
            return false;
        };
        self.inflight_requests.remove(index);

        if acknowledged {
            self.stored_at += 1;
        } else {
            debug!(target = ?self.target, "Store request failed");
        }

        true
    }

    /// Consume the query, delivering the receipt to the waiting caller.
    pub fn finish(self) {
        let receipt = StoreReceipt {
            target: self.target,
            contacts: self.contacts,
            stored_at: self.stored_at,
        };

        debug!(
            target = ?receipt.target,
            contacts = receipt.contacts,
            stored_at = receipt.stored_at,
            "StoreQuery done"
        );

        if let Some(sender) = self.sender {
            let _ = sender.send(receipt);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::messages::{ResponseSpecific, StoreResponseArguments};
    use crate::testnet::Testnet;
    use crate::transport::{Transport, TransportEvent};
    use bytes::Bytes;

    #[test]
    fn fan_out_and_receipt() {
        let testnet = Testnet::new();
        let mut me = testnet.transport();
        let mut peer_a = testnet.transport();
        let peer_b = testnet.transport();

        let a = Contact::new(Id::random(), peer_a.local_endpoint());
        let b = Contact::new(Id::random(), peer_b.local_endpoint());

        testnet.disconnect(peer_b.local_endpoint());

        let entries = vec![
            (
                "one".to_string(),
                StoredValue {
                    value: Bytes::from_static(b"1"),
                    expire: Some(1000),
                },
            ),
            (
                "two".to_string(),
                StoredValue {
                    value: Bytes::from_static(b"2"),
                    expire: None,
                },
            ),
        ];

        let (sender, receiver) = flume::bounded(1);
        let mut query = StoreQuery::new(Id::random(), entries, Some(sender));

        query.start(&mut me, Id::random(), &[a.clone(), b]);
        assert!(query.started());
        assert!(!query.is_done());

        // Peer A acknowledges both entries.
        while let Some(TransportEvent::Request {
            transaction_id,
            from,
            ..
        }) = peer_a.poll()
        {
            peer_a.respond(
                from,
                transaction_id,
                ResponseSpecific::Store(StoreResponseArguments {
                    responder_id: *a.id(),
                }),
            );
        }

        while let Some(TransportEvent::Response {
            transaction_id,
            result,
            ..
        }) = me.poll()
        {
            assert!(query.on_response(transaction_id, result.is_ok()));
        }

        assert!(query.is_done());
        query.finish();

        let receipt = receiver.try_recv().unwrap();
        assert_eq!(receipt.contacts, 2);
        assert_eq!(receipt.stored_at, 2);
    }

    #[test]
    fn empty_contact_list_is_done_immediately() {
        let testnet = Testnet::new();
        let mut me = testnet.transport();

        let (sender, receiver) = flume::bounded(1);
        let mut query = StoreQuery::new(Id::random(), vec![], Some(sender));

        query.start(&mut me, Id::random(), &[]);
        assert!(query.is_done());

        query.finish();
        let receipt = receiver.try_recv().unwrap();
        assert_eq!(receipt.contacts, 0);
        assert_eq!(receipt.stored_at, 0);
    }
}
