//! Iterative lookup driver: concurrently probe the closest known contacts
//! to a target, merge closer contacts from their replies, and repeat until
//! the shortlist is exhausted or a value search closes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::common::messages::{
    FindNodeRequestArguments, FindValueRequestArguments, ResponseSpecific, StoredValue,
    SubkeySelector,
};
use crate::common::{Contact, Id, LookupList};
use crate::error::RpcError;
use crate::transport::{TransactionId, Transport};

#[derive(Debug, Clone)]
pub enum LookupKind {
    /// Converge on the k closest contacts to the target.
    FindNode,
    /// Retrieve values stored under the target key.
    FindValue {
        idkey: Id,
        subkeys: SubkeySelector,
    },
}

#[derive(Debug, Clone)]
/// A value reported during a FIND_VALUE lookup, with the contact it came
/// from.
pub struct FoundValue {
    pub value: StoredValue,
    pub source: Contact,
}

#[derive(Debug, Clone)]
/// What a finished lookup converged on.
pub struct LookupResult {
    pub target: Id,
    /// The final shortlist, in distance order.
    pub contacts: Vec<Contact>,
    /// Accumulated values per subkey; empty for FIND_NODE lookups and misses.
    pub values: BTreeMap<String, FoundValue>,
}

#[derive(Debug)]
pub struct Lookup {
    target: Id,
    kind: LookupKind,
    list: LookupList,
    alpha: usize,
    in_flight: usize,
    aborted: bool,
    inflight_requests: HashMap<TransactionId, Contact>,
    values: BTreeMap<String, FoundValue>,
}

impl Lookup {
    pub fn new(
        target: Id,
        kind: LookupKind,
        k: usize,
        alpha: usize,
        seeds: Vec<Contact>,
    ) -> Self {
        trace!(?target, ?kind, seeds = seeds.len(), "New lookup");

        let mut list = LookupList::new(target, k);
        list.insert_many(seeds);

        Self {
            target,
            kind,
            list,
            alpha,
            in_flight: 0,
            aborted: false,
            inflight_requests: HashMap::new(),
            values: BTreeMap::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn kind(&self) -> &LookupKind {
        &self.kind
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// True if a response with this transaction id belongs to this lookup.
    pub fn inflight(&self, transaction_id: TransactionId) -> bool {
        self.inflight_requests.contains_key(&transaction_id)
    }

    /// A lookup is done once it aborted (a single-subkey search got its
    /// value) or nothing is in flight and no unqueried candidate remains.
    pub fn is_done(&self) -> bool {
        self.aborted || (self.in_flight == 0 && !self.list.has_unqueried())
    }

    // === Public Methods ===

    /// Probe the closest unqueried candidates, keeping at most α requests in
    /// flight.
    pub fn proceed<T: Transport>(&mut self, transport: &mut T, requester_id: Id) {
        if self.aborted {
            return;
        }

        while self.in_flight < self.alpha {
            let Some(contact) = self.list.next() else {
                break;
            };

            let transaction_id = match &self.kind {
                LookupKind::FindNode => transport.find_node(
                    contact.address(),
                    requester_id,
                    FindNodeRequestArguments {
                        target: self.target,
                    },
                ),
                LookupKind::FindValue { idkey, subkeys } => transport.find_value(
                    contact.address(),
                    requester_id,
                    FindValueRequestArguments {
                        target: self.target,
                        idkey: *idkey,
                        subkey: subkeys.clone(),
                    },
                ),
            };

            self.inflight_requests.insert(transaction_id, contact);
            self.in_flight += 1;
        }
    }

    /// Route a response event into this lookup; returns `false` when the
    /// transaction id is not one of ours.
    ///
    /// A failed probe drops the contact from the shortlist (it may be
    /// re-inserted from another responder's reply). After an abort, late
    /// responses only settle the in-flight bookkeeping.
    pub fn on_response(
        &mut self,
        transaction_id: TransactionId,
        result: Result<&ResponseSpecific, &RpcError>,
    ) -> bool {
        let Some(contact) = self.inflight_requests.remove(&transaction_id) else {
            return false;
        };
        self.in_flight -= 1;

        if self.aborted {
            return true;
        }

        match result {
            Err(error) => {
                debug!(target = ?self.target, from = ?contact.id(), ?error, "Lookup probe failed");
                self.list.remove(contact.id());
            }
            Ok(ResponseSpecific::FindNode(args)) => {
                self.list.insert_many(args.contacts.iter().cloned());
            }
            Ok(ResponseSpecific::FindValue(args)) => {
                self.list.insert_many(args.contacts.iter().cloned());
                self.merge_values(&contact, &args.values);
            }
            Ok(_) => {}
        }

        true
    }

    /// Consume the lookup into its result.
    pub fn finish(self) -> LookupResult {
        debug!(
            target = ?self.target,
            contacts = self.list.len(),
            values = self.values.len(),
            "Lookup done"
        );

        LookupResult {
            target: self.target,
            contacts: self.list.contacts(),
            values: self.values,
        }
    }

    // === Private Methods ===

    fn merge_values(&mut self, contact: &Contact, values: &BTreeMap<String, StoredValue>) {
        let LookupKind::FindValue { subkeys, .. } = &self.kind else {
            return;
        };
        let single = matches!(subkeys, SubkeySelector::Single(_));

        for (subkey, value) in values {
            if !subkeys.matches(subkey) {
                continue;
            }

            let won = match self.values.get(subkey) {
                None => true,
                // A strictly closer responder displaces the current winner;
                // the earliest report survives otherwise.
                Some(existing) => {
                    self.target.compare_distance(contact.id(), existing.source.id())
                        == Ordering::Less
                }
            };

            if won {
                self.values.insert(
                    subkey.clone(),
                    FoundValue {
                        value: value.clone(),
                        source: contact.clone(),
                    },
                );
            }

            if single {
                // First value wins; the rest of the search is discarded.
                self.aborted = true;
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::messages::{FindNodeResponseArguments, FindValueResponseArguments};
    use crate::common::ID_BYTES;
    use crate::testnet::{MemoryTransport, Testnet};
    use crate::transport::TransportEvent;
    use bytes::Bytes;
    use std::net::SocketAddr;

    fn id_at_distance(byte: u8) -> Id {
        // With a zero target, the distance of an id is the id itself.
        let mut bytes = [0_u8; ID_BYTES];
        bytes[ID_BYTES - 1] = byte;
        Id::from_bytes(bytes).unwrap()
    }

    fn drain_requests(peer: &mut MemoryTransport) -> Vec<(TransactionId, SocketAddr)> {
        let mut requests = Vec::new();
        while let Some(event) = peer.poll() {
            if let TransportEvent::Request {
                transaction_id,
                from,
                ..
            } = event
            {
                requests.push((transaction_id, from));
            }
        }
        requests
    }

    /// Feed every pending response event into the lookup, proceeding after
    /// each one, the way the engine does.
    fn pump(lookup: &mut Lookup, transport: &mut MemoryTransport, requester_id: Id) {
        while let Some(event) = transport.poll() {
            if let TransportEvent::Response {
                transaction_id,
                result,
                ..
            } = event
            {
                let result = match &result {
                    Ok(response) => Ok(response),
                    Err(error) => Err(error),
                };
                assert!(lookup.on_response(transaction_id, result));

                if !lookup.is_done() {
                    lookup.proceed(transport, requester_id);
                }
            }
        }
    }

    #[test]
    fn in_flight_stays_within_alpha() {
        let testnet = Testnet::new();
        let mut me = testnet.transport();

        let seeds: Vec<Contact> = (1..=5)
            .map(|i| Contact::new(id_at_distance(i), testnet.transport().local_endpoint()))
            .collect();

        let mut lookup = Lookup::new(Id::ZERO, LookupKind::FindNode, 20, 3, seeds);
        lookup.proceed(&mut me, Id::random());

        assert_eq!(lookup.in_flight(), 3);
        assert!(!lookup.is_done());
    }

    #[test]
    fn empty_shortlist_is_done_immediately() {
        let mut lookup = Lookup::new(Id::ZERO, LookupKind::FindNode, 20, 3, vec![]);
        assert!(lookup.is_done());

        let result = lookup.finish();
        assert!(result.contacts.is_empty());
        assert!(result.values.is_empty());
    }

    #[test]
    fn converges_around_a_dead_node() {
        let testnet = Testnet::new();
        let me_id = Id::random();
        let mut me = testnet.transport();

        let mut peer_a = testnet.transport();
        let peer_b = testnet.transport();
        let mut peer_c = testnet.transport();
        let mut peer_d = testnet.transport();

        // Distances from the all-zeros target: D < C < A, B dead.
        let a = Contact::new(id_at_distance(0x10), peer_a.local_endpoint());
        let b = Contact::new(id_at_distance(0x08), peer_b.local_endpoint());
        let c = Contact::new(id_at_distance(0x04), peer_c.local_endpoint());
        let d = Contact::new(id_at_distance(0x01), peer_d.local_endpoint());

        testnet.disconnect(peer_b.local_endpoint());

        let mut lookup = Lookup::new(
            Id::ZERO,
            LookupKind::FindNode,
            20,
            3,
            vec![a.clone(), b.clone(), c.clone()],
        );
        lookup.proceed(&mut me, me_id);
        assert_eq!(lookup.in_flight(), 3);

        // A and C answer with the closer contact D.
        for (peer, responder) in [(&mut peer_a, &a), (&mut peer_c, &c)] {
            for (transaction_id, from) in drain_requests(peer) {
                peer.respond(
                    from,
                    transaction_id,
                    ResponseSpecific::FindNode(FindNodeResponseArguments {
                        responder_id: *responder.id(),
                        contacts: vec![d.clone()],
                    }),
                );
            }
        }
        pump(&mut lookup, &mut me, me_id);

        // D got probed; answer with nothing new.
        for (transaction_id, from) in drain_requests(&mut peer_d) {
            peer_d.respond(
                from,
                transaction_id,
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id: *d.id(),
                    contacts: vec![],
                }),
            );
        }
        pump(&mut lookup, &mut me, me_id);

        assert!(lookup.is_done());
        let result = lookup.finish();

        let ids: Vec<_> = result.contacts.iter().map(|contact| *contact.id()).collect();
        assert_eq!(ids, vec![*d.id(), *c.id(), *a.id()]);
    }

    #[test]
    fn single_subkey_aborts_on_first_value() {
        let testnet = Testnet::new();
        let me_id = Id::random();
        let mut me = testnet.transport();

        let mut peer_a = testnet.transport();
        let mut peer_c = testnet.transport();

        let a = Contact::new(id_at_distance(0x04), peer_a.local_endpoint());
        let c = Contact::new(id_at_distance(0x10), peer_c.local_endpoint());

        let mut lookup = Lookup::new(
            Id::ZERO,
            LookupKind::FindValue {
                idkey: Id::ZERO,
                subkeys: SubkeySelector::Single("greeting".into()),
            },
            20,
            3,
            vec![a.clone(), c.clone()],
        );
        lookup.proceed(&mut me, me_id);

        // A returns the value first.
        for (transaction_id, from) in drain_requests(&mut peer_a) {
            let mut values = BTreeMap::new();
            values.insert(
                "greeting".to_string(),
                StoredValue {
                    value: Bytes::from_static(b"world"),
                    expire: Some(60_000),
                },
            );
            peer_a.respond(
                from,
                transaction_id,
                ResponseSpecific::FindValue(FindValueResponseArguments {
                    responder_id: *a.id(),
                    contacts: vec![],
                    values,
                }),
            );
        }
        pump(&mut lookup, &mut me, me_id);
        assert!(lookup.is_done());

        // C's late reply is discarded, not merged.
        for (transaction_id, from) in drain_requests(&mut peer_c) {
            let mut values = BTreeMap::new();
            values.insert(
                "greeting".to_string(),
                StoredValue {
                    value: Bytes::from_static(b"stale"),
                    expire: None,
                },
            );
            peer_c.respond(
                from,
                transaction_id,
                ResponseSpecific::FindValue(FindValueResponseArguments {
                    responder_id: *c.id(),
                    contacts: vec![],
                    values,
                }),
            );
        }
        pump(&mut lookup, &mut me, me_id);

        let result = lookup.finish();
        let found = &result.values["greeting"];
        assert_eq!(found.value.value, Bytes::from_static(b"world"));
        assert_eq!(found.source.id(), a.id());
    }

    #[test]
    fn closer_source_displaces_earlier_value() {
        let closer = Contact::new(id_at_distance(0x01), SocketAddr::from(([0, 0, 0, 0], 1)));
        let farther = Contact::new(id_at_distance(0x09), SocketAddr::from(([0, 0, 0, 0], 2)));

        let mut lookup = Lookup::new(
            Id::ZERO,
            LookupKind::FindValue {
                idkey: Id::ZERO,
                subkeys: SubkeySelector::All,
            },
            20,
            3,
            vec![],
        );

        let value = |payload: &'static [u8]| StoredValue {
            value: Bytes::from_static(payload),
            expire: None,
        };

        let mut values = BTreeMap::new();
        values.insert("x".to_string(), value(b"far"));
        lookup.merge_values(&farther, &values);

        // Same contact reporting again does not displace itself.
        let mut values = BTreeMap::new();
        values.insert("x".to_string(), value(b"far again"));
        lookup.merge_values(&farther, &values);
        assert_eq!(lookup.values["x"].value.value, Bytes::from_static(b"far"));

        // A strictly closer source wins.
        let mut values = BTreeMap::new();
        values.insert("x".to_string(), value(b"near"));
        lookup.merge_values(&closer, &values);
        assert_eq!(lookup.values["x"].value.value, Bytes::from_static(b"near"));
        assert_eq!(lookup.values["x"].source.id(), closer.id());

        // And a farther one afterwards does not.
        let mut values = BTreeMap::new();
        values.insert("x".to_string(), value(b"far once more"));
        lookup.merge_values(&farther, &values);
        assert_eq!(lookup.values["x"].value.value, Bytes::from_static(b"near"));
    }
}
