//! The node engine.
//!
//! [Rpc] owns the routing table and the cache, advances lookups and store
//! fan-outs, answers incoming requests, and runs the bucket-refresh and
//! cache-replication drivers. Everything happens inside [Rpc::tick], called
//! in a loop by the [crate::dht::Dht] actor thread, which keeps all mutable
//! state under a single logical owner.

mod cache;
mod config;
mod lookup;
mod store_query;

pub use cache::{Cache, CacheEntry};
pub use config::*;
pub use lookup::{FoundValue, Lookup, LookupKind, LookupResult};
pub use store_query::{StoreQuery, StoreReceipt};

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::Sender;
use tracing::{debug, trace};

use crate::common::messages::{
    FindNodeResponseArguments, FindValueResponseArguments, PingResponseArguments, RequestSpecific,
    RequestTypeSpecific, ResponseSpecific, StoreRequestArguments, StoreResponseArguments,
    StoredValue, SubkeySelector,
};
use crate::common::{Contact, Id, RoutingTable, StoreOutcome};
use crate::error::RpcError;
use crate::transport::{TransactionId, Transport, TransportEvent};
use crate::Result;

/// A snapshot of the node's state for callers outside the actor thread.
#[derive(Debug, Clone)]
pub struct Info {
    pub id: Id,
    pub local_endpoint: SocketAddr,
    pub routing_table_size: usize,
    pub cache_size: usize,
    pub is_bootstrapped: bool,
}

#[derive(Debug)]
struct PendingVerification {
    transaction_id: TransactionId,
    current: Contact,
    replacement: Contact,
}

#[derive(Debug)]
enum BootstrapState {
    /// Waiting for the seed pings to resolve.
    Pinging {
        pending: Vec<TransactionId>,
        waiters: Vec<Sender<usize>>,
    },
    /// Seed pings resolved; the self-lookup populating the buckets runs.
    Looking { waiters: Vec<Sender<usize>> },
    Done,
}

/// The engine advanced by the Dht actor thread; public so custom actor
/// setups can drive it directly.
pub struct Rpc<T: Transport> {
    id: Id,
    config: Config,
    transport: T,

    // Routing
    routing_table: RoutingTable,
    cache: Cache,

    // Active queries
    lookups: HashMap<Id, Lookup>,
    lookup_waiters: HashMap<Id, Vec<Sender<LookupResult>>>,
    /// Store fan-outs waiting for a lookup on the same target to finish;
    /// more than one may exist per target.
    store_queries: Vec<(Id, StoreQuery)>,

    /// At most one contact-validation probe is outstanding at a time.
    pending_verification: Option<PendingVerification>,
    bootstrap: BootstrapState,

    // Periodic drivers
    next_bucket_refresh: Instant,
    next_replication: Instant,
}

impl<T: Transport> Rpc<T> {
    /// Create a new Rpc with a random Id and start bootstrapping from the
    /// seeds.
    pub fn new(transport: T, seeds: &[SocketAddr], config: Config) -> Result<Self> {
        Self::new_with_id(transport, seeds, config, Id::random())
    }

    /// Create a new Rpc with an explicit Id.
    pub fn new_with_id(
        transport: T,
        seeds: &[SocketAddr],
        config: Config,
        id: Id,
    ) -> Result<Self> {
        config.validate()?;

        let now = Instant::now();

        let mut rpc = Rpc {
            id,
            routing_table: RoutingTable::new(id).with_bucket_size(config.bucket_size),
            cache: Cache::new(),
            lookups: HashMap::new(),
            lookup_waiters: HashMap::new(),
            store_queries: Vec::new(),
            pending_verification: None,
            bootstrap: BootstrapState::Done,
            next_bucket_refresh: now + config.refresh_time,
            next_replication: now + config.replicate_time,
            config,
            transport,
        };

        rpc.bootstrap(seeds);

        Ok(rpc)
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the endpoint remote nodes can reach this node at.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.transport.local_endpoint()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn is_bootstrapped(&self) -> bool {
        matches!(self.bootstrap, BootstrapState::Done)
    }

    pub fn info(&self) -> Info {
        Info {
            id: self.id,
            local_endpoint: self.transport.local_endpoint(),
            routing_table_size: self.routing_table.size(),
            cache_size: self.cache.len(),
            is_bootstrapped: self.is_bootstrapped(),
        }
    }

    // === Public Methods ===

    /// Drain transport events and run whatever maintenance is due.
    pub fn tick(&mut self) {
        while let Some(event) = self.transport.poll() {
            match event {
                TransportEvent::Request {
                    transaction_id,
                    from,
                    request,
                } => self.handle_request(from, transaction_id, request),
                TransportEvent::Response {
                    transaction_id,
                    from,
                    result,
                } => self.handle_response(from, transaction_id, result),
            }
        }

        let now = Instant::now();
        self.maintain_routing_table(now);
        self.maintain_cache(now);
    }

    /// Store entries under a key: seed the local authoritative copy, then
    /// fan out to the key's closest nodes once a lookup located them.
    pub fn put(
        &mut self,
        target: Id,
        entries: Vec<(String, Bytes)>,
        sender: Option<Sender<StoreReceipt>>,
    ) {
        let now = Instant::now();

        let mut wire_entries = Vec::with_capacity(entries.len());
        for (subkey, value) in entries {
            // The publisher's own copy carries no TTL; it rides the slow
            // republish cadence until the publisher goes away.
            self.cache
                .store(target, subkey.clone(), value.clone(), None, now);
            wire_entries.push((
                subkey,
                StoredValue {
                    value,
                    expire: None,
                },
            ));
        }

        self.store_queries
            .push((target, StoreQuery::new(target, wire_entries, sender)));
        self.start_lookup(target, LookupKind::FindNode, None);
    }

    /// Retrieve values for a key. An explicit single subkey is served from
    /// the local cache when present; everything else consults the network.
    pub fn get(&mut self, target: Id, subkeys: SubkeySelector, sender: Sender<LookupResult>) {
        let now = Instant::now();
        self.cache
            .expire(now, &self.routing_table, self.config.bucket_size);

        if let SubkeySelector::Single(subkey) = &subkeys {
            if let Some(entry) = self.cache.get(&target, subkey) {
                let mut values = BTreeMap::new();
                values.insert(
                    subkey.clone(),
                    FoundValue {
                        value: StoredValue {
                            value: entry.value.clone(),
                            expire: entry.wire_expire(now),
                        },
                        source: Contact::new(self.id, self.transport.local_endpoint()),
                    },
                );

                let _ = sender.send(LookupResult {
                    target,
                    contacts: Vec::new(),
                    values,
                });
                return;
            }
        }

        self.start_lookup(
            target,
            LookupKind::FindValue {
                idkey: target,
                subkeys,
            },
            Some(sender),
        );
    }

    /// Synchronous local cache read, after an expiration pass. An absent key
    /// says nothing about the rest of the network.
    pub fn peek(&mut self, target: Id, subkeys: SubkeySelector) -> BTreeMap<String, Bytes> {
        let now = Instant::now();
        self.cache
            .expire(now, &self.routing_table, self.config.bucket_size);

        match self.cache.subkeys(&target) {
            Some(entries) => entries
                .iter()
                .filter(|(subkey, _)| subkeys.matches(subkey))
                .map(|(subkey, entry)| (subkey.clone(), entry.value.clone()))
                .collect(),
            None => BTreeMap::new(),
        }
    }

    /// Register a waiter for bootstrap completion, resolved immediately if
    /// it already finished.
    pub fn await_bootstrap(&mut self, sender: Sender<usize>) {
        match &mut self.bootstrap {
            BootstrapState::Done => {
                let _ = sender.send(self.routing_table.size());
            }
            BootstrapState::Pinging { waiters, .. } | BootstrapState::Looking { waiters } => {
                waiters.push(sender);
            }
        }
    }

    // === Private Methods ===

    /// Ping every seed in parallel; once they all resolve, a self-lookup
    /// populates the buckets.
    fn bootstrap(&mut self, seeds: &[SocketAddr]) {
        if seeds.is_empty() {
            debug!(id = ?self.id, "Bootstrap without seeds");
            self.bootstrap = BootstrapState::Done;
            return;
        }

        let pending = seeds
            .iter()
            .map(|&address| self.transport.ping(address, self.id))
            .collect();

        self.bootstrap = BootstrapState::Pinging {
            pending,
            waiters: Vec::new(),
        };
    }

    fn handle_request(
        &mut self,
        from: SocketAddr,
        transaction_id: TransactionId,
        request: RequestSpecific,
    ) {
        let requester_id = request.requester_id;
        self.discovered(requester_id, from);

        let response = match request.request_type {
            RequestTypeSpecific::Ping => ResponseSpecific::Ping(PingResponseArguments {
                responder_id: self.id,
            }),
            RequestTypeSpecific::Store(args) => self.on_store(args),
            RequestTypeSpecific::FindNode(args) => self.on_find_node(requester_id, args.target),
            RequestTypeSpecific::FindValue(args) => {
                self.on_find_value(requester_id, args.idkey, args.subkey)
            }
        };

        self.transport.respond(from, transaction_id, response);
    }

    fn on_store(&mut self, args: StoreRequestArguments) -> ResponseSpecific {
        let now = Instant::now();
        let ttl = args
            .expire
            .map_or(self.config.expire_time, Duration::from_millis);

        self.cache
            .store(args.idkey, args.subkey, args.value, Some(now + ttl), now);

        ResponseSpecific::Store(StoreResponseArguments {
            responder_id: self.id,
        })
    }

    fn on_find_node(&mut self, requester_id: Id, target: Id) -> ResponseSpecific {
        let mut contacts = self.routing_table.find(&target, self.config.bucket_size);
        contacts.retain(|contact| contact.id() != &requester_id);

        ResponseSpecific::FindNode(FindNodeResponseArguments {
            responder_id: self.id,
            contacts,
        })
    }

    fn on_find_value(
        &mut self,
        requester_id: Id,
        idkey: Id,
        subkey: SubkeySelector,
    ) -> ResponseSpecific {
        let now = Instant::now();
        self.cache
            .expire(now, &self.routing_table, self.config.bucket_size);

        let values: BTreeMap<String, StoredValue> = match self.cache.subkeys(&idkey) {
            Some(entries) => entries
                .iter()
                .filter(|(name, _)| subkey.matches(name))
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        StoredValue {
                            value: entry.value.clone(),
                            expire: entry.wire_expire(now),
                        },
                    )
                })
                .collect(),
            None => BTreeMap::new(),
        };

        let contacts = if values.is_empty() {
            let mut contacts = self.routing_table.find(&idkey, self.config.bucket_size);
            contacts.retain(|contact| contact.id() != &requester_id);
            contacts
        } else {
            Vec::new()
        };

        ResponseSpecific::FindValue(FindValueResponseArguments {
            responder_id: self.id,
            contacts,
            values,
        })
    }

    /// A node was seen on the wire: try to store it, and when its bucket is
    /// full and unsplittable, verify the oldest occupant with a ping before
    /// letting the newcomer displace it. At most one such probe runs at a
    /// time.
    fn discovered(&mut self, id: Id, address: SocketAddr) {
        if id == self.id {
            return;
        }

        match self.routing_table.store(Contact::new(id, address)) {
            StoreOutcome::Stored | StoreOutcome::Ignored => {}
            StoreOutcome::Pending(oldest) => {
                if self.pending_verification.is_none() {
                    trace!(candidate = ?oldest.id(), "Verifying eviction candidate");

                    let transaction_id = self.transport.ping(oldest.address(), self.id);
                    self.pending_verification = Some(PendingVerification {
                        transaction_id,
                        current: oldest,
                        replacement: Contact::new(id, address),
                    });
                }
            }
        }
    }

    fn handle_response(
        &mut self,
        from: SocketAddr,
        transaction_id: TransactionId,
        result: Result<ResponseSpecific, RpcError>,
    ) {
        // Any responder is a live node worth remembering.
        if let Ok(response) = &result {
            self.discovered(*response.responder_id(), from);
        }

        // The eviction verification probe?
        if let Some(pending) = &self.pending_verification {
            if pending.transaction_id == transaction_id {
                let pending = self.pending_verification.take().expect("checked above");
                self.resolve_verification(pending.current, pending.replacement, &result);
                return;
            }
        }

        // A bootstrap seed ping?
        if let BootstrapState::Pinging { pending, waiters } = &mut self.bootstrap {
            if let Some(index) = pending.iter().position(|&tid| tid == transaction_id) {
                pending.remove(index);

                if pending.is_empty() {
                    let waiters = std::mem::take(waiters);
                    self.bootstrap = BootstrapState::Looking { waiters };
                    self.start_lookup(self.id, LookupKind::FindNode, None);
                }
                return;
            }
        }

        // A store fan-out request?
        let mut handled_store = None;
        for (index, (_, query)) in self.store_queries.iter_mut().enumerate() {
            if query.on_response(transaction_id, result.is_ok()) {
                handled_store = Some(index);
                break;
            }
        }
        if let Some(index) = handled_store {
            if self.store_queries[index].1.is_done() {
                let (_, query) = self.store_queries.remove(index);
                query.finish();
            }
            return;
        }

        // A lookup probe?
        let lookup_target = self.lookups.iter_mut().find_map(|(target, lookup)| {
            let borrowed = match &result {
                Ok(response) => Ok(response),
                Err(error) => Err(error),
            };
            if lookup.on_response(transaction_id, borrowed) {
                Some(*target)
            } else {
                None
            }
        });

        if let Some(target) = lookup_target {
            let mut done = false;
            if let Some(lookup) = self.lookups.get_mut(&target) {
                if !lookup.is_done() {
                    lookup.proceed(&mut self.transport, self.id);
                }
                done = lookup.is_done();
            }

            if done {
                if let Some(lookup) = self.lookups.remove(&target) {
                    self.finish_lookup(lookup);
                }
            }
        }

        // Anything else is a late reply to a fire-and-forget store; the
        // discovery above already made use of it.
    }

    fn resolve_verification(
        &mut self,
        mut current: Contact,
        replacement: Contact,
        result: &Result<ResponseSpecific, RpcError>,
    ) {
        let confirmed =
            matches!(result, Ok(response) if response.responder_id() == current.id());

        if confirmed {
            // Still alive under the same Id: keep it, now as the most
            // recently seen entry of its bucket.
            current.set_alive(true);
            self.routing_table.store(current);
        } else {
            debug!(evicted = ?current.id(), replacement = ?replacement.id(), "Evicting unresponsive contact");
            self.routing_table.remove(current.id());
            self.routing_table.store(replacement);
        }
    }

    fn start_lookup(
        &mut self,
        target: Id,
        kind: LookupKind,
        waiter: Option<Sender<LookupResult>>,
    ) {
        if let Some(waiter) = waiter {
            self.lookup_waiters.entry(target).or_default().push(waiter);
        }

        // An active lookup for this target serves the new waiter too.
        if self.lookups.contains_key(&target) {
            return;
        }

        let seeds = self.routing_table.find(&target, self.config.bucket_size);
        let mut lookup = Lookup::new(
            target,
            kind,
            self.config.bucket_size,
            self.config.concurrency,
            seeds,
        );

        lookup.proceed(&mut self.transport, self.id);

        if lookup.is_done() {
            // Nothing to probe; an empty find is not an error.
            self.finish_lookup(lookup);
        } else {
            self.lookups.insert(target, lookup);
        }
    }

    fn finish_lookup(&mut self, lookup: Lookup) {
        let kind = lookup.kind().clone();
        let result = lookup.finish();
        let target = result.target;
        let now = Instant::now();

        // The traversal just probed this region.
        self.routing_table.mark_refreshed(&target, now);

        if let LookupKind::FindValue { idkey, subkeys } = &kind {
            self.cache_at_closest(idkey, subkeys, &result);
        }

        // Store fan-outs waiting on this target start against the contacts
        // the lookup converged on.
        let mut finished = Vec::new();
        for (index, (query_target, query)) in self.store_queries.iter_mut().enumerate() {
            if *query_target == target && !query.started() {
                query.start(&mut self.transport, self.id, &result.contacts);
                if query.is_done() {
                    finished.push(index);
                }
            }
        }
        for index in finished.into_iter().rev() {
            let (_, query) = self.store_queries.remove(index);
            query.finish();
        }

        // The self-lookup closing means bootstrap is complete.
        if target == self.id {
            if let BootstrapState::Looking { waiters } = &mut self.bootstrap {
                let waiters = std::mem::take(waiters);
                self.bootstrap = BootstrapState::Done;

                let table_size = self.routing_table.size();
                debug!(id = ?self.id, table_size, "Bootstrap complete");

                for waiter in waiters {
                    let _ = waiter.send(table_size);
                }
            }
        }

        if let Some(waiters) = self.lookup_waiters.remove(&target) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// After a successful FIND_VALUE, store the values at the closest seen
    /// contact that did not return them, improving locality of future gets.
    fn cache_at_closest(
        &mut self,
        idkey: &Id,
        subkeys: &SubkeySelector,
        result: &LookupResult,
    ) {
        if result.values.is_empty() {
            return;
        }

        match subkeys {
            SubkeySelector::Single(_) => {
                let Some((subkey, found)) = result.values.iter().next() else {
                    return;
                };
                if let Some(contact) = result
                    .contacts
                    .iter()
                    .find(|c| c.id() != found.source.id())
                {
                    trace!(target = ?idkey, to = ?contact.id(), "Caching value at closest non-holder");
                    self.transport.store(
                        contact.address(),
                        self.id,
                        StoreRequestArguments {
                            idkey: *idkey,
                            subkey: subkey.clone(),
                            value: found.value.value.clone(),
                            expire: found.value.expire,
                        },
                    );
                }
            }
            _ => {
                let Some(closest) = result.contacts.first() else {
                    return;
                };
                for (subkey, found) in &result.values {
                    if found.source.id() == closest.id() {
                        continue;
                    }
                    self.transport.store(
                        closest.address(),
                        self.id,
                        StoreRequestArguments {
                            idkey: *idkey,
                            subkey: subkey.clone(),
                            value: found.value.value.clone(),
                            expire: found.value.expire,
                        },
                    );
                }
            }
        }
    }

    /// Refresh every bucket that went a full interval without a lookup in
    /// its region, rearming to the earliest future due time.
    fn maintain_routing_table(&mut self, now: Instant) {
        if now < self.next_bucket_refresh {
            return;
        }

        let (targets, next_due) = self
            .routing_table
            .refresh_targets(self.config.refresh_time, now);

        for target in targets {
            trace!(?target, "Refreshing bucket");
            self.start_lookup(target, LookupKind::FindNode, None);
        }

        let ceiling = now + self.config.refresh_time;
        self.next_bucket_refresh = next_due.unwrap_or(ceiling).min(ceiling);
    }

    /// Expire stale entries and re-store the due ones at their keys' current
    /// closest nodes. Failures never propagate out of this driver.
    fn maintain_cache(&mut self, now: Instant) {
        if now < self.next_replication {
            return;
        }

        self.cache
            .expire(now, &self.routing_table, self.config.bucket_size);

        let due = self.cache.due_replications(
            now,
            self.config.replicate_time,
            self.config.republish_time,
        );

        for (idkey, entries) in due {
            debug!(target = ?idkey, entries = entries.len(), "Replicating cache entries");

            if !self.store_queries.iter().any(|(target, _)| *target == idkey) {
                self.store_queries
                    .push((idkey, StoreQuery::new(idkey, entries, None)));
                self.start_lookup(idkey, LookupKind::FindNode, None);
            }
        }

        self.next_replication = self.cache.next_replication(
            now,
            self.config.replicate_time,
            self.config.republish_time,
        );
    }
}
