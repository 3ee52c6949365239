//! Kademlia routing table: a binary prefix tree of kbuckets rooted at the
//! local Id, plus a map tracking which Id currently owns each endpoint.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::{Bucket, BucketInsert, Contact, Id, LookupList, Prefix, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

#[derive(Debug, Clone)]
enum BucketTree {
    Leaf(Bucket),
    Branch {
        left: Box<BucketTree>,
        right: Box<BucketTree>,
    },
}

/// Outcome of [RoutingTable::store].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    /// The contact's Id equals the local Id; never stored.
    Ignored,
    /// The contact is in the table, inserted fresh or moved to most recent.
    Stored,
    /// The covering bucket is full and may not split; the bucket's oldest
    /// contact is returned so the caller can verify its liveness before
    /// deciding to evict it.
    Pending(Contact),
}

#[derive(Debug, Clone)]
/// Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k: usize,
    root: BucketTree,
    endpoints: HashMap<SocketAddr, Id>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given local id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            k: DEFAULT_BUCKET_SIZE,
            root: BucketTree::Leaf(Bucket::new(DEFAULT_BUCKET_SIZE, Prefix::ROOT)),
            endpoints: HashMap::new(),
        }
    }

    // === Options ===

    /// Override the bucket capacity. Only meaningful before any contact is
    /// stored.
    pub fn with_bucket_size(mut self, k: usize) -> Self {
        debug_assert!(self.is_empty());

        self.k = k;
        self.root = BucketTree::Leaf(Bucket::new(k, Prefix::ROOT));
        self
    }

    // === Getters ===

    /// Returns the local [Id], where all distances are measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    /// Returns `true` if this routing table holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        let mut count = 0;
        Self::walk(&self.root, &mut |bucket| count += bucket.len());
        count
    }

    /// All contacts in the table, in no particular order.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut out = Vec::new();
        Self::walk(&self.root, &mut |bucket| {
            out.extend(bucket.obtain(None).iter().cloned())
        });
        out
    }

    // === Public Methods ===

    /// Attempt to add a contact to the bucket covering its Id.
    ///
    /// A full bucket splits while it covers the region containing the local
    /// Id and room for a longer prefix remains; otherwise the caller gets
    /// the bucket's oldest contact back as an eviction candidate.
    ///
    /// Storing also claims the contact's endpoint: if a different Id had
    /// previously registered the same endpoint, that stale claimant is
    /// removed from the table, so a restarted or hostile peer cannot squat
    /// multiple Ids from one address.
    pub fn store(&mut self, contact: Contact) -> StoreOutcome {
        if contact.id() == &self.id {
            return StoreOutcome::Ignored;
        }

        let id = *contact.id();
        let address = contact.address();

        let outcome = Self::store_in(&mut self.root, &self.id, self.k, contact, 0, true);

        if outcome == StoreOutcome::Stored {
            self.register_endpoint(address, id);
        }

        outcome
    }

    /// Remove a contact from this routing table, along with the endpoint
    /// registration it owns.
    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let removed = Self::remove_in(&mut self.root, id, 0)?;

        if self.endpoints.get(&removed.address()) == Some(id) {
            self.endpoints.remove(&removed.address());
        }

        Some(removed)
    }

    /// Return up to `n` contacts closest to `target`, sorted by distance.
    ///
    /// Descends the matching subtree first and only widens into siblings
    /// while fewer than `n` contacts have accumulated, so no contact in the
    /// table is closer than any returned one.
    pub fn find(&self, target: &Id, n: usize) -> Vec<Contact> {
        let mut list = LookupList::new(*target, n);
        Self::collect_closest(&self.root, target, 0, n, &mut list);
        list.contacts()
    }

    /// The bucket covering `id`, its depth, and whether the path to it stayed
    /// on the local Id's prefix.
    pub fn find_bucket(&self, id: &Id) -> (&Bucket, usize, bool) {
        let mut node = &self.root;
        let mut depth = 0;
        let mut on_local_path = true;

        loop {
            match node {
                BucketTree::Leaf(bucket) => return (bucket, depth, on_local_path),
                BucketTree::Branch { left, right } => {
                    let bit = id.bit(depth);
                    on_local_path = on_local_path && bit == self.id.bit(depth);
                    node = if bit { right } else { left };
                    depth += 1;
                }
            }
        }
    }

    /// Record that the bucket covering `id` was refreshed at `now`.
    pub fn mark_refreshed(&mut self, id: &Id, now: Instant) {
        self.bucket_mut(id).mark_refreshed(now);
    }

    /// Collect a random lookup target for every bucket due for a refresh,
    /// marking them refreshed, and return the targets together with the
    /// earliest future due time among the remaining buckets.
    pub fn refresh_targets(
        &mut self,
        interval: Duration,
        now: Instant,
    ) -> (Vec<Id>, Option<Instant>) {
        let mut targets = Vec::new();
        let mut next_due: Option<Instant> = None;

        Self::refresh_walk(&mut self.root, interval, now, &mut targets, &mut next_due);

        (targets, next_due)
    }

    /// Count the contacts strictly closer to the local Id than `id` is.
    ///
    /// Estimates how many custodians stand between this node and the nominal
    /// replica set of `id`; drives the cache expiration scaling.
    pub fn count_closest_nodes(&self, id: &Id) -> usize {
        let mut count = 0;
        Self::walk(&self.root, &mut |bucket| {
            count += bucket
                .iter()
                .filter(|c| self.id.compare_distance(id, c.id()) == Ordering::Greater)
                .count();
        });
        count
    }

    // === Private Methods ===

    fn store_in(
        node: &mut BucketTree,
        local: &Id,
        k: usize,
        contact: Contact,
        depth: usize,
        on_local_path: bool,
    ) -> StoreOutcome {
        match node {
            BucketTree::Branch { left, right } => {
                let bit = contact.id().bit(depth);
                let stays_local = on_local_path && bit == local.bit(depth);
                let child = if bit { right } else { left };

                Self::store_in(child, local, k, contact, depth + 1, stays_local)
            }
            BucketTree::Leaf(bucket) => match bucket.store(contact) {
                BucketInsert::Inserted | BucketInsert::Updated => StoreOutcome::Stored,
                BucketInsert::Full(contact) => {
                    if !on_local_path || depth >= ID_BITS - 1 {
                        return StoreOutcome::Pending(
                            bucket.oldest().expect("full bucket is not empty").clone(),
                        );
                    }

                    // Split the leaf into a branch and descend again; the
                    // contact's side may still be full, in which case the
                    // split repeats one level deeper.
                    let placeholder = BucketTree::Leaf(Bucket::new(k, Prefix::ROOT));
                    let BucketTree::Leaf(bucket) = mem::replace(node, placeholder) else {
                        unreachable!()
                    };

                    let (left, right) = bucket.split(depth);
                    *node = BucketTree::Branch {
                        left: Box::new(BucketTree::Leaf(left)),
                        right: Box::new(BucketTree::Leaf(right)),
                    };

                    Self::store_in(node, local, k, contact, depth, on_local_path)
                }
            },
        }
    }

    fn remove_in(node: &mut BucketTree, id: &Id, depth: usize) -> Option<Contact> {
        match node {
            BucketTree::Leaf(bucket) => bucket.remove(id),
            BucketTree::Branch { left, right } => {
                Self::remove_in(if id.bit(depth) { right } else { left }, id, depth + 1)
            }
        }
    }

    fn register_endpoint(&mut self, address: SocketAddr, id: Id) {
        if let Some(prior) = self.endpoints.insert(address, id) {
            if prior != id {
                self.remove(&prior);
            }
        }
    }

    fn bucket_mut(&mut self, id: &Id) -> &mut Bucket {
        let mut node = &mut self.root;
        let mut depth = 0;

        loop {
            match node {
                BucketTree::Leaf(bucket) => return bucket,
                BucketTree::Branch { left, right } => {
                    node = if id.bit(depth) { right } else { left };
                    depth += 1;
                }
            }
        }
    }

    fn collect_closest(
        node: &BucketTree,
        target: &Id,
        depth: usize,
        n: usize,
        list: &mut LookupList,
    ) {
        match node {
            BucketTree::Leaf(bucket) => list.insert_many(bucket.obtain(None).iter().cloned()),
            BucketTree::Branch { left, right } => {
                let bit = target.bit(depth);
                let (matching, sibling) = if bit { (right, left) } else { (left, right) };

                Self::collect_closest(matching, target, depth + 1, n, list);
                if list.len() < n {
                    Self::collect_closest(sibling, target, depth + 1, n, list);
                }
            }
        }
    }

    fn refresh_walk(
        node: &mut BucketTree,
        interval: Duration,
        now: Instant,
        targets: &mut Vec<Id>,
        next_due: &mut Option<Instant>,
    ) {
        match node {
            BucketTree::Leaf(bucket) => match bucket.next_refresh_time(interval, now) {
                None => {
                    if let Ok(target) = bucket.random_id() {
                        bucket.mark_refreshed(now);
                        targets.push(target);
                    }
                }
                Some(due) => *next_due = Some(next_due.map_or(due, |d| d.min(due))),
            },
            BucketTree::Branch { left, right } => {
                Self::refresh_walk(left, interval, now, targets, next_due);
                Self::refresh_walk(right, interval, now, targets, next_due);
            }
        }
    }

    fn walk<'a>(node: &'a BucketTree, f: &mut impl FnMut(&'a Bucket)) {
        match node {
            BucketTree::Leaf(bucket) => f(bucket),
            BucketTree::Branch { left, right } => {
                Self::walk(left, f);
                Self::walk(right, f);
            }
        }
    }

    #[cfg(test)]
    fn contains(&self, id: &Id) -> bool {
        let (bucket, _, _) = self.find_bucket(id);
        bucket.iter().any(|c| c.id() == id)
    }

    #[cfg(test)]
    fn prefixes_match_paths(&self) -> bool {
        fn check(node: &BucketTree, path: &mut Vec<bool>) -> bool {
            match node {
                BucketTree::Leaf(bucket) => {
                    bucket.prefix().len() == path.len()
                        && bucket
                            .iter()
                            .all(|c| (0..path.len()).all(|i| c.id().bit(i) == path[i]))
                }
                BucketTree::Branch { left, right } => {
                    path.push(false);
                    let left_ok = check(left, path);
                    path.pop();

                    path.push(true);
                    let right_ok = check(right, path);
                    path.pop();

                    left_ok && right_ok
                }
            }
        }

        check(&self.root, &mut Vec::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id_with_bytes(first: u8, last: u8) -> Id {
        let mut bytes = [0_u8; 20];
        bytes[0] = first;
        bytes[19] = last;
        Id::from_bytes(bytes).unwrap()
    }

    fn contact_at(id: Id, port: u16) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.store(Contact::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn should_not_store_self() {
        let mut table = RoutingTable::new(Id::random());
        let contact = Contact::new(*table.id(), SocketAddr::from(([0, 0, 0, 0], 0)));

        assert_eq!(table.store(contact), StoreOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let contact = Contact::random();
        table.store(contact.clone());
        table.store(contact);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn split_boundary() {
        // Local Id all zeros, k = 2.
        let mut table = RoutingTable::new(Id::ZERO).with_bucket_size(2);

        let near_1 = id_with_bytes(0x00, 0x01);
        let near_2 = id_with_bytes(0x00, 0x02);
        let far_1 = id_with_bytes(0x80, 0x01);
        let far_2 = id_with_bytes(0x80, 0x02);
        let far_3 = id_with_bytes(0x80, 0x03);

        for (i, id) in [near_1, near_2, far_1, far_2].iter().enumerate() {
            assert_eq!(
                table.store(contact_at(*id, i as u16 + 1)),
                StoreOutcome::Stored
            );
        }

        // The right subtree (prefix 1) is full and off the local path: the
        // fifth contact is rejected with the oldest of that side as the
        // eviction candidate.
        match table.store(contact_at(far_3, 5)) {
            StoreOutcome::Pending(oldest) => assert_eq!(oldest.id(), &far_1),
            other => panic!("expected eviction candidate, got {other:?}"),
        }

        let (right, depth, on_local_path) = table.find_bucket(&far_1);
        assert_eq!(depth, 1);
        assert!(!on_local_path);
        let right_ids: Vec<_> = right.iter().map(|c| *c.id()).collect();
        assert_eq!(right_ids, vec![far_1, far_2]);

        let (left, _, on_local_path) = table.find_bucket(&near_1);
        assert!(on_local_path);
        let left_ids: Vec<_> = left.iter().map(|c| *c.id()).collect();
        assert_eq!(left_ids, vec![near_1, near_2]);

        assert!(table.prefixes_match_paths());
    }

    #[test]
    fn deep_splits_keep_prefixes_consistent() {
        let local = Id::random();
        let mut table = RoutingTable::new(local).with_bucket_size(2);

        // Contacts near the local id force repeated splits along its path.
        for i in 0..64_u16 {
            let id = Id::random().with_prefix(&local, (i % 32) as usize).unwrap();
            table.store(contact_at(id, i + 1));
        }

        assert!(table.prefixes_match_paths());
    }

    #[test]
    fn endpoint_rebinding() {
        let mut table = RoutingTable::new(Id::random());

        let x = Id::random();
        let y = Id::random();
        let endpoint = SocketAddr::from(([127, 0, 0, 1], 4000));

        assert_eq!(table.store(Contact::new(x, endpoint)), StoreOutcome::Stored);
        assert!(table.contains(&x));

        // A different Id claiming the same endpoint evicts the prior one.
        assert_eq!(table.store(Contact::new(y, endpoint)), StoreOutcome::Stored);
        assert!(!table.contains(&x));
        assert!(table.contains(&y));
        assert_eq!(table.endpoints.get(&endpoint), Some(&y));
    }

    #[test]
    fn find_returns_the_closest_contacts() {
        let mut table = RoutingTable::new(Id::random());

        for i in 0..100_u16 {
            table.store(contact_at(Id::random(), i + 1));
        }

        let target = Id::random();
        let found = table.find(&target, 20);

        assert_eq!(found.len(), 20);

        let mut all = table.contacts();
        all.sort_by(|a, b| target.compare_distance(a.id(), b.id()));

        let expected: Vec<_> = all.iter().take(20).map(|c| *c.id()).collect();
        let found_ids: Vec<_> = found.iter().map(|c| *c.id()).collect();

        assert_eq!(found_ids, expected);
    }

    #[test]
    fn count_closest_nodes() {
        let mut table = RoutingTable::new(Id::ZERO);

        // With a zero local id, distance to it is the id itself.
        table.store(contact_at(id_with_bytes(0, 0x01), 1));
        table.store(contact_at(id_with_bytes(0, 0x02), 2));
        table.store(contact_at(id_with_bytes(0x20, 0), 3));

        let target = id_with_bytes(0, 0x10);
        assert_eq!(table.count_closest_nodes(&target), 2);
    }

    #[test]
    fn refresh_targets_cover_due_buckets() {
        let mut table = RoutingTable::new(Id::ZERO).with_bucket_size(2);
        let interval = Duration::from_secs(3600);
        let now = Instant::now();

        for i in 0..8_u16 {
            table.store(contact_at(Id::random(), i + 1));
        }

        let (targets, next_due) = table.refresh_targets(interval, now);
        assert!(!targets.is_empty());
        assert_eq!(next_due, None);

        // Everything just refreshed: nothing due, earliest future time known.
        let (targets, next_due) = table.refresh_targets(interval, now);
        assert!(targets.is_empty());
        assert_eq!(next_due, Some(now + interval));
    }
}
