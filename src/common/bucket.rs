//! Kbucket: a capacity-bounded, oldest-first list of contacts covering one
//! binary prefix region of the Id space.
use std::fmt::{self, Debug, Formatter};
use std::time::{Duration, Instant};

use crate::common::{Contact, Id, ID_BITS};
use crate::Result;

#[derive(Clone, Copy, PartialEq, Eq)]
/// The first `len` bits of `bits`; the region of the Id space a bucket covers.
pub struct Prefix {
    bits: Id,
    len: usize,
}

impl Prefix {
    /// The empty prefix covering the entire Id space.
    pub const ROOT: Prefix = Prefix {
        bits: Id::ZERO,
        len: 0,
    };

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if the first `len` bits of `id` equal this prefix.
    pub fn covers(&self, id: &Id) -> bool {
        (0..self.len).all(|i| id.bit(i) == self.bits.bit(i))
    }

    /// The prefix one bit longer, extended with `bit`.
    pub fn child(&self, bit: bool) -> Prefix {
        debug_assert!(self.len < ID_BITS);

        let mut raw = *self.bits.as_bytes();
        if bit {
            raw[self.len / 8] |= 1 << (7 - (self.len % 8));
        }

        Prefix {
            bits: Id::from_bytes(raw).expect("infallible"),
            len: self.len + 1,
        }
    }

    /// A weakly random Id within this prefix region.
    pub fn random_id(&self) -> Result<Id> {
        Id::random_weak().with_prefix(&self.bits, self.len)
    }
}

impl Debug for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix(")?;
        for i in 0..self.len {
            write!(f, "{}", self.bits.bit(i) as u8)?;
        }
        write!(f, ")")
    }
}

/// Outcome of [Bucket::store].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketInsert {
    /// The contact was appended as the most recently seen entry.
    Inserted,
    /// A contact with this Id was already present and moved to the tail.
    Updated,
    /// The bucket is at capacity; the contact is handed back and the caller
    /// decides about splitting or eviction.
    Full(Contact),
}

#[derive(Debug, Clone)]
/// A leaf of the routing tree: up to `k` contacts ordered oldest first, plus
/// the last time this region was refreshed with a random-target lookup.
pub struct Bucket {
    k: usize,
    prefix: Prefix,
    contacts: Vec<Contact>,
    refreshed_at: Option<Instant>,
}

impl Bucket {
    pub fn new(k: usize, prefix: Prefix) -> Self {
        Bucket {
            k,
            prefix,
            contacts: Vec::with_capacity(k),
            refreshed_at: None,
        }
    }

    // === Getters ===

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() == self.k
    }

    /// The least recently seen contact; the eviction candidate when full.
    pub fn oldest(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Contact> {
        self.contacts.iter()
    }

    // === Public Methods ===

    /// Add a contact, or move an already known Id to the most recent end.
    pub fn store(&mut self, contact: Contact) -> BucketInsert {
        if let Some(index) = self.contacts.iter().position(|c| c.id() == contact.id()) {
            self.contacts.remove(index);
            self.contacts.push(contact);

            BucketInsert::Updated
        } else if self.contacts.len() == self.k {
            BucketInsert::Full(contact)
        } else {
            debug_assert!(self.prefix.covers(contact.id()));
            self.contacts.push(contact);

            BucketInsert::Inserted
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.contacts.iter().position(|c| c.id() == id)?;

        Some(self.contacts.remove(index))
    }

    /// Up to the first `count` contacts in oldest-first order, or all of them.
    pub fn obtain(&self, count: Option<usize>) -> &[Contact] {
        match count {
            Some(n) => &self.contacts[..n.min(self.contacts.len())],
            None => &self.contacts,
        }
    }

    /// Distribute this bucket's contacts into two children by their `depth`th
    /// bit, preserving relative order within each side.
    pub fn split(self, depth: usize) -> (Bucket, Bucket) {
        debug_assert_eq!(depth, self.prefix.len());

        let mut left = Bucket::new(self.k, self.prefix.child(false));
        let mut right = Bucket::new(self.k, self.prefix.child(true));

        left.refreshed_at = self.refreshed_at;
        right.refreshed_at = self.refreshed_at;

        for contact in self.contacts {
            if contact.id().bit(depth) {
                right.contacts.push(contact);
            } else {
                left.contacts.push(contact);
            }
        }

        (left, right)
    }

    /// A weakly random Id within this bucket's region, used as a refresh
    /// lookup target.
    pub fn random_id(&self) -> Result<Id> {
        self.prefix.random_id()
    }

    /// `None` if this bucket is due for a refresh (never refreshed, or the
    /// interval elapsed); otherwise the instant it becomes due.
    pub fn next_refresh_time(&self, interval: Duration, now: Instant) -> Option<Instant> {
        let due = self.refreshed_at? + interval;
        if due <= now {
            None
        } else {
            Some(due)
        }
    }

    pub fn mark_refreshed(&mut self, now: Instant) {
        self.refreshed_at = Some(now);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn contact_with_first_byte(byte: u8) -> Contact {
        let mut bytes = [0_u8; 20];
        bytes[0] = byte;
        bytes[19] = byte;

        Contact::new(
            Id::from_bytes(bytes).unwrap(),
            std::net::SocketAddr::from(([0, 0, 0, 0], 0)),
        )
    }

    #[test]
    fn capacity_bound() {
        let mut bucket = Bucket::new(2, Prefix::ROOT);

        assert_eq!(bucket.store(Contact::random()), BucketInsert::Inserted);
        assert_eq!(bucket.store(Contact::random()), BucketInsert::Inserted);

        let rejected = Contact::random();
        assert_eq!(
            bucket.store(rejected.clone()),
            BucketInsert::Full(rejected)
        );
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn known_id_moves_to_tail() {
        let mut bucket = Bucket::new(3, Prefix::ROOT);

        let first = Contact::random();
        bucket.store(first.clone());
        bucket.store(Contact::random());

        assert_eq!(bucket.oldest().unwrap().id(), first.id());

        assert_eq!(bucket.store(first.clone()), BucketInsert::Updated);
        assert_eq!(bucket.len(), 2);
        assert_ne!(bucket.oldest().unwrap().id(), first.id());
        assert_eq!(bucket.obtain(None).last().unwrap().id(), first.id());
    }

    #[test]
    fn obtain_is_oldest_first() {
        let mut bucket = Bucket::new(4, Prefix::ROOT);

        let contacts: Vec<_> = (0..4_u8).map(|i| contact_with_first_byte(i + 1)).collect();
        for contact in &contacts {
            bucket.store(contact.clone());
        }

        assert_eq!(bucket.obtain(None), &contacts[..]);
        assert_eq!(bucket.obtain(Some(2)), &contacts[..2]);
        assert_eq!(bucket.obtain(Some(10)).len(), 4);
    }

    #[test]
    fn split_distributes_by_bit() {
        let mut bucket = Bucket::new(4, Prefix::ROOT);

        let low_a = contact_with_first_byte(0x01);
        let low_b = contact_with_first_byte(0x02);
        let high_a = contact_with_first_byte(0x81);
        let high_b = contact_with_first_byte(0x82);

        for contact in [&high_a, &low_a, &high_b, &low_b] {
            bucket.store((*contact).clone());
        }

        let (left, right) = bucket.split(0);

        assert_eq!(left.obtain(None), &[low_a.clone(), low_b.clone()]);
        assert_eq!(right.obtain(None), &[high_a.clone(), high_b.clone()]);
        assert_eq!(left.prefix().len(), 1);
        assert!(!left.prefix().covers(high_b.id()));
    }

    #[test]
    fn random_id_stays_in_prefix() {
        let prefix = Prefix::ROOT.child(true).child(false).child(true);

        for _ in 0..32 {
            assert!(prefix.covers(&prefix.random_id().unwrap()));
        }
    }

    #[test]
    fn refresh_schedule() {
        let mut bucket = Bucket::new(2, Prefix::ROOT);
        let now = Instant::now();
        let interval = Duration::from_secs(3600);

        // Never refreshed: due immediately.
        assert_eq!(bucket.next_refresh_time(interval, now), None);

        bucket.mark_refreshed(now);
        assert_eq!(bucket.next_refresh_time(interval, now), Some(now + interval));
        assert_eq!(bucket.next_refresh_time(interval, now + interval), None);
    }
}
