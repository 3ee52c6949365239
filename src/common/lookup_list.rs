//! Bounded shortlist of lookup candidates, sorted by XOR distance to a fixed
//! target.
use crate::common::{Contact, Id};

#[derive(Debug, Clone)]
struct LookupEntry {
    contact: Contact,
    queried: bool,
}

#[derive(Debug, Clone)]
/// At most `capacity` contacts, ascending by distance to `target`, each with
/// an "already queried" flag. Duplicate Ids are ignored; overflow drops the
/// farthest entry.
pub struct LookupList {
    target: Id,
    capacity: usize,
    entries: Vec<LookupEntry>,
}

impl LookupList {
    pub fn new(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All contacts in distance order.
    pub fn contacts(&self) -> Vec<Contact> {
        self.entries.iter().map(|e| e.contact.clone()).collect()
    }

    /// True while some contact has not been handed out by [LookupList::next].
    pub fn has_unqueried(&self) -> bool {
        self.entries.iter().any(|e| !e.queried)
    }

    // === Public Methods ===

    /// Insert keeping the distance order; returns `true` if the contact was
    /// added.
    pub fn insert(&mut self, contact: Contact) -> bool {
        if self.entries.iter().any(|e| e.contact.id() == contact.id()) {
            return false;
        }

        let distance = self.target.xor(contact.id());
        let position = self
            .entries
            .partition_point(|e| self.target.xor(e.contact.id()) <= distance);

        if position == self.capacity {
            return false;
        }

        self.entries.insert(
            position,
            LookupEntry {
                contact,
                queried: false,
            },
        );
        self.entries.truncate(self.capacity);

        true
    }

    pub fn insert_many<I: IntoIterator<Item = Contact>>(&mut self, contacts: I) {
        for contact in contacts {
            self.insert(contact);
        }
    }

    /// The closest contact not yet queried, marking it queried.
    pub fn next(&mut self) -> Option<Contact> {
        let entry = self.entries.iter_mut().find(|e| !e.queried)?;
        entry.queried = true;

        Some(entry.contact.clone())
    }

    /// Drop a contact, typically after its RPC failed. It may be re-inserted
    /// from another responder's reply.
    pub fn remove(&mut self, id: &Id) {
        self.entries.retain(|e| e.contact.id() != id);
    }
}
