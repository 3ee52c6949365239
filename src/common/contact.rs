//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::common::Id;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A known remote node: an [Id] paired with the opaque endpoint it was seen at.
///
/// The endpoint is never interpreted beyond equality; it is handed back to
/// the transport as-is. On the wire a contact carries `{id, address}` only;
/// the liveness counter is local state.
pub struct Contact {
    id: Id,
    address: SocketAddr,
    #[serde(skip)]
    dead_count: u32,
}

impl Debug for Contact {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("dead_count", &self.dead_count)
            .finish()
    }
}

impl Contact {
    /// Creates a new Contact from an id and endpoint address, initially alive.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            dead_count: 0,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// A contact is alive while it has no unanswered liveness probes.
    pub fn is_alive(&self) -> bool {
        self.dead_count == 0
    }

    // === Public Methods ===

    /// Reset the liveness counter on a successful probe, or bump it on a
    /// failed one.
    pub fn set_alive(&mut self, alive: bool) {
        if alive {
            self.dead_count = 0;
        } else {
            self.dead_count += 1;
        }
    }

    /// Creates a contact with a random Id for testing purposes.
    pub fn random() -> Contact {
        Contact::new(Id::random(), SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}
