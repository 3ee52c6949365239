//! Dht node: a cloneable handle around the actor thread that owns the
//! engine.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};

use crate::common::messages::SubkeySelector;
use crate::common::Id;
use crate::rpc::{Config, Info, LookupResult, Rpc, StoreReceipt};
use crate::transport::Transport;
use crate::Result;

/// A key given to the public API: an [Id] used as-is, or a string hashed
/// into one with SHA-1.
#[derive(Debug, Clone)]
pub enum KeyInput {
    Id(Id),
    Str(String),
}

impl KeyInput {
    fn resolve(&self) -> Id {
        match self {
            KeyInput::Id(id) => *id,
            KeyInput::Str(s) => Id::from_key(s),
        }
    }

    /// The subkey used when none is given: the key itself.
    fn default_subkey(&self) -> String {
        match self {
            KeyInput::Id(id) => id.to_string(),
            KeyInput::Str(s) => s.clone(),
        }
    }
}

impl From<Id> for KeyInput {
    fn from(id: Id) -> Self {
        KeyInput::Id(id)
    }
}

impl From<&str> for KeyInput {
    fn from(s: &str) -> Self {
        KeyInput::Str(s.to_string())
    }
}

impl From<String> for KeyInput {
    fn from(s: String) -> Self {
        KeyInput::Str(s)
    }
}

pub(crate) enum ActorMessage {
    Shutdown,
    AwaitBootstrap(Sender<usize>),
    Put {
        target: Id,
        entries: Vec<(String, Bytes)>,
        sender: Sender<StoreReceipt>,
    },
    Get {
        target: Id,
        subkeys: SubkeySelector,
        sender: Sender<LookupResult>,
    },
    Peek {
        target: Id,
        subkeys: SubkeySelector,
        sender: Sender<BTreeMap<String, Bytes>>,
    },
    Info(Sender<Info>),
}

#[derive(Debug)]
pub struct Dht {
    sender: Sender<ActorMessage>,
    handle: Option<JoinHandle<()>>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht {
            sender: self.sender.clone(),
            handle: None,
        }
    }
}

impl Dht {
    /// Construct the engine, spawn the actor thread that owns it, and start
    /// bootstrapping from the seeds.
    pub fn spawn<T: Transport>(
        transport: T,
        seeds: Vec<SocketAddr>,
        config: Config,
    ) -> Result<Dht> {
        let rpc = Rpc::new(transport, &seeds, config)?;

        let (sender, receiver) = flume::unbounded();
        let handle = thread::spawn(move || run(rpc, receiver));

        Ok(Dht {
            sender,
            handle: Some(handle),
        })
    }

    // === Public Methods ===

    pub fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }

    /// Shut the node down and wait for its actor thread to exit.
    pub fn block_until_shutdown(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Block until bootstrap completes, returning the routing table size.
    pub fn bootstrapped(&self) -> Result<usize> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::AwaitBootstrap(sender))?;

        Ok(receiver.recv()?)
    }

    pub fn info(&self) -> Result<Info> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::Info(sender))?;

        Ok(receiver.recv()?)
    }

    /// Store `value` under `key`; the subkey defaults to the key itself.
    pub fn set<K: Into<KeyInput>, V: Into<Bytes>>(&self, key: K, value: V) -> Result<StoreReceipt> {
        let key = key.into();
        let subkey = key.default_subkey();

        self.multiset(key, &subkey, value)
    }

    /// Store `value` under `(key, subkey)` at the key's closest nodes.
    pub fn multiset<K: Into<KeyInput>, V: Into<Bytes>>(
        &self,
        key: K,
        subkey: &str,
        value: V,
    ) -> Result<StoreReceipt> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::Put {
            target: key.into().resolve(),
            entries: vec![(subkey.to_string(), value.into())],
            sender,
        })?;

        Ok(receiver.recv()?)
    }

    /// Retrieve the value under `key`'s default subkey. `None` means no
    /// responder had it, not that it exists nowhere.
    pub fn get<K: Into<KeyInput>>(&self, key: K) -> Result<Option<Bytes>> {
        let key = key.into();
        let subkey = key.default_subkey();

        let mut values = self.multiget(key, SubkeySelector::Single(subkey.clone()))?;
        Ok(values.remove(&subkey))
    }

    /// Retrieve every subkey stored under `key` across the network.
    pub fn get_all<K: Into<KeyInput>>(&self, key: K) -> Result<BTreeMap<String, Bytes>> {
        self.multiget(key, SubkeySelector::All)
    }

    /// Retrieve the selected subkeys under `key`. A single explicit subkey
    /// may be served from the local cache; wider selections always consult
    /// the network.
    pub fn multiget<K: Into<KeyInput>>(
        &self,
        key: K,
        subkeys: SubkeySelector,
    ) -> Result<BTreeMap<String, Bytes>> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::Get {
            target: key.into().resolve(),
            subkeys,
            sender,
        })?;

        let result = receiver.recv()?;
        Ok(result
            .values
            .into_iter()
            .map(|(subkey, found)| (subkey, found.value.value))
            .collect())
    }

    /// Local cache read of `key`'s default subkey; never touches the
    /// network.
    pub fn peek<K: Into<KeyInput>>(&self, key: K) -> Result<Option<Bytes>> {
        let key = key.into();
        let subkey = key.default_subkey();

        let mut values = self.peek_with(key, SubkeySelector::Single(subkey.clone()))?;
        Ok(values.remove(&subkey))
    }

    /// Local cache read of every subkey under `key`.
    pub fn peek_all<K: Into<KeyInput>>(&self, key: K) -> Result<BTreeMap<String, Bytes>> {
        self.peek_with(key.into(), SubkeySelector::All)
    }

    // === Private Methods ===

    fn peek_with(&self, key: KeyInput, subkeys: SubkeySelector) -> Result<BTreeMap<String, Bytes>> {
        let (sender, receiver) = flume::bounded(1);
        self.sender.send(ActorMessage::Peek {
            target: key.resolve(),
            subkeys,
            sender,
        })?;

        Ok(receiver.recv()?)
    }
}

fn run<T: Transport>(mut rpc: Rpc<T>, receiver: Receiver<ActorMessage>) {
    loop {
        loop {
            match receiver.try_recv() {
                Ok(ActorMessage::Shutdown) => return,
                Ok(message) => handle_message(&mut rpc, message),
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => return,
            }
        }

        rpc.tick();

        // Tick-driven engine; yield between ticks instead of spinning.
        thread::sleep(Duration::from_millis(1));
    }
}

fn handle_message<T: Transport>(rpc: &mut Rpc<T>, message: ActorMessage) {
    match message {
        // Handled by the run loop.
        ActorMessage::Shutdown => {}
        ActorMessage::AwaitBootstrap(sender) => rpc.await_bootstrap(sender),
        ActorMessage::Put {
            target,
            entries,
            sender,
        } => rpc.put(target, entries, Some(sender)),
        ActorMessage::Get {
            target,
            subkeys,
            sender,
        } => rpc.get(target, subkeys, sender),
        ActorMessage::Peek {
            target,
            subkeys,
            sender,
        } => {
            let _ = sender.send(rpc.peek(target, subkeys));
        }
        ActorMessage::Info(sender) => {
            let _ = sender.send(rpc.info());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testnet::Testnet;

    #[test]
    fn shutdown() {
        let testnet = Testnet::new();
        let dht = Dht::spawn(testnet.transport(), vec![], Config::default()).unwrap();

        let clone = dht.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            clone.shutdown();
        });

        dht.block_until_shutdown();
    }

    #[test]
    fn single_node_publish_peek() {
        let testnet = Testnet::new();
        let dht = Dht::spawn(testnet.transport(), vec![], Config::default()).unwrap();

        assert_eq!(dht.bootstrapped().unwrap(), 0);

        let receipt = dht.set("hello", "world").unwrap();
        assert_eq!(receipt.contacts, 0);

        assert_eq!(dht.peek("hello").unwrap().as_deref(), Some(&b"world"[..]));
        assert_eq!(dht.info().unwrap().cache_size, 1);

        // Absent keys read back as None, which is not an error.
        assert_eq!(dht.peek("missing").unwrap(), None);
        assert_eq!(dht.get("missing").unwrap(), None);

        dht.block_until_shutdown();
    }
}
