pub mod contact;
mod lookup;

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use time::SteadyTime;

use crate::config::Config;
use crate::error::Result;
use crate::key::Key;
use crate::node::contact::Contact;
use crate::protocol::{Message, Payload, Protocol, Reply};
use crate::routing::{RoutingTable, UpdateOutcome};
use crate::storage::Storage;
use crate::{lock, ROUTING_TABLE_SIZE};

/// The result of `Node::get`.
#[derive(Clone, Debug, PartialEq)]
pub enum FindValueResult {
    Found(String),
    /// The value was not found. Carries the closest contacts to the key.
    NotFound(Vec<Contact>),
}

/// A read-only view of a node's state.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub id: Key,
    pub port: u16,
    pub num_contacts: usize,
    pub pairs: Vec<PairSnapshot>,
    pub buckets: Vec<BucketSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PairSnapshot {
    pub key: Key,
    pub value: String,
    pub is_publisher: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct BucketSnapshot {
    pub index: usize,
    pub contacts: Vec<Contact>,
}

/// A node in the Kademlia DHT.
///
/// Cloning a `Node` yields another handle to the same node. Any number of nodes can live in the
/// same process; they only talk to each other through their sockets.
#[derive(Clone)]
pub struct Node {
    contact: Arc<Contact>,
    config: Config,
    routing_table: Arc<Mutex<RoutingTable>>,
    storage: Arc<Mutex<Storage>>,
    protocol: Arc<Protocol>,
    is_active: Arc<AtomicBool>,
    shutdown: Arc<Mutex<Option<Sender<()>>>>,
}

impl Node {
    /// Constructs a new `Node` with a random id on a specific ip and port. Port 0 binds an
    /// ephemeral port. The node does not know any peers until `join` is called.
    pub fn new(ip: &str, port: u16, config: Config) -> Result<Self> {
        Node::with_id(Key::rand(), ip, port, config)
    }

    fn with_id(id: Key, ip: &str, port: u16, config: Config) -> Result<Self> {
        let socket = UdpSocket::bind((ip, port))?;
        let (message_tx, message_rx) = channel();
        let (shutdown_tx, shutdown_rx) = channel();
        let protocol = Protocol::new(id, socket, message_tx, config.request_timeout)?;
        let contact = Contact::new(id, protocol.local_addr());

        let node = Node {
            contact: Arc::new(contact),
            config,
            routing_table: Arc::new(Mutex::new(RoutingTable::new(
                id,
                config.k,
                config.bucket_refresh_interval,
            ))),
            storage: Arc::new(Mutex::new(Storage::new(config.key_expiration))),
            protocol: Arc::new(protocol),
            is_active: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Mutex::new(Some(shutdown_tx))),
        };

        node.start_message_handler(message_rx);
        node.start_maintenance(shutdown_rx);
        info!("{:?} - Started node", node.contact);
        Ok(node)
    }

    /// Starts a thread that handles the messages received by the protocol.
    fn start_message_handler(&self, rx: Receiver<(Message, SocketAddr)>) {
        let node = self.clone();
        thread::spawn(move || {
            for (message, src_addr) in rx.iter() {
                node.handle_message(message, src_addr);
            }
            info!("{:?} - Killed message handler", node.contact);
        });
    }

    /// Starts a thread that refreshes stale routing buckets, expires key-value pairs and
    /// replicates and republishes key-value pairs when their intervals elapse. The thread stops as
    /// soon as the sending half of `shutdown` is dropped.
    fn start_maintenance(&self, shutdown: Receiver<()>) {
        let node = self.clone();
        thread::spawn(move || {
            let interval = Duration::from_millis(node.config.maintenance_interval);
            let replicate_interval =
                time::Duration::milliseconds(node.config.replicate_interval as i64);
            let republish_interval =
                time::Duration::milliseconds(node.config.republish_interval as i64);
            let mut replicate_deadline = SteadyTime::now() + replicate_interval;
            let mut republish_deadline = SteadyTime::now() + republish_interval;

            loop {
                match shutdown.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {},
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                lock(&node.storage).remove_expired();

                let stale_indexes = lock(&node.routing_table).get_stale_indexes();
                if !stale_indexes.is_empty() {
                    debug!("{:?} - Refreshing {} buckets", node.contact, stale_indexes.len());
                    node.refresh_buckets(&stale_indexes);
                }

                if SteadyTime::now() >= replicate_deadline {
                    node.replicate();
                    replicate_deadline = SteadyTime::now() + replicate_interval;
                }
                if SteadyTime::now() >= republish_deadline {
                    node.republish();
                    republish_deadline = SteadyTime::now() + republish_interval;
                }
            }
            info!("{:?} - Killed maintenance thread", node.contact);
        });
    }

    /// Bootstraps the routing table using an existing node. The node first looks up its own id
    /// to find its closest neighbours. Then it refreshes every bucket farther away than the
    /// closest neighbour. A node without `bootstrap` starts a new network.
    pub fn join(&self, bootstrap: Option<Contact>) {
        let bootstrap = match bootstrap {
            Some(bootstrap) => bootstrap,
            None => return,
        };
        info!("{:?} - Joining through {:?}", self.contact, bootstrap);

        // directly use update as the bucket of the bootstrap node is empty
        lock(&self.routing_table).update(bootstrap);
        self.lookup_nodes(&self.contact.id);
        self.refresh_beyond_nearest();
        info!(
            "{:?} - Joined with {} contacts",
            self.contact,
            lock(&self.routing_table).size()
        );
    }

    /// Refreshes every bucket farther away than the nearest non-empty one and returns their
    /// indexes.
    fn refresh_beyond_nearest(&self) -> Vec<usize> {
        let start = lock(&self.routing_table)
            .nearest_populated()
            .map_or(ROUTING_TABLE_SIZE, |index| index + 1);
        let indexes: Vec<usize> = (start..ROUTING_TABLE_SIZE).collect();
        self.refresh_buckets(&indexes);
        indexes
    }

    /// Looks up a random key in the range of each bucket in `indexes`. The lookups run in
    /// parallel and the call returns once all of them have finished.
    fn refresh_buckets(&self, indexes: &[usize]) {
        let handles: Vec<_> = indexes
            .iter()
            .map(|&index| {
                let node = self.clone();
                thread::spawn(move || node.refresh_bucket(index))
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("{:?} - Bucket refresh panicked", self.contact);
            }
        }
    }

    fn refresh_bucket(&self, index: usize) {
        let key = Key::rand_in_bucket(index, &self.contact.id);
        lock(&self.routing_table).reset_refresh(index);
        self.lookup_nodes(&key);
    }

    /// Stores every held key-value pair again, including the ones this node only caches.
    fn replicate(&self) {
        let entries = lock(&self.storage).get_entries();
        debug!("{:?} - Replicating {} pairs", self.contact, entries.len());
        for (key, value) in entries {
            self.iterative_store(key, value);
        }
    }

    /// Stores every key-value pair published by this node again. The local copy is stored again
    /// as well, so a published pair lives as long as its publisher.
    fn republish(&self) {
        let entries = lock(&self.storage).get_publisher_entries();
        debug!("{:?} - Republishing {} pairs", self.contact, entries.len());
        for (key, value) in entries {
            lock(&self.storage).insert(key, value.clone(), true);
            self.iterative_store(key, value);
        }
    }

    /// Upserts the routing table. If the bucket of the contact is full, the least recently seen
    /// contact of that bucket is pinged in the background. If it does not respond, it is evicted
    /// and the new contact takes its place. Otherwise the new contact is dropped.
    fn update_routing_table(&self, contact: Contact) {
        let outcome = lock(&self.routing_table).update(contact.clone());
        if let UpdateOutcome::Full(lrs_contact) = outcome {
            let node = self.clone();
            thread::spawn(move || {
                if node.rpc_ping(&lrs_contact) {
                    debug!(
                        "{:?} - Kept {:?}, dropped {:?}",
                        node.contact, lrs_contact, contact
                    );
                } else if lock(&node.routing_table).replace_stale(&lrs_contact, contact) {
                    debug!("{:?} - Evicted {:?}", node.contact, lrs_contact);
                }
            });
        }
    }

    /// Handles a message. The sender is first offered to the routing table, then the message is
    /// answered or handed to the request that waits for it.
    fn handle_message(&self, message: Message, src_addr: SocketAddr) {
        debug!(
            "{:?} - Receiving from {} {:?}",
            self.contact, src_addr, message.payload,
        );
        let Message {
            from_id,
            request_id,
            payload,
        } = message;
        let sender = Contact::new(from_id, src_addr);
        self.update_routing_table(sender.clone());

        let response = match payload {
            Payload::Ping => Payload::Pong,
            Payload::Store(key, value) => {
                lock(&self.storage).insert(key, value, false);
                return;
            },
            Payload::FindNode(key) => {
                Payload::Reply(Reply::Contacts(self.get_closest_for(&key, &sender)))
            },
            Payload::FindValue(key) => {
                let value = lock(&self.storage).get(&key).cloned();
                match value {
                    Some(value) => Payload::Reply(Reply::Value(value)),
                    None => Payload::Reply(Reply::Contacts(self.get_closest_for(&key, &sender))),
                }
            },
            payload => {
                let message = Message {
                    from_id,
                    request_id,
                    payload,
                };
                if !self.protocol.deliver(message) {
                    debug!(
                        "{:?} - Original request not found; irrelevant response or expired request.",
                        self.contact
                    );
                }
                return;
            },
        };

        self.protocol.reply(src_addr, request_id, response);
    }

    /// Returns the `k` closest contacts to `key` for an answer to `requester`. The `k + 1`
    /// closest are computed; the requester is removed if it is among them, otherwise the farthest
    /// one is dropped.
    fn get_closest_for(&self, key: &Key, requester: &Contact) -> Vec<Contact> {
        let mut contacts =
            lock(&self.routing_table).get_closest_contacts(key, self.config.k + 1);
        if contacts.contains(requester) {
            contacts.retain(|data| data != requester);
        } else {
            contacts.truncate(self.config.k);
        }
        contacts
    }

    /// Sends a `PING` RPC and returns `true` if a `PONG` came back in time.
    fn rpc_ping(&self, dest: &Contact) -> bool {
        match self.protocol.send_request(dest, Payload::Ping) {
            Some(Message {
                payload: Payload::Pong,
                ..
            }) => true,
            _ => false,
        }
    }

    /// Sends a `STORE` RPC. Stores are not acknowledged.
    fn rpc_store(&self, dest: &Contact, key: Key, value: String) -> bool {
        self.protocol.send(dest, Payload::Store(key, value))
    }

    /// Sends a `FIND_NODE` RPC.
    fn rpc_find_node(&self, dest: &Contact, key: &Key) -> Option<Reply> {
        self.send_find(dest, Payload::FindNode(*key))
    }

    /// Sends a `FIND_VALUE` RPC.
    fn rpc_find_value(&self, dest: &Contact, key: &Key) -> Option<Reply> {
        self.send_find(dest, Payload::FindValue(*key))
    }

    fn send_find(&self, dest: &Contact, payload: Payload) -> Option<Reply> {
        match self.protocol.send_request(dest, payload)? {
            Message {
                payload: Payload::Reply(reply),
                ..
            } => Some(reply),
            message => {
                warn!(
                    "{:?} - Unexpected answer from {:?} {:?}",
                    self.contact, dest, message.payload
                );
                None
            },
        }
    }

    /// Looks up the `k` closest nodes to `key` and sends each of them a `STORE`. Returns the
    /// number of nodes the pair was sent to.
    fn iterative_store(&self, key: Key, value: String) -> usize {
        let contacts = self.lookup_nodes(&key);
        for dest in &contacts {
            self.rpc_store(dest, key, value.clone());
        }
        debug!(
            "{:?} - Stored {:?} at {} nodes",
            self.contact,
            key,
            contacts.len()
        );
        contacts.len()
    }

    /// Inserts a key-value pair into the DHT. The pair is kept locally with this node as its
    /// publisher and sent to the `k` closest nodes to the key. Returns the number of nodes the
    /// pair was sent to.
    pub fn put(&self, key: &str, value: &str) -> usize {
        let key = Key::hash(key.as_bytes());
        lock(&self.storage).insert(key, value.to_string(), true);
        self.iterative_store(key, value.to_string())
    }

    /// Gets the value associated with a particular key in the DHT. If the key is not found, the
    /// closest contacts to the key are returned instead.
    pub fn get(&self, key: &str) -> FindValueResult {
        self.lookup_value(&Key::hash(key.as_bytes()))
    }

    /// Sends a `PING` to `dest` and returns `true` if it answered.
    pub fn ping(&self, dest: &Contact) -> bool {
        self.rpc_ping(dest)
    }

    /// Returns the `Contact` of the node, which other nodes can join through.
    pub fn contact(&self) -> Contact {
        (*self.contact).clone()
    }

    pub fn id(&self) -> Key {
        self.contact.id
    }

    /// Returns the key-value pairs and the non-empty buckets of the node.
    pub fn snapshot(&self) -> Snapshot {
        let mut pairs: Vec<PairSnapshot> = lock(&self.storage)
            .iter()
            .map(|(key, stored)| PairSnapshot {
                key: *key,
                value: stored.value.clone(),
                is_publisher: stored.is_publisher,
            })
            .collect();
        pairs.sort_by_key(|pair| pair.key);

        let buckets: Vec<BucketSnapshot> = lock(&self.routing_table)
            .populated_buckets()
            .into_iter()
            .map(|(index, contacts)| BucketSnapshot { index, contacts })
            .collect();

        Snapshot {
            id: self.contact.id,
            port: self.contact.port,
            num_contacts: buckets.iter().map(|bucket| bucket.contacts.len()).sum(),
            pairs,
            buckets,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Removes the node from the network. The socket is closed, pending requests fail and all
    /// background threads stop. Peers notice through timeouts.
    pub fn leave(&self) {
        self.is_active.store(false, Ordering::Release);
        lock(&self.shutdown).take();
        let pending_count = self.protocol.pending_count();
        self.protocol.close();
        info!(
            "{:?} - Left the network, dropped {} pending requests and {} pairs",
            self.contact,
            pending_count,
            lock(&self.storage).size()
        );
    }
}
