#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

mod config;
mod error;
mod key;
mod node;
mod protocol;
mod routing;
mod storage;

pub use self::config::Config;
pub use self::error::{Error, Result};
pub use self::key::Key;
pub use self::node::contact::{Contact, ContactStatus};
pub use self::node::{BucketSnapshot, FindValueResult, Node, PairSnapshot, Snapshot};

/// The number of bytes in a key.
const KEY_LENGTH: usize = 20;

/// The maximum length of the message in bytes.
const MESSAGE_LENGTH: usize = 65_507;

/// The number of k-buckets in the routing table.
const ROUTING_TABLE_SIZE: usize = KEY_LENGTH * 8;

/// The maximum number of entries in a k-bucket.
const REPLICATION_PARAM: usize = 20;

/// The maximum number of active RPCs in a lookup round.
const CONCURRENCY_PARAM: usize = 3;

/// Request timeout time in milliseconds
const REQUEST_TIMEOUT: u64 = 200;

/// Key-value pair expiration time in milliseconds
const KEY_EXPIRATION: u64 = 86_400_000;

/// Bucket refresh interval in milliseconds
const BUCKET_REFRESH_INTERVAL: u64 = 3_600_000;

/// Replication interval in milliseconds
const REPLICATE_INTERVAL: u64 = 3_600_000;

/// Republication interval in milliseconds
const REPUBLISH_INTERVAL: u64 = 86_400_000;

/// How often the maintenance thread checks its deadlines, in milliseconds
const MAINTENANCE_INTERVAL: u64 = 1000;

/// How long the receive thread blocks on the socket before checking if it was closed, in
/// milliseconds
const SOCKET_POLL_INTERVAL: u64 = 100;

/// Locks `mutex`, recovering the data if another thread panicked while holding it.
fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
