use crate::{
    BUCKET_REFRESH_INTERVAL, CONCURRENCY_PARAM, KEY_EXPIRATION, MAINTENANCE_INTERVAL,
    REPLICATE_INTERVAL, REPLICATION_PARAM, REPUBLISH_INTERVAL, REQUEST_TIMEOUT,
};

/// Protocol constants of a node. All times are in milliseconds.
///
/// Every node in a network is expected to run with the same values; nothing here is negotiated
/// between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// How long to wait for a reply before a request is considered failed.
    pub request_timeout: u64,
    /// The number of parallel queries in a lookup round.
    pub alpha: usize,
    /// The k-bucket capacity, also the lookup result size and replication factor.
    pub k: usize,
    /// How long a key-value pair lives at a node without being stored again.
    pub key_expiration: u64,
    /// How long a bucket may go without a lookup touching it before it is refreshed.
    pub bucket_refresh_interval: u64,
    /// How often every held key-value pair is stored again.
    pub replicate_interval: u64,
    /// How often the key-value pairs published by this node are stored again.
    pub republish_interval: u64,
    /// Granularity of the maintenance thread.
    pub maintenance_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            request_timeout: REQUEST_TIMEOUT,
            alpha: CONCURRENCY_PARAM,
            k: REPLICATION_PARAM,
            key_expiration: KEY_EXPIRATION,
            bucket_refresh_interval: BUCKET_REFRESH_INTERVAL,
            replicate_interval: REPLICATE_INTERVAL,
            republish_interval: REPUBLISH_INTERVAL,
            maintenance_interval: MAINTENANCE_INTERVAL,
        }
    }
}
