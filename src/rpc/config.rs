use std::time::Duration;

use crate::common::DEFAULT_BUCKET_SIZE;
use crate::{Error, Result};

/// Default lookup concurrency (the α of the Kademlia paper).
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default TTL for stored entries whose store request carries no expire:
/// a day, plus slack so a republish on the same cadence lands first.
pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_millis(24 * 60 * 60 * 1000 + 10_000);

/// Default bucket refresh cadence.
pub const DEFAULT_REFRESH_TIME: Duration = Duration::from_secs(60 * 60);

/// Default cache replication cadence.
pub const DEFAULT_REPLICATE_TIME: Duration = Duration::from_secs(60 * 60);

/// Default publisher republish cadence.
pub const DEFAULT_REPUBLISH_TIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
/// Dht node configuration.
pub struct Config {
    /// Max contacts per bucket and shortlist size for lookups (k).
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE]
    pub bucket_size: usize,
    /// Parallel in-flight RPCs per lookup (α).
    ///
    /// Defaults to [DEFAULT_CONCURRENCY]
    pub concurrency: usize,
    /// TTL applied when a store request omits its own.
    ///
    /// Defaults to [DEFAULT_EXPIRE_TIME]
    pub expire_time: Duration,
    /// How often each bucket is refreshed with a random-target lookup.
    ///
    /// Defaults to [DEFAULT_REFRESH_TIME]
    pub refresh_time: Duration,
    /// How often cached entries are re-stored at the key's closest nodes.
    ///
    /// Defaults to [DEFAULT_REPLICATE_TIME]
    pub replicate_time: Duration,
    /// How often the publisher re-stores its authoritative entries.
    ///
    /// Defaults to [DEFAULT_REPUBLISH_TIME]
    pub republish_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            expire_time: DEFAULT_EXPIRE_TIME,
            refresh_time: DEFAULT_REFRESH_TIME,
            replicate_time: DEFAULT_REPLICATE_TIME,
            republish_time: DEFAULT_REPUBLISH_TIME,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 {
            return Err(Error::InvalidBucketSize(self.bucket_size));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConcurrency(self.concurrency));
        }

        Ok(())
    }
}
