use std::path::PathBuf;

use anyhow::Context as _;
use serde::Deserialize;

use everstore_kvstore_sqlite::DEFAULT_SHARDS;
use everstore_store::{DEFAULT_MIN_DATA_AGE, DEFAULT_QUEUE_AGE_CAP, DEFAULT_TXN_SIZE};

/// When set, mutations are never queued for persistence (pure cache mode).
pub const ENV_NO_PERSISTENCE: &str = "EP_NO_PERSISTENCE";
/// When set, shutdown fails loudly if any entry is still dirty after the
/// final drain.
pub const ENV_VERIFY_SHUTDOWN_FLUSH: &str = "EP_VERIFY_SHUTDOWN_FLUSH";

/// Engine configuration, deserializable from a TOML table.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Backing store database path; `:memory:` keeps it in memory.
    pub dbname: String,
    /// SQL script applied when the backing store is opened.
    pub initfile: Option<PathBuf>,
    /// Load the backing store into memory at startup; when false the
    /// engine starts empty instead.
    pub warmup: bool,
    /// Block engine construction until warmup has finished.
    pub waitforwarmup: bool,
    /// Seconds a disconnected tap subscriber is retained for reconnect.
    pub tap_keepalive: u64,
    /// Number of sharded tables in the backing store.
    pub db_shards: usize,
    pub min_data_age: u64,
    pub queue_age_cap: u64,
    pub txn_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dbname: "/tmp/test.db".into(),
            initfile: None,
            warmup: true,
            waitforwarmup: true,
            tap_keepalive: 0,
            db_shards: DEFAULT_SHARDS,
            min_data_age: DEFAULT_MIN_DATA_AGE,
            queue_age_cap: DEFAULT_QUEUE_AGE_CAP,
            txn_size: DEFAULT_TXN_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(table: toml::Table) -> anyhow::Result<Self> {
        table
            .try_into()
            .context("could not parse engine configuration")
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("could not parse engine configuration")
    }
}
