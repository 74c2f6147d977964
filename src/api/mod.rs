//! Purpose: Define the public Rust API boundary for redump.
//! Exports: Pipelines, configs, the store client seam, the line codec, and errors.
//! Role: Stable surface used by the CLI and tests; hides queue and cancellation internals.
//! Invariants: This module is the only public path to core types.

mod dump;
mod redis_client;
mod restore;
mod workers;

pub use crate::core::cancel::AbortHandle;
pub use crate::core::client::{Reply, ScanPage, StoreClient, parse_scan_reply};
pub use crate::core::codec::{KeyData, SEPARATOR, decode, encode};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{ApiResult, Error, ErrorKind};
pub use dump::{DumpConfig, DumpOutcome, Dumper};
pub use redis_client::{
    CLIENT_NAME, ClientConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MIN_IDLE, DEFAULT_PORT,
    MAX_DATABASE, RedisClient,
};
pub use restore::{RestoreConfig, RestoreOutcome, Restorer, open_restore_file};
pub use workers::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SCAN_COUNT, default_workers};
