// Worker-pool sizing, validation, and join helpers shared by dump and restore.
use std::thread::ScopedJoinHandle;

use crate::core::error::{ApiResult, Error, ErrorKind};

pub const DEFAULT_QUEUE_CAPACITY: usize = 500;
pub const DEFAULT_SCAN_COUNT: usize = 500;

const MAX_SNIPPET_BYTES: usize = 80;

/// Two workers per available CPU.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_mul(2)
}

pub(crate) fn validate_pool(workers: usize, queue_capacity: usize) -> ApiResult<()> {
    if workers == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("workers must be at least 1")
            .with_hint("Omit --workers to use two per CPU."));
    }
    if queue_capacity == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("queue capacity must be at least 1"));
    }
    Ok(())
}

pub(crate) fn join_worker<T>(handle: ScopedJoinHandle<'_, T>, role: &str) -> ApiResult<T> {
    handle.join().map_err(|_| {
        Error::new(ErrorKind::Internal).with_message(format!("{role} worker panicked"))
    })
}

/// Shorten a dump line for log output, respecting char boundaries.
pub(crate) fn snippet(line: &str) -> String {
    if line.len() <= MAX_SNIPPET_BYTES {
        return line.to_string();
    }
    let suffix = "...";
    let mut take = MAX_SNIPPET_BYTES - suffix.len();
    while !line.is_char_boundary(take) {
        take -= 1;
    }
    format!("{}{suffix}", &line[..take])
}
