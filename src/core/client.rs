// Store client seam consumed by the dump and restore pipelines.
use std::sync::Arc;

use tracing::warn;

use crate::core::error::{ApiResult, Error, ErrorKind};

/// A decoded store reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Bulk(Vec<u8>),
    Status(String),
    Array(Vec<Reply>),
    Other(String),
}

impl Reply {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Reply::Nil => "nil",
            Reply::Int(_) => "integer",
            Reply::Bulk(_) => "bulk string",
            Reply::Status(_) => "status",
            Reply::Array(_) => "array",
            Reply::Other(_) => "other",
        }
    }
}

/// One page of a cursor scan. `cursor == 0` means the scan is complete.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanPage {
    pub keys: Vec<Vec<u8>>,
    pub cursor: u64,
}

/// Command execution against a key-value store.
///
/// Implementations own connection management; callers may invoke every
/// method from many threads at once.
pub trait StoreClient: Send + Sync {
    fn execute(&self, command: &str, args: &[&[u8]]) -> ApiResult<Reply>;

    /// Fetch one page of keys starting at `cursor`.
    fn scan(&self, cursor: u64, count: usize) -> ApiResult<ScanPage> {
        let cursor = cursor.to_string();
        let count = count.to_string();
        let reply = self.execute("SCAN", &[cursor.as_bytes(), &b"COUNT"[..], count.as_bytes()])?;
        parse_scan_reply(reply)
    }

    fn ping(&self) -> ApiResult<()> {
        match self.execute("PING", &[])? {
            Reply::Status(_) | Reply::Bulk(_) => Ok(()),
            other => Err(Error::new(ErrorKind::Protocol)
                .with_message(format!("unexpected PING reply: {}", other.kind_name()))),
        }
    }

    /// Release pooled connections. Later commands fail with `Connection`.
    fn close(&self) -> ApiResult<()>;
}

impl<T: StoreClient + ?Sized> StoreClient for &T {
    fn execute(&self, command: &str, args: &[&[u8]]) -> ApiResult<Reply> {
        (**self).execute(command, args)
    }

    fn scan(&self, cursor: u64, count: usize) -> ApiResult<ScanPage> {
        (**self).scan(cursor, count)
    }

    fn ping(&self) -> ApiResult<()> {
        (**self).ping()
    }

    fn close(&self) -> ApiResult<()> {
        (**self).close()
    }
}

impl<T: StoreClient + ?Sized> StoreClient for Arc<T> {
    fn execute(&self, command: &str, args: &[&[u8]]) -> ApiResult<Reply> {
        (**self).execute(command, args)
    }

    fn scan(&self, cursor: u64, count: usize) -> ApiResult<ScanPage> {
        (**self).scan(cursor, count)
    }

    fn ping(&self) -> ApiResult<()> {
        (**self).ping()
    }

    fn close(&self) -> ApiResult<()> {
        (**self).close()
    }
}

/// Parse a `SCAN` reply of the shape `[cursor, [key, ...]]`.
///
/// Non-bulk entries in the key array are logged and skipped.
pub fn parse_scan_reply(reply: Reply) -> ApiResult<ScanPage> {
    let Reply::Array(parts) = reply else {
        return Err(protocol_error(format!(
            "SCAN reply was {}, expected array",
            reply.kind_name()
        )));
    };
    let [cursor, keys]: [Reply; 2] = parts.try_into().map_err(|parts: Vec<Reply>| {
        protocol_error(format!(
            "SCAN reply had {} elements, expected 2",
            parts.len()
        ))
    })?;

    let cursor = match cursor {
        Reply::Bulk(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or_else(|| protocol_error("SCAN cursor was not an integer"))?,
        Reply::Int(value) => u64::try_from(value)
            .map_err(|_| protocol_error("SCAN cursor was negative"))?,
        other => {
            return Err(protocol_error(format!(
                "SCAN cursor was {}, expected bulk string",
                other.kind_name()
            )));
        }
    };

    let Reply::Array(items) = keys else {
        return Err(protocol_error(format!(
            "SCAN keys were {}, expected array",
            keys.kind_name()
        )));
    };
    let mut page_keys = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Reply::Bulk(key) => page_keys.push(key),
            other => warn!(kind = other.kind_name(), "skipping non-bulk key in SCAN reply"),
        }
    }

    Ok(ScanPage {
        keys: page_keys,
        cursor,
    })
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Protocol).with_message(message)
}
