//! Purpose: Snapshot every key of a store into a dump file.
//! Exports: `DumpConfig`, `DumpOutcome`, `Dumper`.
//! Role: Enumeration producer -> bounded key queue -> fetch workers -> bounded data queue -> one writer.
//! Invariants: Every key observation is written once; duplicate observations are not merged.
//! Invariants: A failed fetch still produces a record, with an empty value.
//! Invariants: Only the writer thread touches the file; it is flushed and closed once per run.
//! Invariants: A scan error retries the same cursor with no limit and no delay.
#![allow(clippy::result_large_err)]

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use bstr::ByteSlice;
use serde::Serialize;
use tracing::{Span, debug, info, info_span, warn};

use super::workers::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SCAN_COUNT, default_workers, join_worker, validate_pool,
};
use crate::core::cancel::{AbortHandle, CancellationToken};
use crate::core::client::{Reply, StoreClient};
use crate::core::codec::{KeyData, encode};
use crate::core::error::{ApiResult, Error, ErrorKind, io_error};
use crate::core::queue::{Pop, Push, QueueReceiver, QueueSender, work_queue};

#[derive(Clone, Debug)]
pub struct DumpConfig {
    pub path: PathBuf,
    /// Append to an existing file instead of truncating it.
    pub append: bool,
    pub workers: usize,
    /// `COUNT` hint passed to each `SCAN` call.
    pub scan_count: usize,
    pub queue_capacity: usize,
    /// Log per-key fetch failures.
    pub verbose: bool,
    /// Span entered by every thread of the run.
    pub span: Span,
}

impl DumpConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let span = info_span!("dump", path = %path.display());
        Self {
            path,
            append: false,
            workers: default_workers(),
            scan_count: DEFAULT_SCAN_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            verbose: false,
            span,
        }
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("dump file path is empty"));
        }
        if self.scan_count == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("scan count must be at least 1"));
        }
        validate_pool(self.workers, self.queue_capacity)
    }
}

/// Counters reported by a finished dump.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DumpOutcome {
    /// Keys returned by the scan, duplicates included.
    pub keys_observed: u64,
    pub lines_written: u64,
    /// Keys recorded with an empty value because `DUMP` failed.
    pub fetch_failures: u64,
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct FetchTally {
    forwarded: u64,
    failed: u64,
}

pub struct Dumper<C> {
    client: C,
    config: DumpConfig,
    file: File,
    cancel: CancellationToken,
}

impl<C: StoreClient> Dumper<C> {
    /// Validate `config` and open the dump file (append or truncate).
    pub fn open(client: C, config: DumpConfig) -> ApiResult<Self> {
        config.validate()?;
        let file = open_dump_file(&config.path, config.append)?;
        Ok(Self {
            client,
            config,
            file,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DumpConfig {
        &self.config
    }

    /// Handle that stops the run from any thread, before or during `run`.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.cancel.clone())
    }

    /// Fetch the serialized value of one key.
    pub fn fetch_one(&self, key: &[u8]) -> ApiResult<Vec<u8>> {
        fetch_key(&self.client, key)
    }

    /// Run the pipeline to completion or until aborted.
    pub fn run(self) -> ApiResult<DumpOutcome> {
        let Self {
            client,
            config,
            file,
            cancel,
        } = self;
        let _entered = config.span.enter();
        let started = Instant::now();
        info!(
            workers = config.workers,
            scan_count = config.scan_count,
            append = config.append,
            "starting dump"
        );

        let (key_tx, key_rx) = work_queue::<Vec<u8>>(config.queue_capacity);
        let (data_tx, data_rx) = work_queue::<KeyData>(config.queue_capacity);

        let (keys_observed, tally, written) = thread::scope(|scope| {
            let writer = {
                let span = config.span.clone();
                let path = config.path.as_path();
                let cancel = &cancel;
                scope.spawn(move || span.in_scope(|| write_records(file, path, data_rx, cancel)))
            };

            let fetchers: Vec<_> = (0..config.workers)
                .map(|_| {
                    let span = config.span.clone();
                    let keys = key_rx.clone();
                    let data = data_tx.clone();
                    let (client, cancel, verbose) = (&client, &cancel, config.verbose);
                    scope.spawn(move || {
                        span.in_scope(|| fetch_records(client, &keys, &data, cancel, verbose))
                    })
                })
                .collect();
            drop(key_rx);
            drop(data_tx);

            let keys_observed = enumerate_keys(&client, &key_tx, &cancel, config.scan_count);
            drop(key_tx);

            let mut tally = FetchTally::default();
            let mut panicked = None;
            for handle in fetchers {
                match join_worker(handle, "fetch") {
                    Ok(worker) => {
                        tally.forwarded += worker.forwarded;
                        tally.failed += worker.failed;
                    }
                    Err(err) => {
                        panicked.get_or_insert(err);
                    }
                }
            }
            let written = join_worker(writer, "writer").and_then(|written| written);
            if let Some(err) = panicked {
                return Err(err);
            }
            written.map(|written| (keys_observed, tally, written))
        })?;

        let outcome = DumpOutcome {
            keys_observed,
            lines_written: written,
            fetch_failures: tally.failed,
            cancelled: cancel.is_cancelled(),
        };
        info!(
            keys_observed = outcome.keys_observed,
            lines_written = outcome.lines_written,
            fetch_failures = outcome.fetch_failures,
            cancelled = outcome.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dump finished"
        );
        debug!(forwarded = tally.forwarded, "fetch workers drained");
        Ok(outcome)
    }
}

fn open_dump_file(path: &Path, append: bool) -> ApiResult<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .map_err(|err| io_error(err, "failed to open dump file", path))
}

/// Issue `DUMP key`. An absent key is `NotFound`.
fn fetch_key<C: StoreClient + ?Sized>(client: &C, key: &[u8]) -> ApiResult<Vec<u8>> {
    match client.execute("DUMP", &[key])? {
        Reply::Bulk(payload) => Ok(payload),
        Reply::Nil => Err(Error::new(ErrorKind::NotFound).with_message("key no longer exists")),
        other => Err(Error::new(ErrorKind::Protocol)
            .with_message(format!("DUMP reply was {}, expected bulk string", other.kind_name()))),
    }
}

/// Drive the cursor scan, pushing each observed key. Returns the observation count.
fn enumerate_keys<C: StoreClient + ?Sized>(
    client: &C,
    keys: &QueueSender<Vec<u8>>,
    cancel: &CancellationToken,
    page_size: usize,
) -> u64 {
    let mut cursor = 0u64;
    let mut observed = 0u64;
    loop {
        if cancel.is_cancelled() {
            return observed;
        }
        let page = match client.scan(cursor, page_size) {
            Ok(page) => page,
            Err(err) => {
                // No backoff and no cap: a store that keeps failing stalls the dump here.
                warn!(cursor, error = %err, "scan failed; retrying cursor");
                continue;
            }
        };
        for key in page.keys {
            match keys.push(key, cancel) {
                Push::Sent => observed += 1,
                Push::Closed | Push::Cancelled => return observed,
            }
        }
        cursor = page.cursor;
        if cursor == 0 {
            return observed;
        }
    }
}

fn fetch_records<C: StoreClient + ?Sized>(
    client: &C,
    keys: &QueueReceiver<Vec<u8>>,
    data: &QueueSender<KeyData>,
    cancel: &CancellationToken,
    verbose: bool,
) -> FetchTally {
    let mut tally = FetchTally::default();
    loop {
        let key = match keys.pop(cancel) {
            Pop::Item(key) => key,
            Pop::Closed | Pop::Cancelled => return tally,
        };
        let record = match fetch_key(client, &key) {
            Ok(value) => KeyData::new(key, value),
            Err(err) => {
                tally.failed += 1;
                if verbose {
                    warn!(key = %key.as_bstr(), error = %err, "fetch failed; recording empty value");
                }
                KeyData::empty(key)
            }
        };
        match data.push(record, cancel) {
            Push::Sent => tally.forwarded += 1,
            Push::Closed | Push::Cancelled => return tally,
        }
    }
}

fn write_records(
    file: File,
    path: &Path,
    data: QueueReceiver<KeyData>,
    cancel: &CancellationToken,
) -> ApiResult<u64> {
    let mut out = BufWriter::new(file);
    let mut written = 0u64;
    let result = loop {
        let record = match data.pop(cancel) {
            Pop::Item(record) => record,
            Pop::Closed | Pop::Cancelled => break Ok(()),
        };
        let line = encode(&record);
        if let Err(err) = out
            .write_all(line.as_bytes())
            .and_then(|()| out.write_all(b"\n"))
        {
            break Err(err);
        }
        written += 1;
    };

    match result.and_then(|()| out.flush()) {
        Ok(()) => {
            debug!(written, "dump file flushed");
            Ok(written)
        }
        Err(err) => {
            cancel.cancel();
            Err(io_error(err, "failed to write dump file", path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DumpConfig, enumerate_keys, fetch_key};
    use crate::core::cancel::CancellationToken;
    use crate::core::client::{Reply, ScanPage, StoreClient};
    use crate::core::error::{ApiResult, Error, ErrorKind};
    use crate::core::queue::{Pop, work_queue};
    use std::sync::Mutex;

    struct ScriptedScan {
        replies: Mutex<Vec<ApiResult<ScanPage>>>,
        cursors: Mutex<Vec<u64>>,
    }

    impl StoreClient for ScriptedScan {
        fn execute(&self, _command: &str, _args: &[&[u8]]) -> ApiResult<Reply> {
            Ok(Reply::Nil)
        }

        fn scan(&self, cursor: u64, _count: usize) -> ApiResult<ScanPage> {
            self.cursors.lock().expect("lock").push(cursor);
            self.replies.lock().expect("lock").remove(0)
        }

        fn close(&self) -> ApiResult<()> {
            Ok(())
        }
    }

    #[test]
    fn scan_error_retries_the_same_cursor() {
        let client = ScriptedScan {
            replies: Mutex::new(vec![
                Ok(ScanPage {
                    keys: vec![b"a".to_vec()],
                    cursor: 9,
                }),
                Err(Error::new(ErrorKind::Protocol)),
                Err(Error::new(ErrorKind::Connection)),
                Ok(ScanPage {
                    keys: vec![b"b".to_vec()],
                    cursor: 0,
                }),
            ]),
            cursors: Mutex::new(Vec::new()),
        };
        let cancel = CancellationToken::new();
        let (tx, rx) = work_queue(8);
        let observed = enumerate_keys(&client, &tx, &cancel, 10);
        drop(tx);

        assert_eq!(observed, 2);
        assert_eq!(*client.cursors.lock().expect("lock"), vec![0, 9, 9, 9]);
        assert_eq!(rx.pop(&cancel), Pop::Item(b"a".to_vec()));
        assert_eq!(rx.pop(&cancel), Pop::Item(b"b".to_vec()));
        assert_eq!(rx.pop(&cancel), Pop::Closed);
    }

    #[test]
    fn cancelled_enumeration_stops_before_scanning() {
        let client = ScriptedScan {
            replies: Mutex::new(Vec::new()),
            cursors: Mutex::new(Vec::new()),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = work_queue::<Vec<u8>>(1);
        assert_eq!(enumerate_keys(&client, &tx, &cancel, 10), 0);
        assert!(client.cursors.lock().expect("lock").is_empty());
    }

    #[test]
    fn fetch_key_maps_nil_to_not_found() {
        let client = ScriptedScan {
            replies: Mutex::new(Vec::new()),
            cursors: Mutex::new(Vec::new()),
        };
        let err = fetch_key(&client, b"gone").expect_err("nil");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn config_validation() {
        let config = DumpConfig::new("out.dump");
        config.validate().expect("defaults are valid");
        assert!(!config.append);

        let err = DumpConfig::new("").validate().expect_err("empty path");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = DumpConfig::new("out.dump")
            .with_scan_count(0)
            .validate()
            .expect_err("zero scan count");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = DumpConfig::new("out.dump")
            .with_workers(0)
            .validate()
            .expect_err("zero workers");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
