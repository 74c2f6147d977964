//! Purpose: Replay a dump file into a store.
//! Exports: `RestoreConfig`, `RestoreOutcome`, `Restorer`, `open_restore_file`.
//! Role: Line reader -> bounded line queue -> restore workers -> store.
//! Invariants: `lines_read` counts every non-empty line queued, restored or not.
//! Invariants: Per-line failures (decode or command) are logged and never stop the run.
//! Invariants: Read errors end the run with counts, never with an error.
//! Invariants: The final line is restored even without a trailing newline.
#![allow(clippy::result_large_err)]

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use bstr::ByteSlice;
use serde::Serialize;
use tracing::{Span, debug, info, info_span, warn};

use super::workers::{DEFAULT_QUEUE_CAPACITY, default_workers, join_worker, snippet, validate_pool};
use crate::core::cancel::{AbortHandle, CancellationToken};
use crate::core::client::StoreClient;
use crate::core::codec::decode;
use crate::core::error::{ApiResult, Error, ErrorKind, io_error};
use crate::core::queue::{Pop, Push, QueueReceiver, QueueSender, work_queue};

/// Consecutive read failures after which the reader stops and the run winds down.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

#[derive(Clone, Debug)]
pub struct RestoreConfig {
    pub path: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Log every restored key.
    pub verbose: bool,
    pub span: Span,
}

impl RestoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let span = info_span!("restore", path = %path.display());
        Self {
            path,
            workers: default_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            verbose: false,
            span,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
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
        validate_pool(self.workers, self.queue_capacity)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RestoreOutcome {
    /// Non-empty lines handed to restore workers.
    pub lines_read: u64,
    pub restored: u64,
    /// Lines that failed to decode or were rejected by the store.
    pub failed: u64,
    /// Failed reads of the dump file; the affected bytes are never queued.
    pub read_errors: u64,
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct RestoreTally {
    restored: u64,
    failed: u64,
}

pub struct Restorer<C> {
    client: C,
    config: RestoreConfig,
    file: File,
    cancel: CancellationToken,
}

impl<C: StoreClient> Restorer<C> {
    /// Validate `config` and open the dump file for reading.
    pub fn open(client: C, config: RestoreConfig) -> ApiResult<Self> {
        config.validate()?;
        let file = open_restore_file(&config.path)?;
        Self::from_file(client, config, file)
    }

    /// Build a restorer over a dump file the caller already opened.
    pub fn from_file(client: C, config: RestoreConfig, file: File) -> ApiResult<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            file,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.cancel.clone())
    }

    /// Decode one dump line and restore it, replacing any existing key.
    pub fn restore_one(&self, line: &str) -> ApiResult<()> {
        restore_record(&self.client, line)
    }

    pub fn run(self) -> ApiResult<RestoreOutcome> {
        let Self {
            client,
            config,
            file,
            cancel,
        } = self;
        let _entered = config.span.enter();
        let started = Instant::now();
        info!(workers = config.workers, "starting restore");

        let (line_tx, line_rx) = work_queue::<String>(config.queue_capacity);

        let (read, tally) = thread::scope(|scope| {
            let workers: Vec<_> = (0..config.workers)
                .map(|_| {
                    let span = config.span.clone();
                    let lines = line_rx.clone();
                    let (client, cancel, verbose) = (&client, &cancel, config.verbose);
                    scope.spawn(move || {
                        span.in_scope(|| restore_records(client, &lines, cancel, verbose))
                    })
                })
                .collect();
            drop(line_rx);

            let read = read_lines(BufReader::new(file), &config.path, &line_tx, &cancel);
            drop(line_tx);

            let mut tally = RestoreTally::default();
            let mut panicked = None;
            for handle in workers {
                match join_worker(handle, "restore") {
                    Ok(worker) => {
                        tally.restored += worker.restored;
                        tally.failed += worker.failed;
                    }
                    Err(err) => {
                        panicked.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = panicked {
                return Err(err);
            }
            Ok((read, tally))
        })?;

        let outcome = RestoreOutcome {
            lines_read: read.queued,
            restored: tally.restored,
            failed: tally.failed,
            read_errors: read.read_errors,
            cancelled: cancel.is_cancelled(),
        };
        info!(
            lines_read = outcome.lines_read,
            read_errors = outcome.read_errors,
            restored = outcome.restored,
            failed = outcome.failed,
            cancelled = outcome.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "restore finished"
        );
        Ok(outcome)
    }
}

/// Open a dump file for reading. A missing file is `NotFound`.
pub fn open_restore_file(path: &Path) -> ApiResult<File> {
    File::open(path).map_err(|err| io_error(err, "failed to open dump file", path))
}

/// Strip one trailing `\n` or `\r\n`.
fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct ReadTally {
    queued: u64,
    read_errors: u64,
}

/// Queue every non-empty line of `reader`.
///
/// Bytes that are not UTF-8 are replaced, so such a line is still counted and
/// then rejected by the codec. Reading stops early after
/// `MAX_CONSECUTIVE_READ_ERRORS` failed reads in a row.
fn read_lines<R: BufRead>(
    mut reader: R,
    path: &Path,
    lines: &QueueSender<String>,
    cancel: &CancellationToken,
) -> ReadTally {
    let mut tally = ReadTally::default();
    let mut line_no = 0u64;
    let mut consecutive_errors = 0u32;
    let mut buf = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return tally;
        }
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return tally,
            Ok(_) => consecutive_errors = 0,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tally.read_errors += 1;
                consecutive_errors += 1;
                warn!(line = line_no + 1, error = %err, "failed to read dump line");
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!(
                        path = %path.display(),
                        errors = consecutive_errors,
                        "dump file is unreadable; stopping reader"
                    );
                    return tally;
                }
                continue;
            }
        }
        line_no += 1;

        let raw = trim_line_end(&buf);
        if raw.is_empty() {
            continue;
        }
        let line = String::from_utf8_lossy(raw).into_owned();
        match lines.push(line, cancel) {
            Push::Sent => tally.queued += 1,
            Push::Closed | Push::Cancelled => return tally,
        }
    }
}

fn restore_records<C: StoreClient + ?Sized>(
    client: &C,
    lines: &QueueReceiver<String>,
    cancel: &CancellationToken,
    verbose: bool,
) -> RestoreTally {
    let mut tally = RestoreTally::default();
    loop {
        let line = match lines.pop(cancel) {
            Pop::Item(line) => line,
            Pop::Closed | Pop::Cancelled => return tally,
        };
        match restore_record(client, &line) {
            Ok(()) => {
                tally.restored += 1;
                if verbose {
                    debug!(line = %snippet(&line), "restored");
                }
            }
            Err(err) => {
                tally.failed += 1;
                warn!(line = %snippet(&line), error = %err, "restore failed");
            }
        }
    }
}

fn restore_record<C: StoreClient + ?Sized>(client: &C, line: &str) -> ApiResult<()> {
    let record = decode(line)?;
    client
        .execute(
            "RESTORE",
            &[
                record.key.as_slice(),
                &b"0"[..],
                record.value.as_slice(),
                &b"REPLACE"[..],
            ],
        )
        .map(|_| ())
        .map_err(|err| {
            let key = record.key.as_bstr().to_string();
            err.with_hint(format!("Key: {key}"))
        })
}

#[cfg(test)]
mod tests {
    use super::{
        MAX_CONSECUTIVE_READ_ERRORS, ReadTally, RestoreConfig, read_lines, restore_record,
        trim_line_end,
    };
    use crate::core::cancel::CancellationToken;
    use crate::core::client::{Reply, StoreClient};
    use crate::core::codec::{KeyData, encode};
    use crate::core::error::{ApiResult, ErrorKind};
    use crate::core::queue::{Pop, work_queue};
    use std::io::{self, BufRead, Cursor, Read};
    use std::path::Path;
    use std::sync::Mutex;

    fn drain_reader<R: BufRead>(reader: R) -> (ReadTally, Vec<String>) {
        let cancel = CancellationToken::new();
        let (tx, rx) = work_queue(64);
        let tally = read_lines(reader, Path::new("t.dump"), &tx, &cancel);
        drop(tx);
        let mut lines = Vec::new();
        while let Pop::Item(line) = rx.pop(&cancel) {
            lines.push(line);
        }
        (tally, lines)
    }

    fn drain(input: &[u8]) -> (u64, Vec<String>) {
        let (tally, lines) = drain_reader(Cursor::new(input.to_vec()));
        assert_eq!(tally.read_errors, 0);
        (tally.queued, lines)
    }

    /// Fails the first `failures` reads, then serves `inner`.
    struct FlakyReader {
        failures: u32,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let available = self.fill_buf()?;
            let len = available.len().min(buf.len());
            buf[..len].copy_from_slice(&available[..len]);
            self.consume(len);
            Ok(len)
        }
    }

    impl BufRead for FlakyReader {
        fn fill_buf(&mut self) -> io::Result<&[u8]> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("device went away"));
            }
            self.inner.fill_buf()
        }

        fn consume(&mut self, amt: usize) {
            self.inner.consume(amt);
        }
    }

    #[test]
    fn trims_both_terminators() {
        assert_eq!(trim_line_end(b"abc\n"), b"abc");
        assert_eq!(trim_line_end(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_end(b"abc"), b"abc");
        assert_eq!(trim_line_end(b"\n"), b"");
    }

    #[test]
    fn reads_final_line_without_newline_and_skips_blank_lines() {
        let (queued, lines) = drain(b"a\n\nb\r\n\r\nc");
        assert_eq!(queued, 3);
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn lines_that_are_not_utf8_are_still_counted() {
        let (queued, lines) = drain(b"a\n\xff\xfe junk\nb\n");
        assert_eq!(queued, 3);
        assert_eq!(lines[0], "a");
        assert_eq!(lines[1], "\u{fffd}\u{fffd} junk");
        assert_eq!(lines[2], "b");
    }

    #[test]
    fn read_errors_are_counted_and_reading_continues() {
        let reader = FlakyReader {
            failures: 3,
            inner: Cursor::new(b"a\nb\n".to_vec()),
        };
        let (tally, lines) = drain_reader(reader);
        assert_eq!(
            tally,
            ReadTally {
                queued: 2,
                read_errors: 3,
            }
        );
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn reader_stops_after_repeated_read_errors() {
        let reader = FlakyReader {
            failures: u32::MAX,
            inner: Cursor::new(b"never reached\n".to_vec()),
        };
        let (tally, lines) = drain_reader(reader);
        assert_eq!(tally.queued, 0);
        assert_eq!(tally.read_errors, u64::from(MAX_CONSECUTIVE_READ_ERRORS));
        assert!(lines.is_empty());
    }

    struct Recorder {
        calls: Mutex<Vec<Vec<Vec<u8>>>>,
    }

    impl StoreClient for Recorder {
        fn execute(&self, command: &str, args: &[&[u8]]) -> ApiResult<Reply> {
            assert_eq!(command, "RESTORE");
            self.calls
                .lock()
                .expect("lock")
                .push(args.iter().map(|arg| arg.to_vec()).collect());
            Ok(Reply::Status("OK".to_string()))
        }

        fn close(&self) -> ApiResult<()> {
            Ok(())
        }
    }

    #[test]
    fn restore_record_issues_restore_with_replace() {
        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        let line = encode(&KeyData::new(b"k".to_vec(), b"payload".to_vec()));
        restore_record(&recorder, &line).expect("restore");

        let calls = recorder.calls.lock().expect("lock");
        assert_eq!(
            calls[0],
            vec![
                b"k".to_vec(),
                b"0".to_vec(),
                b"payload".to_vec(),
                b"REPLACE".to_vec()
            ]
        );
    }

    #[test]
    fn restore_record_rejects_malformed_line_without_calling_store() {
        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        let err = restore_record(&recorder, "not a record").expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(recorder.calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn config_defaults_validate() {
        RestoreConfig::new("in.dump").validate().expect("valid");
        let err = RestoreConfig::new("in.dump")
            .with_queue_capacity(0)
            .validate()
            .expect_err("zero capacity");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
