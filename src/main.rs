//! Purpose: `redump` CLI entry point.
//! Role: Binary crate root; parses args, sets up logging, runs dump/restore, emits JSON summaries.
//! Invariants: Success summaries are one JSON line on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`; a cancelled run exits 130.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::time::Duration;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use redump::api::{
    ClientConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MIN_IDLE, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_SCAN_COUNT, Error, ErrorKind, MAX_DATABASE, to_exit_code,
};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;
mod file_template;
mod logging;
mod signals;

use file_template::DEFAULT_DUMP_FILE;
use logging::LogDestination;

/// Exit code for a run stopped by SIGINT or SIGTERM.
const CANCELLED_EXIT_CODE: i32 = 130;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn finished(cancelled: bool) -> Self {
        let exit_code = if cancelled { CANCELLED_EXIT_CODE } else { 0 };
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
        {
            err.print().map_err(|io_err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to write help")
                    .with_source(io_err)
            })?;
            // Bare `redump` prints help but still exits as a usage error.
            let exit_code = if err.kind() == ClapErrorKind::DisplayHelp { 0 } else { 2 };
            return Ok(RunOutcome { exit_code });
        }
        Err(err) => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(clap_error_summary(&err))
                .with_hint(clap_error_hint(&err)));
        }
    };

    logging::init(&LogDestination::parse(&cli.log), cli.verbose);
    let connection = cli.connection;

    command_dispatch::dispatch_command(cli.command, &connection, cli.verbose)
        .map_err(|err| add_connection_hint(err, &connection))
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "redump",
    about = "Dump a Redis keyspace to a flat file and restore it with parallel workers",
    long_about = None,
    after_help = r#"EXAMPLES
  $ redump dump                            # writes ./redump-localhost-6379-0.dump
  $ redump -H cache.internal -d 2 dump -f cache.dump
  $ redump -H replica.internal restore -f cache.dump

Each dump line holds base64(key), a \u0001 separator, and base64(DUMP payload).
Restore issues RESTORE key 0 payload REPLACE for every line."#,
    arg_required_else_help = true,
    disable_version_flag = true
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[arg(
        long,
        global = true,
        default_value = "stderr",
        help = "Log destination: stderr, - (stderr), or a file path opened for append"
    )]
    log: String,

    #[arg(
        short = 'V',
        long,
        global = true,
        help = "Log per-key failures and successes"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Debug)]
struct ConnectionArgs {
    #[arg(short = 'H', long, global = true, default_value = "localhost", help = "Redis host")]
    host: String,

    #[arg(short = 'p', long, global = true, default_value_t = DEFAULT_PORT, help = "Redis port")]
    port: u16,

    #[arg(short = 'a', long, global = true, help = "Redis password")]
    auth: Option<String>,

    #[arg(
        short = 'd',
        long,
        global = true,
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=i64::from(MAX_DATABASE)),
        help = "Database number"
    )]
    database: u8,

    #[arg(
        long,
        global = true,
        default_value_t = 30,
        value_name = "SECONDS",
        help = "Timeout for establishing connections"
    )]
    connect_timeout: u64,

    #[arg(
        long,
        global = true,
        default_value_t = 30,
        value_name = "SECONDS",
        help = "Timeout for each command reply"
    )]
    read_timeout: u64,

    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_MAX_CONNECTIONS,
        help = "Upper bound on pooled connections"
    )]
    max_connections: u32,

    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_MIN_IDLE,
        help = "Idle connections kept open by the pool"
    )]
    min_idle: u32,
}

impl ConnectionArgs {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.host.clone(), self.port)
            .with_database(self.database)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_read_timeout(Duration::from_secs(self.read_timeout))
            .with_pool_size(self.min_idle, self.max_connections);
        if let Some(auth) = &self.auth {
            config = config.with_auth(auth.clone());
        }
        config
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Write every key of the selected database to a dump file",
        after_help = r#"EXAMPLES
  $ redump dump
  $ redump -d 3 dump -f ./backups/db3.dump --append
  $ redump dump --workers 32 --scan-count 1000"#
    )]
    Dump(DumpArgs),
    #[command(
        about = "Restore every line of a dump file into the selected database",
        after_help = r#"EXAMPLES
  $ redump restore -f ./redump-localhost-6379-0.dump
  $ redump -H replica.internal -a secret restore -f cache.dump --workers 8"#
    )]
    Restore(RestoreArgs),
    #[command(about = "Print version info")]
    Version,
    #[command(
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ redump completion bash > ~/.local/share/bash-completion/completions/redump
  $ redump completion zsh > ~/.zfunc/_redump"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[arg(
        short = 'f',
        long,
        default_value = DEFAULT_DUMP_FILE,
        value_hint = ValueHint::FilePath,
        help = "Dump file; ${host}, ${port} and ${db} are substituted"
    )]
    file: String,

    #[arg(long, help = "Append to the dump file instead of truncating it")]
    append: bool,

    #[arg(long, help = "Fetch workers (default: two per CPU)")]
    workers: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_SCAN_COUNT, help = "COUNT hint for each SCAN call")]
    scan_count: usize,

    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, help = "Capacity of each pipeline queue")]
    queue_capacity: usize,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    #[arg(
        short = 'f',
        long,
        default_value = DEFAULT_DUMP_FILE,
        value_hint = ValueHint::FilePath,
        help = "Dump file; ${host}, ${port} and ${db} are substituted"
    )]
    file: String,

    #[arg(long, help = "Restore workers (default: two per CPU)")]
    workers: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, help = "Capacity of the line queue")]
    queue_capacity: usize,
}

fn add_connection_hint(err: Error, connection: &ConnectionArgs) -> Error {
    if err.kind() != ErrorKind::Connection || err.hint().is_some() {
        return err;
    }
    let hint = format!(
        "Check that Redis is reachable at {}:{} (-H/-p) and that --auth is correct.",
        connection.host, connection.port
    );
    err.with_hint(hint)
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::NotFound if err.path().is_some() => {
            err.with_hint("Dump file not found. Pass the file written by `redump dump` with -f.")
        }
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Check file permissions or choose another -f path.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("redump {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "redump",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

/// Pretty on a terminal, one line otherwise.
fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

/// Current time as RFC 3339, or `None` if the clock cannot be formatted.
fn now_rfc3339() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
    } else {
        eprintln!("{}", error_json(err));
    }
}

fn error_message(err: &Error) -> String {
    match err.message() {
        Some(message) => message.to_string(),
        None => format!("{:?} error", err.kind()),
    }
}

/// `{"error": {kind, message, hint?, path?, cause?}}`
fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(source) = err.source() {
        inner.insert("cause".to_string(), json!(source.to_string()));
    }
    json!({ "error": inner })
}

fn error_text(err: &Error) -> String {
    let mut text = format!("error: {}", error_message(err));
    if let Some(hint) = err.hint() {
        text.push_str(&format!("\nhint: {hint}"));
    }
    if let Some(path) = err.path() {
        text.push_str(&format!("\npath: {}", path.display()));
    }
    if let Some(source) = err.source() {
        text.push_str(&format!("\ncaused by: {source}"));
    }
    text
}

/// First line of clap's rendering, without its `error:` label.
fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.strip_prefix("error:").unwrap_or(line).trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `redump --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "redump") else {
        return "Try `redump --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `redump --help`.".to_string();
    }
    format!("Try `redump {} --help`.", parts.join(" "))
}
