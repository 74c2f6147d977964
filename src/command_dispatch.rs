//! Purpose: Hold top-level CLI command dispatch for `redump`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: `dump` connects before it opens (and truncates) the dump file.
//! Invariants: `restore` opens the dump file before it connects.
//! Invariants: The client pool is closed after every run, cancelled or not.

use super::*;
use redump::api::{
    DumpConfig, Dumper, RedisClient, RestoreConfig, Restorer, StoreClient, default_workers,
    open_restore_file,
};
use serde::Serialize;
use std::path::Path;
use tracing::warn;

pub(super) fn dispatch_command(
    command: Command,
    connection: &ConnectionArgs,
    verbose: bool,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "redump", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Dump(args) => run_dump(args, connection, verbose),
        Command::Restore(args) => run_restore(args, connection, verbose),
    }
}

fn run_dump(
    args: DumpArgs,
    connection: &ConnectionArgs,
    verbose: bool,
) -> Result<RunOutcome, Error> {
    let path = file_template::expand_dump_path(
        &args.file,
        &connection.host,
        connection.port,
        connection.database,
    );
    let config = DumpConfig::new(path)
        .with_append(args.append)
        .with_workers(args.workers.unwrap_or_else(default_workers))
        .with_scan_count(args.scan_count)
        .with_queue_capacity(args.queue_capacity)
        .with_verbose(verbose);
    config.validate()?;
    let client_config = connection.client_config();
    client_config.validate()?;

    let started_at = now_rfc3339();
    let client = RedisClient::connect(&client_config)?;
    let dumper = Dumper::open(&client, config)?;
    let file = dumper.config().path.clone();
    let signals = signals::forward_to(dumper.abort_handle())?;
    let result = dumper.run();
    drop(signals);
    close_client(&client);
    let outcome = result?;

    emit_summary("dump", &outcome, &file, started_at);
    Ok(RunOutcome::finished(outcome.cancelled))
}

fn run_restore(
    args: RestoreArgs,
    connection: &ConnectionArgs,
    verbose: bool,
) -> Result<RunOutcome, Error> {
    let path = file_template::expand_dump_path(
        &args.file,
        &connection.host,
        connection.port,
        connection.database,
    );
    let config = RestoreConfig::new(path)
        .with_workers(args.workers.unwrap_or_else(default_workers))
        .with_queue_capacity(args.queue_capacity)
        .with_verbose(verbose);
    config.validate()?;
    let client_config = connection.client_config();
    client_config.validate()?;

    let started_at = now_rfc3339();
    let file = open_restore_file(&config.path)?;
    let client = RedisClient::connect(&client_config)?;
    let restorer = Restorer::from_file(&client, config, file)?;
    let file = restorer.config().path.clone();
    let signals = signals::forward_to(restorer.abort_handle())?;
    let result = restorer.run();
    drop(signals);
    close_client(&client);
    let outcome = result?;

    emit_summary("restore", &outcome, &file, started_at);
    Ok(RunOutcome::finished(outcome.cancelled))
}

/// Print `{"<command>": {...outcome, file, started_at, finished_at}}`.
fn emit_summary<T: Serialize>(
    command: &str,
    outcome: &T,
    file: &Path,
    started_at: Option<String>,
) {
    let mut summary = serde_json::to_value(outcome).unwrap_or_else(|_| json!({}));
    if let Value::Object(fields) = &mut summary {
        fields.insert("file".to_string(), json!(file.display().to_string()));
        fields.insert("started_at".to_string(), json!(started_at));
        fields.insert("finished_at".to_string(), json!(now_rfc3339()));
    }
    let mut envelope = Map::new();
    envelope.insert(command.to_string(), summary);
    emit_json(Value::Object(envelope));
}

fn close_client(client: &RedisClient) {
    if let Err(err) = client.close() {
        warn!(address = client.address(), error = %err, "failed to close redis client");
    }
}
