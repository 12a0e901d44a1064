//! Command entry points shared by the binary and the tests.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use stash_domain::CollectorError;
use tracing::debug;

use crate::config::{Config, GlobalOptions};
use crate::diagnostics;
use crate::gc::{run_gc, GcError, GcOptions, GcReport};
use crate::outcome::ExecutionOutcome;
use crate::progress::ProgressReporter;
use crate::store::{FileStore, OwnerId, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StashCommand {
    Backup { owner: String, files: Vec<PathBuf> },
    Retire { owner: String },
    Status,
    Gc { dry_run: bool },
}

impl StashCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Retire { .. } => "retire",
            Self::Status => "status",
            Self::Gc { .. } => "gc",
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Backup { .. } => diagnostics::commands::BACKUP,
            Self::Retire { .. } => diagnostics::commands::RETIRE,
            Self::Status => diagnostics::commands::STATUS,
            Self::Gc { .. } => diagnostics::commands::GC,
        }
    }
}

/// Run one command. Errors from the store or the collector become
/// user-error or failure outcomes; only configuration problems escape.
pub fn execute(global: &GlobalOptions, command: &StashCommand) -> Result<ExecutionOutcome> {
    let config = Config::from_env(global.root.as_deref())?;
    debug!(
        command = command.name(),
        root = %config.store().root.display(),
        "executing command"
    );
    let result = match command {
        StashCommand::Backup { owner, files } => backup(&config, owner, files),
        StashCommand::Retire { owner } => retire(&config, owner),
        StashCommand::Status => status(&config),
        StashCommand::Gc { dry_run } => gc(&config, global, *dry_run),
    };
    Ok(result.unwrap_or_else(|err| outcome_from_error(command, &err)))
}

fn backup(config: &Config, owner: &str, files: &[PathBuf]) -> Result<ExecutionOutcome> {
    let owner: OwnerId = owner.parse()?;
    if let Some(missing) = files.iter().find(|path| !path.is_file()) {
        return Ok(ExecutionOutcome::user_error(
            format!("{} is not a readable file", missing.display()),
            json!({ "path": missing, "code": diagnostics::commands::BACKUP }),
        ));
    }
    let contents = files
        .iter()
        .map(|path| fs::read(path).with_context(|| format!("failed to read {}", path.display())))
        .collect::<Result<Vec<_>>>()?;

    let store = FileStore::open(&config.store().root)?;
    let receipt = store.backup(&owner, &contents)?;
    let entries: Vec<Value> = files
        .iter()
        .zip(&contents)
        .map(|(path, bytes)| {
            json!({
                "path": path,
                "hash": stash_domain::ContentHash::of(bytes),
                "size": bytes.len(),
            })
        })
        .collect();
    Ok(ExecutionOutcome::success(
        format!(
            "backed up {} file(s) for {owner} ({} new)",
            receipt.hashes.len(),
            receipt.new_files
        ),
        json!({
            "owner": owner.to_string(),
            "archive": receipt.archive,
            "new_files": receipt.new_files,
            "files": entries,
        }),
    ))
}

fn retire(config: &Config, owner: &str) -> Result<ExecutionOutcome> {
    let owner: OwnerId = owner.parse()?;
    let store = FileStore::open(&config.store().root)?;
    if !store.retire_owner(&owner)? {
        return Err(StoreError::UnknownOwner(owner.to_string()).into());
    }
    Ok(ExecutionOutcome::success(
        format!("retired {owner}"),
        json!({ "owner": owner.to_string() }),
    ))
}

fn status(config: &Config) -> Result<ExecutionOutcome> {
    let store = FileStore::open(&config.store().root)?;
    let stats = store.stats()?;
    let owners = store.owners()?;
    Ok(ExecutionOutcome::success(
        format!(
            "{} file(s) in {} archive(s), {} live; {} owner(s), {} retired",
            stats.files, stats.archives, stats.live_files, stats.owners, stats.retired_owners
        ),
        json!({
            "root": store.root(),
            "stats": stats,
            "owners": owners,
            "gc_disabled": config.gc().disabled,
        }),
    ))
}

fn gc(config: &Config, global: &GlobalOptions, dry_run: bool) -> Result<ExecutionOutcome> {
    if config.gc().disabled && !dry_run {
        return Ok(ExecutionOutcome::success(
            "garbage collection is disabled by STASH_GC_DISABLE",
            json!({ "disabled": true }),
        ));
    }
    let store = FileStore::open(&config.store().root)?;
    let options = GcOptions {
        dry_run,
        ..GcOptions::default()
    };
    let progress = if global.json || global.quiet {
        ProgressReporter::new("collecting archives", false)
    } else {
        ProgressReporter::for_config("collecting archives", config.gc())
    };
    let report = run_gc(&store, &options, &progress)?;
    progress.finish();

    let message = gc_message(&report);
    let mut details = serde_json::to_value(&report)?;
    if let Some(hint) = gc_hint(&report) {
        details["hint"] = Value::String(hint);
    }
    Ok(ExecutionOutcome::success(message, details))
}

fn gc_message(report: &GcReport) -> String {
    let summary = &report.summary;
    if report.dry_run {
        return format!(
            "would repack {} and delete {} of {} archive(s), reclaiming {} byte(s)",
            summary.repacked, summary.deleted, summary.scanned, summary.dropped_bytes
        );
    }
    if summary.processed() == 0 && summary.skipped.is_empty() {
        return format!("nothing to collect in {} archive(s)", summary.scanned);
    }
    format!(
        "repacked {} and deleted {} of {} archive(s), reclaiming {} byte(s)",
        summary.repacked, summary.deleted, summary.scanned, summary.dropped_bytes
    )
}

fn gc_hint(report: &GcReport) -> Option<String> {
    let skipped = report.summary.skipped.len();
    let unreadable = report.unreadable.len();
    match (skipped, unreadable) {
        (0, 0) => None,
        (skipped, 0) => Some(format!(
            "{skipped} archive(s) could not be repacked and will be retried on the next run"
        )),
        (0, unreadable) => Some(format!(
            "{unreadable} archive(s) could not be read and were left in place"
        )),
        (skipped, unreadable) => Some(format!(
            "{skipped} archive(s) could not be repacked and {unreadable} could not be read"
        )),
    }
}

fn outcome_from_error(command: &StashCommand, err: &anyhow::Error) -> ExecutionOutcome {
    let code = error_code(err).unwrap_or_else(|| command.code());
    let message = format!("{err:#}");
    let mut details = json!({ "code": code });

    if err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
        .any(StoreError::is_user_error)
    {
        return ExecutionOutcome::user_error(message, details);
    }
    if matches!(err.downcast_ref::<GcError>(), Some(GcError::Busy { .. })) {
        details["hint"] = Value::String(
            "another garbage collection or backup is running; retry once it finishes".into(),
        );
    }
    ExecutionOutcome::failure(message, details)
}

/// Diagnostic code of the innermost known error in `err`.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> Option<&'static str> {
    let mut found = None;
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            found = Some(store_err.code());
        } else if let Some(gc_err) = cause.downcast_ref::<GcError>() {
            found = match gc_err {
                GcError::Collector(collector_err) => Some(collector_code(collector_err)),
                other => Some(other.code()),
            };
        } else if let Some(collector_err) = cause.downcast_ref::<CollectorError>() {
            found = Some(collector_code(collector_err));
        }
    }
    found
}

fn collector_code(err: &CollectorError) -> &'static str {
    match err {
        CollectorError::Aborted { reason, .. } => error_code(reason).unwrap_or(err.code()),
        other => other.code(),
    }
}
