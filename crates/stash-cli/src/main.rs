use atty::Stream;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use stash_core::{ExecutionOutcome, GlobalOptions, StashCommand};

mod cli;
mod style;

use cli::{CommandCli, StashCli};
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = StashCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let global = GlobalOptions {
        quiet: cli.quiet,
        verbose: cli.verbose,
        trace: cli.trace,
        json: cli.json,
        root: cli.root.clone(),
    };

    let command = build_command(&cli.command);
    let outcome = stash_core::execute(&global, &command).map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, &command, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("stash_core={level},stash_domain={level},stash_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn build_command(command: &CommandCli) -> StashCommand {
    match command {
        CommandCli::Backup(args) => StashCommand::Backup {
            owner: args.owner.clone(),
            files: args.files.clone(),
        },
        CommandCli::Retire(args) => StashCommand::Retire {
            owner: args.owner.clone(),
        },
        CommandCli::Status => StashCommand::Status,
        CommandCli::Gc(args) => StashCommand::Gc {
            dry_run: args.dry_run,
        },
    }
}

fn emit_output(cli: &StashCli, command: &StashCommand, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.exit_code();
    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        let payload = stash_core::to_json_response(command, outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(code);
    }

    let message = stash_core::format_status_message(command, &outcome.message);
    if code != 0 {
        eprintln!("{}", style.status(outcome.status, &message));
        if let Some(hint) = hint_from_details(&outcome.details) {
            eprintln!("{}", style.info(&format!("Hint: {hint}")));
        }
        return Ok(code);
    }
    if cli.quiet {
        return Ok(code);
    }

    println!("{}", style.status(outcome.status, &message));
    for line in detail_lines(command, &outcome.details) {
        println!("{}", style.dim(&line));
    }
    if let Some(hint) = hint_from_details(&outcome.details) {
        println!("{}", style.info(&format!("Hint: {hint}")));
    }
    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

fn detail_lines(command: &StashCommand, details: &Value) -> Vec<String> {
    match command {
        StashCommand::Gc { .. } => gc_lines(details),
        StashCommand::Status => owner_lines(details),
        _ => Vec::new(),
    }
}

fn gc_lines(details: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(skipped) = details.get("skipped").and_then(Value::as_array) {
        for entry in skipped {
            let location = entry.get("location").and_then(Value::as_str).unwrap_or("?");
            let reason = entry.get("reason").and_then(Value::as_str).unwrap_or("");
            lines.push(format!("  skipped {location}: {reason}"));
        }
    }
    if let Some(unreadable) = details.get("unreadable").and_then(Value::as_array) {
        for entry in unreadable {
            let path = entry.get("path").and_then(Value::as_str).unwrap_or("?");
            let reason = entry.get("reason").and_then(Value::as_str).unwrap_or("");
            lines.push(format!("  unreadable {path}: {reason}"));
        }
    }
    if let Some(removed) = details.get("partials_removed").and_then(Value::as_u64) {
        if removed > 0 {
            lines.push(format!("  removed {removed} leftover partial write(s)"));
        }
    }
    if let Some(reconciled) = details.get("reconciled") {
        let detached = reconciled.get("detached").and_then(Value::as_u64).unwrap_or(0);
        let reindexed = reconciled.get("reindexed").and_then(Value::as_u64).unwrap_or(0);
        if detached + reindexed > 0 {
            lines.push(format!(
                "  reconciled with index: {detached} stale copy(ies), {reindexed} re-indexed"
            ));
        }
    }
    lines
}

fn owner_lines(details: &Value) -> Vec<String> {
    let Some(owners) = details.get("owners").and_then(Value::as_array) else {
        return Vec::new();
    };
    owners
        .iter()
        .filter_map(|record| {
            let owner = record.get("owner")?;
            let kind = owner.get("owner_type")?.as_str()?;
            let id = owner.get("owner_id")?.as_str()?;
            let refs = record.get("refs")?.as_u64()?;
            let retired = record.get("retired")?.as_bool()?;
            let state = if retired { " (retired)" } else { "" };
            Some(format!("  {kind}:{id}  {refs} file(s){state}"))
        })
        .collect()
}
