use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const STASH_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const STASH_BEFORE_HELP: &str = concat!(
    "stash ",
    env!("CARGO_PKG_VERSION"),
    " – Content-addressed backup store\n\n",
    "\x1b[1;36mCommands\x1b[0m\n",
    "  backup           Store files for an owner (TYPE:ID) and reference them.\n",
    "  retire           Stop an owner from keeping its files alive.\n",
    "  status           Summarize archives, stored files and owners.\n",
    "  gc               Repack or delete archives holding unreferenced files.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = STASH_BEFORE_HELP,
    help_template = STASH_HELP_TEMPLATE
)]
#[allow(clippy::struct_excessive_bools)]
pub struct StashCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,command,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[arg(
        long,
        value_name = "DIR",
        help = "Store root (defaults to STASH_ROOT, then ~/.stash/store)",
        global = true
    )]
    pub root: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Store files in a new archive and reference them from an owner.",
        override_usage = "stash backup --owner TYPE:ID <FILE> [FILE ...]"
    )]
    Backup(BackupArgs),
    #[command(
        about = "Retire an owner so its files become collectable.",
        override_usage = "stash retire TYPE:ID"
    )]
    Retire(RetireArgs),
    #[command(about = "Summarize archives, stored files and owners (read-only).")]
    Status,
    #[command(
        about = "Reclaim space held by files no live owner references.",
        override_usage = "stash gc [--dry-run]"
    )]
    Gc(GcArgs),
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    #[arg(long, value_name = "TYPE:ID", help = "Owner such as loadout:main or game-backup:skyrim")]
    pub owner: String,
    #[arg(value_name = "FILE", required = true, help = "Files to store")]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RetireArgs {
    #[arg(value_name = "TYPE:ID")]
    pub owner: String,
}

#[derive(Args, Debug)]
pub struct GcArgs {
    #[arg(long, help = "Report what would be repacked or deleted without changing anything")]
    pub dry_run: bool,
}
