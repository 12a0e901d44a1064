#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]

//! On-disk archive store and the garbage collector that reclaims archive
//! entries no owner references anymore.

pub mod archive;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod discovery;
mod fsutil;
pub mod gc;
pub mod marker;
pub mod outcome;
pub mod progress;
pub mod reconcile;
pub mod repacker;
pub mod store;
pub mod updater;

pub use crate::archive::{ArchiveBuilder, ArchiveEntry, ArchiveHeader, WrittenArchive};
pub use crate::commands::{error_code, execute, StashCommand};
pub use crate::config::{Config, GcConfig, GlobalOptions, StoreConfig};
pub use crate::discovery::{discover_archives, Discovery, UnreadableArchive};
pub use crate::gc::{run_gc, run_gc_with_env_policy, GcError, GcOptions, GcReport};
pub use crate::outcome::{format_status_message, to_json_response, CommandStatus, ExecutionOutcome};
pub use crate::progress::ProgressReporter;
pub use crate::reconcile::ReconcileReport;
pub use crate::store::{
    BackupReceipt, FileLocation, FileStore, OwnerId, OwnerRecord, OwnerType, StoreError,
    StoreLock, StoreStats,
};
