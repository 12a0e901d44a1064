pub mod commands {
    pub const BACKUP: &str = "STASH101";
    pub const RETIRE: &str = "STASH102";
    pub const STATUS: &str = "STASH103";
    pub const GC: &str = "STASH110";
}

pub mod store {
    pub const MISSING_OR_CORRUPT: &str = "STASH301";
    pub const ARCHIVE_CORRUPT: &str = "STASH302";
    pub const INDEX_CORRUPT: &str = "STASH303";
    pub const INVALID_OWNER: &str = "STASH304";
    pub const SCHEMA_INCOMPATIBLE: &str = "STASH305";
}

pub mod gc {
    pub const BUSY: &str = "STASH310";
    pub const INVARIANT_VIOLATION: &str = "STASH311";
}
