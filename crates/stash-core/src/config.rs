use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub(crate) const ENV_ROOT: &str = "STASH_ROOT";
pub(crate) const ENV_GC_DISABLE: &str = "STASH_GC_DISABLE";
pub(crate) const ENV_PROGRESS: &str = "STASH_PROGRESS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalOptions {
    pub quiet: bool,
    pub verbose: u8,
    pub trace: bool,
    pub json: bool,
    /// Store root from `--root`; wins over `STASH_ROOT`.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        self.vars
            .get(key)
            .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) store: StoreConfig,
    pub(crate) gc: GcConfig,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if no store root is given and the home directory
    /// cannot be resolved.
    pub fn from_env(root_override: Option<&Path>) -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture(), root_override)
    }

    pub(crate) fn from_snapshot(
        snapshot: &EnvSnapshot,
        root_override: Option<&Path>,
    ) -> Result<Self> {
        let root = match (root_override, snapshot.var(ENV_ROOT)) {
            (Some(root), _) => root.to_path_buf(),
            (None, Some(root)) if !root.is_empty() => PathBuf::from(root),
            _ => default_root()?,
        };
        Ok(Self {
            store: StoreConfig { root },
            gc: GcConfig::from_snapshot(snapshot),
        })
    }

    #[must_use]
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    #[must_use]
    pub fn gc(&self) -> &GcConfig {
        &self.gc
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcConfig {
    /// `STASH_GC_DISABLE=1` turns policy-driven collection off.
    pub disabled: bool,
    /// `STASH_PROGRESS` forces progress rendering on or off; unset follows
    /// whether stderr is a terminal.
    pub progress: Option<bool>,
}

impl GcConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        Self {
            disabled: snapshot.flag_is_enabled(ENV_GC_DISABLE),
            progress: snapshot.var(ENV_PROGRESS).map(|value| value != "0"),
        }
    }
}

fn default_root() -> Result<PathBuf> {
    let home = dirs_next::home_dir().context("failed to resolve HOME for the stash store")?;
    Ok(home.join(".stash").join("store"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_prefers_flag_then_env() -> Result<()> {
        let snapshot = EnvSnapshot::testing(&[(ENV_ROOT, "/srv/stash")]);
        let config = Config::from_snapshot(&snapshot, None)?;
        assert_eq!(config.store().root, PathBuf::from("/srv/stash"));

        let config = Config::from_snapshot(&snapshot, Some(Path::new("/tmp/override")))?;
        assert_eq!(config.store().root, PathBuf::from("/tmp/override"));
        Ok(())
    }

    #[test]
    fn gc_flags_follow_environment() {
        let gc = GcConfig::from_snapshot(&EnvSnapshot::testing(&[
            (ENV_GC_DISABLE, "true"),
            (ENV_PROGRESS, "0"),
        ]));
        assert!(gc.disabled);
        assert_eq!(gc.progress, Some(false));

        let gc = GcConfig::from_snapshot(&EnvSnapshot::testing(&[(ENV_GC_DISABLE, "0")]));
        assert!(!gc.disabled);
        assert_eq!(gc.progress, None);
    }
}
