#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::assert::Assert;
use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

/// Scratch directory holding a store root and a few payload files.
pub struct Sandbox {
    pub temp: TempDir,
}

impl Sandbox {
    pub fn new(prefix: &str) -> Self {
        let temp = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .expect("tempdir");
        Self { temp }
    }

    pub fn root(&self) -> PathBuf {
        self.temp.path().join("store")
    }

    pub fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp.path().join(name);
        fs::write(&path, contents).expect("write payload");
        path
    }

    /// `stash` pointed at this sandbox with a clean environment.
    pub fn stash(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("stash");
        cmd.env_remove("STASH_GC_DISABLE")
            .env_remove("STASH_ROOT")
            .env("STASH_PROGRESS", "0")
            .env("NO_COLOR", "1")
            .arg("--root")
            .arg(self.root());
        cmd
    }

    pub fn archives(&self) -> Vec<PathBuf> {
        list_archives(&self.root().join("archives"))
    }
}

pub fn list_archives(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "stash"))
        .collect();
    paths.sort();
    paths
}

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}
