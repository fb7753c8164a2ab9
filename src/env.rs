use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::EnvConfig;

/// Immutable variable map handed verbatim to every spawned process.
/// Built by layering overrides on a base; later layers always win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvDescriptor {
    vars: BTreeMap<String, String>,
}

impl EnvDescriptor {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of the harness's own environment. Non-UTF-8 entries are dropped.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_path(self, key: impl Into<String>, value: &Path) -> Self {
        self.with(key, value.to_string_lossy().into_owned())
    }

    /// New descriptor with `overrides` layered on top of `self`.
    pub fn merged(&self, overrides: &EnvDescriptor) -> EnvDescriptor {
        let mut vars = self.vars.clone();
        for (k, v) in &overrides.vars {
            vars.insert(k.clone(), v.clone());
        }
        EnvDescriptor { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.vars.len()
    }
}

/// Group-level layer: test mode, restricted search path, extra variables.
pub fn group_overrides(cfg: &EnvConfig, server: &Path, artifact_store: &Path) -> EnvDescriptor {
    let mut search: Vec<PathBuf> = Vec::new();
    if let Some(dir) = server.parent().filter(|d| !d.as_os_str().is_empty()) {
        search.push(dir.to_path_buf());
    }
    search.push(artifact_store.to_path_buf());
    search.extend(cfg.search_path.iter().map(PathBuf::from));

    let path = search
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":");

    let mut env = EnvDescriptor::empty()
        .with(cfg.test_mode_var.as_str(), "1")
        .with("PATH", path);
    for (k, v) in &cfg.extra {
        env = env.with(k.as_str(), v.as_str());
    }
    env
}

/// Test-level layer: the server's private temp dir and the local-config dir.
pub fn test_overrides(cfg: &EnvConfig, server_tmp: &Path, localconf: &Path) -> EnvDescriptor {
    EnvDescriptor::empty()
        .with_path(cfg.tmpdir_var.as_str(), server_tmp)
        .with_path(cfg.localconf_var.as_str(), localconf)
}
