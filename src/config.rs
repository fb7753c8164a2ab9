use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wait::Backoff;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarnessConfig {
    #[serde(default)]
    pub binaries: BinaryConfig,
    #[serde(default)]
    pub saved_state: SavedStateConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BinaryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// `load_script` in hh.conf; script prints the artifact path then changed files
    LoadScript,
    /// `load_mini_script` in hh.conf; script prints a JSON record
    MiniScript,
}

impl StrategyKind {
    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::LoadScript => "load-script",
            StrategyKind::MiniScript => "mini-script",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedStateConfig {
    pub strategy: StrategyKind,
    pub artifact_name: String,
    /// Server arguments for the save step. `{build_root}` and `{artifact}` are substituted.
    pub save_args: Vec<String>,
    /// Seconds the server may spend running the load script.
    pub load_script_timeout: u32,
}

impl Default for SavedStateConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::LoadScript,
            artifact_name: "foo".into(),
            save_args: vec![
                "--check".into(),
                "{build_root}".into(),
                "--save".into(),
                "{artifact}".into(),
            ],
            load_script_timeout: 1,
        }
    }
}

/// Client argument templates; `{repo}` is the working repo's absolute path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub check_args: Vec<String>,
    pub stop_args: Vec<String>,
    pub logname_args: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            check_args: vec![
                "check".into(),
                "--retries".into(),
                "20".into(),
                "{repo}".into(),
            ],
            stop_args: vec!["stop".into(), "{repo}".into()],
            logname_args: vec!["--logname".into(), "{repo}".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub test_mode_var: String,
    pub tmpdir_var: String,
    pub localconf_var: String,
    /// Appended after the server's directory and the artifact store.
    pub search_path: Vec<String>,
    pub extra: BTreeMap<String, String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let mut extra = BTreeMap::new();
        extra.insert("OCAMLRUNPARAM".to_string(), "b".to_string());
        Self {
            test_mode_var: "HH_TEST_MODE".into(),
            tmpdir_var: "HH_TMPDIR".into(),
            localconf_var: "HH_LOCALCONF_PATH".into(),
            search_path: vec!["/bin".into(), "/usr/bin".into(), "/usr/local/bin".into()],
            extra,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// 0 disables the per-invocation timeout.
    pub invocation_timeout_secs: u64,
    pub wait_initial_ms: u64,
    pub wait_max_delay_ms: u64,
    pub wait_deadline_ms: u64,
    /// How long an explicitly started server may take to exit after `stop`.
    pub stop_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_secs: 300,
            wait_initial_ms: 50,
            wait_max_delay_ms: 1000,
            wait_deadline_ms: 10_000,
            stop_grace_ms: 5_000,
        }
    }
}

impl TimingConfig {
    pub fn invocation_timeout(&self) -> Option<Duration> {
        (self.invocation_timeout_secs > 0).then(|| Duration::from_secs(self.invocation_timeout_secs))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.wait_initial_ms),
            max_delay: Duration::from_millis(self.wait_max_delay_ms),
            deadline: Duration::from_millis(self.wait_deadline_ms),
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub jobs: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { jobs: 1 }
    }
}

impl HarnessConfig {
    /// Load from `explicit`, then `$HH_HARNESS_CONFIG`, then the user config dir.
    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => get_config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: HarnessConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            Ok(config)
        } else if explicit.is_some() {
            anyhow::bail!("Config file not found: {}", path.display())
        } else {
            Ok(HarnessConfig::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn create_default(explicit: Option<&Path>) -> Result<PathBuf> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => get_config_path()?,
        };
        HarnessConfig::default().save_to(&path)?;
        Ok(path)
    }

    pub fn server_binary(&self) -> Result<&Path> {
        self.binaries
            .server
            .as_deref()
            .context("No server binary configured (pass --server or set binaries.server)")
    }

    pub fn client_binary(&self) -> Result<&Path> {
        self.binaries
            .client
            .as_deref()
            .context("No client binary configured (pass --client or set binaries.client)")
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("HH_HARNESS_CONFIG") {
        if !p.is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(config_dir.join("hh-harness").join("config.toml"))
}

pub fn show_config(explicit: Option<&Path>) -> Result<()> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };
    println!("Config: {}", path.display());
    println!();

    if path.exists() {
        let config = HarnessConfig::load(Some(&path))?;
        println!("{}", toml::to_string_pretty(&config)?);
    } else {
        println!("(default config, file not created)");
        println!();
        println!("{}", toml::to_string_pretty(&HarnessConfig::default())?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hack_conventions() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.saved_state.strategy, StrategyKind::LoadScript);
        assert_eq!(cfg.saved_state.artifact_name, "foo");
        assert_eq!(cfg.client.stop_args, vec!["stop", "{repo}"]);
        assert_eq!(cfg.env.tmpdir_var, "HH_TMPDIR");
        assert_eq!(cfg.run.jobs, 1);
        assert!(cfg.binaries.server.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg: HarnessConfig = toml::from_str(
            r#"
[binaries]
server = "/opt/hh_server"

[saved_state]
strategy = "mini-script"
artifact_name = "state"
save_args = ["--save-state", "{artifact}", "{build_root}"]
load_script_timeout = 5
"#,
        )
        .unwrap();
        assert_eq!(cfg.binaries.server, Some(PathBuf::from("/opt/hh_server")));
        assert_eq!(cfg.saved_state.strategy, StrategyKind::MiniScript);
        assert_eq!(cfg.timing.invocation_timeout_secs, 300);
        assert_eq!(cfg.client.logname_args[0], "--logname");
    }

    #[test]
    fn partial_sections_fill_missing_fields() {
        let cfg: HarnessConfig = toml::from_str(
            r#"
[timing]
invocation_timeout_secs = 60

[env]
search_path = ["/opt/bin"]

[saved_state]
strategy = "mini-script"

[client]
stop_args = ["stop", "--force", "{repo}"]

[run]
"#,
        )
        .unwrap();
        assert_eq!(cfg.timing.invocation_timeout_secs, 60);
        assert_eq!(cfg.timing.wait_initial_ms, 50);
        assert_eq!(cfg.timing.stop_grace_ms, 5_000);
        assert_eq!(cfg.env.search_path, vec!["/opt/bin"]);
        assert_eq!(cfg.env.tmpdir_var, "HH_TMPDIR");
        assert_eq!(cfg.env.extra.get("OCAMLRUNPARAM").map(String::as_str), Some("b"));
        assert_eq!(cfg.saved_state.strategy, StrategyKind::MiniScript);
        assert_eq!(cfg.saved_state.artifact_name, "foo");
        assert_eq!(cfg.client.check_args[0], "check");
        assert_eq!(cfg.run.jobs, 1);
    }

    #[test]
    fn zero_timeout_disables_it() {
        let mut timing = TimingConfig::default();
        assert_eq!(timing.invocation_timeout(), Some(Duration::from_secs(300)));
        timing.invocation_timeout_secs = 0;
        assert_eq!(timing.invocation_timeout(), None);
    }

    #[test]
    fn save_and_reload_roundtrip_via_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let mut cfg = HarnessConfig::default();
        cfg.run.jobs = 4;
        cfg.save_to(&path).unwrap();
        let loaded = HarnessConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.run.jobs, 4);
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = HarnessConfig::load(Some(&tmp.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn missing_binaries_have_actionable_errors() {
        let cfg = HarnessConfig::default();
        assert!(cfg.server_binary().unwrap_err().to_string().contains("--server"));
        assert!(cfg.client_binary().unwrap_err().to_string().contains("--client"));
    }
}
