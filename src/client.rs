use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{ClientConfig, HarnessConfig};
use crate::env::EnvDescriptor;
use crate::process::{Invocation, InvocationResult};

/// The two external binaries plus how to address them.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub server: PathBuf,
    pub client: PathBuf,
    args: ClientConfig,
    timeout: Option<Duration>,
}

impl Toolchain {
    pub fn from_config(cfg: &HarnessConfig) -> Result<Self> {
        Ok(Self {
            server: cfg.server_binary()?.to_path_buf(),
            client: cfg.client_binary()?.to_path_buf(),
            args: cfg.client.clone(),
            timeout: cfg.timing.invocation_timeout(),
        })
    }

    pub fn run_server(&self, args: Vec<String>, env: &EnvDescriptor) -> Result<InvocationResult> {
        Invocation::new(&self.server, args, env)
            .timeout(self.timeout)
            .run()
    }

    /// `check` against `repo` with extra `options` appended.
    pub fn check(
        &self,
        repo: &Path,
        options: &[String],
        stdin: Option<&str>,
        env: &EnvDescriptor,
    ) -> Result<InvocationResult> {
        let mut args = render_repo_args(&self.args.check_args, repo);
        args.extend(options.iter().cloned());
        Invocation::new(&self.client, args, env)
            .stdin(stdin)
            .timeout(self.timeout)
            .run()
    }

    pub fn stop(&self, repo: &Path, env: &EnvDescriptor) -> Result<InvocationResult> {
        let args = render_repo_args(&self.args.stop_args, repo);
        Invocation::new(&self.client, args, env)
            .timeout(self.timeout)
            .run()
    }

    pub fn logname(&self, repo: &Path, env: &EnvDescriptor) -> Result<InvocationResult> {
        let args = render_repo_args(&self.args.logname_args, repo);
        Invocation::new(&self.client, args, env)
            .timeout(self.timeout)
            .run()
    }

    /// Any other helper program (e.g. `kill`) under the same environment.
    pub fn run_tool(&self, program: &Path, args: Vec<String>, env: &EnvDescriptor) -> Result<InvocationResult> {
        Invocation::new(program, args, env).timeout(self.timeout).run()
    }

    #[cfg(test)]
    pub fn for_tests(server: PathBuf, client: PathBuf) -> Self {
        Self {
            server,
            client,
            args: ClientConfig::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

fn render_repo_args(template: &[String], repo: &Path) -> Vec<String> {
    let repo = repo.to_string_lossy();
    template
        .iter()
        .map(|a| a.replace("{repo}", &repo))
        .collect()
}
