use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::EnvConfig;
use crate::env::{self, EnvDescriptor};
use crate::log;

/// Directories owned by one test group: artifact store, save-step server
/// temp, build root. The build root only lives until the saved state has been
/// produced.
#[derive(Debug)]
pub struct GroupFixture {
    // Field order is drop order, the reverse of allocation.
    build_root: Option<TempDir>,
    save_tmp: TempDir,
    artifact_store: TempDir,
    env: EnvDescriptor,
    save_env: EnvDescriptor,
}

impl GroupFixture {
    /// Allocate process-unique directories and compose the group environment.
    pub fn allocate(cfg: &EnvConfig, server: &Path) -> Result<Self> {
        let artifact_store = tempfile::Builder::new()
            .prefix("hh-artifacts-")
            .tempdir()
            .context("Failed to allocate artifact store")?;
        let save_tmp = tempfile::Builder::new()
            .prefix("hh-save-tmp-")
            .tempdir()
            .context("Failed to allocate save-step server temp dir")?;
        let build_root = tempfile::Builder::new()
            .prefix("hh-build-")
            .tempdir()
            .context("Failed to allocate saved-state build root")?;

        let env = EnvDescriptor::from_process().merged(&env::group_overrides(
            cfg,
            server,
            artifact_store.path(),
        ));
        let save_env = env.merged(&env::test_overrides(cfg, save_tmp.path(), build_root.path()));
        log::debug(&format!(
            "group dirs: build_root={} artifact_store={} save_tmp={}",
            build_root.path().display(),
            artifact_store.path().display(),
            save_tmp.path().display()
        ));

        Ok(Self {
            build_root: Some(build_root),
            save_tmp,
            artifact_store,
            env,
            save_env,
        })
    }

    pub fn build_root(&self) -> Option<&Path> {
        self.build_root.as_ref().map(TempDir::path)
    }

    pub fn artifact_store(&self) -> &Path {
        self.artifact_store.path()
    }

    pub fn env(&self) -> &EnvDescriptor {
        &self.env
    }

    /// Environment for the save step: the group layer plus a private server
    /// temp dir and the build root as local-config path.
    pub fn save_env(&self) -> &EnvDescriptor {
        &self.save_env
    }

    /// Delete the build root. Anything that still needs it afterwards was
    /// depending on an absolute path.
    pub fn discard_build_root(&mut self) -> Result<()> {
        if let Some(dir) = self.build_root.take() {
            let path = dir.path().to_path_buf();
            dir.close()
                .with_context(|| format!("Failed to delete build root {}", path.display()))?;
            log::debug(&format!("deleted build root {}", path.display()));
        }
        Ok(())
    }

    /// Disjoint directories for one test plus its environment layer.
    pub fn allocate_test(&self, cfg: &EnvConfig) -> Result<TestFixture> {
        TestFixture::allocate(cfg, &self.env)
    }

    /// Remove everything in reverse order of allocation.
    pub fn teardown(mut self) -> Result<()> {
        self.discard_build_root()?;
        let tmp = self.save_tmp.path().to_path_buf();
        self.save_tmp
            .close()
            .with_context(|| format!("Failed to delete save temp dir {}", tmp.display()))?;
        let store = self.artifact_store.path().to_path_buf();
        self.artifact_store
            .close()
            .with_context(|| format!("Failed to delete artifact store {}", store.display()))
    }
}

/// Working repo and server temp area for exactly one test.
#[derive(Debug)]
pub struct TestFixture {
    server_tmp: TempDir,
    work_root: TempDir,
    repo: PathBuf,
    env: EnvDescriptor,
}

impl TestFixture {
    fn allocate(cfg: &EnvConfig, group_env: &EnvDescriptor) -> Result<Self> {
        let work_root = tempfile::Builder::new()
            .prefix("hh-repo-")
            .tempdir()
            .context("Failed to allocate working repo")?;
        let server_tmp = tempfile::Builder::new()
            .prefix("hh-tmp-")
            .tempdir()
            .context("Failed to allocate server temp dir")?;

        // Canonical so paths reported by the server line up with templated
        // expectations (e.g. /var vs /private/var on macOS).
        let root = fs::canonicalize(work_root.path())
            .with_context(|| format!("Failed to resolve {}", work_root.path().display()))?;
        let repo = root.join("repo");

        let env = group_env.merged(&env::test_overrides(cfg, server_tmp.path(), &repo));
        Ok(Self {
            server_tmp,
            work_root,
            repo,
            env,
        })
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn server_tmp(&self) -> &Path {
        self.server_tmp.path()
    }

    pub fn env(&self) -> &EnvDescriptor {
        &self.env
    }

    pub fn teardown(self) -> Result<()> {
        if self.repo.exists() {
            fs::remove_dir_all(&self.repo)
                .with_context(|| format!("Failed to delete {}", self.repo.display()))?;
        }
        let work = self.work_root.path().to_path_buf();
        self.work_root
            .close()
            .with_context(|| format!("Failed to delete {}", work.display()))?;
        let tmp = self.server_tmp.path().to_path_buf();
        self.server_tmp
            .close()
            .with_context(|| format!("Failed to delete {}", tmp.display()))
    }
}
