use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

use crate::client::Toolchain;
use crate::config::{SavedStateConfig, StrategyKind};
use crate::corpus::Corpus;
use crate::env::EnvDescriptor;
use crate::error::HarnessError;
use crate::fixture::GroupFixture;
use crate::log;
use crate::process::InvocationResult;

const LOCAL_CONFIG: &str = "hh.conf";
const LOAD_SCRIPT: &str = "server_options.sh";

/// Saved state on disk, passed to the load step by reference only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub dir: PathBuf,
    pub name: String,
    pub fingerprint: u64,
}

impl ArtifactRef {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    pub fn verify_unchanged(&self) -> Result<()> {
        let path = self.path();
        let now = fingerprint(&path)?;
        if now != self.fingerprint {
            return Err(HarnessError::ArtifactModified { path }.into());
        }
        Ok(())
    }
}

/// Relative paths the test asserts were touched since the last checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    paths: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}

/// How a saved state is produced and how a fresh server is told to load it.
/// The scenario executor only talks to this trait.
pub trait SavedStateStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn settings(&self) -> &SavedStateConfig;

    /// Run the external save operation over `build_root`, writing `artifact`.
    fn build_saved_state(
        &self,
        tools: &Toolchain,
        build_root: &Path,
        artifact: &Path,
        env: &EnvDescriptor,
    ) -> Result<InvocationResult> {
        let build_root = build_root.to_string_lossy();
        let artifact = artifact.to_string_lossy();
        let args = self
            .settings()
            .save_args
            .iter()
            .map(|a| a.replace("{build_root}", &build_root).replace("{artifact}", &artifact))
            .collect();
        tools.run_server(args, env)
    }

    /// Point the repo's local config at this strategy's load script.
    fn install_loaded_state(&self, repo: &Path, artifact: &ArtifactRef) -> Result<()>;

    /// Write the load script so it reports `changes` alongside the artifact.
    fn declare_changed_files(&self, repo: &Path, artifact: &ArtifactRef, changes: &ChangeSet) -> Result<()>;

    /// Remove the load configuration so the next server start is cold.
    fn install_cold(&self, repo: &Path) -> Result<()> {
        for name in [LOCAL_CONFIG, LOAD_SCRIPT] {
            let path = repo.join(name);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}

pub fn strategy_for(cfg: &SavedStateConfig) -> Box<dyn SavedStateStrategy> {
    match cfg.strategy {
        StrategyKind::LoadScript => Box::new(LoadScript {
            settings: cfg.clone(),
        }),
        StrategyKind::MiniScript => Box::new(MiniScript {
            settings: cfg.clone(),
        }),
    }
}

/// Script prints the artifact path, then one changed file per line.
pub struct LoadScript {
    settings: SavedStateConfig,
}

impl SavedStateStrategy for LoadScript {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LoadScript
    }

    fn settings(&self) -> &SavedStateConfig {
        &self.settings
    }

    fn install_loaded_state(&self, repo: &Path, _artifact: &ArtifactRef) -> Result<()> {
        // load_script is invoked with extra arguments by the server, so it
        // has to be a script file rather than an inline echo.
        let content = format!(
            "# generated by hh-harness\nload_script = {}\nload_script_timeout = {}\n",
            repo.join(LOAD_SCRIPT).display(),
            self.settings.load_script_timeout
        );
        write_file(&repo.join(LOCAL_CONFIG), &content)
    }

    fn declare_changed_files(&self, repo: &Path, artifact: &ArtifactRef, changes: &ChangeSet) -> Result<()> {
        let mut body = String::from("#! /bin/sh\n");
        body.push_str(&format!("echo {}\n", shell_quote(&artifact.path().to_string_lossy())));
        for path in changes.iter() {
            body.push_str(&format!("echo {}\n", shell_quote(path)));
        }
        write_script(&repo.join(LOAD_SCRIPT), &body)
    }
}

/// Script prints one JSON record naming the state and the changed files.
pub struct MiniScript {
    settings: SavedStateConfig,
}

impl SavedStateStrategy for MiniScript {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MiniScript
    }

    fn settings(&self) -> &SavedStateConfig {
        &self.settings
    }

    fn install_loaded_state(&self, repo: &Path, _artifact: &ArtifactRef) -> Result<()> {
        let content = format!(
            "# generated by hh-harness\nuse_mini_state = true\nload_mini_script = {}\nload_script_timeout = {}\n",
            repo.join(LOAD_SCRIPT).display(),
            self.settings.load_script_timeout
        );
        write_file(&repo.join(LOCAL_CONFIG), &content)
    }

    fn declare_changed_files(&self, repo: &Path, artifact: &ArtifactRef, changes: &ChangeSet) -> Result<()> {
        let record = serde_json::json!({
            "state": artifact.path().to_string_lossy(),
            "is_cached": true,
            "changes": changes.iter().collect::<Vec<_>>(),
        });
        let body = format!("#! /bin/sh\necho {}\n", shell_quote(&record.to_string()));
        write_script(&repo.join(LOAD_SCRIPT), &body)
    }
}

/// Write the corpus into the build root, run the save step, require a clean
/// exit and an artifact, then delete the build root. Any failure here is
/// fatal for the whole group.
pub fn build(
    group: &mut GroupFixture,
    tools: &Toolchain,
    strategy: &dyn SavedStateStrategy,
    corpus: &Corpus,
) -> Result<ArtifactRef> {
    let build_root = group
        .build_root()
        .context("Saved state already built for this group")?
        .to_path_buf();
    corpus
        .write_to(&build_root)
        .context("Failed to populate saved-state build root")?;

    let name = strategy.settings().artifact_name.clone();
    let artifact = group.artifact_store().join(&name);
    log::log(&format!(
        "building saved state '{}' ({:?}) from {} files",
        name,
        strategy.kind(),
        corpus.len()
    ));

    let result = strategy.build_saved_state(tools, &build_root, &artifact, group.save_env())?;
    if !result.success() {
        return Err(HarnessError::SaveFailed {
            status: result.status_label(),
            stderr: result.stderr,
        }
        .into());
    }
    if !artifact.exists() {
        return Err(HarnessError::ArtifactMissing(artifact).into());
    }

    let canonical_root = fs::canonicalize(&build_root).unwrap_or_else(|_| build_root.clone());
    for root in [&build_root, &canonical_root] {
        if embeds_path(&artifact, root)? {
            log::warn(&format!(
                "saved state {} mentions build root {}",
                artifact.display(),
                root.display()
            ));
            break;
        }
    }

    group.discard_build_root()?;

    let fingerprint = fingerprint(&artifact)?;
    log::debug(&format!("saved state fingerprint {:016x}", fingerprint));
    Ok(ArtifactRef {
        dir: group.artifact_store().to_path_buf(),
        name,
        fingerprint,
    })
}

/// Content hash of a file, or of a directory tree (relative paths included).
pub fn fingerprint(path: &Path) -> Result<u64> {
    let mut hasher = Xxh3::new();
    let mut buf = vec![0u8; 64 * 1024];
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        let mut file = fs::File::open(entry.path())
            .with_context(|| format!("Failed to open {}", entry.path().display()))?;
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hasher.digest())
}

fn embeds_path(artifact: &Path, root: &Path) -> Result<bool> {
    let needle = root.to_string_lossy();
    let finder = memchr::memmem::Finder::new(needle.as_bytes());
    for entry in WalkDir::new(artifact) {
        let entry = entry.with_context(|| format!("Failed to walk {}", artifact.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let bytes = fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        if finder.find(&bytes).is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn write_script(path: &Path, content: &str) -> Result<()> {
    write_file(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .permissions();
        perms.set_mode(0o700);
        fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use std::process::Command;
    use tempfile::TempDir;

    fn artifact_in(dir: &Path) -> ArtifactRef {
        fs::write(dir.join("foo"), "state").unwrap();
        ArtifactRef {
            dir: dir.to_path_buf(),
            name: "foo".into(),
            fingerprint: fingerprint(&dir.join("foo")).unwrap(),
        }
    }

    fn run_script(path: &Path) -> String {
        let out = Command::new("/bin/sh").arg(path).output().unwrap();
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    fn write_exe(path: &Path, body: &str) {
        write_script(path, body).unwrap();
    }

    #[test]
    fn load_script_echoes_artifact_then_changes() {
        let store = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let artifact = artifact_in(store.path());
        let s = strategy_for(&SavedStateConfig::default());

        s.install_loaded_state(repo.path(), &artifact).unwrap();
        s.declare_changed_files(
            repo.path(),
            &artifact,
            &ChangeSet::new(["foo_2.php", "bar_2.php"]),
        )
        .unwrap();

        let conf = fs::read_to_string(repo.path().join(LOCAL_CONFIG)).unwrap();
        assert!(conf.contains("load_script = "));
        assert!(conf.contains("load_script_timeout = 1"));

        let out = run_script(&repo.path().join(LOAD_SCRIPT));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                artifact.path().to_string_lossy().as_ref(),
                "bar_2.php",
                "foo_2.php"
            ]
        );
    }

    #[test]
    fn mini_script_emits_json_record() {
        let store = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let artifact = artifact_in(store.path());
        let cfg = SavedStateConfig {
            strategy: StrategyKind::MiniScript,
            ..SavedStateConfig::default()
        };
        let s = strategy_for(&cfg);
        assert_eq!(s.kind(), StrategyKind::MiniScript);

        s.install_loaded_state(repo.path(), &artifact).unwrap();
        s.declare_changed_files(repo.path(), &artifact, &ChangeSet::default())
            .unwrap();

        let conf = fs::read_to_string(repo.path().join(LOCAL_CONFIG)).unwrap();
        assert!(conf.contains("load_mini_script = "));

        let record: serde_json::Value =
            serde_json::from_str(run_script(&repo.path().join(LOAD_SCRIPT)).trim()).unwrap();
        assert_eq!(record["is_cached"], serde_json::Value::Bool(true));
        assert_eq!(record["changes"], serde_json::json!([]));
        assert_eq!(
            record["state"].as_str().unwrap(),
            artifact.path().to_string_lossy()
        );
    }

    #[test]
    fn install_cold_removes_load_config() {
        let store = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let artifact = artifact_in(store.path());
        let s = strategy_for(&SavedStateConfig::default());
        s.install_loaded_state(repo.path(), &artifact).unwrap();
        s.declare_changed_files(repo.path(), &artifact, &ChangeSet::default())
            .unwrap();

        s.install_cold(repo.path()).unwrap();
        assert!(!repo.path().join(LOCAL_CONFIG).exists());
        assert!(!repo.path().join(LOAD_SCRIPT).exists());
        s.install_cold(repo.path()).unwrap();
    }

    #[test]
    fn shell_quote_survives_single_quotes() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("q.sh");
        write_exe(
            &script,
            &format!("#! /bin/sh\necho {}\n", shell_quote("it's $HOME")),
        );
        assert_eq!(run_script(&script).trim(), "it's $HOME");
    }

    #[test]
    fn fingerprint_detects_directory_changes() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("state");
        fs::create_dir_all(dir.join("deps")).unwrap();
        fs::write(dir.join("main"), "a").unwrap();
        fs::write(dir.join("deps/table"), "b").unwrap();
        let before = fingerprint(&dir).unwrap();
        assert_eq!(before, fingerprint(&dir).unwrap());
        fs::write(dir.join("deps/table"), "c").unwrap();
        assert_ne!(before, fingerprint(&dir).unwrap());
    }

    #[test]
    fn verify_unchanged_flags_tampering() {
        let store = TempDir::new().unwrap();
        let artifact = artifact_in(store.path());
        artifact.verify_unchanged().unwrap();
        fs::write(artifact.path(), "tampered").unwrap();
        let err = artifact.verify_unchanged().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::ArtifactModified { .. })
        ));
    }

    fn fake_server(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("hh_server");
        write_exe(&path, body);
        path
    }

    #[test]
    fn build_saves_then_deletes_build_root() {
        let bin = TempDir::new().unwrap();
        let server = fake_server(
            bin.path(),
            "#! /bin/sh\n# --check <root> --save <artifact>\nls \"$2\" > \"$4\"\n",
        );
        let tools = Toolchain::for_tests(server.clone(), PathBuf::from("/bin/true"));
        let mut group = GroupFixture::allocate(&EnvConfig::default(), &server).unwrap();
        let root = group.build_root().unwrap().to_path_buf();
        let corpus = Corpus::new()
            .with_file("foo_1.php", "<?hh")
            .with_file("foo_2.php", "<?hh");

        let strategy = strategy_for(&SavedStateConfig::default());
        let artifact = build(&mut group, &tools, strategy.as_ref(), &corpus).unwrap();

        assert!(!root.exists(), "build root must be deleted");
        assert_eq!(artifact.name, "foo");
        let listing = fs::read_to_string(artifact.path()).unwrap();
        assert!(listing.contains("foo_1.php") && listing.contains("foo_2.php"));
        artifact.verify_unchanged().unwrap();
        group.teardown().unwrap();
    }

    #[test]
    fn save_step_runs_in_isolated_env() {
        let bin = TempDir::new().unwrap();
        let server = fake_server(
            bin.path(),
            "#! /bin/sh\nprintf '%s\\n%s\\n' \"${HH_TMPDIR:-unset}\" \"${HH_LOCALCONF_PATH:-unset}\" > \"$4\"\n",
        );
        let tools = Toolchain::for_tests(server.clone(), PathBuf::from("/bin/true"));
        let mut group = GroupFixture::allocate(&EnvConfig::default(), &server).unwrap();
        let root = group.build_root().unwrap().to_string_lossy().into_owned();
        let save_tmp = group.save_env().get("HH_TMPDIR").unwrap().to_string();
        let strategy = strategy_for(&SavedStateConfig::default());

        let artifact = build(&mut group, &tools, strategy.as_ref(), &Corpus::new()).unwrap();

        let seen = fs::read_to_string(artifact.path()).unwrap();
        let lines: Vec<&str> = seen.lines().collect();
        assert_eq!(lines, vec![save_tmp.as_str(), root.as_str()]);
        group.teardown().unwrap();
    }

    #[test]
    fn failing_save_is_fatal() {
        let bin = TempDir::new().unwrap();
        let server = fake_server(bin.path(), "#! /bin/sh\necho 'parse error' >&2\nexit 2\n");
        let tools = Toolchain::for_tests(server.clone(), PathBuf::from("/bin/true"));
        let mut group = GroupFixture::allocate(&EnvConfig::default(), &server).unwrap();
        let strategy = strategy_for(&SavedStateConfig::default());

        let err = build(&mut group, &tools, strategy.as_ref(), &Corpus::new()).unwrap_err();
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::SaveFailed { status, stderr }) => {
                assert_eq!(status, "exit 2");
                assert!(stderr.contains("parse error"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn clean_exit_without_artifact_is_fatal() {
        let bin = TempDir::new().unwrap();
        let server = fake_server(bin.path(), "#! /bin/sh\nexit 0\n");
        let tools = Toolchain::for_tests(server.clone(), PathBuf::from("/bin/true"));
        let mut group = GroupFixture::allocate(&EnvConfig::default(), &server).unwrap();
        let strategy = strategy_for(&SavedStateConfig::default());

        let err = build(&mut group, &tools, strategy.as_ref(), &Corpus::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::ArtifactMissing(_))
        ));
    }

    #[test]
    fn embedded_build_root_is_detected() {
        let tmp = TempDir::new().unwrap();
        let art = tmp.path().join("art");
        fs::write(&art, format!("root={}/x", tmp.path().display())).unwrap();
        assert!(embeds_path(&art, tmp.path()).unwrap());
        assert!(!embeds_path(&art, Path::new("/nowhere/else")).unwrap());
    }
}
