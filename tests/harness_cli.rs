//! Integration tests for the `hh-harness` binary, driven against stand-in
//! `hh_server` / `hh_client` shell scripts.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

// ── Stand-in binaries ───────────────────────────────────────

const FAKE_SERVER: &str = r#"#!/bin/sh
# --check <build_root> --save <artifact>
if [ "$1" = "--check" ]; then
  if [ -n "$FAKE_SAVE_FAIL" ]; then
    echo "save exploded" >&2
    exit 2
  fi
  (cd "$2" && ls -A) > "$4"
  exit 0
fi
exit 0
"#;

const FAKE_CLIENT: &str = r#"#!/bin/sh
if [ "$1" = "stop" ]; then
  if [ -n "$FAKE_STOP_FAIL" ]; then
    echo "hh_client: server did not stop" >&2
    exit 3
  fi
  exit 0
fi
if [ "$1" = "--logname" ]; then
  echo "$2/.hh.log"
  exit 0
fi
# check --retries N <repo> [options]
repo="$4"
shift 4
case "$1" in
  "") echo "No errors!" ;;
  --json) echo '{"passed":true,"errors":[],"version":"fake-1"}' >&2 ;;
  --changes) sh "$repo/server_options.sh" | tail -n +2 ;;
  --list-files) ls "$repo" | grep '\.php$' | sed "s|^|$repo/|" ;;
  *) echo "unknown option $1" >&2; exit 2 ;;
esac
"#;

const SUITE: &str = r#"
[corpus]
".hhconfig" = "assume_php = false"
"a.php" = "<?hh"

[[scenario]]
name = "clean_status"
description = "status and json status on the unmodified corpus"

[[scenario.step]]
op = "declare"

[[scenario.step]]
op = "check"
expect = ["No errors!"]

[[scenario.step]]
op = "json_status"

[[scenario]]
name = "declared_changes_reach_load_script"

[[scenario.step]]
op = "write"
path = "b.php"
content = "<?hh function b() {}"

[[scenario.step]]
op = "declare"
paths = ["b.php"]

[[scenario.step]]
op = "check"
args = ["--changes"]
expect = ["b.php"]

[[scenario.step]]
op = "check_both"
args = ["--list-files"]
text = ["{root}a.php", "{root}b.php"]
structured = ["{root}a.php", "{root}b.php"]
"#;

struct Fakes {
    dir: TempDir,
}

impl Fakes {
    fn new() -> Self {
        let dir = TempDir::new().expect("create fake bin dir");
        write_exe(&dir.path().join("hh_server"), FAKE_SERVER);
        write_exe(&dir.path().join("hh_client"), FAKE_CLIENT);
        Self { dir }
    }

    fn server(&self) -> PathBuf {
        self.dir.path().join("hh_server")
    }

    fn client(&self) -> PathBuf {
        self.dir.path().join("hh_client")
    }

    fn suite(&self, text: &str) -> PathBuf {
        let path = self.dir.path().join("suite.toml");
        fs::write(&path, text).expect("write suite");
        path
    }

    fn harness(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_hh-harness"));
        cmd.env("HH_HARNESS_CONFIG", self.dir.path().join("no-config.toml"))
            .env("NO_COLOR", "1")
            .env("CLICOLOR", "0")
            .env_remove("FAKE_SAVE_FAIL")
            .env_remove("FAKE_STOP_FAIL");
        cmd
    }

    fn run_suite(&self, suite: &Path, extra: &[&str]) -> Command {
        let mut cmd = self.harness();
        cmd.arg("run")
            .arg("--server")
            .arg(self.server())
            .arg("--client")
            .arg(self.client())
            .arg("--scenarios")
            .arg(suite)
            .args(extra);
        cmd
    }
}

fn write_exe(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

// ── run ─────────────────────────────────────────────────────

#[test]
fn passing_suite_exits_zero() {
    let fakes = Fakes::new();
    let suite = fakes.suite(SUITE);

    let out = fakes.run_suite(&suite, &[]).output().expect("run hh-harness");

    let text = stdout(&out);
    assert!(out.status.success(), "stdout:\n{}\nstderr:\n{}", text, stderr(&out));
    assert!(text.contains("PASS clean_status"), "{}", text);
    assert!(text.contains("PASS declared_changes_reach_load_script"), "{}", text);
    assert!(text.contains("2 passed, 0 failed, 0 not run"), "{}", text);
}

#[test]
fn commands_are_echoed_on_stderr() {
    let fakes = Fakes::new();
    let suite = fakes.suite(SUITE);

    let out = fakes
        .run_suite(&suite, &["--filter", "clean"])
        .output()
        .expect("run hh-harness");

    let err = stderr(&out);
    assert!(out.status.success());
    assert!(err.contains("[hh-harness] $ "), "{}", err);
    assert!(err.contains("--save"), "save step should be echoed: {}", err);
    // the --json status record is forwarded from the client's stderr
    assert!(err.contains("\"version\":\"fake-1\""), "{}", err);
}

#[test]
fn mismatch_fails_with_diff() {
    let fakes = Fakes::new();
    let suite = fakes.suite(&SUITE.replace(
        "expect = [\"No errors!\"]",
        "expect = [\"{root}a.php:1:1,1: Unbound name (Naming[2049])\"]",
    ));

    let out = fakes
        .run_suite(&suite, &["--filter", "clean_status"])
        .output()
        .expect("run hh-harness");

    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(1));
    assert!(text.contains("FAIL clean_status"), "{}", text);
    assert!(text.contains("+ No errors!"), "{}", text);
    assert!(text.contains("Unbound name (Naming[2049])"), "{}", text);
}

#[test]
fn failed_stop_fails_the_scenario() {
    let fakes = Fakes::new();
    let suite = fakes.suite(SUITE);

    let out = fakes
        .run_suite(&suite, &["--filter", "clean_status"])
        .env("FAKE_STOP_FAIL", "1")
        .output()
        .expect("run hh-harness");

    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(1));
    assert!(text.contains("FAIL clean_status"), "{}", text);
    assert!(text.contains("stopping server for"), "{}", text);
    assert!(text.contains("server did not stop"), "{}", text);
}

#[test]
fn failed_save_aborts_the_group() {
    let fakes = Fakes::new();
    let suite = fakes.suite(SUITE);

    let out = fakes
        .run_suite(&suite, &[])
        .env("FAKE_SAVE_FAIL", "1")
        .output()
        .expect("run hh-harness");

    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(1));
    assert!(text.contains("SKIP clean_status"), "{}", text);
    assert!(text.contains("SKIP declared_changes_reach_load_script"), "{}", text);
    assert!(text.contains("saved state build failed"), "{}", text);
    assert!(text.contains("save exploded"), "{}", text);
    assert!(text.contains("0 passed, 0 failed, 2 not run"), "{}", text);
}

#[test]
fn json_report_is_machine_readable() {
    let fakes = Fakes::new();
    let suite = fakes.suite(SUITE);

    let out = fakes
        .run_suite(&suite, &["--format", "json", "--jobs", "2"])
        .output()
        .expect("run hh-harness");

    assert!(out.status.success(), "{}", stderr(&out));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).expect("valid json");
    assert_eq!(report["success"], true);
    assert_eq!(report["strategy"], "load-script");
    assert_eq!(report["summary"]["passed"], 2);
    // parallel runs keep suite order
    assert_eq!(report["outcomes"][0]["name"], "clean_status");
    assert_eq!(report["outcomes"][1]["name"], "declared_changes_reach_load_script");
    assert!(report["artifact_fingerprint"].is_string());
}

#[test]
fn undeclared_mutation_is_rejected_before_running() {
    let fakes = Fakes::new();
    let suite = fakes.suite(&SUITE.replace("paths = [\"b.php\"]", "paths = []"));

    let out = fakes.run_suite(&suite, &[]).output().expect("run hh-harness");

    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("invalid scenario"), "{}", err);
    assert!(err.contains("b.php"), "{}", err);
}

#[test]
fn missing_binaries_is_a_usage_error() {
    let fakes = Fakes::new();
    let out = fakes.harness().arg("run").output().expect("run hh-harness");

    assert!(!out.status.success());
    assert!(stderr(&out).contains("--server"), "{}", stderr(&out));
}

// ── list / config ───────────────────────────────────────────

#[test]
fn list_shows_builtin_scenarios() {
    let fakes = Fakes::new();
    let out = fakes.harness().arg("list").output().expect("run hh-harness list");

    assert!(out.status.success());
    let text = stdout(&out);
    for name in ["responsiveness", "moved_file", "refactor_methods", "incremental_matches_cold"] {
        assert!(text.lines().any(|l| l == name), "missing {} in:\n{}", name, text);
    }
}

#[test]
fn list_merges_builtin_with_custom_scenarios() {
    let fakes = Fakes::new();
    let suite = fakes.suite(
        r#"
[[scenario]]
name = "extra_probe"

[[scenario.step]]
op = "declare"

[[scenario.step]]
op = "check"
"#,
    );

    let out = fakes
        .harness()
        .args(["list", "--with-builtin", "--scenarios"])
        .arg(&suite)
        .output()
        .expect("run hh-harness list");

    assert!(out.status.success(), "{}", stderr(&out));
    let text = stdout(&out);
    assert!(text.lines().any(|l| l == "extra_probe"));
    assert!(text.lines().any(|l| l == "find_refs"));
}

#[test]
fn config_init_writes_defaults() {
    let fakes = Fakes::new();
    let path = fakes.dir.path().join("cfg").join("config.toml");

    let out = fakes
        .harness()
        .arg("--config")
        .arg(&path)
        .args(["config", "--init"])
        .output()
        .expect("run hh-harness config --init");

    assert!(out.status.success(), "{}", stderr(&out));
    let written = fs::read_to_string(&path).expect("config written");
    assert!(written.contains("HH_TEST_MODE"));
    assert!(written.contains("load-script"));
}
