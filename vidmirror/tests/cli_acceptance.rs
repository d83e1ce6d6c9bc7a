use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;
use vidmirror_core::Database;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("vidmirror/mirror.db")
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("vidmirror");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }
}

fn run_bin(env: &CliTestEnv, bin_name: &str, args: &[&str]) -> Output {
    let bin_path = match bin_name {
        "vidmirror-sync" => PathBuf::from(assert_cmd::cargo::cargo_bin!("vidmirror-sync")),
        "vidmirror-reconcile" => {
            PathBuf::from(assert_cmd::cargo::cargo_bin!("vidmirror-reconcile"))
        }
        _ => panic!("unsupported binary in test harness: {bin_name}"),
    };

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute {bin_name}: {e}"))
}

fn assert_success(bin_name: &str, args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "{bin_name} {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn sync_dry_run_creates_database_and_lists_candidates() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, "vidmirror-sync", &["--dry-run"]);
    assert_success("vidmirror-sync", &["--dry-run"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Candidates (0):"), "got:\n{stdout}");
    assert!(stdout.contains("Dry run - no sync performed"));

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "database file should exist at {}",
        db_path.display()
    );

    // Schema is in place and queryable.
    let db = Database::open(&db_path).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    assert!(db.containers_needing_catchup(10).unwrap().is_empty());
}

#[test]
fn sync_without_credentials_fails_with_guidance() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, "vidmirror-sync", &[]);
    assert!(
        !output.status.success(),
        "sync with no credentials should fail"
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("credentials"),
        "expected credential guidance in stderr, got:\n{stderr}"
    );
}

#[test]
fn sync_rejects_invalid_config() {
    let env = CliTestEnv::new();
    env.write_config("[scan]\nstop_threshold = 0\n");

    let output = run_bin(&env, "vidmirror-sync", &["--dry-run"]);
    assert!(!output.status.success(), "invalid config should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("stop_threshold"),
        "expected validation message in stderr, got:\n{stderr}"
    );
}

#[test]
fn reconcile_rebuilds_counters_on_fresh_database() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, "vidmirror-reconcile", &[]);
    assert_success("vidmirror-reconcile", &[], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Rebuilt counters for 0 containers"),
        "got:\n{stdout}"
    );
    assert!(env.db_path().exists());
}
