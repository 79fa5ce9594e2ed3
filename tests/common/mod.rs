#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Env vars that would leak the developer's setup into a test run.
const SCRUBBED_ENV: &[&str] = &[
    "GPI_OUTPUT_FORMAT",
    "GPI_PRIMARY_BASE_URL",
    "GPI_PRIMARY_POSITIONS_PATH",
    "GPI_PRIMARY_TIMEOUT_SECS",
    "GPI_SECONDARY_BASE_URL",
    "GPI_SECONDARY_USER",
    "GPI_SECONDARY_PASSWORD",
    "GPI_SECONDARY_POSITIONS_PATH",
    "GPI_SECONDARY_TIMEOUT_SECS",
    "GPI_STORE_CHUNK_SIZE",
    "GPI_STORE_LATEST_POLICY",
    "GPI_SCHEDULE_INTERVAL_SECS",
    "GPI_SQLITE_DB",
    "GPI_JSONL_LOG",
    "GPI_LOCK_FILE",
];

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_gpsi") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "gpsi.exe" } else { "gpsi" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve gpsi binary path for integration test"),
    }
}

/// Write a config whose data paths all live under `dir`.
pub fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        "[paths]\nsqlite_db = {db:?}\njsonl_log = {log:?}\nlock_file = {lock:?}\n\n{extra}\n",
        db = dir.join("positions.sqlite3").to_string_lossy(),
        log = dir.join("runs.jsonl").to_string_lossy(),
        lock = dir.join("ingest.lock").to_string_lossy(),
    );
    fs::write(&path, content).expect("write test config");
    path
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("gpsi-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command.args(args).env("RUST_BACKTRACE", "1");
    for key in SCRUBBED_ENV {
        command.env_remove(key);
    }
    let output = command.output().expect("execute gpsi command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
