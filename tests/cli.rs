use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn shardrun(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("shardrun").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

/// A project with three spec files and an engine script that prints one
/// JSON result per worker.
fn project(failures: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    for file in ["tests/fast/login.spec.js", "tests/cart.spec.js", "tests/slow/checkout.test.js"] {
        let path = root.join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "// test\n").unwrap();
    }
    std::fs::write(root.join("tests/README.md"), "not a test\n").unwrap();

    std::fs::write(
        root.join("engine.sh"),
        format!(
            "echo \"running $# tests on worker $SHARDRUN_WORKER\" >&2\n\
             echo '{{\"tests\":2,\"passes\":{},\"failures\":{},\"pending\":0,\"duration\":15}}'\n",
            2 - failures,
            failures
        ),
    )
    .unwrap();

    // Limits loose enough for any build machine.
    std::fs::write(
        root.join("shardrun.toml"),
        r#"
[runner]
monitor_interval_ms = 100
shutdown_grace_secs = 1

[resources]
memory_limit_percent = 100.0
memory_emergency_percent = 100.0
cpu_threshold_percent = 100000.0
cpu_emergency_percent = 100000.0
disk_buffer_mb = 0

[engine]
command = "sh engine.sh {tests}"
"#,
    )
    .unwrap();

    dir
}

#[test]
fn test_init_writes_config_once() {
    let dir = TempDir::new().unwrap();

    shardrun(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created shardrun.toml"));
    assert!(dir.path().join("shardrun.toml").exists());

    shardrun(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Groups: fast, medium, slow, smoke"));

    shardrun(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("shardrun.toml"),
        "[discovery]\ndefault_group = \"missing\"\n",
    )
    .unwrap();

    shardrun(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn test_collect_groups_tests() {
    let dir = project(0);

    shardrun(dir.path())
        .arg("collect")
        .assert()
        .success()
        .stdout(predicate::str::contains("Discovered 3 tests"))
        .stdout(predicate::str::contains("fast/login.spec.js"))
        .stdout(predicate::str::contains("README").not());

    let output = shardrun(dir.path())
        .args(["collect", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let catalog: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(catalog["tests"]["slow"][0]["id"], "slow/checkout.test.js");
    assert_eq!(catalog["tests"]["medium"][0]["id"], "cart.spec.js");
}

#[test]
fn test_plan_prints_schedule() {
    let dir = project(0);

    shardrun(dir.path())
        .args(["plan", "--workers", "2", "--strategy", "fastest"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 tests on 2 workers (fastest strategy"))
        .stdout(predicate::str::contains("Worker 1:"));
}

#[test]
fn test_run_all_passing_exits_zero() {
    let dir = project(0);

    shardrun(dir.path())
        .args(["run", "--workers", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"));

    let out = dir.path().join("test-results");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("execution-report.json")).unwrap())
            .unwrap();
    assert_eq!(report["summary"]["tests"]["total"], 6);
    assert_eq!(report["summary"]["tests"]["passRate"], 100.0);
    assert_eq!(report["summary"]["workers"]["successful"], 3);
    assert_eq!(report["workerResults"].as_array().unwrap().len(), 3);

    assert!(out.join("execution-summary.txt").exists());
    assert!(out.join("timings.json").exists());
    assert!(out.join("workers/worker-0/worker.log").exists());
}

#[test]
fn test_run_with_failures_exits_one() {
    let dir = project(1);

    shardrun(dir.path())
        .args(["run", "--workers", "2", "--no-video", "--headed"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("tests failed"));

    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("test-results/execution-report.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(report["summary"]["tests"]["failed"], 2);
    assert_eq!(report["summary"]["tests"]["passRate"], 50.0);
}

#[test]
fn test_run_refused_when_resources_unsafe() {
    let dir = project(0);

    shardrun(dir.path())
        .args(["run", "--memory-limit", "0.001"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("RUN REFUSED"));
    assert!(!dir.path().join("test-results/workers").exists());
}

#[test]
fn test_memory_limit_above_emergency_rejected() {
    let dir = project(0);
    std::fs::write(
        dir.path().join("shardrun.toml"),
        "[resources]\nmemory_emergency_percent = 90.0\n\n[engine]\ncommand = \"sh engine.sh {tests}\"\n",
    )
    .unwrap();

    shardrun(dir.path())
        .args(["run", "--memory-limit", "95"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid command-line options"))
        .stderr(predicate::str::contains("exceeds memory_emergency_percent"));
    assert!(!dir.path().join("test-results").exists());
}

#[test]
fn test_rejects_unknown_strategy() {
    let dir = project(0);

    shardrun(dir.path())
        .args(["run", "--strategy", "random"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
