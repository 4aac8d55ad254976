use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn strata(root: &Path, storage: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_strata"))
        .arg("--path")
        .arg(root)
        .arg("--storage")
        .arg(storage)
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to run strata")
}

#[test]
fn test_cli_scan_export_import_apply() {
    let source = TempDir::new().unwrap();
    let source_storage = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();
    let mirror_storage = TempDir::new().unwrap();
    let exports = TempDir::new().unwrap();

    let output = strata(source.path(), &source_storage.path().join("db"), &["init"]);
    assert!(output.status.success(), "CLI init failed: {:?}", output);

    fs::write(source.path().join("hello.txt"), "hello").unwrap();
    let output = strata(source.path(), &source_storage.path().join("db"), &["scan"]);
    assert!(output.status.success(), "CLI scan failed: {:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✓ Recorded patch 1"), "Unexpected scan output: {}", stdout);

    let output = strata(source.path(), &source_storage.path().join("db"), &["scan"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No changes detected."), "Unexpected scan output: {}", stdout);

    let patch = exports.path().join("1.patch");
    let output = strata(
        source.path(),
        &source_storage.path().join("db"),
        &["export", "1", patch.to_str().unwrap()],
    );
    assert!(output.status.success(), "CLI export failed: {:?}", output);

    let output = strata(mirror.path(), &mirror_storage.path().join("db"), &["init"]);
    assert!(output.status.success(), "CLI init failed: {:?}", output);
    let output = strata(
        mirror.path(),
        &mirror_storage.path().join("db"),
        &["import", patch.to_str().unwrap()],
    );
    assert!(output.status.success(), "CLI import failed: {:?}", output);

    let output = strata(
        mirror.path(),
        &mirror_storage.path().join("db"),
        &["apply", "1", mirror.path().to_str().unwrap()],
    );
    assert!(output.status.success(), "CLI apply failed: {:?}", output);
    assert_eq!(fs::read_to_string(mirror.path().join("hello.txt")).unwrap(), "hello");

    let output = strata(mirror.path(), &mirror_storage.path().join("db"), &["verify", "--deep"]);
    assert!(output.status.success(), "CLI verify failed: {:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Verification Report:"), "Unexpected verify output: {}", stdout);
}

#[test]
fn test_cli_requires_init() {
    let tmp = TempDir::new().unwrap();
    let output = strata(tmp.path(), &tmp.path().join(".strata"), &["list"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("strata init"), "Unexpected error output: {}", stderr);
}

#[test]
fn test_cli_show_dumps_patch_tree() {
    let tmp = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("etc")).unwrap();
    fs::write(tmp.path().join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();

    assert!(strata(tmp.path(), storage.path(), &["init"]).status.success());
    assert!(strata(tmp.path(), storage.path(), &["scan"]).status.success());

    let output = strata(tmp.path(), storage.path(), &["show", "1"]);
    assert!(output.status.success(), "CLI show failed: {:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Dir ADDED"), "Unexpected show output: {}", stdout);
    assert!(stdout.contains("hosts"), "Unexpected show output: {}", stdout);
}
