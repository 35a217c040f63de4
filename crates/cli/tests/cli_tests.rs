//! CLI integration tests

use std::process::Command;

fn harbor(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "harbor-cli", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = harbor(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Train and deploy ML models"), "Should show about text");
    for command in ["init", "build", "train", "refresh-data", "deploy", "undeploy", "status"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("HARBOR_PROJECT_DIR"), "Should show env var");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = harbor(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("harbor"), "Should show binary name");
}

/// Test train subcommand help
#[test]
fn test_train_help() {
    let output = harbor(&["train", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Train help should succeed");
    assert!(stdout.contains("--keep-alive"), "Should show keep-alive option");
    assert!(stdout.contains("--name"), "Should show name option");
}

/// Test deploy subcommand help
#[test]
fn test_deploy_help() {
    let output = harbor(&["deploy", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Deploy help should succeed");
    assert!(stdout.contains("--model-name"), "Should show model-name option");
    assert!(stdout.contains("--include-data"), "Should show include-data option");
}

/// Test that undeploy needs a model or --all
#[test]
fn test_undeploy_requires_target() {
    let output = harbor(&["undeploy"]);
    assert!(!output.status.success(), "Undeploy without target should fail");

    let output = harbor(&["undeploy", "iris", "--all"]);
    assert!(!output.status.success(), "Model and --all conflict");
}

/// Test init creates a project without touching Docker
#[test]
fn test_init_creates_project() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().to_str().unwrap();

    let output = harbor(&["--dir", root, "--format", "json", "init"]);
    assert!(output.status.success(), "Init should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("project_id"));
    assert!(dir.path().join("harbor.toml").is_file());
    assert!(dir.path().join("containers/default.dockerfile").is_file());
    assert!(dir.path().join("src").is_dir());
}

/// Test commands outside a project fail cleanly
#[test]
fn test_status_outside_project() {
    let dir = tempfile::TempDir::new().unwrap();
    let output = harbor(&["--dir", dir.path().to_str().unwrap(), "status"]);

    assert!(!output.status.success(), "Status outside a project should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("harbor init"), "Should suggest harbor init");
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = harbor(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}
