use std::time::Duration;

use super::*;
use crate::Error;

fn runner(root: &Path) -> CommandRunner {
    CommandRunner::new(root, root.join("dist"))
}

#[tokio::test]
async fn run_captures_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let out = runner(dir.path())
        .run(RunSpec::new("/bin/echo").arg("hello"))
        .await
        .unwrap();

    assert!(out.success());
    assert_eq!(out.stdout.trim(), "hello");
    assert!(out.stderr.is_empty());
}

#[tokio::test]
async fn strict_run_fails_on_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let err = runner(dir.path())
        .run(RunSpec::new("/bin/sh").args(["-c", "echo diagnostic >&2; exit 3"]))
        .await
        .unwrap_err();

    match err {
        Error::Command(CommandError::Failed { status, stderr, .. }) => {
            assert_eq!(status.code(), Some(3));
            assert!(stderr.contains("diagnostic"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn non_strict_run_returns_output_on_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let out = runner(dir.path())
        .run(RunSpec::new("/bin/sh").args(["-c", "exit 1"]).no_strict())
        .await
        .unwrap();

    assert!(!out.success());
}

#[tokio::test]
async fn timeout_kills_the_child_and_keeps_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let err = runner(dir.path())
        .run(
            RunSpec::new("/bin/sh")
                .args(["-c", "echo started; sleep 30"])
                .timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();

    match err {
        Error::Command(CommandError::TimedOut { stdout, .. }) => {
            assert!(stdout.contains("started"));
        }
        other => panic!("expected TimedOut, got {other:?}"),
    }
}

#[tokio::test]
async fn caller_env_wins_over_fixed_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let out = runner(dir.path())
        .run(
            RunSpec::new("/bin/sh")
                .args(["-c", "echo $CLUSTER_ROOT"])
                .env("CLUSTER_ROOT", "/overridden"),
        )
        .await
        .unwrap();

    assert_eq!(out.stdout.trim(), "/overridden");
}

#[tokio::test]
async fn cluster_root_is_exported_to_children() {
    let dir = tempfile::tempdir().unwrap();
    let out = runner(dir.path())
        .run(RunSpec::new("/bin/sh").args(["-c", "echo $CLUSTER_ROOT"]))
        .await
        .unwrap();

    assert_eq!(out.stdout.trim(), dir.path().display().to_string());
}

#[test]
fn indent_prefixes_every_line() {
    assert_eq!(indent("a\nb"), "  a\n  b");
    assert_eq!(indent("single\n"), "  single");
}
