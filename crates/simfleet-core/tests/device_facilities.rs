//! Per-device facilities wired through a scripted remote host.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{Reply, ScriptedExecutor};

use simfleet_core::capture::{CaptureError, CaptureKind};
use simfleet_core::device::{DeviceError, DeviceHandle, DeviceKind, DeviceLayout, DeviceRef};
use simfleet_core::simctl::SimctlError;

const UDID: &str = "A1B2C3D4-E5F6-7890-ABCD-EF1234567890";

fn layout(capture_dir: &Path) -> DeviceLayout {
    DeviceLayout {
        backup_root: "/var/simfleet/backups".into(),
        video_dir: "/var/simfleet/videos".into(),
        capture_dir: capture_dir.to_path_buf(),
        backup_timeout: Duration::from_secs(120),
    }
}

fn simulator(exec: &Arc<ScriptedExecutor>, capture_dir: &Path) -> DeviceHandle {
    DeviceHandle::new(
        DeviceRef::new(UDID),
        DeviceKind::Simulator,
        exec.clone(),
        layout(capture_dir),
    )
}

#[tokio::test]
async fn data_dir_is_looked_up_once() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    exec.on(
        "xcrun simctl getenv",
        [Reply::ok("/Users/ci/Library/Developer/CoreSimulator/Devices/A1B2/data\n")],
    );
    let device = simulator(&exec, dir.path());

    let shared = device.shared_container().await.unwrap();
    assert_eq!(
        shared.base(),
        Path::new("/Users/ci/Library/Developer/CoreSimulator/Devices/A1B2/data")
    );

    let backup = device.backup().await.unwrap();
    assert_eq!(backup.live_path(), shared.base());
    assert_eq!(
        backup.backup_path(),
        Path::new("/var/simfleet/backups").join(UDID)
    );

    assert_eq!(exec.count(&format!("xcrun simctl getenv {UDID} HOME")), 1);
}

#[tokio::test]
async fn app_containers_are_cached_per_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    exec.on("xcrun simctl get_app_container", [Reply::ok("/containers/app-1\n")]);
    let device = simulator(&exec, dir.path());

    let first = device.app_container("com.example.one").await.unwrap();
    let again = device.app_container("com.example.one").await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    device.app_container("com.example.two").await.unwrap();

    assert_eq!(exec.count("xcrun simctl get_app_container"), 2);
    assert_eq!(
        exec.calls()[0],
        format!("xcrun simctl get_app_container {UDID} com.example.one data")
    );
}

#[tokio::test]
async fn missing_app_is_a_locate_error() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    exec.on(
        "xcrun simctl get_app_container",
        [Reply::fail(2, "No such file or directory")],
    );
    let device = simulator(&exec, dir.path());

    let err = device.app_container("com.example.missing").await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Locate { source: SimctlError::CommandFailed(_), .. }
    ));
}

#[tokio::test]
async fn simulator_log_content_failure_carries_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    exec.on(
        &format!("xcrun simctl spawn {UDID} log show"),
        [Reply::fail(64, "log: Invalid predicate")],
    );
    let device = simulator(&exec, dir.path());

    let log = device.log().await;
    log.truncate().await.unwrap();
    let err = log.content(Some("MyApp")).await.unwrap_err();

    match err {
        CaptureError::Unreadable { kind, stderr, .. } => {
            assert_eq!(kind, CaptureKind::SystemLog);
            assert_eq!(stderr, "log: Invalid predicate");
        }
        other => panic!("expected Unreadable, got {other:?}"),
    }
    let show = exec.calls().pop().unwrap();
    assert!(show.contains("--start "));
    assert!(show.contains(r#"--predicate process == "MyApp""#));
}

#[tokio::test]
async fn simulator_truncate_uses_host_clock() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    exec.on("date -u", [Reply::ok("2026-10-19T08:30:00Z\n")]);
    let device = simulator(&exec, dir.path());

    let log = device.log().await;
    log.truncate().await.unwrap();
    log.content(None).await.unwrap();

    let show = exec.calls().pop().unwrap();
    assert!(show.ends_with("--start 2026-10-19 08:30:00+0000"), "{show}");
}

#[tokio::test]
async fn simulator_log_content_returns_output() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    exec.on(
        &format!("xcrun simctl spawn {UDID} log show"),
        [Reply::ok("2026-10-19 12:00:01.000 MyApp[42]: ready\n")],
    );
    let device = simulator(&exec, dir.path());

    let text = device.log().await.content(None).await.unwrap();
    assert!(text.contains("MyApp[42]: ready"));
    // Never truncated: no lower bound.
    assert!(!exec.calls()[0].contains("--start"));
}

#[tokio::test]
async fn failed_recorder_start_leaves_it_idle() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    let device = simulator(&exec, dir.path());
    let video = device.video().await.unwrap();

    let err = video.start().await.unwrap_err();
    assert!(matches!(err, CaptureError::Start { kind: CaptureKind::Video, .. }));
    assert!(!video.is_recording().await);

    let calls = exec.calls();
    assert_eq!(calls[0], "mkdir -p /var/simfleet/videos");
    assert_eq!(calls[1], format!("rm -f /var/simfleet/videos/{UDID}.mp4"));
    assert!(calls[2].starts_with(&format!("xcrun simctl io {UDID} recordVideo")));

    // Still idle, so stopping is an error for video.
    assert!(matches!(
        video.stop().await,
        Err(CaptureError::NotRunning { .. })
    ));
}

#[tokio::test]
async fn recording_is_fetched_from_the_host() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::remote());
    exec.on("cat /var/simfleet/videos", [Reply::ok("MOVIE")]);
    let device = simulator(&exec, dir.path());

    let bytes = device.video().await.unwrap().content().await.unwrap();
    assert_eq!(bytes, b"MOVIE");
}
