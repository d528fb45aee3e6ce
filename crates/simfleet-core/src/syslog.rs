//! System log capture for simulators and physical devices.
//!
//! [`LogCapture`] wraps a [`CaptureSupervisor`] with the log-specific
//! operations: a truncation mark, and reading back the captured log with an
//! optional process filter. The two sources differ only in data:
//!
//! - [`LogSource::Simulator`] streams `log stream` inside the simulator, and
//!   reads back through `log show` bounded by the truncation timestamp.
//! - [`LogSource::RealDevice`] streams the device syslog relay into a local
//!   file, and reads back from the byte offset recorded at truncation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::capture::{remove_local, CaptureError, CaptureKind, CaptureSpec, CaptureSupervisor};
use crate::device::DeviceRef;
use crate::remote::RemoteExecutor;

/// Bound on a `log show` query.
const LOG_SHOW_TIMEOUT: Duration = Duration::from_secs(60);

/// Format accepted by `log show --start`.
const LOG_SHOW_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Bound on reading the host clock.
const HOST_CLOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Where log lines come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Simulator,
    RealDevice,
}

impl LogSource {
    fn kind(self) -> CaptureKind {
        match self {
            LogSource::Simulator => CaptureKind::SystemLog,
            LogSource::RealDevice => CaptureKind::DeviceLog,
        }
    }
}

/// Reference point set by [`LogCapture::truncate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TruncateMark {
    Since(DateTime<Utc>),
    Offset(u64),
}

/// Log capture for one device.
pub struct LogCapture {
    supervisor: CaptureSupervisor,
    source: LogSource,
    output_dir: PathBuf,
    mark: Mutex<Option<TruncateMark>>,
}

impl LogCapture {
    /// Simulator log capture writing into `output_dir` on this machine.
    pub fn simulator(
        executor: Arc<dyn RemoteExecutor>,
        device: DeviceRef,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(executor, device, LogSource::Simulator, output_dir)
    }

    /// Physical device log capture writing into `output_dir`.
    pub fn real_device(
        executor: Arc<dyn RemoteExecutor>,
        device: DeviceRef,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(executor, device, LogSource::RealDevice, output_dir)
    }

    fn new(
        executor: Arc<dyn RemoteExecutor>,
        device: DeviceRef,
        source: LogSource,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            supervisor: CaptureSupervisor::new(executor, device, source.kind()),
            source,
            output_dir: output_dir.into(),
            mark: Mutex::new(None),
        }
    }

    pub fn source(&self) -> LogSource {
        self.source
    }

    pub fn device(&self) -> &DeviceRef {
        self.supervisor.device()
    }

    pub fn supervisor(&self) -> &CaptureSupervisor {
        &self.supervisor
    }

    /// Local file receiving the streamed log.
    pub fn log_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.log", self.device(), self.supervisor.kind()))
    }

    /// Local file receiving the streaming tool's own diagnostics.
    pub fn error_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.err", self.device(), self.supervisor.kind()))
    }

    /// The streaming command for this source.
    pub fn stream_command(&self) -> Vec<String> {
        let udid = self.device().as_str();
        match self.source {
            LogSource::Simulator => [
                "xcrun", "simctl", "spawn", udid, "log", "stream", "--style", "syslog", "--level",
                "debug",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            LogSource::RealDevice => ["idevicesyslog", "-u", udid]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn spec(&self) -> CaptureSpec {
        let udid = self.device().as_str();
        let pattern = match self.source {
            LogSource::Simulator => format!("simctl spawn {udid} log stream"),
            LogSource::RealDevice => format!("idevicesyslog -u {udid}"),
        };
        CaptureSpec::new(self.stream_command(), self.log_path(), self.error_path())
            .with_interrupt(pattern, Duration::from_secs(1))
    }

    /// Starts streaming, restarting any running capture. The truncation mark
    /// moves to the start of the new capture.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let mut mark = self.mark.lock().await;
        self.supervisor.start(self.spec()).await?;
        *mark = Some(match self.source {
            LogSource::Simulator => TruncateMark::Since(self.host_now().await),
            LogSource::RealDevice => TruncateMark::Offset(0),
        });
        Ok(())
    }

    /// Stops streaming. Stopping an idle capture is a no-op.
    pub async fn stop(&self) -> Result<(), CaptureError> {
        self.supervisor.stop().await
    }

    pub async fn is_active(&self) -> bool {
        self.supervisor.is_active().await
    }

    /// Hides everything logged so far from later [`content`](Self::content)
    /// calls.
    ///
    /// For simulators the mark is a timestamp read from the host running the
    /// simulator, with whole-second granularity: lines logged earlier in the
    /// same second as the mark are still returned.
    pub async fn truncate(&self) -> Result<(), CaptureError> {
        let next = match self.source {
            LogSource::Simulator => TruncateMark::Since(self.host_now().await),
            LogSource::RealDevice => {
                let len = match tokio::fs::metadata(self.log_path()).await {
                    Ok(meta) => meta.len(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(e.into()),
                };
                TruncateMark::Offset(len)
            }
        };
        debug!(device = %self.device(), mark = ?next, "log truncated");
        *self.mark.lock().await = Some(next);
        Ok(())
    }

    /// Current time on the host running the simulator, whole seconds.
    /// Falls back to the local clock when the host's cannot be read.
    async fn host_now(&self) -> DateTime<Utc> {
        let executor = self.supervisor.executor();
        if executor.is_local_host() {
            return Utc::now().trunc_subsecs(0);
        }
        let reply = executor
            .execute(&["date", "-u", "+%Y-%m-%dT%H:%M:%SZ"], &[], Some(HOST_CLOCK_TIMEOUT))
            .await;
        let parsed = match reply {
            Ok(result) if result.is_success() => DateTime::parse_from_rfc3339(result.stdout.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| e.to_string()),
            Ok(result) => Err(result.stderr.trim().to_string()),
            Err(e) => Err(e.to_string()),
        };
        match parsed {
            Ok(now) => now.trunc_subsecs(0),
            Err(reason) => {
                warn!(device = %self.device(), %reason, "host clock unreadable, using local clock");
                Utc::now().trunc_subsecs(0)
            }
        }
    }

    /// Log text since the truncation mark, optionally only lines from
    /// `process`.
    pub async fn content(&self, process: Option<&str>) -> Result<String, CaptureError> {
        let mark = *self.mark.lock().await;
        match self.source {
            LogSource::Simulator => self.simulator_content(mark, process).await,
            LogSource::RealDevice => self.device_content(mark, process).await,
        }
    }

    /// Arguments for the `log show` query.
    fn show_command(&self, mark: Option<TruncateMark>, process: Option<&str>) -> Vec<String> {
        let udid = self.device().as_str();
        let mut args: Vec<String> = [
            "xcrun", "simctl", "spawn", udid, "log", "show", "--style", "syslog",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(TruncateMark::Since(since)) = mark {
            args.push("--start".to_string());
            args.push(since.format(LOG_SHOW_TIME_FORMAT).to_string());
        }
        if let Some(name) = process {
            args.push("--predicate".to_string());
            args.push(process_predicate(name));
        }
        args
    }

    async fn simulator_content(
        &self,
        mark: Option<TruncateMark>,
        process: Option<&str>,
    ) -> Result<String, CaptureError> {
        let args = self.show_command(mark, process);
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self
            .supervisor
            .executor()
            .execute(&argv, &[], Some(LOG_SHOW_TIMEOUT))
            .await?;
        if !result.is_success() {
            return Err(CaptureError::Unreadable {
                device: self.device().clone(),
                kind: self.supervisor.kind(),
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result.stdout)
    }

    async fn device_content(
        &self,
        mark: Option<TruncateMark>,
        process: Option<&str>,
    ) -> Result<String, CaptureError> {
        let offset = match mark {
            Some(TruncateMark::Offset(offset)) => offset,
            _ => 0,
        };
        let text = read_from(&self.log_path(), offset)
            .await
            .map_err(|e| CaptureError::Unreadable {
                device: self.device().clone(),
                kind: self.supervisor.kind(),
                stderr: e.to_string(),
            })?;
        Ok(match process {
            Some(name) => filter_process(&text, name),
            None => text,
        })
    }

    /// Removes the captured files. A running capture is stopped first.
    pub async fn clear(&self) -> Result<(), CaptureError> {
        self.stop().await?;
        remove_local(&self.log_path()).await?;
        remove_local(&self.error_path()).await?;
        *self.mark.lock().await = None;
        Ok(())
    }
}

/// `log` predicate matching one process name.
fn process_predicate(name: &str) -> String {
    format!("process == \"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Keeps syslog lines whose process field is `name`.
///
/// Relay lines look like `Oct 19 10:00:00 iPhone SpringBoard(UIKit)[53] <Notice>: ...`;
/// the process name is followed by `[pid]` or `(subsystem)`.
fn filter_process(text: &str, name: &str) -> String {
    let by_pid = format!(" {name}[");
    let by_subsystem = format!(" {name}(");
    text.lines()
        .filter(|line| line.contains(&by_pid) || line.contains(&by_subsystem))
        .flat_map(|line| [line, "\n"])
        .collect()
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    // The file was recreated since the mark; read it all.
    let start = if offset > len { 0 } else { offset };
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::HostExecutor;

    const RELAY_SAMPLE: &str = "\
Oct 19 10:00:00 iPhone SpringBoard(UIKit)[53] <Notice>: launched
Oct 19 10:00:01 iPhone MyApp[812] <Error>: failed to load
Oct 19 10:00:02 iPhone kernel[0] <Notice>: wake
Oct 19 10:00:03 iPhone MyAppHelper[813] <Notice>: other process
";

    fn capture(source: LogSource, dir: &Path) -> LogCapture {
        LogCapture::new(
            Arc::new(HostExecutor::local()),
            DeviceRef::new("UDID-1"),
            source,
            dir,
        )
    }

    #[test]
    fn predicate_quotes_name() {
        assert_eq!(process_predicate("MyApp"), r#"process == "MyApp""#);
        assert_eq!(process_predicate(r#"we"ird"#), r#"process == "we\"ird""#);
    }

    #[test]
    fn filter_keeps_exact_process_lines() {
        let filtered = filter_process(RELAY_SAMPLE, "MyApp");
        assert_eq!(filtered, "Oct 19 10:00:01 iPhone MyApp[812] <Error>: failed to load\n");
        let springboard = filter_process(RELAY_SAMPLE, "SpringBoard");
        assert!(springboard.contains("launched"));
        assert_eq!(springboard.lines().count(), 1);
    }

    #[test]
    fn simulator_commands() {
        let dir = tempfile::tempdir().unwrap();
        let c = capture(LogSource::Simulator, dir.path());
        assert_eq!(
            c.stream_command(),
            vec!["xcrun", "simctl", "spawn", "UDID-1", "log", "stream", "--style", "syslog", "--level", "debug"]
        );

        let since = DateTime::parse_from_rfc3339("2026-10-19T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let show = c.show_command(Some(TruncateMark::Since(since)), Some("MyApp"));
        assert_eq!(
            &show[6..],
            &["--style", "syslog", "--start", "2026-10-19 08:30:00+0000", "--predicate", r#"process == "MyApp""#]
        );
        assert!(!c.show_command(None, None).contains(&"--start".to_string()));
    }

    #[test]
    fn output_paths_are_per_device_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let c = capture(LogSource::RealDevice, dir.path());
        assert_eq!(c.log_path(), dir.path().join("UDID-1_devicelog.log"));
        assert_eq!(c.error_path(), dir.path().join("UDID-1_devicelog.err"));
    }

    #[tokio::test]
    async fn device_content_respects_truncate_offset() {
        let dir = tempfile::tempdir().unwrap();
        let c = capture(LogSource::RealDevice, dir.path());
        std::fs::write(c.log_path(), "Oct 19 09:00:00 iPhone MyApp[1] <Notice>: old\n").unwrap();

        c.truncate().await.unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(c.log_path()).unwrap();
        std::io::Write::write_all(&mut file, RELAY_SAMPLE.as_bytes()).unwrap();

        let all = c.content(None).await.unwrap();
        assert!(!all.contains("old"));
        assert!(all.contains("wake"));

        let mine = c.content(Some("MyApp")).await.unwrap();
        assert_eq!(mine.lines().count(), 1);
    }

    #[tokio::test]
    async fn device_content_without_capture_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let c = capture(LogSource::RealDevice, dir.path());
        let err = c.content(None).await.unwrap_err();
        assert!(matches!(err, CaptureError::Unreadable { kind: CaptureKind::DeviceLog, .. }));
    }

    #[tokio::test]
    async fn truncate_without_file_marks_zero() {
        let dir = tempfile::tempdir().unwrap();
        let c = capture(LogSource::RealDevice, dir.path());
        c.truncate().await.unwrap();
        assert_eq!(*c.mark.lock().await, Some(TruncateMark::Offset(0)));
    }

    #[tokio::test]
    async fn clear_when_idle_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let c = capture(LogSource::RealDevice, dir.path());
        std::fs::write(c.log_path(), "x").unwrap();
        c.clear().await.unwrap();
        assert!(!c.log_path().exists());
    }
}
