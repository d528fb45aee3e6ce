//! Command-line front end for simfleet device hosts.
//!
//! Every command runs against one host picked from the fleet config with
//! `--host` (this machine when omitted). Remote hosts are driven over ssh.
//!
//! # Usage
//!
//! ```bash
//! # Write a starter config, then inspect the effective settings
//! simfleet config init
//! simfleet config show
//!
//! # List simulators on a configured host, boot one
//! simfleet --host mini devices
//! simfleet --host mini boot A1B2C3D4
//!
//! # Browse and edit an app's data container
//! simfleet ls A1B2C3D4 Library/Preferences --app com.example.app
//! simfleet cat A1B2C3D4 Library/Preferences/com.example.app.plist --app com.example.app
//! simfleet put A1B2C3D4 ./fixture.json Documents/fixture.json --app com.example.app
//! simfleet rm A1B2C3D4 Library/Caches
//!
//! # Snapshot and restore the simulator data directory
//! simfleet backup create A1B2C3D4
//! simfleet backup status A1B2C3D4
//! simfleet backup restore A1B2C3D4
//!
//! # Capture the system log until Ctrl-C, or read it back
//! simfleet log A1B2C3D4
//! simfleet log-show A1B2C3D4 --process MyApp
//!
//! # Record the screen until Ctrl-C and download the movie
//! simfleet record A1B2C3D4 -o run.mp4
//! ```

use std::io::Write;
use std::ops::Deref;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use simfleet_core::backup::BackupError;
use simfleet_core::capture::CaptureError;
use simfleet_core::config::{ConfigError, FleetConfig};
use simfleet_core::container::{ContainerError, FilesystemContainer};
use simfleet_core::device::{DeviceError, DeviceHandle, DeviceKind, DeviceLayout, DeviceRef};
use simfleet_core::remote::{ExecError, HostExecutor, RemoteExecutor};
use simfleet_core::simctl::{Simctl, SimctlError};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Command-line front end for simfleet device hosts.
#[derive(Parser)]
#[command(name = "simfleet")]
#[command(about = "Manage simulators and devices on local and remote hosts")]
#[command(version)]
struct Cli {
    /// Host name from the config file (default: this machine)
    #[arg(short = 'H', long, env = "SIMFLEET_HOST")]
    host: Option<String>,

    /// Config file (default: ~/.simfleet/config.json)
    #[arg(short, long, env = "SIMFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "SIMFLEET_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List simulators on the host
    Devices,

    /// Boot a simulator
    Boot { udid: String },

    /// Shut a simulator down
    Shutdown { udid: String },

    /// Write or inspect the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List a directory in a data container
    Ls {
        udid: String,
        /// Path relative to the container
        #[arg(default_value = "")]
        path: String,
        /// Use this app's data container instead of the simulator data directory
        #[arg(short, long)]
        app: Option<String>,
    },

    /// Print a file from a data container
    Cat {
        udid: String,
        path: String,
        #[arg(short, long)]
        app: Option<String>,
    },

    /// Copy a local file into a data container
    Put {
        udid: String,
        /// Local file to upload
        local: PathBuf,
        /// Destination relative to the container
        path: String,
        #[arg(short, long)]
        app: Option<String>,
    },

    /// Remove a file or directory from a data container
    Rm {
        udid: String,
        path: String,
        #[arg(short, long)]
        app: Option<String>,
    },

    /// Snapshot and restore the simulator data directory
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Capture the device log until Ctrl-C
    Log {
        udid: String,
        /// The device is a physical device, not a simulator
        #[arg(long)]
        real_device: bool,
    },

    /// Print the device log
    LogShow {
        udid: String,
        /// Only lines from this process
        #[arg(short, long)]
        process: Option<String>,
        #[arg(long)]
        real_device: bool,
    },

    /// Record the simulator screen until Ctrl-C
    Record {
        udid: String,
        /// Where to save the movie (default: <udid>.mp4)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Leave the recording on the host after downloading it
        #[arg(long)]
        keep: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a config file with default settings
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective settings
    Show,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Snapshot the data directory, replacing any previous backup
    Create { udid: String },
    /// Replace the data directory with the backup
    Restore { udid: String },
    /// Remove the backup
    Delete { udid: String },
    /// Show whether a usable backup exists
    Status { udid: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("simfleet.log"));
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum CliError {
    /// The operation ran and failed.
    Failed(String),
    /// The host could not be reached or did not answer in time.
    Infrastructure(String),
    /// Bad arguments or configuration.
    Usage(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Failed(_) => ExitCode::from(1),
            CliError::Infrastructure(_) => ExitCode::from(2),
            CliError::Usage(_) => ExitCode::from(3),
        }
    }

    /// Classifies by the execution error underneath `err`, if any.
    fn from_exec(exec: &ExecError, err: &dyn std::fmt::Display) -> Self {
        if exec.is_infrastructure() {
            CliError::Infrastructure(err.to_string())
        } else {
            CliError::Failed(err.to_string())
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Failed(msg) => write!(f, "{}", msg),
            CliError::Infrastructure(msg) => write!(f, "Host error: {}", msg),
            CliError::Usage(msg) => write!(f, "Usage error: {}", msg),
        }
    }
}

impl From<ExecError> for CliError {
    fn from(e: ExecError) -> Self {
        CliError::from_exec(&e, &e)
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Usage(e.to_string())
    }
}

impl From<SimctlError> for CliError {
    fn from(e: SimctlError) -> Self {
        match &e {
            SimctlError::Exec(exec) => CliError::from_exec(exec, &e),
            _ => CliError::Failed(e.to_string()),
        }
    }
}

impl From<DeviceError> for CliError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Locate {
                source: SimctlError::Exec(ref exec),
                ..
            } => CliError::from_exec(exec, &e),
            DeviceError::Locate { .. } => CliError::Failed(e.to_string()),
            DeviceError::Unsupported { .. } => CliError::Usage(e.to_string()),
        }
    }
}

impl From<ContainerError> for CliError {
    fn from(e: ContainerError) -> Self {
        match &e {
            ContainerError::Containment { .. } => CliError::Usage(e.to_string()),
            ContainerError::Read { source, .. }
            | ContainerError::Write { source, .. }
            | ContainerError::Exec(source) => CliError::from_exec(source, &e),
        }
    }
}

impl From<BackupError> for CliError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::Exec(ref exec) => CliError::from_exec(exec, &e),
            BackupError::Metadata { source, .. } => source.into(),
            _ => CliError::Failed(e.to_string()),
        }
    }
}

impl From<CaptureError> for CliError {
    fn from(e: CaptureError) -> Self {
        match &e {
            CaptureError::Start { source, .. } | CaptureError::Exec(source) => {
                CliError::from_exec(source, &e)
            }
            _ => CliError::Failed(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

struct Context {
    config: FleetConfig,
    executor: Arc<dyn RemoteExecutor>,
    format: OutputFormat,
}

impl Context {
    fn new(cli: &Cli) -> Result<Self, CliError> {
        let config = match &cli.config {
            Some(path) => FleetConfig::load_from(path)?,
            None => FleetConfig::load(),
        };
        let host = config.host(cli.host.as_deref())?;
        debug!(host = %host, local = host.is_local(), "using host");
        let executor: Arc<dyn RemoteExecutor> =
            Arc::new(HostExecutor::new(host).with_default_timeout(config.command_timeout()));
        Ok(Self {
            config,
            executor,
            format: cli.format,
        })
    }

    fn device(&self, udid: &str, kind: DeviceKind) -> DeviceHandle {
        DeviceHandle::new(
            DeviceRef::new(udid),
            kind,
            Arc::clone(&self.executor),
            DeviceLayout::from(&self.config),
        )
    }

    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}

/// Either the shared data container (borrowed from the handle) or an app
/// container.
enum Container<'a> {
    Shared(&'a FilesystemContainer),
    App(Arc<FilesystemContainer>),
}

impl Deref for Container<'_> {
    type Target = FilesystemContainer;

    fn deref(&self) -> &FilesystemContainer {
        match self {
            Container::Shared(c) => c,
            Container::App(c) => c,
        }
    }
}

async fn container<'a>(
    device: &'a DeviceHandle,
    app: Option<&str>,
) -> Result<Container<'a>, CliError> {
    Ok(match app {
        Some(bundle) => Container::App(device.app_container(bundle).await?),
        None => Container::Shared(device.shared_container().await?),
    })
}

fn write_stdout(bytes: &[u8]) -> Result<(), CliError> {
    let mut out = std::io::stdout().lock();
    out.write_all(bytes)
        .and_then(|()| out.flush())
        .map_err(|e| CliError::Failed(format!("Failed to write output: {}", e)))
}

async fn wait_for_ctrl_c() -> Result<(), CliError> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CliError::Failed(format!("Failed to listen for Ctrl-C: {}", e)))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(cli: Cli) -> Result<(), CliError> {
    if let Command::Config { action } = &cli.command {
        return config(&cli, action);
    }
    let ctx = Context::new(&cli)?;

    match cli.command {
        // Needs no host; handled above.
        Command::Config { .. } => {}

        Command::Devices => {
            let devices = Simctl::new(Arc::clone(&ctx.executor)).list_devices().await?;
            if ctx.json() {
                println!("{}", serde_json::json!({ "devices": devices }));
            } else {
                for device in &devices {
                    let state = if device.state == "Booted" { " (Booted)" } else { "" };
                    println!("{} -- {}{}", device.udid, device.name, state);
                }
            }
        }

        Command::Boot { udid } => {
            Simctl::new(Arc::clone(&ctx.executor)).boot(&udid).await?;
            info!(device = %udid, "booted");
            if ctx.json() {
                println!("{}", serde_json::json!({ "success": true, "udid": udid, "state": "Booted" }));
            }
        }

        Command::Shutdown { udid } => {
            Simctl::new(Arc::clone(&ctx.executor)).shutdown(&udid).await?;
            info!(device = %udid, "shut down");
            if ctx.json() {
                println!("{}", serde_json::json!({ "success": true, "udid": udid, "state": "Shutdown" }));
            }
        }

        Command::Ls { udid, path, app } => {
            let device = ctx.device(&udid, DeviceKind::Simulator);
            let entries = container(&device, app.as_deref()).await?.list(&path).await?;
            if ctx.json() {
                println!("{}", serde_json::json!({ "entries": entries }));
            } else {
                for entry in entries {
                    println!("{}", entry);
                }
            }
        }

        Command::Cat { udid, path, app } => {
            let device = ctx.device(&udid, DeviceKind::Simulator);
            let bytes = container(&device, app.as_deref()).await?.read(&path).await?;
            write_stdout(&bytes)?;
        }

        Command::Put { udid, local, path, app } => {
            let bytes = tokio::fs::read(&local).await.map_err(|e| {
                CliError::Usage(format!("Cannot read {}: {}", local.display(), e))
            })?;
            let device = ctx.device(&udid, DeviceKind::Simulator);
            container(&device, app.as_deref())
                .await?
                .write(&bytes, &path)
                .await?;
            info!(device = %udid, path = %path, len = bytes.len(), "uploaded");
            if ctx.json() {
                println!("{}", serde_json::json!({ "success": true, "path": path, "bytes": bytes.len() }));
            }
        }

        Command::Rm { udid, path, app } => {
            let device = ctx.device(&udid, DeviceKind::Simulator);
            container(&device, app.as_deref()).await?.delete(&path).await?;
            if ctx.json() {
                println!("{}", serde_json::json!({ "success": true, "path": path }));
            }
        }

        Command::Backup { action } => backup(&ctx, action).await?,

        Command::Log { udid, real_device } => {
            let device = ctx.device(&udid, kind_for(real_device));
            let log = device.log().await;
            log.start().await?;
            eprintln!("Capturing log to {} (Ctrl-C to stop)", log.log_path().display());
            wait_for_ctrl_c().await?;
            log.stop().await?;
            if ctx.json() {
                println!(
                    "{}",
                    serde_json::json!({ "log": log.log_path(), "errors": log.error_path() })
                );
            } else {
                println!("{}", log.log_path().display());
            }
        }

        Command::LogShow {
            udid,
            process,
            real_device,
        } => {
            let device = ctx.device(&udid, kind_for(real_device));
            let text = device.log().await.content(process.as_deref()).await?;
            write_stdout(text.as_bytes())?;
        }

        Command::Record { udid, output, keep } => {
            let device = ctx.device(&udid, DeviceKind::Simulator);
            let video = device.video().await?;
            video.start().await?;
            eprintln!("Recording {} (Ctrl-C to stop)", udid);
            wait_for_ctrl_c().await?;
            video.stop().await?;

            let bytes = video.content().await?;
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.mp4", udid)));
            tokio::fs::write(&output, &bytes).await.map_err(|e| {
                CliError::Failed(format!("Cannot write {}: {}", output.display(), e))
            })?;
            if !keep {
                video.delete().await?;
            }
            if ctx.json() {
                println!(
                    "{}",
                    serde_json::json!({ "output": output, "bytes": bytes.len() })
                );
            } else {
                println!("{}", output.display());
            }
        }
    }

    Ok(())
}

fn config(cli: &Cli, action: &ConfigAction) -> Result<(), CliError> {
    let path = cli.config.clone().unwrap_or_else(FleetConfig::default_path);
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::Usage(format!(
                    "{} already exists (use --force to replace it)",
                    path.display()
                )));
            }
            let config = FleetConfig::default();
            match &cli.config {
                Some(path) => config.save_to(path)?,
                None => config.save()?,
            }
            info!(path = %path.display(), "config written");
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "success": true, "path": path }));
            } else {
                println!("{}", path.display());
            }
        }
        ConfigAction::Show => {
            let config = match &cli.config {
                Some(path) => FleetConfig::load_from(path)?,
                None => FleetConfig::load(),
            };
            let scheduler = config.autorelease.scheduler_config();
            if cli.format == OutputFormat::Json {
                println!(
                    "{}",
                    serde_json::json!({
                        "path": path,
                        "config": config,
                        "autorelease": {
                            "release_timeout_secs": scheduler.release_timeout.as_secs(),
                            "min_sleep_secs": scheduler.min_sleep.as_secs(),
                        },
                    })
                );
            } else {
                println!("config:           {}", path.display());
                for (name, host) in &config.hosts {
                    println!("host {}: {}", name, host);
                }
                println!("backup root:      {}", config.backup_root.display());
                println!("video dir:        {}", config.video_dir.display());
                println!("capture dir:      {}", config.capture_dir.display());
                println!("backup timeout:   {}s", config.backup_timeout().as_secs());
                println!("command timeout:  {}s", config.command_timeout().as_secs());
                println!("release timeout:  {}s", scheduler.release_timeout.as_secs());
                println!("release min wait: {}s", scheduler.min_sleep.as_secs());
            }
        }
    }
    Ok(())
}

fn kind_for(real_device: bool) -> DeviceKind {
    if real_device {
        DeviceKind::Physical
    } else {
        DeviceKind::Simulator
    }
}

async fn backup(ctx: &Context, action: BackupAction) -> Result<(), CliError> {
    let (udid, verb) = match &action {
        BackupAction::Create { udid } => (udid, "created"),
        BackupAction::Restore { udid } => (udid, "restored"),
        BackupAction::Delete { udid } => (udid, "deleted"),
        BackupAction::Status { udid } => (udid, "status"),
    };
    let device = ctx.device(udid, DeviceKind::Simulator);
    let store = device.backup().await?;

    match &action {
        BackupAction::Create { .. } => store.create().await?,
        BackupAction::Restore { .. } => {
            if !store.exists().await {
                return Err(CliError::Failed(format!("No usable backup for {}", udid)));
            }
            store.restore().await?
        }
        BackupAction::Delete { .. } => store.delete().await?,
        BackupAction::Status { .. } => {
            let valid = store.exists().await;
            let meta = store.meta().await;
            if ctx.json() {
                println!(
                    "{}",
                    serde_json::json!({
                        "udid": udid,
                        "path": store.backup_path(),
                        "valid": valid,
                        "meta": meta,
                    })
                );
            } else if valid {
                let created = meta
                    .map(|m| m.created.to_rfc3339())
                    .unwrap_or_default();
                println!("valid backup at {} (created {})", store.backup_path().display(), created);
            } else {
                println!("no usable backup at {}", store.backup_path().display());
            }
            return Ok(());
        }
    }

    if ctx.json() {
        println!("{}", serde_json::json!({ "success": true, "udid": udid, "action": verb }));
    } else {
        eprintln!("Backup {} for {}", verb, udid);
    }
    Ok(())
}
