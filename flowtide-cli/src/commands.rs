use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flowtide_config::{CaptureConfig, FlowtideConfig};
use flowtide_core::events::{BroadcastNotifier, Notification};
use flowtide_core::record::{ConnectionRecord, MatchResult};
use flowtide_engine::{AppContext, SessionHandle, SessionManager, SessionState, SessionStatus};
use flowtide_storage::{ConnectionQuery, MatchQuery, MemoryStorage, Storage};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "flowtide", version, about)]
pub struct Cli {
    /// Configuration file (default: config/flowtide.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import a pcap or pcapng capture file
    Import(ImportArgs),
    /// Check the configuration and compile the rules without importing
    Validate(SettingsArgs),
    /// Import from a network interface until interrupted
    #[cfg(feature = "live")]
    Live(LiveArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// Server subnet, as CIDR or a single address
    #[arg(long)]
    pub server: Option<String>,
    /// Flag regex
    #[arg(long)]
    pub flag: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Write the session status, connection records and matches as JSON
    #[arg(long)]
    pub export: Option<PathBuf>,
    /// Print pipeline metrics once the import has finished
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    pub capture: PathBuf,
    #[command(flatten)]
    pub settings: SettingsArgs,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[cfg(feature = "live")]
#[derive(Args, Debug, Clone)]
pub struct LiveArgs {
    #[arg(short, long)]
    pub interface: String,
    #[arg(long, default_value_t = 65535)]
    pub snaplen: i32,
    #[arg(long)]
    pub promiscuous: bool,
    #[command(flatten)]
    pub settings: SettingsArgs,
    #[command(flatten)]
    pub output: OutputArgs,
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<FlowtideConfig> {
    match path {
        Some(path) => FlowtideConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display())),
        None => FlowtideConfig::load().context("loading configuration"),
    }
}

/// File settings with the command line flags applied on top.
fn settings(config: &FlowtideConfig, args: &SettingsArgs) -> Result<CaptureConfig, CliError> {
    let mut settings = config.capture.clone();
    if let Some(server) = &args.server {
        settings.server_address = Some(server.clone());
    }
    if let Some(flag) = &args.flag {
        settings.flag_regex = Some(flag.clone());
    }
    if !settings.is_complete() {
        return Err(CliError::MissingSettings);
    }
    Ok(settings)
}

async fn configured_manager(
    config: FlowtideConfig,
    args: &SettingsArgs,
) -> anyhow::Result<(SessionManager, Arc<BroadcastNotifier>)> {
    let capture = settings(&config, args)?;
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let notifier = Arc::new(BroadcastNotifier::new(1024));
    let app = AppContext::new(config, storage, notifier.clone())?;
    app.configure(capture).await.context("configuring")?;
    Ok((SessionManager::new(Arc::new(app)), notifier))
}

pub async fn import(config: FlowtideConfig, args: ImportArgs) -> anyhow::Result<()> {
    let (manager, notifier) = configured_manager(config, &args.settings).await?;
    let printer = print_matches(&notifier);

    let handle = manager
        .start_file_import(&args.capture)
        .await
        .with_context(|| format!("importing {}", args.capture.display()))?;
    info!(session_id = handle.id(), capture_id = handle.capture_id(), "Import started");

    let status = wait_or_cancel(&handle).await?;
    let _ = printer.await;
    report(&manager, &status, &args.output).await
}

pub async fn validate(config: FlowtideConfig, args: SettingsArgs) -> anyhow::Result<()> {
    let (manager, _) = configured_manager(config, &args).await?;
    let context = manager.app().context()?;
    println!(
        "configuration ok: server network {}, {} rule(s), {} service(s)",
        context.server_network,
        context.rules.len(),
        context.services.len()
    );
    Ok(())
}

#[cfg(feature = "live")]
pub async fn live(config: FlowtideConfig, args: LiveArgs) -> anyhow::Result<()> {
    use std::sync::atomic::Ordering;

    let (manager, notifier) = configured_manager(config, &args.settings).await?;
    let (capture, stop) =
        flowtide_capture::LiveCapture::open(&args.interface, args.snaplen, args.promiscuous)?;
    let printer = print_matches(&notifier);
    let handle = manager.start_import(capture)?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping capture");
    stop.store(true, Ordering::Relaxed);

    let status = handle.wait().await?;
    let _ = printer.await;
    report(&manager, &status, &args.output).await
}

async fn wait_or_cancel(handle: &SessionHandle) -> anyhow::Result<SessionStatus> {
    tokio::select! {
        status = handle.wait() => Ok(status?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling import");
            handle.cancel();
            Ok(handle.wait().await?)
        }
    }
}

/// Prints every match as it is found, until the session ends.
fn print_matches(notifier: &BroadcastNotifier) -> JoinHandle<()> {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Notification::RuleMatched(m)) => println!(
                    "[{}] {} {} @{}: {}",
                    m.rule_id,
                    m.key,
                    m.direction.as_str(),
                    m.offset,
                    m.matched_text
                ),
                Ok(Notification::SessionFinished { .. }) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Match output fell behind"),
            }
        }
    })
}

#[derive(Serialize)]
struct Export<'a> {
    session: &'a SessionStatus,
    connections: Vec<ConnectionRecord>,
    matches: Vec<MatchResult>,
}

async fn report(manager: &SessionManager, status: &SessionStatus, output: &OutputArgs) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);

    if let Some(path) = &output.export {
        let storage = manager.app().storage().as_ref();
        let connections = ConnectionQuery::new()
            .capture(status.capture_id.clone())
            .run(storage)
            .await?;
        let mut matches = Vec::new();
        for connection in &connections {
            matches.extend(MatchQuery::new().connection(connection.id.clone()).run(storage).await?);
        }
        let export = Export {
            session: status,
            connections,
            matches,
        };
        std::fs::write(path, serde_json::to_vec_pretty(&export)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Export written");
    }

    if output.metrics {
        let text = manager
            .app()
            .metrics()
            .gather()
            .map_err(|e| anyhow::anyhow!("gathering metrics: {e}"))?;
        print!("{text}");
    }

    match status.state {
        SessionState::Completed | SessionState::Cancelled => Ok(()),
        state => Err(CliError::ImportFailed {
            session_id: status.session_id.clone(),
            state,
            errors: status.errors.len(),
        }
        .into()),
    }
}
