use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roapid_core::{format_endpoint_url, parse_category};
use roapid_sync::{load_file_config, recovered_schedule, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "roapid")]
#[command(about = "Bridges the Roblox API to MediaWiki pages")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon until SIGINT, SIGTERM or SIGHUP.
    Run,
    /// One bootstrap, discovery and refresh pass, then exit.
    Once,
    /// Print the schedule that would be recovered from the data directory.
    Schedule,
    /// Parse a category label and show the job it maps to.
    Parse {
        label: String,
        #[arg(long)]
        prefix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));
            roapid_sync::run_daemon_from_env(cancel).await?;
        }
        Commands::Once => {
            let summary = roapid_sync::run_once_from_env().await?;
            println!(
                "sync complete: recovered={} discovered={} refreshed={} failed={}",
                summary.recovery.scheduled.len(),
                summary.discovery.as_ref().map_or(0, |r| r.succeeded),
                summary.refresh.succeeded,
                summary.discovery.as_ref().map_or(0, |r| r.failed) + summary.refresh.failed,
            );
        }
        Commands::Schedule => {
            let sync = SyncConfig::from_env();
            let file = load_file_config(&sync)?;
            for (category, entry) in recovered_schedule(&sync, &file).await {
                println!(
                    "{category}\t{}\t{}\t{}",
                    entry.endpoint_type,
                    humantime::format_duration(entry.interval),
                    entry.next_run.to_rfc3339()
                );
            }
        }
        Commands::Parse { label, prefix } => {
            let sync = SyncConfig::from_env();
            let file = match prefix {
                Some(_) => None,
                None => Some(load_file_config(&sync)?),
            };
            let prefix = prefix
                .or_else(|| file.as_ref().map(|f| f.dynamic_endpoints.category_prefix.clone()))
                .unwrap_or_default();

            let job = parse_category(&label, &prefix)?;
            let url = file
                .as_ref()
                .and_then(|f| f.dynamic_endpoints.api_map.get(&job.endpoint_type))
                .map(|template| format_endpoint_url(&job, template))
                .transpose()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "endpointType": job.endpoint_type,
                    "instanceId": job.instance_id,
                    "category": job.category_label(&prefix),
                    "artifact": job.artifact_file_name(),
                    "requiresApiKey": job.requires_api_key(),
                    "url": url,
                }))?
            );
        }
    }

    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        match ShutdownSignals::install() {
            Ok(signals) => {
                let name = signals.recv().await;
                info!(signal = name, "received shutdown signal");
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot install unix signal handlers");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
    cancel.cancel();
}

/// SIGINT, SIGTERM and SIGHUP listeners, registered before the first await.
#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }
}
