use agentflow_console::config::{ConsoleConfig, FileConfig, Overrides};
use agentflow_console::{AppState, listen_local, router};
use anyhow::{Context, Result};
use clap::Parser;
use libagentflow::{EventBus, RunSupervisor};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Port on 127.0.0.1 to listen on (0 picks a free port).
    #[arg(long)]
    port: Option<u16>,
    /// Project containing prd.json and the loop script. Defaults to the current directory.
    #[arg(long)]
    project_root: Option<PathBuf>,
    /// Where finished run archives are written.
    #[arg(long)]
    archive_dir: Option<PathBuf>,
    /// Keep run events in memory only.
    #[arg(long)]
    no_archive: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_events_per_run: Option<usize>,
    #[arg(long)]
    max_process_text_bytes: Option<usize>,
    /// Grace period between SIGINT and SIGKILL when stopping a run.
    #[arg(long)]
    stop_grace_ms: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            project_root: self.project_root.clone(),
            archive_dir: self.archive_dir.clone(),
            no_archive: self.no_archive,
            max_events_per_run: self.max_events_per_run,
            max_process_text_bytes: self.max_process_text_bytes,
            stop_grace_ms: self.stop_grace_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentflow_console=info,libagentflow=info".into()),
        )
        .init();

    let args = Args::parse();
    let file_cfg = FileConfig::discover(args.config.as_deref())?;
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let cfg = ConsoleConfig::resolve(args.overrides(), file_cfg, &cwd)?;

    let stop_grace = cfg.supervisor.stop_grace;
    let bus = EventBus::new(cfg.bus.clone());
    let supervisor = RunSupervisor::new(cfg.supervisor.clone(), bus)
        .context("invalid supervisor configuration")?;
    let app = router(AppState::new(supervisor.clone()));

    let (listener, base_url) = listen_local(cfg.port).await?;
    tracing::info!(
        project_root = %supervisor.project_root().display(),
        archive_dir = ?cfg.bus.archive_dir,
        "agentflow-console listening on {base_url}"
    );
    println!("{base_url}");

    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    tokio::select! {
        res = server => {
            res.context("server task failed")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            shutdown(&supervisor, stop_grace).await;
        }
    }
    Ok(())
}

/// Stop the active run and give its finalizer a chance to publish.
async fn shutdown(supervisor: &RunSupervisor, stop_grace: Duration) {
    let outcome = supervisor.stop().await;
    let Some(run_id) = outcome.run_id else {
        return;
    };
    tracing::info!(run_id = %run_id, stopping = outcome.stopping, "stopped active run");

    let deadline = tokio::time::Instant::now() + stop_grace;
    while supervisor.active_run_id().is_some() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
