use anyhow::Context;
use clap::Parser;
use runner::{router, AppState, Config};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "runner=info,herd=info,tower_http=info";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "runner", version, about = "Run and supervise uploaded scripts and projects")]
struct Args {
	/// Path to config.toml (defaults to ~/.config/runner/config.toml)
	#[arg(short, long, env = "RUNNER_CONFIG")]
	config: Option<PathBuf>,

	/// Address to bind
	#[arg(long)]
	host: Option<String>,

	/// Port to listen on
	#[arg(short, long)]
	port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
		)
		.init();

	let args = Args::parse();
	let mut config = Config::load(args.config.as_deref())?;
	if let Some(host) = args.host {
		config.server.host = host;
	}
	if let Some(port) = args.port {
		config.server.port = port;
	}
	config.ensure_dirs().context("failed to create storage directories")?;

	let addr = format!("{}:{}", config.server.host, config.server.port);
	let state = AppState::new(config);
	let supervisor = state.supervisor.clone();
	let app = router(state);

	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("failed to bind HTTP on {}", addr))?;
	tracing::info!("runner listening on {}", addr);

	axum::serve(listener, app)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			tracing::info!("shutting down");
		})
		.await
		.context("HTTP server error")?;

	supervisor.shutdown();
	if !supervisor.wait_idle(SHUTDOWN_GRACE).await {
		tracing::warn!("children still running after {}s, exiting anyway", SHUTDOWN_GRACE.as_secs());
	}
	Ok(())
}
