use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{AppConfig, LogFormat, LoggingConfig};
use ratekeeper::ratelimit::sort_by_priority;
use ratekeeper::response::Decision;
use ratekeeper::{RateLimitManager, RequestContext};

#[derive(Parser, Debug)]
#[command(name = "ratekeeper", version, about = "Request-scoped rate limiting engine")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a single request and print the decision
    Check(CheckArgs),
    /// Read request contexts as JSON lines from stdin and answer each on stdout
    Serve,
    /// Print the effective rules in evaluation order
    Rules,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Full request context as JSON; other flags are ignored when set
    #[arg(long)]
    json: Option<String>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    user_type: Option<String>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    method: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    /// The request uploads files
    #[arg(long)]
    files: bool,
}

impl CheckArgs {
    fn into_context(self) -> anyhow::Result<RequestContext> {
        if let Some(json) = self.json {
            return serde_json::from_str(&json).context("Invalid request context JSON");
        }

        let mut ctx = RequestContext::new().with_files(self.files);
        ctx.ip = self.ip;
        ctx.user_type = self.user_type;
        ctx.endpoint = self.endpoint;
        ctx.method = self.method;
        ctx.api_key = self.api_key;
        if let Some(user) = self.user {
            ctx = ctx.with_user(user);
        }
        Ok(ctx)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratekeeper");

    match cli.command {
        Command::Rules => {
            let mut rules = config.effective_rules()?;
            sort_by_priority(&mut rules);
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
        Command::Check(args) => {
            let ctx = args.into_context()?;
            let manager = config.build_manager().await?;
            let outcome = manager.check_rate_limit(&ctx).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&Decision::from_outcome(outcome))?
            );
        }
        Command::Serve => {
            let manager = Arc::new(config.build_manager().await?);
            let interval = Duration::from_secs(config.maintenance.cleanup_interval_secs);
            serve(manager, interval).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries decisions.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Answer newline-delimited JSON request contexts until EOF or a shutdown
/// signal, sweeping expired state every `cleanup_interval`.
async fn serve(manager: Arc<RateLimitManager>, cleanup_interval: Duration) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let mut cleanup = tokio::time::interval(cleanup_interval);
    // The first tick completes immediately
    cleanup.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(
        cleanup_interval_secs = cleanup_interval.as_secs(),
        rules = manager.rules().len(),
        "Serving rate limit decisions on stdin/stdout"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = cleanup.tick() => {
                if let Err(e) = manager.cleanup_expired().await {
                    warn!(error = %e, "Cleanup of expired rate limit state failed");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = answer(&manager, &line).await;
                stdout.write_all(reply.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
    }

    info!("Ratekeeper stopped");
    Ok(())
}

/// One JSON reply for one JSON request line.
async fn answer(manager: &RateLimitManager, line: &str) -> String {
    let ctx: RequestContext = match serde_json::from_str(line) {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!(error = %e, "Malformed request context");
            return serde_json::json!({ "error": format!("invalid request context: {}", e) })
                .to_string();
        }
    };

    let reply = match manager.check_rate_limit(&ctx).await {
        Ok(outcome) => serde_json::to_string(&Decision::from_outcome(outcome)),
        Err(e) => {
            warn!(error = %e, "Rate limit check failed");
            return serde_json::json!({ "error": e.to_string() }).to_string();
        }
    };
    reply.unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
