use anyhow::Result;
use clap::Parser;
use creditgate::config::CoreConfig;
use creditgate::telemetry::Telemetry;
use creditgate::CoreServices;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "creditgate", about = "Metered tool-call admission gateway")]
struct Cli {
    /// Path to the core config file (TOML or JSON, by extension).
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Admin API listen address (health/metrics only).
    #[arg(long, default_value = "127.0.0.1:9091")]
    admin_listen: String,

    /// Program to spawn as the downstream tool-execution process.
    #[arg(long)]
    tool_command: Option<String>,

    /// Arguments passed to `--tool-command`.
    #[arg(long)]
    tool_arg: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = creditgate::runtime::get_container_cpu_limit();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    init_tracing();
    let telemetry = Telemetry::install();

    let mut config = CoreConfig::load(&cli.config)?;
    config.admin.listen = cli.admin_listen.clone();
    if let Some(command) = cli.tool_command {
        config.tool.command = command;
        config.tool.args = cli.tool_arg;
    }

    let services = CoreServices::new(config);
    services.start_background_tasks();

    tracing::info!(admin_listen = %cli.admin_listen, "creditgate: starting");

    let admin_handle = tokio::spawn({
        let listen = cli.admin_listen.clone();
        async move { creditgate::admin::run(&listen, telemetry).await }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("creditgate: shutdown signal received");

    services.shutdown();
    admin_handle.abort();

    tracing::info!("creditgate: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
