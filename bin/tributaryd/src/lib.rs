//! Process entrypoint for the tributary daemon.
use anyhow::Result;
use clap::Parser;
use slog::Drain;

use tributary_context::Context;
use tributary_sync::SyncCoordinator;

/// Real-time CDC and replication ingestion plane.
#[derive(Debug, Parser)]
#[command(name = "tributaryd", version)]
struct Cli {
    /// Path to the process configuration file.
    #[arg(long, short, default_value = "tributary.yaml")]
    config: String,
}

/// Parse the CLI, load configuration and run the plane until a signal.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let logger = root_logger();
    let context = Context::root(logger);
    let conf = tributary_conf::load(&cli.config)?;

    // Metrics registration failures are programming errors worth failing
    // startup for, not conditions to tolerate.
    let registry = prometheus::Registry::new();
    tributary_queue::register_metrics(&registry)?;
    tributary_tasks::register_metrics(&registry)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let mut coordinator = SyncCoordinator::initialize(&context, conf).await?;
        coordinator.start(&context).await?;
        slog::info!(context.logger, "Tributary is running; send SIGINT to stop");

        wait_for_signal().await?;
        slog::info!(context.logger, "Shutdown signal received");
        coordinator.stop(&context).await;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Structured terminal logging through an async drain.
fn root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("app" => "tributaryd"))
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
