use anyhow::Context;
use clap::Parser;
use page_snapshot::{install_prometheus_recorder, setup_logging, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose).map_err(|e| anyhow::anyhow!(e))?;

    info!("Starting page-snapshot v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    // Handles are bound when the cache is built, so the recorder goes first.
    let metrics = if args.wants_metrics() {
        Some(install_prometheus_recorder()?)
    } else {
        None
    };

    let cli_runner = CliRunner::new(config, metrics).context("failed to set up the screenshot cache")?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    cli_runner.shutdown();

    if let Err(e) = result {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("page-snapshot stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("could not read {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("could not parse {}", config_path.display()))?
    } else {
        Config::default()
    };

    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Screenshot directory: {}", config.screenshot_dir().display());
    info!("Render timeout: {:?}", config.render_timeout);
    info!("Lock strategy: {:?}", config.lock_strategy);

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("Could not install signal handlers: {}", e);
            return;
        }
        let _ = shutdown_tx.send(());
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    Ok(())
}
