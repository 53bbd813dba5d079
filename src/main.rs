use clap::Parser;
use perpctl::cli::{Cli, Commands};
use perpctl::config::{AppConfig, ConnectorKind, LoggingConfig};
use perpctl::coordination::install_signal_handlers;
use perpctl::domain::TradingSignal;
use perpctl::error::{PerpError, Result};
use perpctl::exchange::build_connector;
use perpctl::orchestrator::{Orchestrator, SignalSender};
use perpctl::persistence::open_store;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config_dir,
            paper,
            signals,
        } => {
            let mut config = AppConfig::load_from(&config_dir)?;
            if paper {
                config.exchange.kind = ConnectorKind::Paper;
            }
            let _guard = init_logging(&config.logging);
            if let Err(errors) = config.validate() {
                for e in &errors {
                    error!("config: {}", e);
                }
                return Err(PerpError::Validation(errors.join("; ")));
            }
            run(config, signals).await
        }
        Commands::CheckConfig { config_dir } => {
            let config = AppConfig::load_from(&config_dir)?;
            match config.validate() {
                Ok(()) => {
                    println!("{}: configuration is valid", config_dir.display());
                    Ok(())
                }
                Err(errors) => {
                    for e in &errors {
                        println!("  - {}", e);
                    }
                    Err(PerpError::Validation(format!(
                        "{} configuration problem(s)",
                        errors.len()
                    )))
                }
            }
        }
    }
}

async fn run(config: AppConfig, signals: Option<PathBuf>) -> Result<()> {
    info!(
        connector = ?config.exchange.kind,
        symbols = ?config.orchestrator.symbols,
        "starting perpctl"
    );

    let store = open_store(&config.database).await?;
    let exchange = build_connector(&config)?;
    let orchestrator = Orchestrator::new(config, exchange, store);
    install_signal_handlers(orchestrator.shutdown_handle());

    let sender = orchestrator.signal_sender();
    let feed = tokio::spawn(async move {
        let outcome = match signals {
            Some(path) => feed_file(&path, &sender).await,
            None => feed_lines(BufReader::new(tokio::io::stdin()), &sender).await,
        };
        if let Err(e) = outcome {
            warn!(error = %e, "signal feed stopped");
        }
    });

    let result = orchestrator.run().await;
    feed.abort();
    result
}

async fn feed_file(path: &Path, sender: &SignalSender) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    info!(path = %path.display(), "reading signals from file");
    feed_lines(BufReader::new(file), sender).await
}

/// Forward one JSON-encoded signal per line; malformed lines are skipped.
async fn feed_lines<R: AsyncBufRead + Unpin>(reader: R, sender: &SignalSender) -> Result<()> {
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<TradingSignal>(line) {
            Ok(signal) => sender.submit(signal).await?,
            Err(e) => warn!(line = line_no, error = %e, "skipping malformed signal"),
        }
    }
    info!(lines = line_no, "signal feed exhausted");
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},perpctl=debug,sqlx=warn", config.level))
    });

    let console = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let (file_layer, guard) = match std::env::var("PERPCTL_LOG_DIR") {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "perpctl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    guard
}
