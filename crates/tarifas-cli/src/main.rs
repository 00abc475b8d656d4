use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tarifas_sync::{Cancellation, MonitorConfig, TariffMonitor};
use tracing::warn;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tarifas-cli")]
#[command(about = "SISS water tariff monitor")]
struct Cli {
    /// YAML file with configuration overrides; TARIFAS_* variables still win.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON instead of a one-line summary.
    #[arg(long, global = true)]
    json: bool,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check where the regulator site redirects and where its tariffs link points.
    Verify,
    /// Extract the company catalog and save it when it changed.
    Monitor {
        /// Tariffs page to read instead of locating it from the start URL.
        #[arg(long)]
        url: Option<String>,
    },
    /// Download catalog PDFs that are new, moved or previously failed.
    Download,
    /// Verify, monitor and download once.
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.verbose) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) -> Result<()> {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().context("parsing RUST_LOG")?
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("error,tarifas={level}"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Cancels in-flight downloads on Ctrl-C.
fn cancel_on_ctrl_c() -> Cancellation {
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling downloads");
            trigger.cancel();
        }
    });
    cancel
}

fn emit<T: Serialize>(json: bool, value: &T, summary: String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).context("serializing result")?);
    } else {
        println!("{summary}");
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = MonitorConfig::load(cli.config.as_deref())?;
    let monitor = TariffMonitor::new(config.clone())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Verify => {
            let result = monitor.verify_redirect(&config.redirect_path()).await;
            emit(
                cli.json,
                &result,
                format!(
                    "verify: {} final={} tarifas={}",
                    result.message,
                    result.url_final.as_deref().unwrap_or("-"),
                    result.url_tarifas_vigentes.as_deref().unwrap_or("-")
                ),
            )?;
            Ok(result.success)
        }
        Commands::Monitor { url } => {
            let path = config.catalog_path();
            let result = match url {
                Some(url) => monitor.monitor_tariffs_at(&url, &path).await,
                None => monitor.monitor_tariffs(&path).await,
            };
            emit(
                cli.json,
                &result,
                format!(
                    "monitor: {} companies={} pdfs={} changed={:?}",
                    result.message, result.total_companies, result.total_pdfs, result.changed_companies
                ),
            )?;
            Ok(result.success)
        }
        Commands::Download => {
            let report = monitor
                .download_pdfs(
                    &config.catalog_path(),
                    &config.pdf_root(),
                    &config.registry_path(),
                    &cancel_on_ctrl_c(),
                )
                .await;
            emit(cli.json, &report, format!("download: {} run_id={}", report.message, report.run_id))?;
            Ok(report.success)
        }
        Commands::Run => {
            let summary = monitor.run_once(&cancel_on_ctrl_c()).await;
            emit(
                cli.json,
                &summary,
                format!(
                    "run complete: verify=\"{}\" monitor=\"{}\" download=\"{}\"",
                    summary.verification.message, summary.monitor.message, summary.download.message
                ),
            )?;
            Ok(summary.success())
        }
    }
}
