//! `gitian-build` entry point.
//!
//! Runs one pipeline for the signer and version given on the command line
//! (or through `GITIAN_SIGNER` / `GITIAN_VERSION`) and prints the aggregate
//! report as JSON on stdout. Logs go to stderr.
//!
//! ## Exit codes
//!
//! - **0**: every target succeeded
//! - **1**: every target failed, or the run could not start
//! - **2**: partial success
//! - **130**: cancelled with Ctrl-C

use gitian_cli::CliConfig;
use gitian_core::{
    AggregateReport, PipelineContext, PipelineController, PipelineError, PipelineStatus,
};
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // stdout carries the report
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("gitian=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = CliConfig::from_env(&args)?;
    tracing::info!(?config, "Configuration loaded");

    let request = config.request()?;
    let context = PipelineContext::new(
        config.pipeline_config()?,
        config.backend(),
        config.signing_identity(),
    );

    let controller = PipelineController::new(request, context);
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received interrupt, cancelling pipeline");
            interrupt.cancel();
        }
    });

    let mut progress = controller.subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            tracing::info!(state = ?snapshot.state, targets = ?snapshot.targets, "Progress");
        }
    });

    let (report, code) = match controller.run(cancel).await {
        Ok(report) => {
            let code = match report.status {
                PipelineStatus::Success => 0,
                PipelineStatus::PartialSuccess => 2,
                PipelineStatus::Failed => 1,
            };
            (report, code)
        }
        Err(PipelineError::Cancelled(report)) => (*report, 130),
        Err(e) => return Err(e.into()),
    };

    summarize(&report);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(code))
}

fn summarize(report: &AggregateReport) {
    for (target, entry) in &report.targets {
        tracing::info!(
            os = %target,
            outcome = ?entry.outcome,
            verification = ?entry.verification,
            commit = ?entry.commit,
            "Target finished"
        );
    }
    tracing::info!(
        version = %report.version,
        builder = %report.builder,
        status = ?report.status,
        cancelled = report.cancelled,
        "Pipeline finished"
    );
}
