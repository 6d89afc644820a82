//! Bootline - first-boot Kubernetes node bootstrap

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use bootline_common::logging::init_logging;
use bootline_orchestrator::Cli;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_config()).context("failed to initialize logging")?;

    // Stages run strictly one after another
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match runtime.block_on(cli.run()) {
        Ok(code) => Ok(ExitCode::from(code)),
        Err(e) => {
            error!(error = %e, error_kind = ?e.kind(), "bootline failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
