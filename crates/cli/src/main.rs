use std::process::ExitCode;

use clap::Parser;

use jobline_cli::{ConsumeArgs, consume};
use jobline_infra::Registry;

#[tokio::main]
async fn main() -> ExitCode {
    jobline_observability::init();

    let args = ConsumeArgs::parse();

    match consume(&args, Registry::new()).await {
        Ok(report) => {
            tracing::info!(
                report = %serde_json::to_string(&report).unwrap_or_default(),
                "consume-jobs finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = ?err, "consume-jobs failed");
            ExitCode::FAILURE
        }
    }
}
