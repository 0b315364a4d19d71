///! Cairn agent
///!
///! Entrypoint for one invocation of the backup agent: load the catalog
///! snapshot, plan every blueprint, gate on operator confirmation, and
///! execute the accepted plans.

mod output;

use anyhow::{Context, Result};
use cairn_core::{load_snapshot, logging, AgentConfig, MongoCatalog, RunCoordinator};
use clap::Parser;
use dialoguer::Confirm;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Multi-host backup orchestration agent")]
struct Cli {
    /// Skip the interactive confirmation prompt (for cron/non-interactive use).
    #[arg(short = 'y', long)]
    yes: bool,

    /// Tracing output format.
    #[arg(long, default_value = "pretty")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let format = cli
        .log_format
        .parse::<logging::LogFormat>()
        .map_err(anyhow::Error::msg)?;
    logging::init(format);

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            output::print_error(&format!("configuration error: {e}"));
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(%config, "loaded agent configuration");

    let catalog = MongoCatalog::connect(&config.mongodb_url, &config.database, config.agent_id.clone())
        .await
        .context("failed to connect to catalog")?;
    let catalog: Arc<dyn cairn_core::Catalog> = Arc::new(catalog);

    let snapshot = load_snapshot(catalog.as_ref(), config.agent_id.clone())
        .await
        .context("failed to load catalog snapshot")?;

    let skip_confirmation = cli.yes;
    let confirm: Box<dyn Fn(usize) -> bool + Send + Sync> = if skip_confirmation {
        Box::new(|_| true)
    } else {
        Box::new(|count| {
            Confirm::new()
                .with_prompt(format!("I will execute {count} plans, continue"))
                .default(false)
                .interact()
                .unwrap_or(false)
        })
    };

    let coordinator = RunCoordinator::new(catalog, confirm);
    let summary = coordinator.run(&snapshot).await;

    if summary.plans_total == 0 {
        output::print_info("no blueprints due");
    } else if summary.declined {
        output::print_info(&format!(
            "operator declined to run {} pending plans",
            summary.plans_total
        ));
    } else if summary.plans_failed == 0 {
        output::print_success(&format!(
            "executed {}/{} plans successfully",
            summary.plans_executed, summary.plans_total
        ));
    } else {
        output::print_warning(&format!(
            "executed {} plans, {} failed",
            summary.plans_executed, summary.plans_failed
        ));
    }

    Ok(ExitCode::SUCCESS)
}
