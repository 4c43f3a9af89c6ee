use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use catalog_sync::config::Config;
use catalog_sync::markup::reprice_file;
use catalog_sync::pipeline::{Pipeline, StepOutcome};
use catalog_sync::profiles::EntityKind;
use catalog_sync::sync::CatalogSync;

#[derive(Parser)]
#[command(name = "catalog-sync", about = "Synchronize scraped catalog files into the document store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Synchronize one entity's hand-off file
    Sync {
        /// products, carousel, categories, brands or banners
        entity: EntityKind,
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Apply the price markup to scraped products
    Markup {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run markup and every sync once
    Pipeline,
    /// Run the pipeline on a cron schedule
    Schedule {
        /// Six-field cron expression, seconds first
        #[arg(long)]
        cron: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    info!(store = %config.store_url, data_dir = %config.data_dir.display(), "Loaded configuration");

    match cli.command {
        Command::Sync { entity, input } => {
            let sync = CatalogSync::new(Arc::new(config.store()?)).strict_indexes(config.strict_indexes);
            let input = input.unwrap_or_else(|| config.input_path(entity));
            let report = sync.run(&config.profile(entity), &input).await?;
            println!("{entity}: {report}");
        }
        Command::Markup { input, output } => {
            let input = input.unwrap_or_else(|| config.markup_input());
            let output = output.unwrap_or_else(|| config.markup_output());
            let report = reprice_file(&input, &output)
                .await
                .with_context(|| format!("repricing {}", input.display()))?;
            println!(
                "markup: total={} repriced={} unpriced={}",
                report.total, report.repriced, report.unpriced
            );
        }
        Command::Pipeline => {
            let pipeline = Pipeline::from_config(config)?;
            for outcome in pipeline.run().await? {
                match outcome {
                    StepOutcome::Markup(report) => println!(
                        "markup: total={} repriced={} unpriced={}",
                        report.total, report.repriced, report.unpriced
                    ),
                    StepOutcome::Sync { entity, report } => println!("{entity}: {report}"),
                }
            }
        }
        Command::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.pipeline_cron.clone());
            schedule(Arc::new(Pipeline::from_config(config)?), &cron).await?;
        }
    }
    Ok(())
}

async fn schedule(pipeline: Arc<Pipeline>, cron: &str) -> Result<()> {
    let sched = JobScheduler::new().await?;

    let job_pipeline = pipeline.clone();
    sched
        .add(Job::new_async(cron, move |_uuid, _l| {
            let pipeline = job_pipeline.clone();
            Box::pin(async move {
                if let Err(e) = pipeline.run().await {
                    error!("Scheduled pipeline run failed: {}", e);
                }
            })
        })?)
        .await?;

    info!(cron, "Scheduler started");
    sched.start().await?;

    // Keep the program running
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
    }
}
