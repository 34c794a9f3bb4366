use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jetload_sync::{
    load_pipeline_config, PgWarehouse, ReplayConnector, SyncConfig, SyncPipeline, SyncRunSummary,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jetload-cli")]
#[command(about = "Load CRM report exports into the warehouse and union them into history")]
struct Cli {
    /// Read exports from <DIR>/<source_id>/<report_id>.csv instead of logging in.
    #[arg(long, global = true, value_name = "DIR")]
    replay_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load every enabled source, then union into the history table.
    Run {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Load the reports of one source.
    Load { source: String },
    /// Append the instance tables into the history table.
    Union,
    /// Create the history table if it does not exist.
    InitHistory,
    /// Print the column identifiers a header row would get.
    Sanitize {
        headers: Vec<String>,
        /// Use the historical cleanup rules.
        #[arg(long)]
        legacy: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run { json: false });

    if let Commands::Sanitize { headers, legacy } = &command {
        print_identifiers(headers, *legacy);
        return Ok(());
    }

    let config = SyncConfig::from_env();
    let pipeline_config = load_pipeline_config(&config.config_path).await?;
    let mut pipeline = SyncPipeline::new(&config, pipeline_config);
    if let Some(dir) = cli.replay_dir {
        pipeline = pipeline.with_connector(Box::new(ReplayConnector::new(dir)));
    }
    let warehouse = PgWarehouse::connect(&config.database_url)
        .await
        .context("connecting to warehouse")?
        .with_insert_batch(config.insert_batch);

    let result = execute(&pipeline, &warehouse, command).await;
    warehouse.close().await;
    result
}

async fn execute(pipeline: &SyncPipeline, warehouse: &PgWarehouse, command: Commands) -> Result<()> {
    match command {
        Commands::Run { json } => {
            let summary = pipeline.run_once(warehouse).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Load { source } => {
            for load in pipeline.load_source(pipeline.source(&source)?, warehouse).await? {
                println!("{load}");
            }
        }
        Commands::Union => {
            pipeline.init_history(warehouse).await?;
            for union in pipeline.run_union(warehouse).await? {
                println!(
                    "appended {} rows from {} into {}",
                    union.rows_appended,
                    union.source_table,
                    pipeline.pipeline().history.table
                );
            }
        }
        Commands::InitHistory => {
            let table = &pipeline.pipeline().history.table;
            if pipeline.init_history(warehouse).await? {
                println!("created {table}");
            } else {
                println!("{table} already exists");
            }
        }
        Commands::Sanitize { headers, legacy } => print_identifiers(&headers, legacy),
    }
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    for load in &summary.loads {
        println!("{load}");
    }
    println!(
        "sync complete: run_id={} sources={} rows_loaded={} rows_appended={}",
        summary.run_id,
        summary.enabled_sources,
        summary.rows_loaded(),
        summary.rows_appended()
    );
}

fn print_identifiers(headers: &[String], legacy: bool) {
    let names = if legacy {
        let mut seen = std::collections::HashSet::new();
        headers
            .iter()
            .map(|header| {
                let name = jetload_core::unique_identifier(&seen, &jetload_core::sanitize_legacy(header));
                seen.insert(name.clone());
                name
            })
            .collect()
    } else {
        jetload_core::unique_identifiers(headers)
    };
    for (header, name) in headers.iter().zip(names) {
        println!("{name}\t{header}");
    }
}
