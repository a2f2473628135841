//! dacc-agg - measure aggregation service
//!
//! Runs the HTTP API with the periodic aggregation scheduler (`serve`), or a
//! single administrative operation on the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dacc_common::config::{ConfigOverrides, ServiceConfig};
use dacc_common::db::{definitions, init_database, GroupSlot, MeasureDefinition};
use dacc_common::time::parse_date;
use dacc_agg::{
    build_router, ingestion, restitution, scheduler, AggregationEngine, AppState, MeasureLocks,
    PurgeCoordinator,
};
use sqlx::SqlitePool;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dacc-agg")]
#[command(about = "Measure collection and aggregation service")]
#[command(version)]
struct Args {
    /// SQLite database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the aggregation scheduler
    Serve {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,
    },
    /// Aggregate one measure, or every measure when NAME is omitted
    Aggregate {
        name: Option<String>,
        /// Ignore the execution frequency
        #[arg(long)]
        force: bool,
    },
    /// Purge aggregated raw measures
    Purge {
        name: String,
        /// Purge up to this ingestion date instead of the last aggregation
        #[arg(long, value_parser = parse_date_arg)]
        date: Option<DateTime<Utc>>,
    },
    /// Delete aggregates from a date forward and roll the watermark back
    Rollback {
        name: String,
        #[arg(long, value_parser = parse_date_arg)]
        from: DateTime<Utc>,
    },
    /// Compute roll-ups over all values of one or two groups
    Wildcard {
        name: String,
        /// group1, group2 or group3
        #[arg(long = "group", required = true)]
        groups: Vec<GroupSlot>,
        #[arg(long, value_parser = parse_date_arg)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_date_arg)]
        to: DateTime<Utc>,
    },
    /// Print threshold-filtered aggregates as JSON
    Results {
        name: String,
        #[arg(long, value_parser = parse_date_arg)]
        start: DateTime<Utc>,
        #[arg(long, value_parser = parse_date_arg)]
        end: DateTime<Utc>,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Load measure definitions from a JSON file
    LoadDefinitions { file: PathBuf },
    /// Load raw measures from a JSON file
    LoadMeasures { file: PathBuf },
}

fn parse_date_arg(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_date(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::resolve(&ConfigOverrides {
        config_file: args.config.clone(),
        database_path: args.database.clone(),
        listen_addr: match &args.command {
            Command::Serve { listen } => listen.clone(),
            _ => None,
        },
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dacc-agg v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {}", config.database_path.display());

    let pool = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let locks = MeasureLocks::new();

    match args.command {
        Command::Serve { .. } => serve(pool, locks, &config).await?,
        Command::Aggregate { name, force } => {
            let engine = AggregationEngine::new(pool.clone(), locks);
            match name {
                Some(name) => {
                    let definition = find_definition(&pool, &name).await?;
                    match engine.aggregate(&definition, force).await? {
                        Some(run) => info!(
                            "{} aggregates updated for {}, last aggregated date {}",
                            run.aggregates.len(),
                            name,
                            run.watermark
                        ),
                        None => info!("Nothing aggregated for {}", name),
                    }
                }
                None => {
                    let runs = engine.aggregate_all(force).await?;
                    info!("{} measures aggregated", runs.len());
                }
            }
        }
        Command::Purge { name, date } => {
            let definition = find_definition(&pool, &name).await?;
            let report = PurgeCoordinator::new(pool, locks)
                .purge(&definition, date)
                .await?;
            info!(
                "{} raw measures deleted for {}, {} aggregates flagged",
                report.deleted, name, report.flagged
            );
        }
        Command::Rollback { name, from } => {
            let definition = find_definition(&pool, &name).await?;
            let report = AggregationEngine::new(pool, locks)
                .rollback_aggregates(&definition, &from)
                .await?;
            info!("{} aggregates deleted for {}", report.deleted, name);
        }
        Command::Wildcard {
            name,
            groups,
            from,
            to,
        } => {
            let definition = find_definition(&pool, &name).await?;
            let inserted = AggregationEngine::new(pool, locks)
                .compute_wildcard_aggregate(&definition, &groups, &from, &to)
                .await?;
            info!("{} wildcard aggregates inserted for {}", inserted.len(), name);
        }
        Command::Results {
            name,
            start,
            end,
            created_by,
        } => {
            let results =
                restitution::get_results(&pool, &name, created_by.as_deref(), &start, &end).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::LoadDefinitions { file } => {
            ingestion::load_definitions_file(&pool, &file).await?;
        }
        Command::LoadMeasures { file } => {
            ingestion::load_measures_file(&pool, &file).await?;
        }
    }

    Ok(())
}

async fn find_definition(pool: &SqlitePool, name: &str) -> Result<MeasureDefinition> {
    let mut conn = pool.acquire().await?;
    definitions::find_by_name(&mut conn, name)
        .await?
        .with_context(|| format!("No measure definition found for: {}", name))
}

async fn serve(pool: SqlitePool, locks: MeasureLocks, config: &ServiceConfig) -> Result<()> {
    let engine = AggregationEngine::new(pool.clone(), locks);
    let scheduler = scheduler::spawn(engine, config.scheduler_interval_secs);

    let app = build_router(AppState::new(pool));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    info!("dacc-agg listening on http://{}", config.listen_addr);
    info!("Health check: http://{}/health", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(handle) = scheduler {
        handle.abort();
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
