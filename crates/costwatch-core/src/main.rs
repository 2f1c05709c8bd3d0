//! CostWatch CLI
//!
//! Command-line interface for the CostWatch cost monitoring engine.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use costwatch::anomaly::AnomalyRepository;
use costwatch::api::HttpServer;
use costwatch::db::{CostRecordRepository, Database, PostgresPool};
use costwatch::engine::EvaluationEngine;
use costwatch::forecast::{ForecastRepository, Reconciler};
use costwatch::ingest::{FeedClient, FeedSync};
use costwatch::Config;

/// CostWatch - cost monitoring and alerting for cloud spend
#[derive(Parser)]
#[command(name = "costwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "COSTWATCH_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and the periodic evaluation engine
    Serve {
        /// HTTP API port
        #[arg(long, env = "COSTWATCH_HTTP_PORT")]
        http_port: Option<u16>,
    },

    /// Run one evaluation tick and exit
    Evaluate {
        /// Evaluate a single subscription instead of all of them
        #[arg(long)]
        subscription: Option<Uuid>,
    },

    /// Pull the trailing billing-feed window once
    Sync {
        /// Feed base URL (overrides configuration)
        #[arg(long)]
        feed_url: Option<String>,
    },

    /// Reconcile matured forecasts against actuals
    Reconcile {
        /// Reconcile a single subscription instead of all of them
        #[arg(long)]
        subscription: Option<Uuid>,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Show system health status
    Health,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Delete cost records and anomalies past the retention window
    Prune {
        /// Retention window in days
        #[arg(long, default_value = "365")]
        keep_days: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Serve { http_port } => run_serve(config, http_port).await,
        Commands::Evaluate { subscription } => run_evaluate(config, subscription).await,
        Commands::Sync { feed_url } => run_sync(config, feed_url).await,
        Commands::Reconcile { subscription } => run_reconcile(config, subscription).await,
        Commands::Db { command } => run_db(config, command).await,
        Commands::Health => run_health(config).await,
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { &config.logging.level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_serve(config: Config, http_port: Option<u16>) -> anyhow::Result<()> {
    let db = Database::new(&config).await?;
    db.health_check().await?;
    info!("Database connections healthy");

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.metrics_port).parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()?;
    info!("Prometheus metrics on {}", metrics_addr);

    let engine = Arc::new(EvaluationEngine::new(&db, &config));
    let engine_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    // Periodic feed sync, when a feed is configured
    let sync_handle = config.ingest.feed_url.clone().map(|feed_url| {
        let records = CostRecordRepository::new(&db.postgres);
        let ingest = config.ingest.clone();
        tokio::spawn(async move {
            let client = match FeedClient::new(feed_url, ingest.page_size) {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build feed client");
                    return;
                }
            };
            let sync = FeedSync::new(client, records, ingest.resync_days);
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                ingest.sync_interval_seconds,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = sync.run(Utc::now().date_naive()).await {
                    tracing::error!(error = %e, "Feed sync failed");
                }
            }
        })
    });

    let http_addr = format!(
        "{}:{}",
        config.server.host,
        http_port.unwrap_or(config.server.http_port)
    );
    let http_server = HttpServer::new(&db);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.serve(&http_addr).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down...");

    engine_handle.abort();
    http_handle.abort();
    if let Some(handle) = sync_handle {
        handle.abort();
    }

    Ok(())
}

async fn run_evaluate(config: Config, subscription: Option<Uuid>) -> anyhow::Result<()> {
    let db = Database::new(&config).await?;
    let engine = EvaluationEngine::new(&db, &config);

    match subscription {
        Some(subscription_id) => {
            let evaluated = engine.evaluate_subscription(subscription_id).await?;
            if evaluated {
                println!("Evaluated subscription {subscription_id}");
            } else {
                println!("Skipped: lease for {subscription_id} is held elsewhere");
            }
        }
        None => {
            engine.run_tick().await?;
            println!("Evaluation tick complete");
        }
    }

    Ok(())
}

async fn run_sync(config: Config, feed_url: Option<String>) -> anyhow::Result<()> {
    let Some(feed_url) = feed_url.or_else(|| config.ingest.feed_url.clone()) else {
        anyhow::bail!("no feed URL configured; pass --feed-url or set ingest.feed_url");
    };

    let db = Database::new(&config).await?;
    let client = FeedClient::new(feed_url, config.ingest.page_size)?;
    let sync = FeedSync::new(
        client,
        CostRecordRepository::new(&db.postgres),
        config.ingest.resync_days,
    );

    let inserted = sync.run(Utc::now().date_naive()).await?;
    println!("Ingested {inserted} new cost records");
    Ok(())
}

async fn run_reconcile(config: Config, subscription: Option<Uuid>) -> anyhow::Result<()> {
    let db = Database::new(&config).await?;
    let records = CostRecordRepository::new(&db.postgres);
    let reconciler = Reconciler::new(records.clone(), ForecastRepository::new(&db.postgres));
    let today = Utc::now().date_naive();

    let subscriptions = match subscription {
        Some(id) => vec![id],
        None => records.active_subscriptions().await?,
    };

    let mut total = 0usize;
    for subscription_id in subscriptions {
        total += reconciler.run(subscription_id, today).await?;
    }

    println!("Reconciled {total} forecasts");
    Ok(())
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    let pool = PostgresPool::new(&config.database).await?;

    match command {
        DbCommands::Migrate => {
            pool.migrate().await?;
            println!("Migrations applied");
        }
        DbCommands::Prune { keep_days } => {
            let cutoff = Utc::now().date_naive() - chrono::Duration::days(i64::from(keep_days));
            let records = CostRecordRepository::new(&pool).prune_before(cutoff).await?;
            let anomalies = AnomalyRepository::new(&pool).prune_before(cutoff).await?;
            println!("Pruned {records} cost records and {anomalies} anomalies before {cutoff}");
        }
    }
    Ok(())
}

async fn run_health(config: Config) -> anyhow::Result<()> {
    let db = Database::new(&config).await?;
    db.health_check().await?;
    println!("postgres: ok");
    println!("redis:    ok");
    Ok(())
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "costwatch", &mut io::stdout());
}
