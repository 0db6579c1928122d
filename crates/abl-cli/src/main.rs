use std::sync::Arc;

use abl_core::{BallFilter, Brand};
use abl_storage::{BallStore, PageToken, SqliteConfig, SqliteStore};
use abl_sync::{AppConfig, Services};
use abl_web::AppState;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "abl")]
#[command(about = "Keep a local copy of the USBC approved ball list")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides ABL_CONCURRENCY.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (and the scheduler, when enabled).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Reconcile once against the USBC list.
    Refresh {
        #[arg(long, value_enum, default_value_t = Output::Text)]
        output: Output,
    },
    /// List stored balls.
    List {
        #[arg(long)]
        brand: Option<Brand>,
        #[arg(long)]
        name: Option<String>,
        /// Approval date, YYYY-MM-DD.
        #[arg(long)]
        approved: Option<NaiveDate>,
        #[arg(long, default_value_t = abl_web::DEFAULT_PAGE_SIZE)]
        page_size: usize,
        #[arg(long, default_value = "")]
        page_token: String,
        #[arg(short, long, value_enum, default_value_t = Output::Text)]
        output: Output,
    },
    /// Delete a stored ball by brand and name.
    Remove {
        #[arg(long)]
        brand: Brand,
        #[arg(long)]
        name: String,
    },
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    Text,
    Json,
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.is_local() {
        builder.init();
    } else {
        builder.json().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency.max(1);
    }
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await?;
        }
        Commands::Refresh { output } => {
            let services = Services::from_config(&config).await?;
            info!(workers = services.reconciler.concurrency(), "starting refresh");
            let report = services
                .reconciler
                .run(&CancellationToken::new())
                .await
                .context("reconciliation run")?;
            services.store.close().await;

            match output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&report.summary())?),
                Output::Text => {
                    println!(
                        "refresh complete: run_id={} brands={} new={} failed={}",
                        report.run_id,
                        report.brands_checked,
                        report.new_balls.len(),
                        report.errors.len()
                    );
                    for ball in &report.new_balls {
                        println!("  + {} {} ({})", ball.brand, ball.name, ball.approval_date);
                    }
                    for err in &report.errors {
                        println!("  ! {err}");
                    }
                }
            }
        }
        Commands::List {
            brand,
            name,
            approved,
            page_size,
            page_token,
            output,
        } => {
            let store = SqliteStore::connect(&SqliteConfig::new(&config.database_url)).await?;
            let filter = BallFilter {
                brand,
                name,
                approval_date: approved,
            };
            let result = store
                .list_balls(&filter, page_size, &PageToken::from(page_token))
                .await?;
            store.close().await;

            match output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                Output::Text => {
                    for ball in &result.balls {
                        println!(
                            "{:<12} {:<32} {}  {}",
                            ball.brand, ball.name, ball.approval_date, ball.image_url
                        );
                    }
                    println!("-- {} of {} total", result.balls.len(), result.total_count);
                    if !result.next_page_token.is_empty() {
                        println!("-- next page: --page-token {}", result.next_page_token);
                    }
                }
            }
        }
        Commands::Remove { brand, name } => {
            let store = SqliteStore::connect(&SqliteConfig::new(&config.database_url)).await?;
            let filter = BallFilter {
                brand: Some(brand),
                name: Some(name.clone()),
                approval_date: None,
            };
            let existing = store.all_balls(&filter).await?;
            if existing.is_empty() {
                println!("no stored ball named {brand} {name}");
            } else {
                store.remove_balls(&existing).await?;
                println!("removed {brand} {name}");
            }
            store.close().await;
        }
        Commands::Migrate => {
            let store = SqliteStore::connect(&SqliteConfig::new(&config.database_url)).await?;
            store.close().await;
            println!("migrations applied to {}", config.database_url);
        }
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let services = Services::from_config(&config).await?;
    let shutdown = CancellationToken::new();

    let mut state = AppState::new(
        config.environment.clone(),
        services.store.clone(),
        Arc::clone(&services.reconciler),
    );
    state.cancel = shutdown.child_token();

    let scheduler = abl_sync::maybe_build_scheduler(
        &config,
        Arc::clone(&services.reconciler),
        shutdown.child_token(),
    )
    .await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(
            cron = %config.sync_cron,
            workers = services.reconciler.concurrency(),
            "scheduler started"
        );
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "listening for shutdown signal");
        }
        signal_token.cancel();
    });

    abl_web::serve(state, config.port, shutdown.clone()).await?;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "stopping scheduler");
        }
    }
    services.store.close().await;
    Ok(())
}
