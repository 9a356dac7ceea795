use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pcw_adapters::CommentPaging;
use pcw_core::Platform;
use pcw_storage::Store;
use pcw_sync::{build_watch_scheduler, AccountTags, SyncConfig, SyncServices};
use pcw_web::{AppState, WebConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pcw-cli")]
#[command(about = "Platform content watcher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with the watch loop scheduled in the background.
    Serve,
    /// Create or upgrade the database schema.
    Migrate,
    /// Run one watch tick now, regardless of the enable flag.
    Tick,
    /// Fetch and reconcile one entity.
    Scrape {
        #[arg(value_enum)]
        target: ScrapeTarget,
        identifier: String,
        #[arg(long, default_value = "youtube")]
        platform: Platform,
        #[arg(long)]
        channel_type: Option<String>,
        #[arg(long)]
        ideology: Option<String>,
        #[arg(long)]
        pages: Option<u32>,
        #[arg(long)]
        max_results: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScrapeTarget {
    Account,
    Content,
    Comments,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let services = SyncServices::from_config(&config).await?;
            let sched = build_watch_scheduler(services.tracker.clone(), config.watch_interval()).await?;
            sched.start().await.context("starting watch scheduler")?;
            info!(
                interval_secs = config.watch_interval().as_secs(),
                enabled = services.control.is_enabled(),
                "watch loop scheduled"
            );
            pcw_web::serve(AppState::new(services), WebConfig::from_env()).await?;
        }
        Commands::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Tick => {
            let summary = pcw_sync::run_tick_once_from_env().await?;
            println!(
                "tick complete: run_id={} checked={} detections={} failures={} timeouts={}",
                summary.run_id,
                summary.checked,
                summary.detections.len(),
                summary.failures,
                summary.timeouts
            );
            for detection in &summary.detections {
                println!(
                    "  {} {} -> {}",
                    detection.platform, detection.account_external_id, detection.item_id
                );
            }
        }
        Commands::Scrape {
            target,
            identifier,
            platform,
            channel_type,
            ideology,
            pages,
            max_results,
        } => {
            let services = SyncServices::from_config(&config).await?;
            let ingestor = &services.ingestor;
            let output = match target {
                ScrapeTarget::Account => {
                    let tags = AccountTags {
                        channel_type,
                        ideology,
                    };
                    let account = ingestor.scrape_account(platform, &identifier, tags).await?;
                    serde_json::to_string_pretty(&account)?
                }
                ScrapeTarget::Content => {
                    let item = ingestor.scrape_content(platform, &identifier).await?;
                    serde_json::to_string_pretty(&item)?
                }
                ScrapeTarget::Comments => {
                    let paging = CommentPaging::new(max_results, pages);
                    let count = ingestor.scrape_comments(platform, &identifier, paging).await?;
                    format!("{count} comments saved")
                }
            };
            println!("{output}");
        }
    }

    Ok(())
}
