use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kwatera_core::Listing;
use kwatera_sync::{FeedService, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kwatera")]
#[command(about = "Poznań rental listing tracker")]
struct Cli {
    /// Interaction partition to read and write; anonymous when omitted.
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the configured sources and print the unseen listings.
    Refresh,
    /// Print the given listings that are neither viewed nor liked.
    Latest { ids: Vec<String> },
    /// Print liked listings, most recently liked first.
    Liked,
    View { id: String },
    Like {
        id: String,
        #[arg(long)]
        unlike: bool,
    },
    Flags { ids: Vec<String> },
    Migrate,
    Serve,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_listings(listings: &[Listing]) {
    for l in listings {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            l.external_id,
            l.price,
            l.floor.as_deref().unwrap_or("-"),
            l.area.as_deref().unwrap_or("-"),
            l.title
        );
    }
}

async fn open_service(user: Option<String>) -> Result<FeedService> {
    let service = FeedService::from_config(&SyncConfig::from_env())
        .await
        .context("opening feed service")?;
    Ok(service.scoped(user))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let service = open_service(cli.user).await?;
            let outcome = service.scrape_and_refresh().await?;
            for failure in &outcome.page_failures {
                warn!(url = %failure.url, reason = %failure.reason, "listing page skipped");
            }
            info!(cached = service.listings().count().await?, "listing cache updated");
            print_listings(&outcome.latest);
            println!(
                "refresh complete: run_id={} pages={} failed_pages={} extracted={} latest={}",
                outcome.run_id,
                outcome.pages_attempted,
                outcome.page_failures.len(),
                outcome.extracted,
                outcome.latest.len()
            );
        }
        Commands::Latest { ids } => {
            let service = open_service(cli.user).await?;
            print_listings(&service.get_latest(&ids).await?);
        }
        Commands::Liked => {
            let service = open_service(cli.user).await?;
            print_listings(&service.get_liked().await?);
        }
        Commands::View { id } => {
            let service = open_service(cli.user).await?;
            service.mark_viewed(&id).await?;
            println!("viewed {id}");
        }
        Commands::Like { id, unlike } => {
            let service = open_service(cli.user).await?;
            service.set_liked(&id, !unlike).await?;
            println!("{} {id}", if unlike { "unliked" } else { "liked" });
        }
        Commands::Flags { ids } => {
            let service = open_service(cli.user).await?;
            for (id, flags) in service.get_flags(&ids).await? {
                println!("{id}\tviewed={}\tliked={}", flags.is_viewed, flags.is_liked);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = kwatera_storage::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            kwatera_storage::migrate(&pool).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve => {
            kwatera_web::serve_from_env().await?;
        }
    }

    Ok(())
}
