use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use aq_adapters::{
    AnthropicClassifier, ClassifierConfig, GmailConfig, GmailSourceFactory, HttpClientConfig,
};
use aq_storage::{AchievementStore, LogoTable, MemoryStore, PgStore, Store};
use aq_sync::{default_catalogue, RefreshConfig, RefreshPipeline};
use aq_web::{AppState, FirebaseTokenVerifier, WebConfig};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "aq-cli")]
#[command(about = "ApplyQuest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve {
        /// Keep everything in process memory instead of Postgres.
        #[arg(long)]
        in_memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Write the default achievement catalogue into the store.
    SeedAchievements,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("AQ_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let result = if json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing init failed: {e}");
    }
}

async fn connect_pg() -> Result<PgStore> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store = PgStore::connect(&url)
        .await
        .context("connecting to postgres")?;
    Ok(store)
}

fn load_logos() -> Result<LogoTable> {
    match std::env::var("AQ_LOGOS_FILE") {
        Ok(path) => LogoTable::from_yaml_file(&PathBuf::from(path)),
        Err(_) => Ok(LogoTable::builtin()),
    }
}

async fn serve(in_memory: bool) -> Result<()> {
    let store: Arc<dyn Store> = if in_memory {
        warn!("using in-memory store; data is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        let pg = connect_pg().await?;
        pg.migrate().await?;
        Arc::new(pg)
    };

    let http = HttpClientConfig::from_env();
    let client = http.build_client()?;
    let classifier = AnthropicClassifier::new(&http, ClassifierConfig::from_env()?)?;
    let mail = GmailSourceFactory::new(&http, GmailConfig::from_env())?;
    let verifier = FirebaseTokenVerifier::from_env(client)?;
    let logos = load_logos()?;
    info!(logos = logos.len(), "reference data loaded");

    let pipeline = RefreshPipeline::new(
        store,
        Arc::new(classifier),
        Arc::new(logos),
        RefreshConfig::from_env(),
    );
    let state = AppState::new(pipeline, Arc::new(verifier), Arc::new(mail));
    aq_web::serve(state, WebConfig::from_env()).await
}

async fn seed_achievements() -> Result<usize> {
    let store = connect_pg().await?;
    let catalogue = default_catalogue();
    for achievement in &catalogue {
        store.put_achievement(achievement).await?;
    }
    Ok(catalogue.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { in_memory: false }) {
        Commands::Serve { in_memory } => serve(in_memory).await?,
        Commands::Migrate => {
            connect_pg().await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::SeedAchievements => {
            let count = seed_achievements().await?;
            println!("seeded {count} achievements");
        }
    }

    Ok(())
}
