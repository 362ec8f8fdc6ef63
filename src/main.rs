mod bot;
mod config;
mod conversation;
mod form;
mod platform;
mod scheduler;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::App;
use crate::config::{Config, StoreBackend};
use crate::conversation::ConversationController;
use crate::platform::telegram::{self, TelegramTransport};
use crate::scheduler::Scheduler;
use crate::store::google::GoogleSheet;
use crate::store::sqlite::SqliteSheet;
use crate::store::{RetryPolicy, SheetBackend, SubmissionStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,formbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let zone = config.time_zone()?;
    let access = Arc::new(config.access());

    info!("Configuration loaded successfully");
    info!("  Store backend: {}", config.store.backend);
    info!("  Admins: {}", config.telegram.admin_usernames.len());
    info!("  Notify targets: {}", access.notify_targets().len());
    info!("  Conversation timeout: {}s", config.conversation.timeout_secs);
    info!("  Time zone: {}", zone);

    let backend = open_backend(&config)?;
    let store = SubmissionStore::new(backend, RetryPolicy::from(&config.store.retry))
        .with_dashboard_url(config.store.dashboard_url.clone());

    let bot = Bot::new(&config.telegram.bot_token);
    let transport = Arc::new(TelegramTransport::new(bot.clone()));

    let app = Arc::new(App::new(
        ConversationController::new(config.session_timeout(), zone),
        store,
        transport,
        access,
        zone,
    ));

    let mut scheduler = Scheduler::new().await?;
    scheduler::tasks::register_builtin_tasks(
        &mut scheduler,
        Arc::clone(&app),
        &config.conversation.sweep_cron,
    )
    .await?;
    scheduler.start().await?;
    info!("Background jobs: {}", scheduler.job_names().join(", "));

    info!("Bot is starting...");
    telegram::run(app, bot).await?;

    scheduler.shutdown().await?;
    Ok(())
}

fn open_backend(config: &Config) -> Result<Arc<dyn SheetBackend>> {
    let backend: Arc<dyn SheetBackend> = match config.store.backend {
        StoreBackend::Google => {
            let google = config
                .google
                .as_ref()
                .context("[google] section is required for the google backend")?;
            Arc::new(
                GoogleSheet::from_config(google)
                    .context("Failed to set up the Google Sheets backend")?,
            )
        }
        StoreBackend::Sqlite => {
            let path = &config.sqlite.database_path;
            Arc::new(
                SqliteSheet::open(path)
                    .with_context(|| format!("Failed to open database: {}", path.display()))?,
            )
        }
    };
    Ok(backend)
}
