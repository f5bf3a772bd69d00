//! points-ledger
//!
//! `serve`: follow one entity's history and live feed, expose the reconciled
//! ledger over HTTP.
//! `replay`: build a ledger offline from a saved history response.
//!
//! Environment:
//!   LEDGER_CONFIG        - optional TOML config file
//!   LEDGER_ENTITY_ID     - entity to follow
//!   LEDGER_API_BASE_URL  - REST base URL
//!   LEDGER_WS_URL        - live feed URL
//!   LEDGER_AUTH_TOKEN    - sent as the Authorization header
//!   LEDGER_BIND_ADDR     - API listen address
//!   LEDGER_REFRESH_SECS  - periodic bulk refresh (0 disables)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast, time::interval};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use points_ledger::{
    api,
    config::Config,
    ledger::build_from_raw,
    live::{LedgerRegistry, LedgerSession},
    sources::{history_rest::history_from_body, HistoryRestClient, HistorySource, LiveFeedClient},
};

#[derive(Parser, Debug)]
#[command(name = "points-ledger")]
#[command(about = "Reconciled points ledger: live follower and offline replay")]
struct Cli {
    /// TOML config file
    #[arg(long, env = "LEDGER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow one entity and serve its ledger over HTTP
    Serve(ServeArgs),

    /// Build a ledger from a saved history JSON array and print it
    Replay {
        /// File holding the `/history/user/{id}` response body
        #[arg(short = 'f', long)]
        history: PathBuf,

        /// Authoritative balance to anchor to
        #[arg(short, long)]
        balance: Option<f64>,

        /// Only entries at or after this RFC3339 instant
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Only entries at or before this RFC3339 instant
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "LEDGER_ENTITY_ID")]
    entity: Option<String>,

    #[arg(long, env = "LEDGER_API_BASE_URL")]
    api_base_url: Option<String>,

    #[arg(long, env = "LEDGER_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "LEDGER_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    #[arg(long, env = "LEDGER_BIND_ADDR")]
    bind_addr: Option<String>,

    #[arg(long, env = "LEDGER_REFRESH_SECS")]
    refresh_interval_secs: Option<u64>,
}

impl ServeArgs {
    /// Flags and environment win over the config file.
    fn apply(self, config: &mut Config) {
        if let Some(entity) = self.entity {
            config.entity_id = Some(entity);
        }
        if let Some(url) = self.api_base_url {
            config.api_base_url = url;
        }
        if let Some(url) = self.ws_url {
            config.ws_url = url;
        }
        if let Some(token) = self.auth_token {
            config.auth_token = Some(token);
        }
        if let Some(addr) = self.bind_addr {
            config.bind_addr = addr;
        }
        if let Some(secs) = self.refresh_interval_secs {
            config.refresh_interval_secs = Some(secs);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => {
            args.apply(&mut config);
            serve(config).await
        }
        Commands::Replay {
            history,
            balance,
            from,
            to,
            json,
        } => replay(&history, balance, from, to, json),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "points_ledger=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config: Config) -> Result<()> {
    let entity = config
        .entity_id
        .clone()
        .context("No entity configured (--entity or LEDGER_ENTITY_ID)")?;

    info!("🚀 Starting points ledger for {}", entity);
    info!("  API: {}", config.api_base_url);
    info!("  Live feed: {}", config.ws_url);

    let registry = Arc::new(LedgerRegistry::new(config.update_capacity));
    let controller = registry.get_or_create(&entity);
    let source: Arc<dyn HistorySource> = Arc::new(HistoryRestClient::new(
        &config.api_base_url,
        config.auth_token.as_deref(),
        config.request_timeout(),
    )?);
    let session = Arc::new(LedgerSession::new(controller, source));

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let (feed, events) = LiveFeedClient::new(
        config.ws_url.clone(),
        entity.clone(),
        config.auth_token.clone(),
        config.max_reconnect_backoff(),
    );
    let feed_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = feed.run(shutdown).await {
                warn!("Live feed stopped: {:#}", e);
            }
        })
    };

    let pump_task = {
        let session = Arc::clone(&session);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { session.pump(events, shutdown).await })
    };

    let load_task = {
        let session = Arc::clone(&session);
        let mut shutdown = shutdown_tx.subscribe();
        let every = config.refresh_interval();
        tokio::spawn(async move {
            if !load_once(&session, &mut shutdown).await {
                return;
            }
            let Some(every) = every else {
                return;
            };
            let mut ticker = interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !load_once(&session, &mut shutdown).await {
                            return;
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
        })
    };

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 Ledger API listening on {}", config.bind_addr);

    let shutdown_signal = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
            let _ = shutdown_tx.send(());
        }
    };

    axum::serve(listener, api::router(Arc::clone(&registry)))
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(());
    let (_, consumed, _) = tokio::join!(feed_task, pump_task, load_task);
    if let Ok(consumed) = consumed {
        info!("Live events consumed: {}", consumed);
    }

    let stats = session.controller().stats();
    info!("📊 Final stats: {:?}", stats);
    registry.remove(&entity);
    Ok(())
}

/// Returns false once shutdown has fired.
async fn load_once(session: &LedgerSession, shutdown: &mut broadcast::Receiver<()>) -> bool {
    match session.refresh_or_cancel(shutdown).await {
        Ok(Some(outcome)) => {
            info!(
                transactions = outcome.transactions,
                carried_over = outcome.carried_over,
                "Ledger refreshed"
            );
            true
        }
        Ok(None) => false,
        Err(e) => {
            // previous ledger stays visible
            warn!("⚠️  Ledger refresh failed: {:#}", e);
            true
        }
    }
}

fn replay(
    history: &Path,
    balance: Option<f64>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    json: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(history)
        .with_context(|| format!("Failed to read {}", history.display()))?;
    let body: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("{} is not JSON", history.display()))?;

    let built = build_from_raw(&history_from_body(body), balance);
    let ledger = &built.ledger;
    let entries = ledger.display_entries_between(from, to);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!(
        "{:<22} {:<24} {:>10} {:>12}",
        "TIME", "LABEL", "DELTA", "BALANCE"
    );
    for entry in &entries {
        println!(
            "{:<22} {:<24} {:>+10.2} {:>12.2}",
            entry.timestamp().format("%Y-%m-%d %H:%M:%S"),
            entry.transaction.display_label(),
            entry.delta(),
            entry.display_balance
        );
    }
    println!(
        "\n{} entries ({} skipped, {} unknown action), offset {:.2}, balance {:.2}",
        entries.len(),
        built.rejected.len(),
        built.unknown_actions.len(),
        ledger.offset(),
        ledger.current_balance()
    );
    Ok(())
}
