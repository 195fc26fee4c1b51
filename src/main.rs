//! Perp Sentinel - Main Entry Point

use anyhow::Result;
use clap::{Parser, Subcommand};
use perp_sentinel::config::Config;
use perp_sentinel::exchange::{BinanceFuturesClient, Exchange, PaperExchange};
use perp_sentinel::persistence::SqliteStore;
use perp_sentinel::service::RiskService;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Perp Sentinel CLI
#[derive(Parser)]
#[command(name = "perp-sentinel")]
#[command(version, about = "Risk and position-control engine for perpetual futures")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the risk engine
    Run {
        /// Log defensive actions without touching the exchange
        #[arg(long)]
        dry_run: bool,
    },

    /// Show persisted risk state
    Status {
        /// Path to the SQLite database (default: from config)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of recent risk events to show
        #[arg(short = 'n', long, default_value = "10")]
        events: u32,
    },
}

/// Console logging by default; JSON lines into a daily-rotated file when
/// `PS_LOG_DIR` is set. The returned guard must outlive main so buffered
/// lines flush on exit.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Ok(dir) = std::env::var("PS_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "perp-sentinel.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .json()
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Status { db, events }) => show_status(db, events),
        Some(Commands::Run { dry_run }) => run(dry_run).await,
        None => run(false).await,
    }
}

async fn run(dry_run: bool) -> Result<()> {
    let mut config = Config::load()?;
    if dry_run {
        config.service.dry_run = true;
    }
    config.validate()?;

    let exchange: Arc<dyn Exchange> = if config.exchange.paper {
        info!("Paper venue selected; seeding nominal marks");
        let venue = Arc::new(PaperExchange::new(config.controller.starting_balance));
        for symbol in &config.service.symbols {
            venue.set_price(symbol, dec!(100)).await;
        }
        venue
    } else {
        Arc::new(BinanceFuturesClient::new(&config.exchange)?)
    };

    if config.service.dry_run {
        warn!("DRY RUN mode: defensive actions will be logged, not executed");
    }

    let service = RiskService::new(config, exchange)?;
    service.start().await?;

    tokio::signal::ctrl_c().await.ok();
    info!("Interrupt received");
    service.shutdown().await;
    Ok(())
}

fn show_status(db: Option<String>, events: u32) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let db_path = db.unwrap_or(config.persistence.db_path);
    let store = SqliteStore::new(&db_path)?;

    match store.latest_equity()? {
        Some(equity) => {
            println!("Equity:          {}", equity.total_equity);
            println!("Available:       {}", equity.available_balance);
            println!("Margin used:     {}", equity.used_margin);
            println!("Margin ratio:    {}", equity.margin_ratio);
            println!("Unrealized PnL:  {}", equity.unrealized_pnl);
            println!("Open positions:  {}", equity.position_count);
            println!("As of:           {}", equity.at);
        }
        None => println!("No equity history recorded yet."),
    }

    if let Some(summary) = store.daily_summary(chrono::Utc::now().date_naive())? {
        println!();
        println!(
            "Today: start {} -> now {} (realized {}, unrealized {})",
            summary.starting_equity,
            summary.current_equity,
            summary.realized_pnl,
            summary.unrealized_pnl
        );
    }

    let recent = store.recent_events(events)?;
    if !recent.is_empty() {
        println!();
        println!("Recent risk events:");
        for event in recent {
            println!(
                "  [{}] {} {} {} - {}",
                event.created_at,
                event.severity.to_uppercase(),
                event.event_type,
                event.symbol.as_deref().unwrap_or("-"),
                event.message
            );
        }
    }
    Ok(())
}
