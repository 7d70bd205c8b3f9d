use std::sync::Arc;
use std::time::Duration;

use alpaca_broker::AlpacaClient;
use anyhow::{Context, Result};
use broker_trait::{BrokerClient, PaperBroker, PriceSource};
use harvest_core::RunMode;
use notification_service::{NotificationConfig, NotificationService};
use tokio::signal::unix::SignalKind;
use tokio::time::{self, Instant, Interval};

mod config;
mod readiness;
mod runner;
mod state;

use config::{AgentConfig, BrokerKind};
use readiness::DataReadiness;
use runner::Rebalancer;
use state::{load_ledger, SqliteStateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting tax-aware rebalance agent");

    // 2. Configuration and policy
    let config = AgentConfig::from_env()?;
    let policy = config.load_policy()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Broker: {:?} | Mode: {}", config.broker, config.run_mode);
    tracing::info!(
        "  {} asset classes, {} symbols",
        policy.asset_classes.len(),
        policy.universe().len()
    );
    tracing::info!(
        "  Harvest limit: ${} | Buy limit: ${} | Cooldown: {}d",
        policy.harvest_limit,
        policy.buy_limit,
        policy.wash_sale_cooldown_secs / 86_400
    );
    tracing::info!("  Rebalance interval: {}s", config.rebalance_interval_secs);

    // 3. State store and cooldown ledger
    sqlx::any::install_default_drivers();
    let db_pool = sqlx::AnyPool::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?;
    let store = Arc::new(SqliteStateStore::new(db_pool));
    store.init_tables().await?;
    let ledger = load_ledger(store.as_ref(), &policy, config.refresh_last_sold_times).await?;
    tracing::info!("State store initialized ({} ledger entries)", ledger.len());

    // 4. Broker
    let readiness_timeout = Duration::from_secs(config.data_ready_timeout_secs);
    let poll_interval = Duration::from_secs(config.data_poll_interval_secs);
    let (broker, prices, paper): (
        Arc<dyn BrokerClient>,
        Arc<dyn PriceSource>,
        Option<Arc<PaperBroker>>,
    ) = match config.broker {
        BrokerKind::Paper => {
            let paper = Arc::new(PaperBroker::new(config.paper_cash, chrono::Utc::now()));
            paper.set_prices(config.load_paper_prices()?).await;
            tracing::info!("Paper broker seeded with ${}", config.paper_cash);
            (
                paper.clone() as Arc<dyn BrokerClient>,
                paper.clone() as Arc<dyn PriceSource>,
                Some(paper),
            )
        }
        BrokerKind::Alpaca => {
            let alpaca = Arc::new(AlpacaClient::from_env()?);
            alpaca
                .get_account()
                .await
                .map_err(|e| anyhow::anyhow!("Alpaca connectivity check failed: {}", e))?;
            if alpaca.is_paper() {
                tracing::info!("Startup check: Alpaca OK (paper account)");
            } else {
                tracing::warn!("Startup check: Alpaca OK (LIVE account, real money at risk)");
            }
            (
                alpaca.clone() as Arc<dyn BrokerClient>,
                alpaca as Arc<dyn PriceSource>,
                None,
            )
        }
    };

    let readiness = match config.run_mode {
        RunMode::Backtest => DataReadiness::ready(),
        RunMode::Live => {
            let readiness = DataReadiness::new();
            readiness.spawn_poller(prices, policy.universe(), poll_interval);
            readiness
        }
    };

    // 5. Notifications
    let notifier = Arc::new(NotificationService::new(&NotificationConfig::from_env()));

    let rebalancer = Rebalancer::new(broker, store, policy, config.run_mode, ledger)
        .with_notifier(notifier);

    // 6. Schedules
    let mut rebalance_interval = schedule(config.rebalance_interval_secs, config.run_on_startup);
    let mut preview_interval = config.preview_interval_secs.map(|s| schedule(s, false));
    let mut report_interval = config.report_interval_secs.map(|s| schedule(s, false));

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = rebalance_interval.tick() => {
                run_rebalance(&rebalancer, &readiness, readiness_timeout, false).await;
                // Simulated time moves one period per run
                if let Some(paper) = &paper {
                    paper
                        .advance(chrono::Duration::seconds(config.rebalance_interval_secs as i64))
                        .await;
                }
            }
            _ = tick(&mut preview_interval) => {
                run_rebalance(&rebalancer, &readiness, readiness_timeout, true).await;
            }
            _ = tick(&mut report_interval) => {
                match rebalancer.portfolio_report().await {
                    Ok(report) => tracing::info!("Portfolio report:\n{}", report.render()),
                    Err(e) => tracing::warn!("Failed to build portfolio report: {:#}", e),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                if let Err(e) = rebalancer.persist_ledger().await {
                    tracing::error!("Failed to persist cooldown ledger: {:#}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Rebalance agent shut down.");
    Ok(())
}

/// Periodic timer; the first tick is immediate only when `immediate` is set.
fn schedule(period_secs: u64, immediate: bool) -> Interval {
    let period = Duration::from_secs(period_secs.max(1));
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = time::interval_at(start, period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_rebalance(
    rebalancer: &Rebalancer,
    readiness: &DataReadiness,
    timeout: Duration,
    email_only: bool,
) {
    let result = async {
        readiness.wait_ready(timeout).await?;
        rebalancer.rebalance(email_only).await
    }
    .await;

    match result {
        Ok(report) => {
            tracing::info!(
                "{}Rebalance finished:\n{}",
                if email_only { "Faux " } else { "" },
                report.outcome.transcript.render()
            );
        }
        Err(e) => {
            tracing::error!("Rebalance run failed: {:#}", e);
            rebalancer.notify_failure(&e).await;
        }
    }
}
