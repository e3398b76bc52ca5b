use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use storefront_api::{
    auth::{AuthConfig, AuthService},
    config::{self, AppConfig},
    db,
    events::{Event, EventSender},
    handlers::AppServices,
    services::{coins::CoinBalance, orders::SettlementReport},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "storefront",
    about = "Storefront CLI for migrations, settlement and coin lookups",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Re-run settlement for one order
    Reconcile {
        #[arg(long, help = "Order number, e.g. ORD-20240309-AB12CD")]
        order: String,
    },
    /// Re-run settlement for every order that is not yet settled
    ReconcilePending {
        #[arg(long, default_value_t = 100, help = "Maximum orders to examine")]
        limit: u64,
    },
    /// Show a user's coin balance
    Balance {
        #[arg(long, help = "User id")]
        user: Uuid,
    },
    /// Issue a session token for a user, for local testing
    IssueToken {
        #[arg(long, help = "User id")]
        user: Uuid,
        #[arg(long, help = "Email embedded in the token claims")]
        email: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json);

    match cli.command {
        Commands::Migrate => {
            let pool = db::establish_connection_from_app_config(&config)
                .await
                .context("failed to connect to database")?;
            db::run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::Reconcile { order } => {
            let context = CliContext::initialize(&config).await?;
            let report = context
                .services
                .orders
                .reconcile(&order)
                .await
                .with_context(|| format!("failed to reconcile {}", order))?;
            context.services.orders.wait_for_confirmations().await;
            if cli.json {
                print_json(&report)?;
            } else {
                render_report(&order, &report);
            }
        }
        Commands::ReconcilePending { limit } => {
            let context = CliContext::initialize(&config).await?;
            let summary = context
                .services
                .orders
                .reconcile_pending(limit)
                .await
                .context("failed to reconcile pending orders")?;
            context.services.orders.wait_for_confirmations().await;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "Examined {} unsettled orders, {} now settled",
                    summary.examined, summary.settled
                );
            }
        }
        Commands::Balance { user } => {
            let context = CliContext::initialize(&config).await?;
            let balance = context
                .services
                .coins
                .balance(user)
                .await
                .context("failed to load coin balance")?;
            if cli.json {
                print_json(&balance)?;
            } else {
                render_balance(&balance);
            }
        }
        Commands::IssueToken { user, email } => {
            let auth = AuthService::new(AuthConfig::new(
                config.jwt_secret.clone(),
                Duration::from_secs(config.jwt_expiration as u64),
            ));
            let token = auth
                .issue_token(user, email)
                .context("failed to issue token")?;
            println!("{}", token);
        }
    }

    Ok(())
}

struct CliContext {
    services: AppServices,
}

impl CliContext {
    async fn initialize(config: &AppConfig) -> Result<Self> {
        let db_pool = db::establish_connection_from_app_config(config)
            .await
            .context("failed to connect to database")?;

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(32);
        let event_sender = Arc::new(EventSender::new(event_tx));

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                debug!(target: "storefront_cli", event = event.name(), "received async event");
            }
        });

        let services = AppServices::from_config(Arc::new(db_pool), event_sender, config)
            .context("failed to build services")?;

        Ok(Self { services })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_report(order_number: &str, report: &SettlementReport) {
    println!(
        "Order {} • settled {} • redeemed {} • earned {} • referral {} • confirmation queued {}",
        order_number,
        report.settled,
        report.coins_redeemed,
        report.coins_earned,
        report.referral_bonus_credited,
        report.confirmation_dispatched
    );
    if !report.stock_shortfalls.is_empty() {
        println!("  stock shortfalls: {:?}", report.stock_shortfalls);
    }
    for failure in &report.failures {
        println!("  failed: {}", failure);
    }
}

fn render_balance(balance: &CoinBalance) {
    println!(
        "User {} • {} coins (max discount {}) • earned {} • redeemed {} • referral {}",
        balance.user_id,
        balance.coins,
        balance.max_discount,
        balance.total_earned,
        balance.total_redeemed,
        balance.referral_total_earnings
    );
}
