//! Command-line interface: argument parsing, startup and dispatch.

mod quota;
mod referral;
mod status;
mod user;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use quotaledger::config::LoggingConfig;
use quotaledger::{Config, Ledger, ReferralProgram, Store, SystemClock, UserHash};

#[derive(Parser)]
#[command(name = "quotaledger", version, about = "Entitlement and referral ledger admin")]
pub(crate) struct Cli {
    /// Config file (default: ~/.quotaledger/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding config and environment
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Inspect or replace the tier quota map
    Quota {
        #[command(subcommand)]
        action: QuotaSubcommand,
    },
    /// Inspect and administer a single user
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Referral records and maintenance
    Referral {
        #[command(subcommand)]
        action: ReferralAction,
    },
    /// Ledger-wide counts
    Status,
}

#[derive(Subcommand)]
pub(crate) enum QuotaSubcommand {
    /// Show the effective map and the raw override
    Show,
    /// Replace the runtime override, e.g. '{"FREE":12,"PLUS":30,"PREMIUM":100}'
    Set { json: String },
    /// Remove the runtime override
    Clear,
}

#[derive(Subcommand)]
pub(crate) enum UserAction {
    /// Show limits and referral fields
    Show { user: String },
    /// Change tier and subscription
    SetTier {
        user: String,
        tier: String,
        /// Subscription length in days; 0 clears the subscription
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Recompute today's allowance now
    ForceReset { user: String },
    /// Add bonus credits
    Grant { user: String, amount: i64 },
    /// Print the hash of a raw identity
    Hash { raw: String },
}

#[derive(Subcommand)]
pub(crate) enum ReferralAction {
    /// Show a user's own referral and the ones they made
    Show { user: String },
    /// Counts by status
    Stats,
    /// Expire overdue pending referrals
    Sweep,
}

/// Handles shared by every command.
pub(crate) struct Admin {
    pub config: Config,
    pub ledger: Ledger,
    pub referrals: ReferralProgram,
}

impl Admin {
    /// Operator argument to a hash: 16+ hex chars is a hash, anything else is
    /// hashed with the configured secret.
    pub fn resolve(&self, ident: &str) -> UserHash {
        quotaledger::resolve_identifier(&self.config.identity.secret, ident)
    }
}

pub(crate) async fn run() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let path = cli.config.clone().unwrap_or_else(Config::path);
    let mut config = if path.exists() {
        Config::load_from_path(&path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    if let Some(db) = &cli.db {
        config.storage.database_path = Some(db.clone());
    }

    init_logging(&config.logging);
    config.validate().context("invalid configuration")?;

    // `user hash` needs no database.
    if let Commands::User {
        action: UserAction::Hash { raw },
    } = &cli.command
    {
        println!("{}", UserHash::derive(&config.identity.secret, raw.trim()));
        return Ok(());
    }

    let store = Store::open(&config.storage).await.with_context(|| {
        format!(
            "failed to open database at {}",
            config.storage.resolved_path().display()
        )
    })?;
    let ledger = Ledger::from_config(store.clone(), Arc::new(SystemClock), &config)?;
    let referrals = ReferralProgram::new(ledger.clone(), config.referral.clone());
    let ctx = Admin {
        config,
        ledger,
        referrals,
    };

    let result = match cli.command {
        Commands::Quota { action } => quota::cmd_quota(&ctx, action).await,
        Commands::User { action } => user::cmd_user(&ctx, action).await,
        Commands::Referral { action } => referral::cmd_referral(&ctx, action).await,
        Commands::Status => status::cmd_status(&ctx).await,
    };
    store.close().await;
    result
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr so command output on stdout stays pipeable.
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// `2025-03-02 00:00 UTC`, or `-` for none.
pub(crate) fn fmt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}


#[cfg(test)]
pub(crate) async fn test_admin() -> Admin {
    let config = Config::default();
    let store = Store::open_in_memory().await.unwrap();
    let ledger = Ledger::from_config(store, Arc::new(SystemClock), &config).unwrap();
    let referrals = ReferralProgram::new(ledger.clone(), config.referral.clone());
    Admin {
        config,
        ledger,
        referrals,
    }
}
