use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mensa_sync::db::repo;
use mensa_sync::notify::LogSink;
use mensa_sync::sync::{RunMode, SyncEngine};
use mensa_sync::{config, model, present, reconcile};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a sync against the configured portals
    Sync {
        /// Only pending actions and credit
        #[arg(long, conflicts_with = "remaining")]
        changes: bool,
        /// Only remaining-portion counts and credit
        #[arg(long)]
        remaining: bool,
        /// Restrict a remaining sync to one credential
        #[arg(long, requires = "remaining")]
        credential: Option<i64>,
    },
    /// List menu entries with their currently valid action
    Menu {
        #[arg(long)]
        credential: i64,
        /// First day to list; defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Stage a reservation change for one menu entry
    Edit {
        #[arg(long)]
        credential: i64,
        #[arg(long)]
        portal: i64,
        /// Relative id of the menu entry
        #[arg(long)]
        entry: i64,
        #[arg(long)]
        reserved: i32,
        #[arg(long, default_value_t = 0)]
        offered: i32,
    },
    /// Promote staged edits so the next sync pushes them
    Save {
        #[arg(long)]
        credential: i64,
    },
    /// Throw staged edits away
    Discard {
        #[arg(long)]
        credential: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/mensa.db", cfg.app.data_dir));

    let pool = repo::init_pool(&database_url).await?;
    repo::run_migrations(&pool).await?;
    repo::seed_config(&pool, &cfg).await?;

    match args.command {
        Command::Sync {
            changes,
            remaining,
            credential,
        } => {
            let mode = if changes {
                RunMode::Changes
            } else if remaining {
                RunMode::Remaining { credential }
            } else {
                RunMode::Full
            };
            let engine = SyncEngine::new(
                pool,
                Arc::new(LogSink),
                Duration::from_secs(cfg.app.plugin_timeout_secs),
            );
            let summary = engine.run(mode).await?;
            for outcome in &summary.scopes {
                println!(
                    "credential {} @ portal {}: {:?} (requested {})",
                    outcome.credential_id,
                    outcome.portal_id,
                    outcome.report.worst(),
                    outcome.requested
                );
            }
            for (credential_id, tally) in &summary.tallies {
                println!(
                    "credential {}: {} confirmed, {} failed",
                    credential_id, tally.succeeded, tally.failed
                );
            }
            // NotSupported is below Ok on the severity ladder but is still
            // not a success.
            if !summary.worst.is_ok() {
                return Err(anyhow!("sync finished with {:?}", summary.worst));
            }
            info!("sync finished");
        }
        Command::Menu { credential, date } => {
            let scope = repo::load_log_data(&pool, Some(credential))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("credential {} not found", credential))?;
            let since = date.unwrap_or_else(model::today);
            let slots = repo::menu_slots_since(&pool, credential, scope.portal_id, since).await?;
            let today = model::today();
            for slot in &slots {
                let (reserved, offered) = slot.authoritative_amounts();
                println!(
                    "{} #{:<5} {:<40} {:>8} r={} o={} [{:?}]",
                    slot.date,
                    slot.relative_id,
                    slot.label,
                    slot.price
                        .map(|p| format!("{}.{:02}", p / 100, p % 100))
                        .unwrap_or_else(|| "-".into()),
                    reserved,
                    offered,
                    present::resolve_action(slot, today)
                );
            }
        }
        Command::Edit {
            credential,
            portal,
            entry,
            reserved,
            offered,
        } => {
            let plan =
                reconcile::make_edit(&pool, &LogSink, credential, portal, entry, reserved, offered)
                    .await?;
            if plan.is_noop() {
                println!("nothing to change");
            } else {
                println!("staged {} change(s)", plan.mutations.len());
                if plan.stock_forced {
                    println!("note: a sibling portion was offered into the food stock");
                }
            }
        }
        Command::Save { credential } => {
            let (promoted, dropped) = reconcile::save_edits(&pool, credential).await?;
            println!("{} edit(s) queued for sync, {} discarded as no-ops", promoted, dropped);
        }
        Command::Discard { credential } => {
            let dropped = reconcile::discard_edits(&pool, credential).await?;
            println!("{} edit(s) discarded", dropped);
        }
    }

    Ok(())
}
