use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use proctord::config::ProctorConfig;
use proctord::quota::engine::format_restore_eta;
use proctord::ProctorContext;

#[derive(Parser)]
#[command(
    name = "proctord",
    about = "Proctor host — exam session gating and lives-quota engine",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data directory for config and the SQLite database
    #[arg(long, env = "PROCTORD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PROCTORD_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or administer a subject's lives quota.
    ///
    /// Examples:
    ///   proctord quota show alice@example.com
    ///   proctord quota deduct alice@example.com
    ///   proctord quota reset alice@example.com
    Quota {
        #[command(subcommand)]
        action: QuotaAction,
    },
}

#[derive(Subcommand)]
enum QuotaAction {
    /// Show the effective record (after lazy restoration).
    Show { owner: String },
    /// Record one deduction (admin/testing).
    Deduct { owner: String },
    /// Reset the subject to a full quota.
    Reset { owner: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ProctorConfig::new(args.data_dir, args.log);
    init_tracing(&config);

    let ctx = ProctorContext::open(config).await?;

    match args.command {
        Command::Quota { action } => quota_command(&ctx, action).await?,
    }
    Ok(())
}

fn init_tracing(config: &ProctorConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn quota_command(ctx: &ProctorContext, action: QuotaAction) -> Result<()> {
    let engine = ctx.engine();
    let now = Utc::now();
    match action {
        QuotaAction::Show { owner } => {
            let record = ctx.store.load(&owner).await?;
            let eval = engine.evaluate(&record, now);
            println!(
                "{owner}: {} of {} lives",
                eval.record.count,
                engine.policy().max_quota
            );
            match eval.next_restore_at {
                Some(at) => println!("next restore in {}", format_restore_eta(at - now)),
                None => println!("quota full"),
            }
            for t in &eval.record.deducted_at {
                println!("  deducted at {}", t.to_rfc3339());
            }
        }
        QuotaAction::Deduct { owner } => {
            let record = ctx.store.load(&owner).await?;
            let eval = engine.evaluate(&record, now);
            match engine.deduct(&eval.record, now) {
                Ok(next) => {
                    ctx.store.save(&owner, &next).await?;
                    info!(owner = %owner, count = next.count, "deduction recorded");
                    println!("{owner}: {} lives remain", next.count);
                }
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
        QuotaAction::Reset { owner } => {
            let fresh = engine.fresh_record(Some(owner.clone()));
            ctx.store.save(&owner, &fresh).await?;
            info!(owner = %owner, "quota reset");
            println!("{owner}: reset to {} lives", fresh.count);
        }
    }
    Ok(())
}
