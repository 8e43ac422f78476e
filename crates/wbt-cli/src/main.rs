use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wbt_storage::TariffStore;
use wbt_sync::{run_daemon, App, AppConfig};

#[derive(Debug, Parser)]
#[command(name = "wbt")]
#[command(about = "Wildberries box tariff sync: fetch, store and publish to Google Sheets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate, sync once, then run the scheduler until a shutdown signal.
    Run,
    /// Run one sync for a tariff day (default: today).
    Sync {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, value_enum, default_value_t = Stage::All)]
        stage: Stage,
    },
    /// Delete tariffs older than the retention window.
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    Migrate {
        #[command(subcommand)]
        action: Option<MigrateAction>,
    },
    /// Print stored tariffs for a day or an inclusive date range as JSON.
    Tariffs {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Check that the tariffs API accepts the configured token.
    CheckSource {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    All,
    Source,
    Sheets,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum MigrateAction {
    /// Apply pending migrations.
    Run,
    /// Revert the latest applied migration.
    Undo,
    /// Show every known migration and whether it is applied.
    List,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WBT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A .env file in the working directory fills in anything not already exported.
    dotenvy::dotenv().ok();
    init_tracing();
    let config = AppConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        command => {
            let app = App::connect(config).await?;
            let result = run_command(&app, command).await;
            app.close().await;
            result
        }
    }
}

async fn run_command(app: &App, command: Commands) -> Result<()> {
    let orchestrator = app.orchestrator();
    match command {
        Commands::Run => bail!("the daemon is started without an open connection"),
        Commands::Sync { date, stage } => {
            app.store().migrate().await.context("running database migrations")?;
            let tariff_date = date.unwrap_or_else(|| orchestrator.calendar().today());
            let succeeded = match stage {
                Stage::All => {
                    let outcome = orchestrator.full_sync(Some(tariff_date)).await;
                    print_json(&outcome)?;
                    outcome.wb_sync.success && outcome.sheets_sync.success
                }
                Stage::Source => {
                    let outcome = orchestrator.sync_from_source(Some(tariff_date)).await;
                    print_json(&outcome)?;
                    outcome.success
                }
                Stage::Sheets => {
                    let outcome = orchestrator.sync_to_sheets(Some(tariff_date)).await;
                    print_json(&outcome)?;
                    outcome.success
                }
            };
            if !succeeded {
                bail!("sync for {tariff_date} finished with errors");
            }
        }
        Commands::Cleanup { days } => {
            app.store().migrate().await.context("running database migrations")?;
            let retention_days = days.unwrap_or(app.config().retention_days);
            let outcome = orchestrator.cleanup(retention_days).await;
            print_json(&outcome)?;
            if !outcome.success {
                bail!("cleanup failed");
            }
        }
        Commands::Migrate { action } => match action.unwrap_or(MigrateAction::Run) {
            MigrateAction::Run => {
                app.store().migrate().await?;
                println!("migrations applied");
            }
            MigrateAction::Undo => match app.store().undo_last_migration().await? {
                Some(version) => println!("reverted migration {version}"),
                None => println!("no applied migrations"),
            },
            MigrateAction::List => {
                for migration in app.store().migration_status().await? {
                    let state = if migration.applied { "applied" } else { "pending" };
                    println!("{:>14}  {:<8} {}", migration.version, state, migration.description);
                }
            }
        },
        Commands::Tariffs { from, to } => {
            let to = to.unwrap_or(from);
            if to < from {
                bail!("--to {to} is before --from {from}");
            }
            let records = app.store().query_range(from, to).await?;
            info!(count = records.len(), %from, %to, "loaded stored tariffs");
            print_json(&records)?;
        }
        Commands::CheckSource { date } => {
            let date = date.unwrap_or_else(|| orchestrator.calendar().today());
            let accepted = app.source().validate_token(date).await;
            print_json(&serde_json::json!({
                "base_url": app.source().base_url(),
                "tariff_date": date,
                "accepted": accepted,
            }))?;
            if !accepted {
                bail!("tariffs API rejected the request");
            }
        }
    }
    Ok(())
}
