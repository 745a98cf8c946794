use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "attend", about = "Attend kiosk administration CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus.
    #[arg(long)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the person at the kiosk camera
    Enroll {
        /// Display name for the new identity
        name: String,
        /// Card id (any format; hex digits are extracted)
        card: String,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity id to remove
        id: i64,
    },
    /// Bind an identity to a different card
    BindCard {
        /// Identity id
        id: i64,
        /// New card id
        card: String,
    },
    /// Write attendance records to a CSV file
    Export {
        /// Export only records from the current local day
        #[arg(long)]
        today: bool,
    },
    /// Show attendance records
    Records {
        /// Show only the most recent N records
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Delete all attendance records
    ClearRecords {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.freedesktop.Attend1",
    default_service = "org.freedesktop.Attend1",
    default_path = "/org/freedesktop/Attend1"
)]
trait Attend {
    async fn enroll(&self, name: &str, card: &str) -> zbus::Result<i64>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, id: i64) -> zbus::Result<bool>;
    async fn bind_card(&self, id: i64, card: &str) -> zbus::Result<bool>;
    async fn export_csv(&self, start_ms: i64, end_ms: i64) -> zbus::Result<String>;
    async fn records(&self, limit: u32) -> zbus::Result<String>;
    async fn clear_records(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Deserialize)]
struct IdentityRow {
    id: i64,
    name: String,
    card: String,
    has_embedding: bool,
}

#[derive(Deserialize)]
struct RecordRow {
    id: i64,
    identity_id: i64,
    card_id: String,
    timestamp_ms: i64,
    signed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to the bus")?;
    let proxy = AttendProxy::new(&conn)
        .await
        .context("is attendd running?")?;

    match cli.command {
        Commands::Enroll { name, card } => {
            println!("Look at the camera...");
            let id = proxy.enroll(&name, &card).await?;
            println!("Enrolled {name} as identity {id}");
        }
        Commands::List => {
            let rows: Vec<IdentityRow> = serde_json::from_str(&proxy.list_identities().await?)?;
            if rows.is_empty() {
                println!("No identities enrolled");
            }
            for row in rows {
                let face = if row.has_embedding { "" } else { "  (no face model)" };
                println!("{:>4}  {:<24} {}{face}", row.id, row.name, row.card);
            }
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(id).await? {
                println!("Removed identity {id}");
            } else {
                println!("No identity {id}");
            }
        }
        Commands::BindCard { id, card } => {
            if proxy.bind_card(id, &card).await? {
                println!("Identity {id} bound to card");
            } else {
                println!("No identity {id}");
            }
        }
        Commands::Export { today } => {
            let (start_ms, end_ms) = if today {
                local_day_bounds(chrono::Local::now().date_naive())?
            } else {
                (0, 0)
            };
            let path = proxy.export_csv(start_ms, end_ms).await?;
            println!("Exported to {path}");
        }
        Commands::Records { limit } => {
            let rows: Vec<RecordRow> = serde_json::from_str(&proxy.records(limit).await?)?;
            if rows.is_empty() {
                println!("No records");
            }
            for row in rows {
                println!(
                    "{:>6}  identity {:<4} card {:<16} {}  signed={}",
                    row.id,
                    row.identity_id,
                    row.card_id,
                    format_ms(row.timestamp_ms),
                    row.signed
                );
            }
        }
        Commands::ClearRecords { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear records without --yes");
            }
            let removed = proxy.clear_records().await?;
            println!("Removed {removed} records");
        }
        Commands::Status => {
            println!("{}", proxy.status().await?);
        }
    }

    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}

/// `[midnight, next midnight)` of `day` in local time, as epoch ms. The end
/// is the following day's midnight, not start plus 24 hours; DST transition
/// days are 23 or 25 hours long.
fn local_day_bounds(day: chrono::NaiveDate) -> Result<(i64, i64)> {
    let next = day.succ_opt().context("date out of range")?;
    Ok((local_midnight_ms(day)?, local_midnight_ms(next)?))
}

fn local_midnight_ms(day: chrono::NaiveDate) -> Result<i64> {
    day.and_hms_opt(0, 0, 0)
        .and_then(|t| t.and_local_timezone(chrono::Local).earliest())
        .map(|dt| dt.timestamp_millis())
        .context("failed to resolve local midnight")
}
