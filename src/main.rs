//! simple_bank - process wiring
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────────┐
//! │  Config  │───▶│ Logging  │───▶│  PgPool  │───▶│ transfer_tx  │
//! │  (YAML)  │    │(tracing) │    │  (sqlx)  │    │ (optional)   │
//! └──────────┘    └──────────┘    └──────────┘    └──────────────┘
//! ```
//!
//! Usage: `simple_bank [--env <name>] [--transfer <from> <to> <amount>]`

use anyhow::{Context, Result, bail};

use simple_bank::config::AppConfig;
use simple_bank::store::{PgBackend, Store, TransferTxParams};
use simple_bank::Database;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// `--transfer <from> <to> <amount>`
fn get_transfer_request() -> Result<Option<TransferTxParams>> {
    let args: Vec<String> = std::env::args().collect();
    let Some(pos) = args.iter().position(|a| a == "--transfer") else {
        return Ok(None);
    };
    if pos + 3 >= args.len() {
        bail!("--transfer needs <from> <to> <amount>");
    }
    let from: i64 = args[pos + 1].parse().context("invalid <from> account id")?;
    let to: i64 = args[pos + 2].parse().context("invalid <to> account id")?;
    let amount: i64 = args[pos + 3].parse().context("invalid <amount>")?;
    Ok(Some(TransferTxParams::new(from, to, amount)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&app_config);

    tracing::info!(
        git = env!("GIT_HASH"),
        overdraft = ?app_config.ledger.overdraft,
        "Starting simple_bank in {} mode",
        env
    );

    let request = get_transfer_request()?;

    let db = Database::connect(&app_config.postgres)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await.context("Database health check failed")?;

    let store = Store::new(PgBackend::new(db.pool().clone()))
        .with_overdraft_policy(app_config.ledger.overdraft);

    if let Some(request) = request {
        let result = store.transfer_tx(request).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        tracing::info!("Store ready, no transfer requested");
    }

    Ok(())
}
