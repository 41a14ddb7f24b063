//! CLI command implementations.

pub mod checkpoint;
pub mod migrate;
pub mod stream;
pub mod tail;

use anyhow::{Context, Result};
use eventlog_core::config::Config;
use eventlog_core::db::Database;

/// Connect to the relational database, which checkpoints and migrations need.
pub async fn database(config: &Config) -> Result<Database> {
    let database = config
        .database
        .as_ref()
        .context("this command needs a [database] section or --database-url")?;
    Ok(Database::connect(database).await?)
}
