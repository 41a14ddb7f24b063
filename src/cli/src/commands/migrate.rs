//! Schema migration command.

use anyhow::Result;
use eventlog_core::config::Config;

use crate::output;

pub async fn execute(config: &Config) -> Result<()> {
    let database = super::database(config).await?;
    database.migrate().await?;
    output::print_success("Schema is up to date");
    Ok(())
}
