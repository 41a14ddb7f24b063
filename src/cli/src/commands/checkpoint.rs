//! Processor checkpoint commands.

use anyhow::Result;
use clap::Subcommand;
use eventlog_core::config::Config;
use eventlog_core::processing::{CheckpointStore, PostgresCheckpointStore};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// Show the persisted checkpoint of a processor
    Show {
        /// Processor name
        name: String,
    },

    /// Delete a processor's checkpoint so it starts over
    Reset {
        /// Processor name
        name: String,
    },
}

pub async fn execute(cmd: CheckpointCommands, config: &Config, format: OutputFormat) -> Result<()> {
    let database = super::database(config).await?;
    let checkpoints = PostgresCheckpointStore::new(database.pool().clone());

    match cmd {
        CheckpointCommands::Show { name } => match checkpoints.load(&name).await? {
            Some(checkpoint) => output::print_item(&checkpoint, format, |c| {
                vec![
                    ("Processor", c.id.clone()),
                    ("Stream", c.stream_id.to_string()),
                    ("Position", c.position.to_string()),
                ]
            })?,
            None => output::print_info(&format!("No checkpoint stored for '{}'", name)),
        },
        CheckpointCommands::Reset { name } => {
            checkpoints.delete(&name).await?;
            output::print_success(&format!("Checkpoint for '{}' reset", name));
        }
    }

    Ok(())
}
