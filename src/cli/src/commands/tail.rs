//! Follow a stream through a subscription.

use anyhow::Result;
use clap::Args;
use colored::*;
use eventlog_core::config::Config;
use eventlog_core::events::{Position, StreamId, SubscribeOptions, TypeFilter};
use eventlog_core::store;

use super::stream::RecordRow;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct TailArgs {
    /// Stream ID ($all for the global stream)
    pub stream_id: String,

    /// Exclusive start position; only new events when omitted
    #[arg(short, long, allow_negative_numbers = true)]
    pub from: Option<i64>,

    /// Event types to select
    #[arg(short = 't', long = "type")]
    pub types: Vec<String>,
}

pub async fn execute(args: TailArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let store = store::connect(config).await?;

    let mut options = SubscribeOptions::new().from_position(args.from.map(Position::new).unwrap_or(Position::END));
    if !args.types.is_empty() {
        options = options.type_filter(TypeFilter::select(args.types));
    }

    let stream_id = StreamId::new(args.stream_id);
    let mut subscription = store.subscribe_to_stream(&stream_id, options).await?;
    output::print_info(&format!("Following {} (Ctrl-C to stop)", stream_id));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = subscription.recv() => match next {
                Some(Ok(record)) => {
                    output::print_line(&RecordRow::from(&record), format, |row| {
                        format!(
                            "{} {}@{} {} {}",
                            format!("#{}", row.sequence).dimmed(),
                            row.stream.cyan(),
                            row.version,
                            row.type_name.bold(),
                            row.payload
                        )
                    })?;
                }
                Some(Err(e)) => output::print_error(&format!("{:#}", e)),
                None => break,
            },
        }
    }

    subscription.close();
    Ok(())
}
