//! Stream commands.
//!
//! Provides read, append, info, truncate and delete operations on streams.

use anyhow::{Context, Result};
use clap::Subcommand;
use eventlog_core::config::Config;
use eventlog_core::events::{
    AppendOptions, EventDescriptor, EventId, EventMetadata, Position, ReadOptions, RecordedEventDescriptor,
    StreamId, StreamVersion, TypeFilter,
};
use eventlog_core::store;
use serde::Serialize;
use serde_json::{Map, Value};
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum StreamCommands {
    /// Read events from a stream ($all for the global stream)
    Read {
        /// Stream ID
        stream_id: String,

        /// Read from the end towards the start
        #[arg(short, long)]
        backward: bool,

        /// Exclusive start position (version, or sequence number on $all)
        #[arg(short, long, allow_negative_numbers = true)]
        from: Option<i64>,

        /// Maximum number of events
        #[arg(short, long)]
        limit: Option<usize>,

        /// Event types to select
        #[arg(short = 't', long = "type")]
        types: Vec<String>,

        /// Exclude the given types instead of selecting them
        #[arg(long, requires = "types")]
        exclude: bool,
    },

    /// Append one event to a stream
    Append {
        /// Stream ID
        stream_id: String,

        /// Event type
        #[arg(short = 't', long = "type")]
        type_name: String,

        /// Event payload as JSON
        #[arg(short, long)]
        data: String,

        /// Event metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,

        /// Event ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Required current version of the stream (-1 for a new stream)
        #[arg(short, long, allow_negative_numbers = true)]
        expected_version: Option<i64>,
    },

    /// Show the version bounds of a stream
    Info {
        /// Stream ID
        stream_id: String,
    },

    /// Remove the events of a stream below a position
    Truncate {
        /// Stream ID
        stream_id: String,

        /// Events with a version below this are removed
        #[arg(long)]
        before: i64,
    },

    /// Delete a stream
    Delete {
        /// Stream ID
        stream_id: String,
    },
}

// ── Output types ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Tabled)]
pub struct RecordRow {
    #[tabled(rename = "Seq")]
    pub sequence: i64,
    #[tabled(rename = "Stream")]
    pub stream: String,
    #[tabled(rename = "Version")]
    pub version: i64,
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Type")]
    pub type_name: String,
    #[tabled(rename = "Recorded")]
    pub recorded_at: String,
    #[tabled(rename = "Payload")]
    pub payload: Value,
}

impl From<&RecordedEventDescriptor> for RecordRow {
    fn from(record: &RecordedEventDescriptor) -> Self {
        Self {
            sequence: record.sequence_number().value(),
            stream: record.stream_id().to_string(),
            version: record.version().value(),
            id: record.id().to_string(),
            type_name: record.type_name().to_string(),
            recorded_at: record.recorded_at().to_rfc3339(),
            payload: record.payload().as_value().clone(),
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: StreamCommands, config: &Config, format: OutputFormat) -> Result<()> {
    let store = store::connect(config).await?;

    match cmd {
        StreamCommands::Read {
            stream_id,
            backward,
            from,
            limit,
            types,
            exclude,
        } => {
            let mut options = if backward {
                ReadOptions::backward()
            } else {
                ReadOptions::forward()
            };
            if let Some(from) = from {
                options = options.from_position(Position::new(from));
            }
            if let Some(limit) = limit {
                options = options.max_count(limit);
            }
            if !types.is_empty() {
                let filter = if exclude {
                    TypeFilter::exclude(types)
                } else {
                    TypeFilter::select(types)
                };
                options = options.type_filter(filter);
            }

            let slice = store.read_from_stream(&StreamId::new(stream_id), options).await?;
            let rows: Vec<RecordRow> = slice.iter().map(RecordRow::from).collect();
            output::print_list(&rows, format)?;
        }

        StreamCommands::Append {
            stream_id,
            type_name,
            data,
            metadata,
            id,
            expected_version,
        } => {
            let payload: Value = serde_json::from_str(&data).context("--data is not valid JSON")?;
            let metadata: Map<String, Value> = match metadata {
                Some(raw) => serde_json::from_str(&raw).context("--metadata is not a JSON object")?,
                None => Map::new(),
            };
            let id = id.map(EventId::new).unwrap_or_else(EventId::generate);
            let event = EventDescriptor::new(id, type_name, payload).with_metadata(EventMetadata::from(metadata));

            let mut options = AppendOptions::new();
            if let Some(version) = expected_version {
                options = options.expected_version(StreamVersion::new(version));
            }

            let recorded = store
                .append_to_stream(&StreamId::new(stream_id), vec![event], options)
                .await?;
            let rows: Vec<RecordRow> = recorded.iter().map(RecordRow::from).collect();
            match format {
                OutputFormat::Table => {
                    for row in &rows {
                        output::print_success(&format!(
                            "Appended {} to {} at version {} (sequence {})",
                            row.id, row.stream, row.version, row.sequence
                        ));
                    }
                }
                _ => output::print_list(&rows, format)?,
            }
        }

        StreamCommands::Info { stream_id } => {
            let stream = store.get_stream(&StreamId::new(stream_id)).await?;
            output::print_item(&stream, format, |s| {
                vec![
                    ("Stream", s.id.to_string()),
                    ("Version", s.version.to_string()),
                    ("Initial version", s.initial_version.to_string()),
                ]
            })?;
        }

        StreamCommands::Truncate { stream_id, before } => {
            store
                .truncate_stream(&StreamId::new(stream_id.clone()), Position::new(before))
                .await?;
            output::print_success(&format!("Truncated {} before {}", stream_id, before));
        }

        StreamCommands::Delete { stream_id } => {
            store.delete_stream(&StreamId::new(stream_id.clone())).await?;
            output::print_success(&format!("Deleted {}", stream_id));
        }
    }

    Ok(())
}
