//! Newline-delimited JSON input stream.
//!
//! Each line is either a scored post or an operator command:
//!
//! ```text
//! {"kind":"sentiment","source_post_id":"1846","score":8,"observed_at":"2025-10-14T17:20:04Z"}
//! {"kind":"command","command":"close-now"}
//! ```
//!
//! Malformed lines (including scores outside 0..=10) are logged and
//! skipped.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::SentimentEvent;
use crate::trading::{EngineInput, OperatorCommand};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputLine {
    Sentiment(SentimentEvent),
    Command { command: OperatorCommand },
}

impl From<InputLine> for EngineInput {
    fn from(line: InputLine) -> Self {
        match line {
            InputLine::Sentiment(event) => EngineInput::Sentiment(event),
            InputLine::Command { command } => EngineInput::Command {
                command,
                reply: None,
            },
        }
    }
}

/// Parse one line; blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<InputLine>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let parsed = serde_json::from_str(line).context("Invalid input line")?;
    Ok(Some(parsed))
}

/// Open `path` for reading, `-` meaning stdin.
pub async fn open_source(path: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open input {}", path))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Forward parsed lines to the engine until the source ends or the
/// engine goes away.
pub fn spawn_reader<R>(reader: R, tx: mpsc::Sender<EngineInput>) -> JoinHandle<Result<()>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        let mut line_no = 0u64;
        while let Some(line) = lines.next_line().await.context("Failed to read input")? {
            line_no += 1;
            let input = match parse_line(&line) {
                Ok(Some(input)) => input,
                Ok(None) => continue,
                Err(e) => {
                    warn!(line = line_no, error = %format!("{:#}", e), "Skipping malformed input");
                    continue;
                }
            };
            debug!(line = line_no, ?input, "Input received");
            if tx.send(input.into()).await.is_err() {
                debug!("Engine stopped, input reader exiting");
                return Ok(());
            }
        }
        info!(lines = line_no, "Input stream ended");
        Ok(())
    })
}
