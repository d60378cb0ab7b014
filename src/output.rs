use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ExplainResult, ProgressEvent, ProgressSink, RunSummary};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(result: &RunSummary) -> io::Result<()> {
        Self::print_json(&mut io::stderr(), result)
    }

    pub fn print_explain(result: &ExplainResult) -> io::Result<()> {
        Self::print_json(&mut io::stdout(), result)
    }

    fn print_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        out.write_all(json.as_bytes())?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards progress events to `tracing`.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}
