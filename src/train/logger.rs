//! Console progress and the JSON-lines event log.

use crate::error::TrainError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

pub const EVENTS_FILE: &str = "events.jsonl";

fn format_values<'a>(values: impl IntoIterator<Item = (&'a str, f32)>) -> String {
    values
        .into_iter()
        .map(|(name, value)| format!("{name}: {value:.5}"))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Step and epoch summaries through `tracing`.
#[derive(Debug, Default)]
pub struct ConsoleLogger {
    previous_eval: BTreeMap<String, f32>,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn train_start(&self, epoch: usize, epochs: usize) {
        tracing::info!("> EPOCH {epoch}/{epochs} TRAINING");
    }

    #[allow(clippy::too_many_arguments)]
    pub fn train_step(
        &self,
        step_in_epoch: usize,
        batches: usize,
        global_step: usize,
        values: &[(&'static str, f32)],
        lr: f64,
        grad_norm: f32,
        step_time: Duration,
        loader_time: Duration,
    ) {
        tracing::info!(
            "   | > step {step_in_epoch}/{batches} global {global_step} | {} | grad_norm: {grad_norm:.4} | lr: {lr:.7} | step_time: {:.2}s | loader_time: {:.3}s",
            format_values(values.iter().map(|(name, value)| (*name, *value))),
            step_time.as_secs_f32(),
            loader_time.as_secs_f32(),
        );
    }

    pub fn train_epoch_end(&self, global_step: usize, epoch: usize, epoch_time: Duration, averages: &BTreeMap<String, f32>) {
        tracing::info!(
            "   | > EPOCH END {epoch} global {global_step} | {} | epoch_time: {:.1}s",
            format_values(averages.iter().map(|(name, value)| (name.as_str(), *value))),
            epoch_time.as_secs_f32(),
        );
    }

    pub fn eval_start(&self) {
        tracing::info!("> EVALUATION");
    }

    pub fn eval_step(&self, step: usize, values: &[(&'static str, f32)]) {
        tracing::debug!(
            "   | > eval step {step} | {}",
            format_values(values.iter().map(|(name, value)| (*name, *value)))
        );
    }

    /// Log eval averages with the change since the previous epoch.
    pub fn eval_end(&mut self, averages: &BTreeMap<String, f32>) {
        let line = averages
            .iter()
            .map(|(name, value)| match self.previous_eval.get(name) {
                Some(previous) => format!("{name}: {value:.5} ({:+.5})", value - previous),
                None => format!("{name}: {value:.5}"),
            })
            .collect::<Vec<_>>()
            .join(" | ");
        tracing::info!("   | > EVAL | {line}");
        self.previous_eval = averages.clone();
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub kind: &'static str,
    pub step: usize,
    pub epoch: usize,
    pub scalars: BTreeMap<String, f32>,
    pub date: String,
}

impl EventRecord {
    pub fn new(kind: &'static str, step: usize, epoch: usize) -> Self {
        Self {
            kind,
            step,
            epoch,
            scalars: BTreeMap::new(),
            date: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: f32) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    pub fn with_all<'a>(mut self, prefix: &str, values: impl IntoIterator<Item = (&'a str, f32)>) -> Self {
        for (name, value) in values {
            self.scalars.insert(format!("{prefix}{name}"), value);
        }
        self
    }
}

/// Appends event records; a disabled writer (non-zero ranks) drops them.
#[derive(Debug)]
pub struct EventWriter {
    file: Option<BufWriter<File>>,
}

impl EventWriter {
    pub fn create(dir: &Path) -> Result<Self, TrainError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
        })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn write(&mut self, record: &EventRecord) -> Result<(), TrainError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let line = serde_json::to_string(record)
            .map_err(|err| TrainError::Io(std::io::Error::other(err)))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}
