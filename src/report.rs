//! Metric Reporters
//!
//! The training loop hands named scalar metrics to an optional
//! [`MetricsReporter`] every `report_every` global steps. Reporting is fire
//! and forget from the loop's side: an `Err` is logged and training goes on.
//!
//! ## CSV Format
//!
//! [`CsvReporter`] writes one row per metric:
//!
//! ```text
//! step,elapsed_seconds,metric,value
//! 50,12.34,train/grad_norm,0.812345
//! 50,12.34,train/loss,5.123400
//! ```
//!
//! Rows are flushed after every call so a crashed run keeps its history.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::error::{LumiereError, Result};

/// Named scalar metrics for one step, in name order
pub type Metrics = BTreeMap<&'static str, f32>;

/// Sink for periodic training metrics
pub trait MetricsReporter {
    fn report(&mut self, step: usize, metrics: &Metrics) -> Result<()>;
}

/// Appends metrics to a CSV file
pub struct CsvReporter {
    writer: BufWriter<File>,
    start_time: Instant,
}

impl CsvReporter {
    /// Create (truncate) the file and write the header
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "step,elapsed_seconds,metric,value")?;
        writer.flush()?;
        Ok(Self {
            writer,
            start_time: Instant::now(),
        })
    }
}

impl MetricsReporter for CsvReporter {
    fn report(&mut self, step: usize, metrics: &Metrics) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        for (name, value) in metrics {
            writeln!(self.writer, "{},{:.2},{},{:.6}", step, elapsed, name, value)
                .map_err(|e| LumiereError::Report(format!("writing {}: {}", name, e)))?;
        }
        self.writer
            .flush()
            .map_err(|e| LumiereError::Report(e.to_string()))
    }
}

/// Logs each report at `info` level
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl MetricsReporter for LogReporter {
    fn report(&mut self, step: usize, metrics: &Metrics) -> Result<()> {
        let line = metrics
            .iter()
            .map(|(name, value)| format!("{}={:.4}", name, value))
            .collect::<Vec<_>>()
            .join(" | ");
        log::info!("Step {:6} | {}", step, line);
        Ok(())
    }
}
