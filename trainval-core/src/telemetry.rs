//! Scalar telemetry sinks.
//!
//! A sink receives `(key, value, step)` samples keyed by the global
//! iteration. Sinks are optional and their failures never stop training:
//! the controller logs the error and moves on.
//!
//! `CsvScalarSink` output (`log/scalars.csv`):
//!
//! ```text
//! step,key,value
//! 101,loss,1.386294
//! 101,lr,0.001000
//! ```

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::TelemetryError;

pub trait TelemetrySink {
    fn record(&mut self, key: &str, value: f64, step: u64) -> Result<(), TelemetryError>;

    fn flush(&mut self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&mut self, _key: &str, _value: f64, _step: u64) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// One recorded sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarRecord {
    pub key: String,
    pub value: f64,
    pub step: u64,
}

/// Keeps samples in memory, in arrival order. Clones share the same
/// buffer, so a caller can keep a handle while the controller owns the sink.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Rc<RefCell<Vec<ScalarRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records.borrow().clone()
    }

    /// Samples recorded under `key`, as `(step, value)`.
    pub fn series(&self, key: &str) -> Vec<(u64, f64)> {
        self.records
            .borrow()
            .iter()
            .filter(|r| r.key == key)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&mut self, key: &str, value: f64, step: u64) -> Result<(), TelemetryError> {
        self.records.borrow_mut().push(ScalarRecord {
            key: key.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

/// Appends samples to a CSV file. The header is written only when the file
/// is new, so a resumed run keeps appending to the same log.
pub struct CsvScalarSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvScalarSink {
    pub fn open(dir: &Path) -> Result<Self, TelemetryError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("scalars.csv");
        let is_new = !path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "step,key,value")?;
            tracing::debug!("Created telemetry CSV: '{}'", path.display());
        }
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for CsvScalarSink {
    fn record(&mut self, key: &str, value: f64, step: u64) -> Result<(), TelemetryError> {
        if key.contains([',', '\n']) {
            return Err(TelemetryError::Rejected {
                key: key.to_string(),
                reason: "key must not contain ',' or newlines".to_string(),
            });
        }
        writeln!(self.writer, "{step},{key},{value:.6}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TelemetryError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for CsvScalarSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
