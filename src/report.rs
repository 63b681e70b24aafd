//! The line-oriented sinks that measurement output goes to. The core
//! never formats anything fancier than one delimiter-separated row
//! per line; everything beyond appending lines (rotation, upload,
//! spreadsheets) is the host's business.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};

use crate::info;

pub trait Reporter: Send {
    /// One measurement row (or the header row). Must be durable
    /// enough to survive the process dying mid-sweep, hence
    /// implementations flush per line.
    fn log_measurement(&mut self, line: &str) -> Result<()>;

    /// Free-form progress lines for a human following along.
    fn log_verbose(&mut self, line: &str) -> Result<()>;
}

/// Appends measurement rows to a file, one per line; verbose lines
/// are forwarded to the process log (`info!`).
#[derive(Debug)]
pub struct FileReporter {
    path: PathBuf,
    file: File,
}

impl FileReporter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| anyhow!("opening measurement log {path:?} for appending"))?;
        Ok(Self {
            path: path.to_owned(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Reporter for FileReporter {
    fn log_measurement(&mut self, line: &str) -> Result<()> {
        let path = &self.path;
        writeln!(self.file, "{line}")
            .with_context(|| anyhow!("writing measurement row to {path:?}"))?;
        self.file
            .flush()
            .with_context(|| anyhow!("flushing measurement log {path:?}"))
    }

    fn log_verbose(&mut self, line: &str) -> Result<()> {
        info!("{line}");
        Ok(())
    }
}

/// Collects lines in memory; made for tests, also useful for hosts
/// that want to post-process rows themselves. Clones share the same
/// buffers, so a handle kept by the caller still sees what the
/// `Measurement` wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
    measurement: Arc<Mutex<Vec<String>>>,
    verbose: Arc<Mutex<Vec<String>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measurement_lines(&self) -> Vec<String> {
        self.measurement.lock().unwrap().clone()
    }

    pub fn verbose_lines(&self) -> Vec<String> {
        self.verbose.lock().unwrap().clone()
    }
}

impl Reporter for MemoryReporter {
    fn log_measurement(&mut self, line: &str) -> Result<()> {
        self.measurement.lock().unwrap().push(line.into());
        Ok(())
    }

    fn log_verbose(&mut self, line: &str) -> Result<()> {
        self.verbose.lock().unwrap().push(line.into());
        Ok(())
    }
}
