//! Optional per-cycle trace for external waveform rendering. One JSONL
//! record per unit per cycle; rendering itself is out of scope.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::mem::Cycle;

#[derive(Debug, Serialize)]
pub struct TraceRecord<'a> {
    pub cycle: Cycle,
    pub unit: usize,
    pub core: usize,
    pub kind: &'a str,
    pub stage: &'a str,
    pub idle: bool,
    pub stall: bool,
}

pub struct TraceLog {
    writer: BufWriter<File>,
}

impl TraceLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create trace file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Best effort: a failed trace write never aborts the simulation.
    pub fn write(&mut self, record: &TraceRecord) {
        if let Ok(payload) = serde_json::to_string(record) {
            let _ = writeln!(self.writer, "{payload}");
        }
    }

    pub fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}
