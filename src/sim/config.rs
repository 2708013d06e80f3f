use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{ensure, Result};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

/// Dataflow mode of the systolic arrays: which operand stays resident in the
/// array across tiles.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dataflow {
    #[default]
    Ws,
    Os,
}

impl FromStr for Dataflow {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ws" => Ok(Self::Ws),
            "os" => Ok(Self::Os),
            _ => Err(format!(
                "unsupported dataflow '{}', expected one of: ws, os",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub log_level: u64,
    pub timeout: u64,
    pub trace: bool,
    pub trace_path: PathBuf,
    pub summary_path: PathBuf,
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_level: 0,
            timeout: 10000000,
            trace: false,
            trace_path: PathBuf::from("trace.jsonl"),
            summary_path: PathBuf::from("summary.json"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ArchConfig {
    pub num_cores: usize,
    pub systolic_per_core: usize,
    pub vector_per_core: usize,
    /// Side length of the systolic array; one tile is one pass through it.
    pub array_size: u32,
    pub vector_lanes: u32,
    pub dataflow: Dataflow,
    pub frequency_mhz: u64,
    pub compute_latency: u64,
    pub batch_size: u32,
    pub elem_width: u32,
    /// Per-core scratch budget in bytes; drives systolic job splitting.
    pub buffer_budget: u64,
    /// Width of one memory transaction issued by a unit.
    pub txn_bytes: u32,
    /// Transactions a unit may issue per direction per cycle.
    pub issue_per_cycle: u32,
}

impl Config for ArchConfig {}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            num_cores: 1,
            systolic_per_core: 1,
            vector_per_core: 1,
            array_size: 64,
            vector_lanes: 64,
            dataflow: Dataflow::Ws,
            frequency_mhz: 500,
            compute_latency: 1,
            batch_size: 1,
            elem_width: 2,
            buffer_budget: 1 << 20, // 1 MiB
            txn_bytes: 64,
            issue_per_cycle: 2,
        }
    }
}

impl ArchConfig {
    /// Configuration errors are detected before simulation start and are
    /// fatal, reported once.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_cores >= 1, "arch.num_cores must be >= 1");
        ensure!(
            self.systolic_per_core >= 1 || self.vector_per_core >= 1,
            "arch: at least one unit per core is required"
        );
        ensure!(self.array_size >= 1, "arch.array_size must be >= 1");
        ensure!(self.vector_lanes >= 1, "arch.vector_lanes must be >= 1");
        ensure!(self.frequency_mhz >= 1, "arch.frequency_mhz must be >= 1");
        ensure!(self.batch_size >= 1, "arch.batch_size must be >= 1");
        ensure!(self.elem_width >= 1, "arch.elem_width must be >= 1");
        ensure!(self.buffer_budget >= 1, "arch.buffer_budget must be >= 1");
        ensure!(self.txn_bytes >= 1, "arch.txn_bytes must be >= 1");
        ensure!(
            self.issue_per_cycle >= 1,
            "arch.issue_per_cycle must be >= 1"
        );
        Ok(())
    }
}
