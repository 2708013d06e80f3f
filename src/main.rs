use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use toml::Table;

use betatron::frontend::{build_phases, WorkloadConfig};
use betatron::mem::MemConfig;
use betatron::sim::config::{ArchConfig, Config, Dataflow, SimConfig};
use betatron::sim::stats::write_summary;
use betatron::sim::top::{BetatronTop, BetatronTopConfig};

#[derive(Parser)]
#[command(version, about)]
struct BetatronArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override number of cores")]
    num_cores: Option<usize>,
    #[arg(long, help = "Override systolic array side length")]
    array_size: Option<u32>,
    #[arg(long, help = "Override dataflow (ws, os)")]
    dataflow: Option<Dataflow>,
    #[arg(long, help = "Enable log at level (0:none, 1:info, 2:debug)")]
    log: Option<u64>,
    #[arg(long, help = "Generate per-cycle trace")]
    trace: Option<bool>,
    #[arg(long, help = "Override summary output path")]
    summary_path: Option<PathBuf>,
}

pub fn main() -> Result<()> {
    env_logger::init();

    let argv = BetatronArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;

    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let mut arch_config = ArchConfig::from_section(config_table.get("arch"));
    let mem_config = MemConfig::from_section(config_table.get("mem"));

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    sim_config.trace = argv.trace.unwrap_or(sim_config.trace);
    if let Some(path) = argv.summary_path {
        sim_config.summary_path = path;
    }
    arch_config.num_cores = argv.num_cores.unwrap_or(arch_config.num_cores);
    arch_config.array_size = argv.array_size.unwrap_or(arch_config.array_size);
    arch_config.dataflow = argv.dataflow.unwrap_or(arch_config.dataflow);

    let workload = WorkloadConfig::from_table(&config_table)?;
    let phases = build_phases(&workload, &arch_config)?;

    let summary_path = sim_config.summary_path.clone();
    let mut top = BetatronTop::new(BetatronTopConfig {
        sim: sim_config,
        arch: arch_config,
        mem: mem_config,
        phases,
    })?;
    let summary = top.simulate()?;

    for phase in &summary.per_phase {
        println!(
            "phase {}: {} cycles, {} jobs, systolic {:.1}% / vector {:.1}% utilized",
            phase.phase, phase.cycles, phase.jobs_finished, phase.systolic_util_pct,
            phase.vector_util_pct
        );
    }
    let micros = summary.total.cycles as f64 / arch_config.frequency_mhz as f64;
    println!(
        "total: {} cycles ({:.1} us at {} MHz), {} jobs, {} memory commands",
        summary.total.cycles,
        micros,
        arch_config.frequency_mhz,
        summary.total.jobs_finished,
        summary.total.mem_commands
    );
    write_summary(&summary_path, &summary)?;
    Ok(())
}
