use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::graph::JobGraph;
use crate::mem::MemConfig;
use crate::sched::Scheduler;
use crate::sim::config::{ArchConfig, SimConfig};
use crate::sim::stats::{aggregate, RunSummary, UnitReport};
use crate::sim::trace::TraceLog;

pub struct BetatronTopConfig {
    pub sim: SimConfig,
    pub arch: ArchConfig,
    pub mem: MemConfig,
    pub phases: Vec<JobGraph>,
}

/// Top-level simulation driver: runs the workload's phases back to back on
/// one scheduler instance, so the global cycle counter carries across phase
/// boundaries.
pub struct BetatronTop {
    sched: Scheduler,
    phases: Vec<JobGraph>,
    timeout: u64,
    trace: Option<TraceLog>,
}

impl BetatronTop {
    pub fn new(config: BetatronTopConfig) -> Result<Self> {
        let sched = Scheduler::new(Arc::new(config.arch), &config.mem)?;
        let trace = if config.sim.trace {
            Some(TraceLog::create(&config.sim.trace_path)?)
        } else {
            None
        };
        Ok(Self {
            sched,
            phases: config.phases,
            timeout: config.sim.timeout,
            trace,
        })
    }

    pub fn simulate(&mut self) -> Result<RunSummary> {
        let phases = std::mem::take(&mut self.phases);
        let mut per_phase = Vec::with_capacity(phases.len());
        for (idx, graph) in phases.into_iter().enumerate() {
            let stats =
                self.sched
                    .run_phase(idx, graph, self.timeout, self.trace.as_mut())?;
            per_phase.push(stats);
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.flush();
        }
        let per_unit = self
            .sched
            .units()
            .iter()
            .map(UnitReport::from_unit)
            .collect();
        let summary = aggregate(per_phase, per_unit);
        info!(
            "simulation finished: {} phases, {} cycles, {} jobs",
            summary.total.phases, summary.total.cycles, summary.total.jobs_finished
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{build_phases, WorkloadConfig};
    use toml::Table;

    #[test]
    fn two_phase_workload_runs_to_completion() {
        let table: Table = toml::from_str(
            r#"
            [[phase]]
            [[phase.matmul]]
            m = 64
            k = 64
            n = 128

            [[phase]]
            [[phase.vector]]
            linear = 64
            parallel = 128
            op = "relu"
            "#,
        )
        .unwrap();
        let arch = ArchConfig::default();
        let workload = WorkloadConfig::from_table(&table).unwrap();
        let phases = build_phases(&workload, &arch).unwrap();

        let mut top = BetatronTop::new(BetatronTopConfig {
            sim: SimConfig::default(),
            arch,
            mem: MemConfig::default(),
            phases,
        })
        .unwrap();
        let summary = top.simulate().unwrap();
        assert_eq!(summary.total.phases, 2);
        assert_eq!(summary.total.jobs_finished, 2);
        assert_eq!(
            summary.total.cycles,
            summary.per_phase.iter().map(|p| p.cycles).sum::<u64>()
        );

        // one report per instantiated unit, each carrying the traffic it moved
        assert_eq!(summary.per_unit.len(), 2);
        let systolic = summary.per_unit.iter().find(|u| u.kind == "systolic").unwrap();
        let vector = summary.per_unit.iter().find(|u| u.kind == "vector").unwrap();
        assert_eq!(systolic.stats.jobs_completed, 1);
        assert_eq!(vector.stats.jobs_completed, 1);
        assert!(systolic.stats.bytes_read > 0);
        assert!(vector.stats.bytes_written > 0);
    }

    #[test]
    fn empty_workload_produces_empty_summary() {
        let mut top = BetatronTop::new(BetatronTopConfig {
            sim: SimConfig::default(),
            arch: ArchConfig::default(),
            mem: MemConfig::default(),
            phases: Vec::new(),
        })
        .unwrap();
        let summary = top.simulate().unwrap();
        assert_eq!(summary.total.phases, 0);
        assert_eq!(summary.total.cycles, 0);
    }
}
