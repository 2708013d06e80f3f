use std::fs;
use std::ops::AddAssign;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::mem::Cycle;
use crate::unit::{StepOutcome, Unit, UnitStats};

/// Per-unit-kind cycle tally for one phase. One unit-cycle is one unit
/// stepped once; utilization is active unit-cycles over all unit-cycles of
/// that kind.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct KindTally {
    pub active: u64,
    pub mem_stall: u64,
    pub idle: u64,
}

impl KindTally {
    pub fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Active => self.active += 1,
            StepOutcome::MemStall => self.mem_stall += 1,
            StepOutcome::Idle => self.idle += 1,
        }
    }

    pub fn unit_cycles(&self) -> u64 {
        self.active + self.mem_stall + self.idle
    }

    pub fn utilization_pct(&self) -> f64 {
        let total = self.unit_cycles();
        if total == 0 {
            return 0.0;
        }
        100.0 * self.active as f64 / total as f64
    }
}

impl AddAssign<&KindTally> for KindTally {
    fn add_assign(&mut self, other: &KindTally) {
        self.active += other.active;
        self.mem_stall += other.mem_stall;
        self.idle += other.idle;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStats {
    pub phase: usize,
    pub cycles: Cycle,
    pub jobs_submitted: u64,
    pub jobs_finished: u64,
    pub mem_commands: u64,
    pub systolic: KindTally,
    pub vector: KindTally,
    pub systolic_util_pct: f64,
    pub vector_util_pct: f64,
}

#[derive(Debug, Default, Serialize)]
pub struct RunTotals {
    pub phases: usize,
    pub cycles: Cycle,
    pub jobs_submitted: u64,
    pub jobs_finished: u64,
    pub mem_commands: u64,
    pub systolic: KindTally,
    pub vector: KindTally,
}

impl AddAssign<&PhaseStats> for RunTotals {
    fn add_assign(&mut self, phase: &PhaseStats) {
        self.phases += 1;
        self.cycles += phase.cycles;
        self.jobs_submitted += phase.jobs_submitted;
        self.jobs_finished += phase.jobs_finished;
        self.mem_commands += phase.mem_commands;
        self.systolic += &phase.systolic;
        self.vector += &phase.vector;
    }
}

/// Lifetime transaction counters of one unit, reported once per run.
#[derive(Debug, Serialize)]
pub struct UnitReport {
    pub unit: usize,
    pub core: usize,
    pub kind: &'static str,
    #[serde(flatten)]
    pub stats: UnitStats,
}

impl UnitReport {
    pub fn from_unit(unit: &Unit) -> Self {
        Self {
            unit: unit.handle(),
            core: unit.core(),
            kind: unit.kind().name(),
            stats: *unit.stats(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub per_phase: Vec<PhaseStats>,
    pub per_unit: Vec<UnitReport>,
    pub total: RunTotals,
}

pub fn aggregate(per_phase: Vec<PhaseStats>, per_unit: Vec<UnitReport>) -> RunSummary {
    let mut total = RunTotals::default();
    for phase in &per_phase {
        total += phase;
    }
    RunSummary {
        per_phase,
        per_unit,
        total,
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let payload = serde_json::to_string_pretty(summary).context("serialize run summary")?;
    fs::write(path, payload).with_context(|| format!("write summary to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_records_each_outcome() {
        let mut tally = KindTally::default();
        tally.record(StepOutcome::Active);
        tally.record(StepOutcome::Active);
        tally.record(StepOutcome::MemStall);
        tally.record(StepOutcome::Idle);
        assert_eq!(tally.active, 2);
        assert_eq!(tally.mem_stall, 1);
        assert_eq!(tally.idle, 1);
        assert_eq!(tally.unit_cycles(), 4);
        assert!((tally.utilization_pct() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn empty_tally_has_zero_utilization() {
        assert_eq!(KindTally::default().utilization_pct(), 0.0);
    }

    #[test]
    fn totals_accumulate_across_phases() {
        let phase = PhaseStats {
            phase: 0,
            cycles: 100,
            jobs_submitted: 3,
            jobs_finished: 3,
            mem_commands: 12,
            systolic: KindTally {
                active: 80,
                mem_stall: 15,
                idle: 5,
            },
            vector: KindTally::default(),
            systolic_util_pct: 80.0,
            vector_util_pct: 0.0,
        };
        let summary = aggregate(vec![phase.clone(), phase], Vec::new());
        assert_eq!(summary.total.phases, 2);
        assert_eq!(summary.total.cycles, 200);
        assert_eq!(summary.total.jobs_finished, 6);
        assert_eq!(summary.total.systolic.active, 160);
    }
}
