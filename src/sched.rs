/*
Core scheduler and main simulation loop.

The whole system advances in lock-step simulated cycles. Each cycle:
  (a) every instantiated unit is stepped once, tallying per-kind
      active/stall/idle counts; jobs whose final write stage completed
      release their dependents into the owning core's ready queue;
  (b) every idle unit scans ready queues of its kind, starting at its own
      core and rotating across cores, and binds the first ready job;
  (c) the memory interface admits up to its quota and this cycle's
      completions are applied to the issuing units.
The rotation and unit-index tie-break make runs reproducible bit for bit.
*/

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use log::{debug, info};

use crate::graph::{JobGraph, JobId, UnitKind};
use crate::mem::{Cycle, MemConfig, MemInterface, TimedMemory, TimingEngine};
use crate::sim::config::ArchConfig;
use crate::sim::stats::{KindTally, PhaseStats};
use crate::sim::trace::{TraceLog, TraceRecord};
use crate::unit::{StepOutcome, Unit};

struct Core {
    id: usize,
    ready: [VecDeque<JobId>; UnitKind::COUNT],
    /// Strictly increasing; ordering/debug only, never a scheduling input.
    task_counter: u64,
}

impl Core {
    fn new(id: usize) -> Self {
        Self {
            id,
            ready: Default::default(),
            task_counter: 0,
        }
    }

    fn push_ready(&mut self, kind: UnitKind, job: JobId) {
        self.task_counter += 1;
        debug!(
            "core {}: task {} ready, job {} ({})",
            self.id,
            self.task_counter,
            job,
            kind.name()
        );
        self.ready[kind.index()].push_back(job);
    }

    fn pop_ready(&mut self, kind: UnitKind) -> Option<JobId> {
        self.ready[kind.index()].pop_front()
    }

    fn ready_len(&self, kind: UnitKind) -> usize {
        self.ready[kind.index()].len()
    }
}

/// In-flight state of one phase; owns the phase's job graph.
pub struct PhaseRun {
    pub graph: JobGraph,
    phase: usize,
    submitted: u64,
    finished: u64,
    commands_at_start: u64,
    cycles: Cycle,
    systolic: KindTally,
    vector: KindTally,
}

impl PhaseRun {
    pub fn finished(&self) -> u64 {
        self.finished
    }

    pub fn cycles(&self) -> Cycle {
        self.cycles
    }

    pub fn done(&self) -> bool {
        self.graph.all_done()
    }
}

pub struct Scheduler {
    cores: Vec<Core>,
    units: Vec<Unit>,
    mem: MemInterface,
    /// Global cycle, monotonic across phases.
    cycle: Cycle,
}

impl Scheduler {
    pub fn new(arch: Arc<ArchConfig>, mem_config: &MemConfig) -> Result<Self> {
        mem_config.validate()?;
        let engine = Box::new(TimedMemory::new(*mem_config));
        Self::with_engine(arch, engine, mem_config.admit_per_cycle)
    }

    /// Seam for isolated testing with a synthetic timing engine.
    pub fn with_engine(
        arch: Arc<ArchConfig>,
        engine: Box<dyn TimingEngine>,
        admit_per_cycle: usize,
    ) -> Result<Self> {
        arch.validate()?;
        let cores = (0..arch.num_cores).map(Core::new).collect();
        let mut units = Vec::new();
        for core in 0..arch.num_cores {
            for _ in 0..arch.systolic_per_core {
                units.push(Unit::new(units.len(), core, UnitKind::Systolic, arch.clone()));
            }
            for _ in 0..arch.vector_per_core {
                units.push(Unit::new(units.len(), core, UnitKind::Vector, arch.clone()));
            }
        }
        info!(
            "scheduler instantiated: {} cores, {} units",
            arch.num_cores,
            units.len()
        );
        Ok(Self {
            cores,
            units,
            mem: MemInterface::new(engine, admit_per_cycle),
            cycle: 0,
        })
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn ready_len(&self, core: usize, kind: UnitKind) -> usize {
        self.cores[core].ready_len(kind)
    }

    fn home_core(&self, graph: &JobGraph, id: JobId) -> Result<usize> {
        let job = graph.job(id);
        match job.core {
            Some(core) => {
                ensure!(
                    core < self.cores.len(),
                    "job {} affinity {} out of range (cores: {})",
                    id,
                    core,
                    self.cores.len()
                );
                Ok(core)
            }
            None => Ok(id % self.cores.len()),
        }
    }

    fn enqueue_ready(&mut self, graph: &JobGraph, id: JobId) -> Result<()> {
        let core = self.home_core(graph, id)?;
        let kind = graph.job(id).unit_kind();
        self.cores[core].push_ready(kind, id);
        Ok(())
    }

    /// Pops the first ready job of `kind`, scanning from `home` and rotating
    /// across cores so pooled unit types are shared fairly.
    fn take_ready(&mut self, kind: UnitKind, home: usize) -> Option<JobId> {
        let num_cores = self.cores.len();
        for offset in 0..num_cores {
            let core = (home + offset) % num_cores;
            if let Some(job) = self.cores[core].pop_ready(kind) {
                return Some(job);
            }
        }
        None
    }

    /// Seeds ready queues with the phase's zero-dependency jobs.
    pub fn begin_phase(&mut self, phase: usize, graph: JobGraph) -> Result<PhaseRun> {
        debug_assert!(self.units.iter().all(Unit::is_idle));
        let submitted = graph.len() as u64;
        info!("phase {}: {} jobs submitted", phase, submitted);

        for id in graph.roots() {
            self.enqueue_ready(&graph, id)?;
        }
        Ok(PhaseRun {
            graph,
            phase,
            submitted,
            finished: 0,
            commands_at_start: self.mem.commands(),
            cycles: 0,
            systolic: KindTally::default(),
            vector: KindTally::default(),
        })
    }

    /// Advances the phase by one cycle. Fails on a detected full-cycle stall
    /// with unfinished jobs, which indicates a malformed graph.
    pub fn tick_phase(
        &mut self,
        run: &mut PhaseRun,
        mut trace: Option<&mut TraceLog>,
    ) -> Result<()> {
        let now = self.cycle;
        let mut progress = false;
        let mut completed: Vec<JobId> = Vec::new();

        // (a) step every unit; issuance precedes completion inside each step
        for idx in 0..self.units.len() {
            let unit = &mut self.units[idx];
            let job = unit.bound_job().map(|id| run.graph.job_mut(id));
            let (outcome, finished) = unit.step(now, job, &mut self.mem)?;
            match unit.kind() {
                UnitKind::Systolic => run.systolic.record(outcome),
                UnitKind::Vector => run.vector.record(outcome),
            }
            if outcome != StepOutcome::Idle {
                progress = true;
            }
            if let Some(log) = trace.as_mut() {
                log.write(&TraceRecord {
                    cycle: now,
                    unit: idx,
                    core: unit.core(),
                    kind: unit.kind().name(),
                    stage: unit.stage_name(),
                    idle: outcome == StepOutcome::Idle,
                    stall: outcome == StepOutcome::MemStall,
                });
            }
            if let Some(job_id) = finished {
                completed.push(job_id);
            }
        }

        // dependents release at write-stage completion, into the owning
        // core's queue immediately
        for job_id in completed {
            run.finished += 1;
            progress = true;
            for child in run.graph.complete(job_id) {
                self.enqueue_ready(&run.graph, child)?;
            }
        }

        // (b) assign ready work to idle units
        for idx in 0..self.units.len() {
            if !self.units[idx].is_idle() {
                continue;
            }
            let kind = self.units[idx].kind();
            let home = self.units[idx].core();
            if let Some(job_id) = self.take_ready(kind, home) {
                self.units[idx].bind(now, run.graph.job_mut(job_id));
                progress = true;
            }
        }

        // (c) memory admission and completion routing
        let mut completions = Vec::new();
        let admitted = self.mem.tick(now, &mut completions);
        if admitted > 0 || !completions.is_empty() {
            progress = true;
        }
        for completion in completions {
            self.units[completion.origin].ack(completion);
        }

        self.cycle += 1;
        run.cycles += 1;

        // in-flight memory is pending state, not a stall
        if !progress && self.mem.in_flight() == 0 && !run.graph.all_done() {
            let mut stuck = String::new();
            for job in run.graph.unfinished().take(8) {
                let _ = write!(stuck, " job {} (deps_left={})", job.id, job.deps_left);
            }
            bail!(
                "deadlock at cycle {}: no state change with {} unfinished jobs:{}",
                now,
                run.graph.unfinished().count(),
                stuck
            );
        }
        Ok(())
    }

    pub fn run_phase(
        &mut self,
        phase: usize,
        graph: JobGraph,
        timeout: u64,
        mut trace: Option<&mut TraceLog>,
    ) -> Result<PhaseStats> {
        let mut run = self.begin_phase(phase, graph)?;
        while !run.done() {
            ensure!(
                run.cycles < timeout,
                "phase {} exceeded timeout of {} cycles",
                phase,
                timeout
            );
            self.tick_phase(&mut run, trace.as_mut().map(|log| &mut **log))?;
        }
        Ok(self.finish_phase(run))
    }

    /// Records phase statistics and resets per-phase counters.
    pub fn finish_phase(&mut self, run: PhaseRun) -> PhaseStats {
        debug_assert_eq!(run.finished, run.submitted, "job conservation violated");
        let stats = PhaseStats {
            phase: run.phase,
            cycles: run.cycles,
            jobs_submitted: run.submitted,
            jobs_finished: run.finished,
            mem_commands: self.mem.commands() - run.commands_at_start,
            systolic_util_pct: run.systolic.utilization_pct(),
            vector_util_pct: run.vector.utilization_pct(),
            systolic: run.systolic,
            vector: run.vector,
        };
        info!(
            "phase {}: {} cycles, {}/{} jobs, {} mem commands, systolic {:.1}%, vector {:.1}%",
            stats.phase,
            stats.cycles,
            stats.jobs_finished,
            stats.jobs_submitted,
            stats.mem_commands,
            stats.systolic_util_pct,
            stats.vector_util_pct
        );
        stats
    }
}
