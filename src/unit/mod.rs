/*
Per-unit cycle-stepped execution.

Every instantiated unit is stepped exactly once per simulated cycle,
regardless of others' progress; there is no yield/resume primitive. Within a
step, memory issuance happens before stage-completion evaluation: the unit
first drains up to its issue quota of declared read/write bytes into the
memory interface, then checks whether the current stage may complete. A
stage completes only once its minimum-latency counter hit zero AND every
transaction it declared has been acknowledged complete, not merely issued.
*/

pub mod systolic;
pub mod vector;

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use serde::Serialize;

use crate::graph::{Job, JobId, JobPayload, UnitKind};
use crate::mem::{
    Cycle, MemCompletion, MemInterface, MemRequest, UnitHandle, PRIO_DEMAND_READ, PRIO_WRITEBACK,
};
use crate::sim::config::ArchConfig;
use crate::unit::systolic::SystolicState;
use crate::unit::vector::VectorState;

/// Per-cycle activity flag, threaded back to the scheduler for utilization
/// accounting. A unit blocked solely on pending acknowledgement is
/// memory-stalled, distinct from idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Active,
    Idle,
    MemStall,
}

/// What the state machine asks of the framework when entering a stage:
/// occupancy cycles plus the traffic whose acknowledgement gates completion.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StagePlan {
    pub latency: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Row advance rewinds the job's transaction address to its base.
    pub restore_addr: bool,
    pub done: bool,
}

impl StagePlan {
    pub(crate) fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum EngineState {
    Systolic(SystolicState),
    Vector(VectorState),
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct UnitStats {
    pub jobs_completed: u64,
    pub read_txns: u64,
    pub write_txns: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// One physical compute resource, modeled as a cycle-stepped state machine.
/// Holds at most one job and cannot progress stages while job-less.
pub struct Unit {
    handle: UnitHandle,
    core: usize,
    kind: UnitKind,
    job: Option<JobId>,
    latency_left: u64,
    unissued_read: u64,
    unissued_write: u64,
    unacked: u32,
    state: Option<EngineState>,
    stats: UnitStats,
    config: Arc<ArchConfig>,
}

impl Unit {
    pub fn new(handle: UnitHandle, core: usize, kind: UnitKind, config: Arc<ArchConfig>) -> Self {
        Self {
            handle,
            core,
            kind,
            job: None,
            latency_left: 0,
            unissued_read: 0,
            unissued_write: 0,
            unacked: 0,
            state: None,
            stats: UnitStats::default(),
            config,
        }
    }

    pub fn handle(&self) -> UnitHandle {
        self.handle
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn is_idle(&self) -> bool {
        self.job.is_none()
    }

    pub fn bound_job(&self) -> Option<JobId> {
        self.job
    }

    pub fn stats(&self) -> &UnitStats {
        &self.stats
    }

    pub fn stage_name(&self) -> &'static str {
        match &self.state {
            Some(EngineState::Systolic(s)) => s.stage_name(),
            Some(EngineState::Vector(v)) => v.stage_name(),
            None => "-",
        }
    }

    /// Binds a ready job. The job keeps this unit until completion; no
    /// preemption or reassignment exists.
    pub fn bind(&mut self, now: Cycle, job: &mut Job) {
        assert!(self.job.is_none(), "unit {} already bound", self.handle);
        assert_eq!(job.unit_kind(), self.kind, "job/unit kind mismatch");
        debug!(
            "cycle {}: unit {} (core {}) bound job {}",
            now, self.handle, self.core, job.id
        );

        let (state, plan) = match &job.payload {
            JobPayload::Matrix(dims) => {
                let (state, plan) = SystolicState::new(*dims, &self.config);
                (EngineState::Systolic(state), plan)
            }
            JobPayload::Vector(op) => {
                let (state, plan) = VectorState::new(op, &self.config);
                (EngineState::Vector(state), plan)
            }
        };
        self.job = Some(job.id);
        self.state = Some(state);
        self.apply_plan(plan, job);
    }

    /// One simulated cycle. Returns the activity outcome and, when the bound
    /// job's final write stage completed this cycle, its id so the scheduler
    /// can release dependents.
    pub fn step(
        &mut self,
        now: Cycle,
        job: Option<&mut Job>,
        mem: &mut MemInterface,
    ) -> Result<(StepOutcome, Option<JobId>)> {
        let Some(job_id) = self.job else {
            return Ok((StepOutcome::Idle, None));
        };
        let job = job.expect("bound unit stepped without its job");
        debug_assert_eq!(job.id, job_id);

        // issuance precedes stage-completion evaluation
        self.issue(now, job, mem)?;

        if self.latency_left > 0 {
            self.latency_left -= 1;
            return Ok((StepOutcome::Active, None));
        }
        if self.unissued_read > 0 || self.unissued_write > 0 || self.unacked > 0 {
            return Ok((StepOutcome::MemStall, None));
        }

        // stage complete: advance the state machine
        let plan = match self.state.as_mut().expect("bound unit has stage state") {
            EngineState::Systolic(s) => s.advance(&self.config),
            EngineState::Vector(v) => v.advance(&self.config),
        };
        if plan.done {
            debug!("cycle {}: unit {} finished job {}", now, self.handle, job_id);
            self.job = None;
            self.state = None;
            self.stats.jobs_completed += 1;
            return Ok((StepOutcome::Active, Some(job_id)));
        }
        self.apply_plan(plan, job);
        Ok((StepOutcome::Active, None))
    }

    /// Routes one memory acknowledgement back into the stage gate.
    pub fn ack(&mut self, completion: MemCompletion) {
        assert!(
            self.unacked > 0,
            "unit {} acked with no transaction outstanding",
            self.handle
        );
        debug_assert_eq!(completion.origin, self.handle);
        self.unacked -= 1;
    }

    fn apply_plan(&mut self, plan: StagePlan, job: &mut Job) {
        debug_assert!(!plan.done);
        if plan.restore_addr {
            job.restore_addr();
        }
        self.latency_left = plan.latency;
        self.unissued_read += plan.read_bytes;
        self.unissued_write += plan.write_bytes;
    }

    /// Issues up to the per-direction quota of outstanding transactions,
    /// advancing the job's address by the transaction width each time.
    fn issue(&mut self, _now: Cycle, job: &mut Job, mem: &mut MemInterface) -> Result<()> {
        for _ in 0..self.config.issue_per_cycle {
            if self.unissued_read == 0 {
                break;
            }
            let width = (self.config.txn_bytes as u64).min(self.unissued_read) as u32;
            mem.enqueue(MemRequest {
                addr: job.addr,
                size_bytes: width,
                is_write: false,
                priority: PRIO_DEMAND_READ,
                origin: self.handle,
            })?;
            job.addr += width as u64;
            self.unissued_read -= width as u64;
            self.unacked += 1;
            self.stats.read_txns += 1;
            self.stats.bytes_read += width as u64;
        }
        for _ in 0..self.config.issue_per_cycle {
            if self.unissued_write == 0 {
                break;
            }
            let width = (self.config.txn_bytes as u64).min(self.unissued_write) as u32;
            mem.enqueue(MemRequest {
                addr: job.addr,
                size_bytes: width,
                is_write: true,
                priority: PRIO_WRITEBACK,
                origin: self.handle,
            })?;
            job.addr += width as u64;
            self.unissued_write -= width as u64;
            self.unacked += 1;
            self.stats.write_txns += 1;
            self.stats.bytes_written += width as u64;
        }
        Ok(())
    }
}
