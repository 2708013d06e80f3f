//! Phase-queue driven vector unit.
//!
//! A vector job carries an ordered queue of REDUCE and BROADCAST phases;
//! multi-phase jobs (e.g. normalization) chain several. The unit consumes
//! one phase at a time under the same issue-then-complete discipline as the
//! systolic arrays, and the job completes only after the last phase.

use smallvec::SmallVec;

use crate::graph::{VectorOp, VectorPhase};
use crate::sim::config::ArchConfig;
use crate::unit::StagePlan;

#[derive(Debug)]
pub(crate) struct VectorState {
    linear: u32,
    parallel: u32,
    phases: SmallVec<[VectorPhase; 4]>,
    current: usize,
}

impl VectorState {
    pub(crate) fn new(op: &VectorOp, config: &ArchConfig) -> (Self, StagePlan) {
        assert!(!op.phases.is_empty(), "vector job with empty phase queue");
        let state = Self {
            linear: op.linear,
            parallel: op.parallel,
            phases: op.phases.clone(),
            current: 0,
        };
        let plan = state.phase_plan(state.phases[0], config);
        (state, plan)
    }

    pub(crate) fn advance(&mut self, config: &ArchConfig) -> StagePlan {
        self.current += 1;
        match self.phases.get(self.current) {
            Some(&phase) => self.phase_plan(phase, config),
            None => StagePlan::done(),
        }
    }

    pub(crate) fn stage_name(&self) -> &'static str {
        match self.phases.get(self.current) {
            Some(phase) => phase.name(),
            None => "-",
        }
    }

    fn phase_plan(&self, phase: VectorPhase, config: &ArchConfig) -> StagePlan {
        let elems = self.linear as u64 * self.parallel as u64;
        let latency = elems.div_ceil(config.vector_lanes as u64);
        let full = elems * config.elem_width as u64;
        let slice = self.parallel as u64 * config.elem_width as u64;
        match phase {
            // dimension reduction: read everything, write one row of results
            VectorPhase::Reduce => StagePlan {
                latency,
                read_bytes: full,
                write_bytes: slice,
                ..StagePlan::default()
            },
            // elementwise application: read the operand row, write everything
            VectorPhase::Broadcast => StagePlan {
                latency,
                read_bytes: slice,
                write_bytes: full,
                ..StagePlan::default()
            },
        }
    }
}
