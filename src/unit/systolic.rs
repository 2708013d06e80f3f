//! Systolic-array state machines for both dataflow modes.
//!
//! Weight Stationary: prefetch -> read -> shift -> write, column-major within
//! a row (all column tiles before the row advances) to maximize weight reuse.
//! Output Stationary: read -> shift -> write, row-major with a full K-tile
//! iteration per (row, col) target before committing, since partial sums
//! stay resident in the array.

use crate::graph::MatrixDims;
use crate::sim::config::{ArchConfig, Dataflow};
use crate::unit::StagePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystolicStage {
    Prefetch,
    Read,
    Shift,
    Write,
}

#[derive(Debug)]
pub(crate) struct SystolicState {
    dataflow: Dataflow,
    stage: SystolicStage,
    dims: MatrixDims,
    /// 1-based tile coordinates. WS folds the K iteration into `col`; OS
    /// tracks it separately in `k`.
    row: u32,
    col: u32,
    k: u32,
    rows: u32,
    cols: u32,
    ks: u32,
    pub(crate) read_stage_entries: u64,
    pub(crate) write_commits: u64,
}

impl SystolicState {
    pub(crate) fn new(dims: MatrixDims, config: &ArchConfig) -> (Self, StagePlan) {
        let t = config.array_size;
        let mut state = Self {
            dataflow: config.dataflow,
            stage: SystolicStage::Prefetch,
            dims,
            row: 1,
            col: 1,
            k: 1,
            rows: dims.m.div_ceil(t),
            cols: dims.n.div_ceil(t),
            ks: dims.k.div_ceil(t),
            read_stage_entries: 0,
            write_commits: 0,
        };
        let plan = match config.dataflow {
            Dataflow::Ws => {
                // weight tile loads without traffic: it is assumed resident
                // in the weight buffer by phase construction
                let row_tile = t.min(dims.m) as u64;
                StagePlan {
                    latency: row_tile * ws_beat(config),
                    ..StagePlan::default()
                }
            }
            Dataflow::Os => {
                state.stage = SystolicStage::Read;
                state.read_stage_entries += 1;
                state.os_read_plan(config)
            }
        };
        (state, plan)
    }

    pub(crate) fn advance(&mut self, config: &ArchConfig) -> StagePlan {
        match self.dataflow {
            Dataflow::Ws => self.advance_ws(config),
            Dataflow::Os => self.advance_os(config),
        }
    }

    pub(crate) fn stage_name(&self) -> &'static str {
        match self.stage {
            SystolicStage::Prefetch => "prefetch",
            SystolicStage::Read => "read",
            SystolicStage::Shift => "shift",
            SystolicStage::Write => "write",
        }
    }

    /// Column tiles per row; WS iterates every K tile inside each column.
    fn ws_cols_per_row(&self) -> u32 {
        self.cols * self.ks
    }

    fn advance_ws(&mut self, config: &ArchConfig) -> StagePlan {
        let t = config.array_size as u64;
        match self.stage {
            SystolicStage::Prefetch => {
                self.stage = SystolicStage::Read;
                self.read_stage_entries += 1;
                StagePlan {
                    latency: t * ws_beat(config),
                    read_bytes: self.activation_tile_bytes(config),
                    ..StagePlan::default()
                }
            }
            SystolicStage::Read => {
                self.stage = SystolicStage::Shift;
                StagePlan {
                    latency: t * ws_beat(config),
                    ..StagePlan::default()
                }
            }
            SystolicStage::Shift => {
                self.stage = SystolicStage::Write;
                if self.col == self.ws_cols_per_row() {
                    if self.row == self.rows {
                        // the single full output write of the job
                        self.write_commits += 1;
                        StagePlan {
                            write_bytes: self.output_bytes(config),
                            ..StagePlan::default()
                        }
                    } else {
                        // preload next-row activations while the array drains
                        StagePlan {
                            read_bytes: self.activation_tile_bytes(config),
                            ..StagePlan::default()
                        }
                    }
                } else {
                    StagePlan::default()
                }
            }
            SystolicStage::Write => {
                if self.col == self.ws_cols_per_row() {
                    if self.row == self.rows {
                        return StagePlan::done();
                    }
                    self.col = 1;
                    self.row += 1;
                    self.stage = SystolicStage::Read;
                    self.read_stage_entries += 1;
                    StagePlan {
                        latency: t * ws_beat(config),
                        read_bytes: self.activation_tile_bytes(config),
                        restore_addr: true,
                        ..StagePlan::default()
                    }
                } else {
                    self.col += 1;
                    self.stage = SystolicStage::Read;
                    self.read_stage_entries += 1;
                    StagePlan {
                        latency: t * ws_beat(config),
                        read_bytes: self.activation_tile_bytes(config),
                        ..StagePlan::default()
                    }
                }
            }
        }
    }

    fn advance_os(&mut self, config: &ArchConfig) -> StagePlan {
        let t = config.array_size as u64;
        match self.stage {
            SystolicStage::Prefetch => unreachable!("no prefetch stage under OS"),
            SystolicStage::Read => {
                self.stage = SystolicStage::Shift;
                StagePlan {
                    latency: t * os_beat(config),
                    ..StagePlan::default()
                }
            }
            SystolicStage::Shift => {
                if self.k < self.ks {
                    self.k += 1;
                    self.stage = SystolicStage::Read;
                    self.read_stage_entries += 1;
                    self.os_read_plan(config)
                } else {
                    // full K iteration done: commit the accumulation target
                    self.stage = SystolicStage::Write;
                    self.write_commits += 1;
                    StagePlan {
                        write_bytes: self.os_commit_bytes(config),
                        ..StagePlan::default()
                    }
                }
            }
            SystolicStage::Write => {
                if self.col == self.cols {
                    if self.row == self.rows {
                        return StagePlan::done();
                    }
                    self.col = 1;
                    self.k = 1;
                    self.row += 1;
                    self.stage = SystolicStage::Read;
                    self.read_stage_entries += 1;
                    let mut plan = self.os_read_plan(config);
                    plan.restore_addr = true;
                    plan
                } else {
                    self.col += 1;
                    self.k = 1;
                    self.stage = SystolicStage::Read;
                    self.read_stage_entries += 1;
                    self.os_read_plan(config)
                }
            }
        }
    }

    fn os_read_plan(&self, config: &ArchConfig) -> StagePlan {
        let t = config.array_size as u64;
        StagePlan {
            latency: t * os_beat(config),
            read_bytes: self.os_read_bytes(config),
            ..StagePlan::default()
        }
    }

    fn activation_tile_bytes(&self, config: &ArchConfig) -> u64 {
        let t = config.array_size;
        let tk = t.min(self.dims.k) as u64;
        let tn = t.min(self.dims.n) as u64;
        tk * tn * config.elem_width as u64
    }

    /// Weight and activation tiles for one (row, col, k) target.
    fn os_read_bytes(&self, config: &ArchConfig) -> u64 {
        let t = config.array_size;
        let tm = t.min(self.dims.m) as u64;
        let tk = t.min(self.dims.k) as u64;
        let tn = t.min(self.dims.n) as u64;
        (tm * tk + tk * tn) * config.elem_width as u64
    }

    fn os_commit_bytes(&self, config: &ArchConfig) -> u64 {
        let t = config.array_size;
        let tm = t.min(self.dims.m) as u64;
        let tn = t.min(self.dims.n) as u64;
        tm * tn * config.elem_width as u64 * config.batch_size as u64
    }

    fn output_bytes(&self, config: &ArchConfig) -> u64 {
        self.dims.m as u64
            * self.dims.n as u64
            * config.elem_width as u64
            * config.batch_size as u64
    }
}

fn ws_beat(config: &ArchConfig) -> u64 {
    config.compute_latency.max(config.batch_size as u64)
}

fn os_beat(config: &ArchConfig) -> u64 {
    config.compute_latency.min(config.batch_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(dims: MatrixDims, config: &ArchConfig) -> (SystolicState, Vec<StagePlan>) {
        let (mut state, first) = SystolicState::new(dims, config);
        let mut plans = vec![first];
        loop {
            let plan = state.advance(config);
            if plan.done {
                return (state, plans);
            }
            plans.push(plan);
            assert!(plans.len() < 1_000_000, "state machine does not terminate");
        }
    }

    #[test]
    fn ws_read_entries_cover_all_tiles() {
        let config = ArchConfig {
            array_size: 64,
            dataflow: Dataflow::Ws,
            ..ArchConfig::default()
        };
        let dims = MatrixDims {
            m: 128,
            k: 256,
            n: 512,
        };
        let (state, plans) = drain(dims, &config);
        // ceil(128/64) * ceil(512/64) * ceil(256/64)
        assert_eq!(state.read_stage_entries, 2 * 8 * 4);

        // exactly one final output write of M*N*elem_width*batch
        let writes: Vec<u64> = plans
            .iter()
            .filter(|p| p.write_bytes > 0)
            .map(|p| p.write_bytes)
            .collect();
        assert_eq!(writes, vec![128 * 512 * 2]);
    }

    #[test]
    fn ws_row_advance_restores_base_address() {
        let config = ArchConfig {
            array_size: 64,
            dataflow: Dataflow::Ws,
            ..ArchConfig::default()
        };
        let dims = MatrixDims {
            m: 256,
            k: 64,
            n: 64,
        };
        let (_, plans) = drain(dims, &config);
        let restores = plans.iter().filter(|p| p.restore_addr).count();
        assert_eq!(restores, 4 - 1); // once per row transition
    }

    #[test]
    fn os_commits_once_per_output_tile() {
        let config = ArchConfig {
            array_size: 64,
            dataflow: Dataflow::Os,
            ..ArchConfig::default()
        };
        let dims = MatrixDims {
            m: 128,
            k: 256,
            n: 128,
        };
        let (state, plans) = drain(dims, &config);
        assert_eq!(state.write_commits, 2 * 2);
        assert_eq!(state.read_stage_entries, 2 * 2 * 4);

        // every commit writes one accumulation tile
        let commits = plans.iter().filter(|p| p.write_bytes > 0).count();
        assert_eq!(commits, 4);
        assert!(plans
            .iter()
            .filter(|p| p.write_bytes > 0)
            .all(|p| p.write_bytes == 64 * 64 * 2));
    }

    #[test]
    fn small_dims_clamp_to_single_tile() {
        for dataflow in [Dataflow::Ws, Dataflow::Os] {
            let config = ArchConfig {
                array_size: 64,
                dataflow,
                ..ArchConfig::default()
            };
            let dims = MatrixDims { m: 4, k: 4, n: 4 };
            let (state, _) = drain(dims, &config);
            assert_eq!(state.read_stage_entries, 1);
            assert_eq!(state.write_commits, 1);
        }
    }

    #[test]
    fn ws_prefetch_has_no_traffic() {
        let config = ArchConfig {
            array_size: 8,
            dataflow: Dataflow::Ws,
            compute_latency: 3,
            ..ArchConfig::default()
        };
        let dims = MatrixDims {
            m: 16,
            k: 8,
            n: 8,
        };
        let (_, first) = SystolicState::new(dims, &config);
        assert_eq!(first.read_bytes, 0);
        assert_eq!(first.write_bytes, 0);
        // rowTile x max(computeLatency, batchSize)
        assert_eq!(first.latency, 8 * 3);
    }

    #[test]
    fn os_read_duration_uses_min_of_latency_and_batch() {
        let config = ArchConfig {
            array_size: 8,
            dataflow: Dataflow::Os,
            compute_latency: 4,
            batch_size: 2,
            ..ArchConfig::default()
        };
        let dims = MatrixDims { m: 8, k: 8, n: 8 };
        let (_, first) = SystolicState::new(dims, &config);
        assert_eq!(first.latency, 8 * 2);
        assert!(first.read_bytes > 0);
    }
}
