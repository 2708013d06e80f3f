/*
Workload frontend (layer parser).

Parses `[[phase]]` tables from the run's TOML config into fully wired job
graphs, one per phase. Jobs are tagged with their unit kind, dimension
parameters, optional core affinity, and dependency edges; buffer-constrained
splitting of systolic jobs is applied here, before job creation, so the
scheduler only ever sees jobs that fit the per-core budget.
*/

use anyhow::{ensure, Context, Result};
use log::info;
use serde::Deserialize;
use smallvec::{smallvec, SmallVec};
use toml::Table;

use crate::graph::{JobGraph, JobId, JobPayload, MatrixDims, VectorOp, VectorPhase};
use crate::sim::config::ArchConfig;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorOpKind {
    Relu,
    Softmax,
    Layernorm,
}

impl VectorOpKind {
    fn phases(self) -> SmallVec<[VectorPhase; 4]> {
        match self {
            VectorOpKind::Relu => smallvec![VectorPhase::Broadcast],
            // max/sum pass, then normalize
            VectorOpKind::Softmax => smallvec![VectorPhase::Reduce, VectorPhase::Broadcast],
            // mean, variance, then apply
            VectorOpKind::Layernorm => smallvec![
                VectorPhase::Reduce,
                VectorPhase::Reduce,
                VectorPhase::Broadcast
            ],
        }
    }
}

/// One matrix layer. Layers inside a phase are numbered matmuls first, then
/// vector layers; `after` may reference any other layer of the phase, in
/// either direction.
#[derive(Debug, Deserialize, Clone)]
pub struct MatmulSpec {
    pub m: u32,
    pub k: u32,
    pub n: u32,
    #[serde(default)]
    pub addr: u64,
    #[serde(default)]
    pub core: Option<usize>,
    /// Split the N dimension evenly across this many cores as independent
    /// parallel jobs.
    #[serde(default)]
    pub split_cores: Option<usize>,
    #[serde(default)]
    pub after: Vec<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorSpec {
    pub linear: u32,
    pub parallel: u32,
    pub op: VectorOpKind,
    #[serde(default)]
    pub addr: u64,
    #[serde(default)]
    pub core: Option<usize>,
    #[serde(default)]
    pub after: Vec<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PhaseSpec {
    #[serde(default)]
    pub matmul: Vec<MatmulSpec>,
    #[serde(default)]
    pub vector: Vec<VectorSpec>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub phase: Vec<PhaseSpec>,
}

impl WorkloadConfig {
    pub fn from_table(table: &Table) -> Result<Self> {
        table
            .clone()
            .try_into()
            .context("cannot parse workload phases")
    }
}

/// Column widths of the sequential slices a systolic job splits into.
///
/// Required per-core buffer bytes for an M x N output with batch S and
/// element width W is W*M*S*(N + T): the output slice plus one K-tile of
/// activations. Over budget, the job is cut at the widest slice that fits,
/// N_per_job = floor(budget / (W*M*S)) - T. A budget too small for even a
/// single column is a configuration error, not something to degrade around.
pub fn split_widths(dims: MatrixDims, arch: &ArchConfig) -> Result<Vec<u32>> {
    let per_col = arch.elem_width as u64 * dims.m as u64 * arch.batch_size as u64;
    let required = per_col * (dims.n as u64 + arch.array_size as u64);
    if required <= arch.buffer_budget {
        return Ok(vec![dims.n]);
    }

    let max_width = (arch.buffer_budget / per_col) as i64 - arch.array_size as i64;
    ensure!(
        max_width >= 1,
        "buffer budget {} B below a single output column of an {}x{} job \
         ({} B per column plus a {}-wide tile)",
        arch.buffer_budget,
        dims.m,
        dims.n,
        per_col,
        arch.array_size
    );
    let max_width = max_width as u32;

    let mut widths = Vec::with_capacity(dims.n.div_ceil(max_width) as usize);
    let mut remaining = dims.n;
    while remaining > 0 {
        let width = remaining.min(max_width);
        widths.push(width);
        remaining -= width;
    }
    Ok(widths)
}

struct LayerPorts {
    entries: Vec<JobId>,
    exits: Vec<JobId>,
}

/// Emits the buffer-split slices of one output-column range as a sequential
/// dependency chain, returning its entry and exit job.
fn add_matmul_chunk(
    graph: &mut JobGraph,
    spec: &MatmulSpec,
    core: Option<usize>,
    col_offset: u32,
    width: u32,
    arch: &ArchConfig,
) -> Result<(JobId, JobId)> {
    let widths = split_widths(
        MatrixDims {
            m: spec.m,
            k: spec.k,
            n: width,
        },
        arch,
    )?;
    if widths.len() > 1 {
        info!(
            "matmul {}x{}x{}: split into {} sequential jobs for the buffer budget",
            spec.m,
            spec.k,
            width,
            widths.len()
        );
    }

    let mut offset = col_offset;
    let mut first = None;
    let mut prev: Option<JobId> = None;
    for slice_width in widths {
        let addr = spec.addr
            + offset as u64 * spec.m as u64 * arch.elem_width as u64;
        let job = graph.add_job(
            core,
            addr,
            JobPayload::Matrix(MatrixDims {
                m: spec.m,
                k: spec.k,
                n: slice_width,
            }),
        );
        if let Some(prev) = prev {
            graph.add_edge(prev, job);
        }
        first.get_or_insert(job);
        prev = Some(job);
        offset += slice_width;
    }
    let first = first.expect("split produced at least one slice");
    Ok((first, prev.expect("split produced at least one slice")))
}

fn add_matmul_layer(
    graph: &mut JobGraph,
    spec: &MatmulSpec,
    arch: &ArchConfig,
) -> Result<LayerPorts> {
    ensure!(
        spec.m >= 1 && spec.k >= 1 && spec.n >= 1,
        "matmul dimensions must be >= 1"
    );

    let mut entries = Vec::new();
    let mut exits = Vec::new();
    match spec.split_cores {
        Some(cores) => {
            ensure!(
                cores >= 1 && cores <= arch.num_cores,
                "split_cores {} out of range (cores: {})",
                cores,
                arch.num_cores
            );
            ensure!(
                spec.core.is_none(),
                "split_cores and an explicit core affinity are mutually exclusive"
            );
            // independent per-core column ranges, no cross edges
            let base = spec.n / cores as u32;
            let extra = spec.n % cores as u32;
            let mut offset = 0;
            for core in 0..cores {
                let width = base + u32::from((core as u32) < extra);
                ensure!(width >= 1, "split_cores {} exceeds N={}", cores, spec.n);
                let (entry, exit) =
                    add_matmul_chunk(graph, spec, Some(core), offset, width, arch)?;
                entries.push(entry);
                exits.push(exit);
                offset += width;
            }
        }
        None => {
            let (entry, exit) = add_matmul_chunk(graph, spec, spec.core, 0, spec.n, arch)?;
            entries.push(entry);
            exits.push(exit);
        }
    }
    Ok(LayerPorts { entries, exits })
}

pub fn build_phase(spec: &PhaseSpec, arch: &ArchConfig) -> Result<JobGraph> {
    let mut graph = JobGraph::new();
    let mut ports = Vec::new();
    let mut after_lists = Vec::new();

    for matmul in &spec.matmul {
        ports.push(add_matmul_layer(&mut graph, matmul, arch)?);
        after_lists.push(matmul.after.clone());
    }
    for vector in &spec.vector {
        ensure!(
            vector.linear >= 1 && vector.parallel >= 1,
            "vector extents must be >= 1"
        );
        let job = graph.add_job(
            vector.core,
            vector.addr,
            JobPayload::Vector(VectorOp {
                linear: vector.linear,
                parallel: vector.parallel,
                phases: vector.op.phases(),
            }),
        );
        ports.push(LayerPorts {
            entries: vec![job],
            exits: vec![job],
        });
        after_lists.push(vector.after.clone());
    }

    // a dependency cycle among layers surfaces as a scheduler deadlock, not
    // here; only self-edges and dangling references are rejected
    for (layer, after) in after_lists.iter().enumerate() {
        for &dep in after {
            ensure!(
                dep < after_lists.len(),
                "layer {} depends on unknown layer {}",
                layer,
                dep
            );
            ensure!(dep != layer, "layer {} depends on itself", layer);
            for &src in &ports[dep].exits {
                for &dst in &ports[layer].entries {
                    graph.add_edge(src, dst);
                }
            }
        }
    }
    Ok(graph)
}

pub fn build_phases(workload: &WorkloadConfig, arch: &ArchConfig) -> Result<Vec<JobGraph>> {
    workload
        .phase
        .iter()
        .enumerate()
        .map(|(idx, phase)| {
            build_phase(phase, arch).with_context(|| format!("phase {}", idx))
        })
        .collect()
}
