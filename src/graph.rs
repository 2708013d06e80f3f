use log::debug;
use smallvec::SmallVec;

/// Index into the phase's job arena.
pub type JobId = usize;

/// Closed set of compute-unit kinds. The scheduler keeps one ready queue per
/// kind per core and matches exhaustively on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Systolic,
    Vector,
}

impl UnitKind {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            UnitKind::Systolic => 0,
            UnitKind::Vector => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnitKind::Systolic => "systolic",
            UnitKind::Vector => "vector",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorPhase {
    /// Read-heavy dimension reduction.
    Reduce,
    /// Write-heavy elementwise application.
    Broadcast,
}

impl VectorPhase {
    pub fn name(self) -> &'static str {
        match self {
            VectorPhase::Reduce => "reduce",
            VectorPhase::Broadcast => "broadcast",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatrixDims {
    pub m: u32,
    pub k: u32,
    pub n: u32,
}

#[derive(Debug, Clone)]
pub struct VectorOp {
    pub linear: u32,
    pub parallel: u32,
    /// Ordered phase queue; multi-phase ops (e.g. normalization) chain several.
    pub phases: SmallVec<[VectorPhase; 4]>,
}

#[derive(Debug, Clone)]
pub enum JobPayload {
    Matrix(MatrixDims),
    Vector(VectorOp),
}

/// A unit of work bound to exactly one processing unit until completion.
///
/// Wired fully by the frontend before the phase starts; transitions
/// pending -> ready -> bound -> done under the scheduler.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    /// Explicit core affinity, if the frontend pinned this job.
    pub core: Option<usize>,
    /// Current transaction address, advanced as the bound unit issues traffic.
    pub addr: u64,
    pub base_addr: u64,
    pub children: SmallVec<[JobId; 4]>,
    pub deps_left: u32,
    pub done: bool,
    pub payload: JobPayload,
}

impl Job {
    pub fn unit_kind(&self) -> UnitKind {
        match self.payload {
            JobPayload::Matrix(_) => UnitKind::Systolic,
            JobPayload::Vector(_) => UnitKind::Vector,
        }
    }

    pub fn restore_addr(&mut self) {
        self.addr = self.base_addr;
    }
}

/// Pre-wired DAG of jobs for one phase. The graph is acyclic and valid by
/// contract with the frontend; a malformed graph surfaces as a scheduler
/// stall, not as anything detected here.
#[derive(Debug, Default)]
pub struct JobGraph {
    jobs: Vec<Job>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, core: Option<usize>, addr: u64, payload: JobPayload) -> JobId {
        let id = self.jobs.len();
        self.jobs.push(Job {
            id,
            core,
            addr,
            base_addr: addr,
            children: SmallVec::new(),
            deps_left: 0,
            done: false,
            payload,
        });
        id
    }

    /// Wires `child` to depend on `parent`.
    pub fn add_edge(&mut self, parent: JobId, child: JobId) {
        assert!(parent < self.jobs.len(), "invalid parent job");
        assert!(child < self.jobs.len(), "invalid child job");
        assert_ne!(parent, child, "self-dependency");
        self.jobs[parent].children.push(child);
        self.jobs[child].deps_left += 1;
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id]
    }

    pub fn job_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.jobs[id]
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs that are ready at phase start, in id order.
    pub fn roots(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|job| job.deps_left == 0)
            .map(|job| job.id)
            .collect()
    }

    /// Marks `id` done and decrements the counter of every child. Children
    /// whose counter reaches zero are returned for scheduling; each child can
    /// be yielded at most once over the lifetime of the graph.
    pub fn complete(&mut self, id: JobId) -> SmallVec<[JobId; 4]> {
        assert!(!self.jobs[id].done, "job {} completed twice", id);
        self.jobs[id].done = true;

        let children = self.jobs[id].children.clone();
        let mut released = SmallVec::new();
        for child in children {
            let job = &mut self.jobs[child];
            assert!(job.deps_left > 0, "dependency underflow on job {}", child);
            job.deps_left -= 1;
            if job.deps_left == 0 {
                debug!("job {} released job {}", id, child);
                released.push(child);
            }
        }
        released
    }

    pub fn all_done(&self) -> bool {
        self.jobs.iter().all(|job| job.done)
    }

    pub fn unfinished(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|job| !job.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn matrix(m: u32, k: u32, n: u32) -> JobPayload {
        JobPayload::Matrix(MatrixDims { m, k, n })
    }

    fn vector() -> JobPayload {
        JobPayload::Vector(VectorOp {
            linear: 16,
            parallel: 4,
            phases: smallvec![VectorPhase::Reduce, VectorPhase::Broadcast],
        })
    }

    #[test]
    fn roots_are_zero_dependency_jobs() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(None, 0, matrix(8, 8, 8));
        let b = graph.add_job(None, 0x100, matrix(8, 8, 8));
        let c = graph.add_job(None, 0x200, vector());
        graph.add_edge(a, c);
        graph.add_edge(b, c);

        assert_eq!(graph.roots(), vec![a, b]);
        assert_eq!(graph.job(c).deps_left, 2);
    }

    #[test]
    fn counter_reaches_zero_exactly_once() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(None, 0, matrix(8, 8, 8));
        let b = graph.add_job(None, 0, matrix(8, 8, 8));
        let c = graph.add_job(None, 0, vector());
        graph.add_edge(a, c);
        graph.add_edge(b, c);

        assert!(graph.complete(a).is_empty());
        let released = graph.complete(b);
        assert_eq!(released.as_slice(), &[c]);
        // c has no parents left; completing it releases nothing further
        assert!(graph.complete(c).is_empty());
        assert!(graph.all_done());
    }

    #[test]
    fn diamond_releases_join_once() {
        let mut graph = JobGraph::new();
        let top = graph.add_job(None, 0, matrix(4, 4, 4));
        let left = graph.add_job(None, 0, matrix(4, 4, 4));
        let right = graph.add_job(None, 0, matrix(4, 4, 4));
        let join = graph.add_job(None, 0, vector());
        graph.add_edge(top, left);
        graph.add_edge(top, right);
        graph.add_edge(left, join);
        graph.add_edge(right, join);

        let released = graph.complete(top);
        assert_eq!(released.as_slice(), &[left, right]);
        assert!(graph.complete(left).is_empty());
        assert_eq!(graph.complete(right).as_slice(), &[join]);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion_panics() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(None, 0, matrix(4, 4, 4));
        graph.complete(a);
        graph.complete(a);
    }

    #[test]
    fn unit_kind_follows_payload() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(None, 0, matrix(4, 4, 4));
        let b = graph.add_job(Some(2), 0, vector());
        assert_eq!(graph.job(a).unit_kind(), UnitKind::Systolic);
        assert_eq!(graph.job(b).unit_kind(), UnitKind::Vector);
        assert_eq!(graph.job(b).core, Some(2));
    }

    #[test]
    fn address_restore_returns_to_base() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(None, 0x1000, matrix(4, 4, 4));
        let job = graph.job_mut(a);
        job.addr += 256;
        job.restore_addr();
        assert_eq!(job.addr, 0x1000);
    }
}
