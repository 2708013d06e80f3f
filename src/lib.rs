pub mod frontend;
pub mod graph;
pub mod mem;
pub mod sched;
pub mod sim;
pub mod unit;
