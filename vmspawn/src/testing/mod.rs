//! Testing utilities for spawn/pipe/join workloads.
//!
//! This module provides:
//! - Closure-backed programs for ad hoc instance bodies
//! - A seeded generator of spawn trees with pipe traffic between instances
//! - A program and a runner that execute such a graph and check every byte

mod dag;
mod fixtures;

pub use dag::{
    generate_data_graph, run_data_graph, DagProgram, DagReport, DataGraph, PipeOp, SpawnOp, WriteOp,
    DAG_PROGRAM,
};
pub use fixtures::FnProgram;
