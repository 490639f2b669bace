//! Randomized spawn/pipe workloads.
//!
//! A [`DataGraph`] describes a spawn tree rooted at instance index 0 plus a set
//! of writes between instances. Each write gets its own pipe. The pipe is
//! created by the lowest common ancestor of writer and reader in the spawn
//! tree and handed down the spawn path to both of them. [`DagProgram`]
//! interprets the graph from inside every instance; [`run_data_graph`] runs it
//! to completion.

use crate::config::SchedulerConfig;
use crate::core::Endpoint;
use crate::errors::SchedulerError;
use crate::program::{Argv, Program, ProgramDescriptor, ProgramFault, ProgramRegistry};
use crate::runtime::InstanceContext;
use crate::scheduler::{RunMode, RunOutcome, Scheduler};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Descriptor under which [`run_data_graph`] registers [`DagProgram`].
pub const DAG_PROGRAM: ProgramDescriptor = ProgramDescriptor::new(0, 0);

/// Exit code of an instance that read different bytes than were written.
const MISMATCH_EXIT_CODE: i8 = 1;

/// A parent spawning a child and handing it pipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOp {
    /// Spawning instance index.
    pub from: u64,
    /// Spawned instance index.
    pub child: u64,
    /// Pipe indices handed to the child, in transfer order.
    pub pipes: Vec<u64>,
}

/// A pipe created by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeOp {
    /// Creating instance index.
    pub vm: u64,
    /// Pipe index bound to the first endpoint, used by the reader.
    pub read_pipe: u64,
    /// Pipe index bound to the second endpoint, used by the writer.
    pub write_pipe: u64,
}

/// Bytes sent from one instance to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
    /// Writing instance index.
    pub from: u64,
    /// Pipe index the writer writes to.
    pub from_pipe: u64,
    /// Reading instance index.
    pub to: u64,
    /// Pipe index the reader reads from.
    pub to_pipe: u64,
    /// The payload.
    #[serde(serialize_with = "encode_bytes", deserialize_with = "decode_bytes")]
    pub data: Vec<u8>,
}

fn encode_bytes<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

fn decode_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// A complete workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGraph {
    /// Spawns, parents before children.
    pub spawns: Vec<SpawnOp>,
    /// Pipe creations.
    pub pipes: Vec<PipeOp>,
    /// Writes, in the order every instance performs them.
    pub writes: Vec<WriteOp>,
}

impl DataGraph {
    /// Number of instances, root included.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.spawns.len() + 1
    }
}

impl fmt::Display for DataGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pipe in &self.pipes {
            writeln!(
                f,
                "VM {} creates read pipe {}, write pipe {}",
                pipe.vm, pipe.read_pipe, pipe.write_pipe
            )?;
        }
        for spawn in &self.spawns {
            writeln!(f, "VM {} spawns VM {}, passed pipes: {:?}", spawn.from, spawn.child, spawn.pipes)?;
        }
        for write in &self.writes {
            writeln!(
                f,
                "VM {} writes {} bytes to pipe {}, read by VM {} from pipe {}",
                write.from,
                write.data.len(),
                write.from_pipe,
                write.to,
                write.to_pipe
            )?;
        }
        Ok(())
    }
}

/// Returns true if `to` is reachable from `from` along `edges`.
fn reaches(edges: &BTreeMap<usize, Vec<usize>>, from: usize, to: usize) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if seen.insert(node) {
            stack.extend(edges.get(&node).into_iter().flatten().copied());
        }
    }
    false
}

/// Nodes from `node` up to the root, `node` first.
fn ancestry(parents: &[Option<usize>], node: usize) -> Vec<usize> {
    let mut path = vec![node];
    let mut current = node;
    while let Some(parent) = parents[current] {
        path.push(parent);
        current = parent;
    }
    path
}

/// Generates a seeded workload.
///
/// `spawns` children are attached to random earlier instances. Then up to
/// `writes` write edges are drawn between random pairs of instances; each
/// edge gets `converging_threshold` attempts to find a pair that keeps the
/// write graph acyclic, and generation of writes stops at the first edge that
/// finds none.
#[must_use]
pub fn generate_data_graph(seed: u64, spawns: u32, writes: u32, converging_threshold: u32) -> DataGraph {
    let mut rng = StdRng::seed_from_u64(seed);
    let nodes = spawns as usize + 1;

    let mut parents: Vec<Option<usize>> = vec![None];
    for child in 1..nodes {
        parents.push(Some(rng.gen_range(0..child)));
    }

    let mut write_edges: Vec<(usize, usize)> = Vec::new();
    if spawns > 0 {
        let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for _ in 0..writes {
            let mut added = false;
            for _ in 0..converging_threshold {
                let writer = rng.gen_range(0..nodes);
                let mut reader = writer;
                while reader == writer {
                    reader = rng.gen_range(0..nodes);
                }
                if reaches(&adjacency, reader, writer) {
                    continue;
                }
                adjacency.entry(writer).or_default().push(reader);
                write_edges.push((writer, reader));
                added = true;
                break;
            }
            if !added {
                break;
            }
        }
    }

    // Breadth-first spawn order so every parent exists before its children.
    let mut spawn_order = Vec::new();
    let mut queue = VecDeque::from([0usize]);
    while let Some(node) = queue.pop_front() {
        for child in (1..nodes).filter(|c| parents[*c] == Some(node)) {
            spawn_order.push(child);
            queue.push_back(child);
        }
    }

    let mut passed: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    let mut pipes = Vec::new();
    let mut write_ops = Vec::new();
    for (edge, &(writer, reader)) in write_edges.iter().enumerate() {
        let reader_pipe = edge as u64 * 2;
        let writer_pipe = edge as u64 * 2 + 1;

        let data_len = rng.gen_range(1..=1024);
        let mut data = vec![0u8; data_len];
        rng.fill(&mut data[..]);
        write_ops.push(WriteOp {
            from: writer as u64,
            from_pipe: writer_pipe,
            to: reader as u64,
            to_pipe: reader_pipe,
            data,
        });

        let writer_path = ancestry(&parents, writer);
        let reader_path = ancestry(&parents, reader);
        let ancestor = reader_path
            .iter()
            .copied()
            .find(|node| writer_path.contains(node))
            .unwrap_or(0);

        for node in writer_path.iter().take_while(|node| **node != ancestor) {
            passed.entry(*node).or_default().push(writer_pipe);
        }
        for node in reader_path.iter().take_while(|node| **node != ancestor) {
            passed.entry(*node).or_default().push(reader_pipe);
        }
        pipes.push(PipeOp {
            vm: ancestor as u64,
            read_pipe: reader_pipe,
            write_pipe: writer_pipe,
        });
    }
    pipes.sort_by_key(|pipe| pipe.vm);

    let spawns = spawn_order
        .into_iter()
        .filter_map(|child| {
            parents[child].map(|parent| SpawnOp {
                from: parent as u64,
                child: child as u64,
                pipes: passed.remove(&child).unwrap_or_default(),
            })
        })
        .collect();

    DataGraph {
        spawns,
        pipes,
        writes: write_ops,
    }
}

/// Interprets a [`DataGraph`] inside every instance.
///
/// `argv[0]` is the instance index in decimal; every further argument is
/// `pipe_index=endpoint` for a pipe inherited from the parent. The instance
/// creates its pipes, spawns its children, performs its writes and reads in
/// graph order, then joins its children. It exits non-zero if any read
/// returned unexpected bytes or any child exited non-zero.
#[derive(Debug, Clone)]
pub struct DagProgram {
    graph: Arc<DataGraph>,
}

impl DagProgram {
    /// Creates a program for `graph`.
    #[must_use]
    pub fn new(graph: Arc<DataGraph>) -> Self {
        Self { graph }
    }

    /// Arguments for the root instance.
    #[must_use]
    pub fn root_argv() -> Argv {
        vec![b"0".to_vec()]
    }
}

fn parse_u64(arg: &[u8]) -> Result<u64, ProgramFault> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| ProgramFault::new(format!("malformed argument {:?}", String::from_utf8_lossy(arg))))
}

fn parse_argv(argv: &[Vec<u8>]) -> Result<(u64, BTreeMap<u64, Endpoint>), ProgramFault> {
    let (index, pairs) = argv
        .split_first()
        .ok_or_else(|| ProgramFault::new("missing instance index"))?;
    let index = parse_u64(index)?;

    let mut endpoints = BTreeMap::new();
    for pair in pairs {
        let split = pair
            .iter()
            .position(|b| *b == b'=')
            .ok_or_else(|| ProgramFault::new("expected pipe_index=endpoint"))?;
        let pipe = parse_u64(&pair[..split])?;
        let endpoint = Endpoint::new(parse_u64(&pair[split + 1..])?)
            .ok_or_else(|| ProgramFault::new("endpoint 0 is not a valid endpoint"))?;
        endpoints.insert(pipe, endpoint);
    }
    Ok((index, endpoints))
}

fn endpoint_for(endpoints: &BTreeMap<u64, Endpoint>, pipe: u64) -> Result<Endpoint, ProgramFault> {
    endpoints
        .get(&pipe)
        .copied()
        .ok_or_else(|| ProgramFault::new(format!("pipe {pipe} is not held by this instance")))
}

#[async_trait]
impl Program for DagProgram {
    async fn run(self: Arc<Self>, ctx: InstanceContext, argv: Argv) -> Result<i8, ProgramFault> {
        let (me, mut endpoints) = parse_argv(&argv)?;

        for pipe in self.graph.pipes.iter().filter(|pipe| pipe.vm == me) {
            let (read_end, write_end) = ctx.pipe()?;
            endpoints.insert(pipe.read_pipe, read_end);
            endpoints.insert(pipe.write_pipe, write_end);
        }

        let mut children = Vec::new();
        for spawn in self.graph.spawns.iter().filter(|spawn| spawn.from == me) {
            let mut child_argv = vec![spawn.child.to_string().into_bytes()];
            let mut handed = Vec::with_capacity(spawn.pipes.len());
            for pipe in &spawn.pipes {
                let endpoint = endpoint_for(&endpoints, *pipe)?;
                child_argv.push(format!("{pipe}={}", endpoint.get()).into_bytes());
                handed.push(endpoint);
            }
            children.push(ctx.spawn(&DAG_PROGRAM, child_argv, &handed)?);
            for pipe in &spawn.pipes {
                endpoints.remove(pipe);
            }
        }

        let mut exit_code = 0;
        for write in &self.graph.writes {
            if write.from == me {
                let endpoint = endpoint_for(&endpoints, write.from_pipe)?;
                ctx.write_all(endpoint, &write.data).await?;
                ctx.close(endpoint)?;
            }
            if write.to == me {
                let endpoint = endpoint_for(&endpoints, write.to_pipe)?;
                let mut buf = vec![0u8; write.data.len()];
                let n = ctx.read_exact(endpoint, &mut buf).await?;
                ctx.close(endpoint)?;
                if n != buf.len() || buf != write.data {
                    warn!(instance = %ctx.instance_id(), vm = me, pipe = write.to_pipe, "Read mismatch");
                    exit_code = MISMATCH_EXIT_CODE;
                }
            }
        }

        for child in children {
            let child_code = ctx.join(child).await?;
            if child_code != 0 && exit_code == 0 {
                exit_code = child_code;
            }
        }
        debug!(instance = %ctx.instance_id(), vm = me, exit_code, "DAG instance done");
        Ok(exit_code)
    }
}

/// Summary of one [`run_data_graph`] session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagReport {
    /// Root exit code.
    pub exit_code: i8,
    /// Steps consumed over the session.
    pub consumed_steps: u64,
    /// Number of `run` calls it took.
    pub iterations: u64,
    /// Snapshot fingerprint after the root exited.
    pub fingerprint: String,
}

/// Runs `graph` to completion.
///
/// With `steps_per_iteration` the session is driven by repeated step-limited
/// `run` calls instead of a single unlimited one. With `max_steps` the session
/// fails with [`SchedulerError::StepsExceeded`] once that many steps were
/// consumed and the root is still running.
pub fn run_data_graph(
    graph: Arc<DataGraph>,
    config: SchedulerConfig,
    steps_per_iteration: Option<u64>,
    max_steps: Option<u64>,
) -> Result<DagReport, SchedulerError> {
    let registry = ProgramRegistry::new();
    registry.register(DAG_PROGRAM.index, DAG_PROGRAM.source, Arc::new(DagProgram::new(graph)));

    let mut scheduler = Scheduler::new(config, Arc::new(registry))?;
    scheduler.boot(&DAG_PROGRAM, DagProgram::root_argv())?;

    let per_iteration = steps_per_iteration.filter(|steps| *steps > 0);
    let mut iterations = 0;
    loop {
        let remaining = max_steps.map(|limit| limit.saturating_sub(scheduler.consumed_steps()));
        let mode = match (per_iteration, remaining) {
            (Some(steps), Some(remaining)) => RunMode::LimitSteps(steps.min(remaining)),
            (Some(steps), None) | (None, Some(steps)) => RunMode::LimitSteps(steps),
            (None, None) => RunMode::Unlimited,
        };

        iterations += 1;
        match scheduler.run(mode)? {
            RunOutcome::Exited {
                exit_code,
                consumed_steps,
            } => {
                return Ok(DagReport {
                    exit_code,
                    consumed_steps,
                    iterations,
                    fingerprint: scheduler.snapshot().fingerprint(),
                });
            }
            RunOutcome::Paused { consumed_steps } => {
                if let Some(limit) = max_steps.filter(|limit| consumed_steps >= *limit) {
                    warn!(consumed_steps, limit, "Step budget exhausted");
                    return Err(SchedulerError::StepsExceeded { consumed_steps, limit });
                }
            }
        }
    }
}
