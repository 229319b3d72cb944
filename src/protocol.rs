//! Wire-level types exchanged between workers.
//!
//! Everything in this module is plain data: task and result descriptors plus
//! the envelope that carries them. Transports move envelopes around without
//! looking inside; the control loop is the only producer and consumer.

use crate::error::TaskFailure;
use crate::stats::TargetStats;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Fixed, comparable identity of one worker process in the pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Pool-wide unique task identity: the creating worker plus a per-worker
/// sequence number. No two tasks anywhere in the pool ever share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub creator: WorkerId,
    pub seq: u64,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.creator, self.seq)
    }
}

/// Monotonic [`TaskId`] source, one per worker.
#[derive(Debug)]
pub struct IdGenerator {
    worker: WorkerId,
    next: Mutex<u64>,
}

impl IdGenerator {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            next: Mutex::new(0),
        }
    }

    pub fn next_id(&self) -> TaskId {
        let mut next = self.next.lock();
        let seq = *next;
        *next += 1;
        TaskId {
            creator: self.worker,
            seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Waiting,
}

/// A schedulable unit of work, owned by exactly one worker at a time.
///
/// `args` holds one encoded argument per sub-unit: a batched fan-out of many
/// cheap calls travels as a single task occupying the slot range
/// `[index, index + args.len())` in its parent's bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMsg {
    pub id: TaskId,
    /// Worker the result must be returned to (where the parent waits).
    pub creator: WorkerId,
    /// Creating task; `None` exactly for the root task.
    pub parent: Option<TaskId>,
    /// First slot this task fills in the parent's bucket.
    pub index: usize,
    /// Creation stamp on the creating worker's clock; orders the ready queue.
    pub created_at: f64,
    /// Workers this task has traversed. Diagnostic only.
    pub route: Vec<WorkerId>,
    pub target: String,
    pub args: Vec<Vec<u8>>,
    pub state: TaskState,
}

impl TaskMsg {
    pub fn units(&self) -> usize {
        self.args.len()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Outcome of one sub-unit of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    Value(Vec<u8>),
    Failure(TaskFailure),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}

/// The finished form of a task, routed back to the worker where its parent
/// waits. Consumed exactly once by the parent's bucket bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMsg {
    pub task: TaskId,
    pub parent: TaskId,
    /// First bucket slot the outcomes fill.
    pub index: usize,
    /// Wall-clock execution time in calibration units.
    pub exec_time: f64,
    pub success: bool,
    /// One outcome per sub-unit, in sub-unit order.
    pub outcomes: Vec<Outcome>,
}

/// One worker's load as advertised to the rest of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Predicted remaining time of the currently running task.
    pub running: f64,
    /// Summed predicted time of the ready queue.
    pub queued: f64,
    /// Summed predicted time of tasks waiting to resume.
    pub restart: f64,
    /// Summed predicted time of suspended tasks.
    pub waiting: f64,
    /// Update sequence number; stale reports never overwrite newer ones.
    pub seq: u64,
}

impl LoadReport {
    /// The portion of the load the balancer weighs: work that still has to
    /// run here, excluding suspended tasks waiting on children.
    pub fn active(&self) -> f64 {
        self.running + self.queued + self.restart
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Task,
    Result,
    RequestTask,
    Ack,
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Tasks(Vec<TaskMsg>),
    Results(Vec<ResultMsg>),
    RequestTask,
    /// Echo of the ack number carried by a received `Tasks` envelope.
    Ack(u32),
    Exit {
        code: i32,
        message: String,
    },
}

impl Payload {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Payload::Tasks(_) => EnvelopeKind::Task,
            Payload::Results(_) => EnvelopeKind::Result,
            Payload::RequestTask => EnvelopeKind::RequestTask,
            Payload::Ack(_) => EnvelopeKind::Ack,
            Payload::Exit { .. } => EnvelopeKind::Exit,
        }
    }
}

/// The worker-to-worker message. Every envelope piggybacks the sender's view
/// of pool load and its timing statistics so that state spreads without
/// dedicated gossip traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: WorkerId,
    pub receiver: WorkerId,
    pub loads: HashMap<WorkerId, LoadReport>,
    pub stats: HashMap<String, TargetStats>,
    pub prep_time: f64,
    pub send_time: f64,
    /// Ack number the receiver of a `Tasks` payload must echo back.
    pub ack_number: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_id_generator_monotonic() {
        let ids = IdGenerator::new(WorkerId(3));
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a.creator, WorkerId(3));
        assert_eq!(b.seq, a.seq + 1);
        assert!(a < b);
    }

    #[test]
    fn test_id_generator_unique_across_threads() {
        let ids = Arc::new(IdGenerator::new(WorkerId(0)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..200).map(|_| ids.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope {
            sender: WorkerId(0),
            receiver: WorkerId(1),
            loads: HashMap::new(),
            stats: HashMap::new(),
            prep_time: 0.5,
            send_time: 0.6,
            ack_number: 7,
            payload: Payload::Ack(7),
        };
        let bytes = rmp_serde::to_vec(&env).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.sender, env.sender);
        assert_eq!(back.ack_number, 7);
        assert_eq!(back.kind(), EnvelopeKind::Ack);
    }
}
