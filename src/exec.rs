//! Per-task execution runtime.
//!
//! Every started task body runs on its own thread, but at most one of those
//! threads is unparked at a time: the control loop grants the execution token
//! by sending on a task's private resume channel and only grants it again
//! after a [`ExecEvent::Block`] or [`ExecEvent::Finish`] hands it back. The
//! blocking primitives of [`TaskContext`] are the only suspension points a
//! target ever passes through.

use crate::error::{Error, Result, TaskFailure};
use crate::future::{AsyncMapResult, AsyncResult, FutureSlot, Waitable};
use crate::protocol::{
    IdGenerator, Outcome, ResultMsg, TaskId, TaskMsg, TaskState, WorkerId,
};
use crate::registry::{decode, encode, Registry};
use crate::stats::StatsTable;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Mean execution time (in calibration units) below which a target is cheap
/// enough to batch several calls into one task.
const CHEAP_TARGET_MEAN: f64 = 0.05;
const MAX_BATCH: usize = 64;

/// Identity of one fan-out bucket, unique per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId(pub(crate) u64);

/// Everything the control loop must know to track a new bucket.
#[derive(Debug)]
pub(crate) struct BucketSpec {
    pub id: BucketId,
    pub slots: usize,
    pub children: Vec<TaskId>,
    pub future: Option<Arc<FutureSlot>>,
}

/// What a suspending task is waiting for.
#[derive(Debug)]
pub(crate) enum WaitRequest {
    /// A blocking `apply`/`map`: resume when this bucket drains and deliver
    /// its slots through the resume signal.
    Sync { bucket: BucketId },
    /// `wait_any`: resume when the first of these buckets drains.
    Any { buckets: Vec<BucketId> },
    /// `wait_all`: resume when every one of these buckets has drained.
    All { buckets: Vec<BucketId> },
}

/// Token grant sent back to a suspended task thread.
#[derive(Debug)]
pub(crate) enum Resume {
    Results {
        slots: Vec<Outcome>,
        failure: Option<TaskFailure>,
    },
    AnyReady(usize),
    AllReady,
}

/// Events task threads push to their worker's control loop.
#[derive(Debug)]
pub(crate) enum ExecEvent {
    /// Async fan-out: the caller keeps the token and keeps running.
    Spawn {
        parent: TaskId,
        tasks: Vec<TaskMsg>,
        bucket: BucketSpec,
    },
    /// The running task suspends; the token returns to the control loop.
    Block {
        parent: TaskId,
        /// Total execution time so far, calibration units.
        busy: f64,
        tasks: Vec<TaskMsg>,
        bucket: Option<BucketSpec>,
        wait: WaitRequest,
    },
    /// The task body ran to completion; the token returns.
    Finish {
        task: TaskId,
        reply: Option<(WorkerId, ResultMsg)>,
        root: Option<Vec<Outcome>>,
    },
    /// Cooperative pool shutdown requested from inside a task.
    Exit { from: TaskId },
}

/// Worker-wide state handed to every execution thread.
#[derive(Clone)]
pub(crate) struct ExecShared {
    pub worker: WorkerId,
    pub ids: Arc<IdGenerator>,
    pub stats: Arc<StatsTable>,
    pub registry: Registry,
    pub events: Sender<ExecEvent>,
    pub buckets: Arc<AtomicU64>,
    pub epoch: Instant,
    pub ref_time: f64,
}

/// Handle a target uses to talk to its scheduler: fan out children, wait on
/// futures, or ask the pool to shut down.
#[derive(Debug)]
pub struct TaskContext {
    worker: WorkerId,
    task: TaskId,
    ids: Arc<IdGenerator>,
    stats: Arc<StatsTable>,
    events: Sender<ExecEvent>,
    resume: Receiver<Resume>,
    buckets: Arc<AtomicU64>,
    epoch: Instant,
    ref_time: f64,
    busy_since: Instant,
    busy_acc: f64,
    spawned: bool,
}

impl TaskContext {
    fn new(shared: &ExecShared, task: TaskId, resume: Receiver<Resume>) -> Self {
        Self {
            worker: shared.worker,
            task,
            ids: Arc::clone(&shared.ids),
            stats: Arc::clone(&shared.stats),
            events: shared.events.clone(),
            resume,
            buckets: Arc::clone(&shared.buckets),
            epoch: shared.epoch,
            ref_time: shared.ref_time,
            busy_since: Instant::now(),
            busy_acc: 0.0,
            spawned: false,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Run `target` once on some worker of the pool and block until its
    /// value is back. A failure inside the child is re-raised here.
    pub fn apply<A, R>(&mut self, target: &str, arg: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.spawned = true;
        let child = self.new_task(target, vec![encode(&arg)?], 0);
        let bucket = self.next_bucket();
        let spec = BucketSpec {
            id: bucket,
            slots: 1,
            children: vec![child.id],
            future: None,
        };
        match self.block(vec![child], Some(spec), WaitRequest::Sync { bucket })? {
            Resume::Results { mut slots, failure } => {
                if let Some(failure) = failure {
                    return Err(Error::Task(failure));
                }
                decode_outcome(slots.remove(0))
            }
            _ => Err(Error::scheduler("unexpected resume signal for apply")),
        }
    }

    /// Run `target` over every item and block until all values are back, in
    /// the original item order no matter where or in what order the
    /// sub-tasks completed. Cheap targets are batched into fewer tasks.
    pub fn map<A, R, I>(&mut self, target: &str, items: I) -> Result<Vec<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
        I: IntoIterator<Item = A>,
    {
        let encoded = items
            .into_iter()
            .map(|item| encode(&item))
            .collect::<Result<Vec<_>>>()?;
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        self.spawned = true;

        let total = encoded.len();
        let (tasks, bucket) = self.fan_out(target, encoded);
        let spec = BucketSpec {
            id: bucket,
            slots: total,
            children: tasks.iter().map(|t| t.id).collect(),
            future: None,
        };
        match self.block(tasks, Some(spec), WaitRequest::Sync { bucket })? {
            Resume::Results { slots, failure } => {
                if let Some(failure) = failure {
                    return Err(Error::Task(failure));
                }
                slots.into_iter().map(decode_outcome).collect()
            }
            _ => Err(Error::scheduler("unexpected resume signal for map")),
        }
    }

    /// Non-blocking [`TaskContext::apply`]: returns a handle immediately.
    pub fn apply_async<A, R>(&mut self, target: &str, arg: A) -> Result<AsyncResult<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.spawned = true;
        let child = self.new_task(target, vec![encode(&arg)?], 0);
        let slot = Arc::new(FutureSlot::new());
        let bucket = self.next_bucket();
        let spec = BucketSpec {
            id: bucket,
            slots: 1,
            children: vec![child.id],
            future: Some(Arc::clone(&slot)),
        };
        self.events
            .send(ExecEvent::Spawn {
                parent: self.task,
                tasks: vec![child],
                bucket: spec,
            })
            .map_err(|_| Error::ShuttingDown)?;
        Ok(AsyncResult::new(bucket, slot))
    }

    /// Non-blocking [`TaskContext::map`]: returns a handle immediately.
    pub fn map_async<A, R, I>(&mut self, target: &str, items: I) -> Result<AsyncMapResult<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
        I: IntoIterator<Item = A>,
    {
        let encoded = items
            .into_iter()
            .map(|item| encode(&item))
            .collect::<Result<Vec<_>>>()?;
        self.spawned = true;

        let total = encoded.len();
        let slot = Arc::new(FutureSlot::new());
        if total == 0 {
            // nothing outstanding; the handle is born ready
            slot.fulfill(Vec::new(), None);
            return Ok(AsyncMapResult::new(self.next_bucket(), slot));
        }
        let (tasks, bucket) = self.fan_out(target, encoded);
        let spec = BucketSpec {
            id: bucket,
            slots: total,
            children: tasks.iter().map(|t| t.id).collect(),
            future: Some(Arc::clone(&slot)),
        };
        self.events
            .send(ExecEvent::Spawn {
                parent: self.task,
                tasks,
                bucket: spec,
            })
            .map_err(|_| Error::ShuttingDown)?;
        Ok(AsyncMapResult::new(bucket, slot))
    }

    /// Block until the first of `handles` completes and return its index;
    /// the remaining handles stay outstanding and individually retrievable.
    pub fn wait_any(&mut self, handles: &[&dyn Waitable]) -> Result<usize> {
        if handles.is_empty() {
            return Err(Error::scheduler("wait_any over an empty set of handles"));
        }
        if let Some(idx) = handles.iter().position(|h| h.is_ready()) {
            return Ok(idx);
        }
        let buckets = handles.iter().map(|h| h.bucket()).collect();
        match self.block(Vec::new(), None, WaitRequest::Any { buckets })? {
            Resume::AnyReady(idx) => Ok(idx),
            _ => Err(Error::scheduler("unexpected resume signal for wait_any")),
        }
    }

    /// Block until every handle in `handles` has completed.
    pub fn wait_all(&mut self, handles: &[&dyn Waitable]) -> Result<()> {
        if handles.is_empty() || handles.iter().all(|h| h.is_ready()) {
            return Ok(());
        }
        let buckets = handles.iter().map(|h| h.bucket()).collect();
        match self.block(Vec::new(), None, WaitRequest::All { buckets })? {
            Resume::AllReady => Ok(()),
            _ => Err(Error::scheduler("unexpected resume signal for wait_all")),
        }
    }

    /// Distributed filter: evaluate the boolean `target` over the pool and
    /// keep the items it approves, preserving order.
    pub fn filter<A>(&mut self, target: &str, items: Vec<A>) -> Result<Vec<A>>
    where
        A: Serialize + Clone,
    {
        let keep: Vec<bool> = self.map(target, items.iter().cloned())?;
        Ok(items
            .into_iter()
            .zip(keep)
            .filter_map(|(item, keep)| keep.then_some(item))
            .collect())
    }

    /// Ask the whole pool to shut down once the current task bodies return.
    pub fn terminate(&mut self) -> Result<()> {
        self.events
            .send(ExecEvent::Exit { from: self.task })
            .map_err(|_| Error::ShuttingDown)
    }

    fn new_task(&self, target: &str, args: Vec<Vec<u8>>, index: usize) -> TaskMsg {
        TaskMsg {
            id: self.ids.next_id(),
            creator: self.worker,
            parent: Some(self.task),
            index,
            created_at: self.epoch.elapsed().as_secs_f64(),
            route: vec![self.worker],
            target: target.to_string(),
            args,
            state: TaskState::Pending,
        }
    }

    fn next_bucket(&self) -> BucketId {
        BucketId(self.buckets.fetch_add(1, Ordering::Relaxed))
    }

    /// Split encoded arguments into tasks, batching several per task when
    /// the target's history says a single call is too cheap to ship alone.
    fn fan_out(&self, target: &str, encoded: Vec<Vec<u8>>) -> (Vec<TaskMsg>, BucketId) {
        let chunk = self.chunk_size(target);
        let mut tasks = Vec::new();
        let mut index = 0;
        let mut iter = encoded.into_iter().peekable();
        while iter.peek().is_some() {
            let batch: Vec<Vec<u8>> = iter.by_ref().take(chunk).collect();
            let units = batch.len();
            tasks.push(self.new_task(target, batch, index));
            index += units;
        }
        (tasks, self.next_bucket())
    }

    fn chunk_size(&self, target: &str) -> usize {
        match self.stats.batching_profile(target) {
            Some(s) if !s.spawns_children && s.mean > 0.0 && s.mean < CHEAP_TARGET_MEAN => {
                ((CHEAP_TARGET_MEAN / s.mean) as usize).clamp(1, MAX_BATCH)
            }
            _ => 1,
        }
    }

    /// Hand the token back and park until the control loop resumes us.
    fn block(
        &mut self,
        tasks: Vec<TaskMsg>,
        bucket: Option<BucketSpec>,
        wait: WaitRequest,
    ) -> Result<Resume> {
        let busy = self.pause_clock();
        self.events
            .send(ExecEvent::Block {
                parent: self.task,
                busy,
                tasks,
                bucket,
                wait,
            })
            .map_err(|_| Error::ShuttingDown)?;
        let resume = self.resume.recv().map_err(|_| Error::ShuttingDown)?;
        self.busy_since = Instant::now();
        Ok(resume)
    }

    /// Fold the current run segment into the accumulated execution time.
    fn pause_clock(&mut self) -> f64 {
        self.busy_acc += self.busy_since.elapsed().as_secs_f64() / self.ref_time;
        self.busy_acc
    }
}

fn decode_outcome<R: DeserializeOwned>(outcome: Outcome) -> Result<R> {
    match outcome {
        Outcome::Value(bytes) => decode(&bytes),
        Outcome::Failure(failure) => Err(Error::Task(failure)),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Start a task body on its own thread, already holding the token. Returns
/// the resume channel the control loop grants the token back through.
pub(crate) fn launch(task: TaskMsg, shared: ExecShared) -> Result<Sender<Resume>> {
    let (resume_tx, resume_rx) = unbounded();
    thread::Builder::new()
        .name(format!("colony-{}", task.id))
        .spawn(move || run_task(task, resume_rx, shared))?;
    Ok(resume_tx)
}

fn run_task(task: TaskMsg, resume: Receiver<Resume>, shared: ExecShared) {
    let mut ctx = TaskContext::new(&shared, task.id, resume);
    let target = shared.registry.get(&task.target);

    let mut outcomes = Vec::with_capacity(task.args.len());
    match target {
        None => {
            for _ in &task.args {
                outcomes.push(Outcome::Failure(TaskFailure::from(Error::UnknownTarget(
                    task.target.clone(),
                ))));
            }
        }
        Some(target) => {
            for arg in &task.args {
                let unit = catch_unwind(AssertUnwindSafe(|| target.run(&mut ctx, arg)));
                outcomes.push(match unit {
                    Ok(Ok(bytes)) => Outcome::Value(bytes),
                    Ok(Err(failure)) => Outcome::Failure(failure),
                    Err(payload) => Outcome::Failure(TaskFailure::panic(panic_message(payload))),
                });
            }
        }
    }

    let busy = ctx.pause_clock();
    shared.stats.record(&task.target, busy, ctx.spawned);

    let event = match task.parent {
        None => ExecEvent::Finish {
            task: task.id,
            reply: None,
            root: Some(outcomes),
        },
        Some(parent) => {
            let success = outcomes.iter().all(|o| !o.is_failure());
            let msg = ResultMsg {
                task: task.id,
                parent,
                index: task.index,
                exec_time: busy,
                success,
                outcomes,
            };
            ExecEvent::Finish {
                task: task.id,
                reply: Some((task.creator, msg)),
                root: None,
            }
        }
    };
    // the control loop may already be gone during shutdown
    let _ = shared.events.send(event);
}
