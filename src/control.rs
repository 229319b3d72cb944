//! The per-worker coordination loop.
//!
//! One `Control` runs per worker process. It owns the execution token, the
//! ready queue, and all wait-record bookkeeping; task threads and the
//! transport only ever talk to it through channels, so none of that state
//! needs a lock.

use crate::balance::{self, Decision, LoadBalancer, LoadTuple};
use crate::config::Config;
use crate::error::{Result, TaskFailure};
use crate::exec::{self, BucketId, BucketSpec, ExecEvent, ExecShared, Resume, WaitRequest};
use crate::future::FutureSlot;
use crate::protocol::{
    Envelope, IdGenerator, Outcome, Payload, ResultMsg, TaskId, TaskMsg, TaskState, WorkerId,
};
use crate::queue::TaskQueue;
use crate::stats::StatsTable;
use crate::transport::Transport;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Sibling sub-tasks created by one fan-out call, tracked together so the
/// caller sees results in submission order.
#[derive(Debug)]
struct Bucket {
    id: BucketId,
    outstanding: HashSet<TaskId>,
    slots: Vec<Option<Outcome>>,
    /// First failure to arrive; never overwritten by a later success.
    failure: Option<TaskFailure>,
    future: Option<Arc<FutureSlot>>,
}

/// What a suspended parent is currently waiting for.
#[derive(Debug, Default)]
enum WaitKind {
    #[default]
    None,
    Sync(BucketId),
    Any(Vec<BucketId>),
    All(Vec<BucketId>),
}

#[derive(Debug, Default)]
struct WaitRecord {
    wait: WaitKind,
    buckets: Vec<Bucket>,
}

impl WaitRecord {
    fn has_bucket(&self, id: BucketId) -> bool {
        self.buckets.iter().any(|b| b.id == id)
    }
}

/// A task body that has been started on this worker.
struct StartedTask {
    resume_tx: Sender<Resume>,
    target: String,
    /// Execution time consumed so far, calibration units.
    busy: f64,
    state: TaskState,
}

struct RunningTask {
    id: TaskId,
    granted_at: Instant,
}

pub struct Control {
    cfg: Config,
    transport: Box<dyn Transport>,
    balancer: Box<dyn LoadBalancer>,
    stats: Arc<StatsTable>,
    shared: ExecShared,
    events_rx: Receiver<ExecEvent>,
    queue: TaskQueue,
    started: HashMap<TaskId, StartedTask>,
    records: HashMap<TaskId, WaitRecord>,
    restart: VecDeque<(TaskId, Resume)>,
    running: Option<RunningTask>,
    exit_requested: bool,
    exit_remote: bool,
    exit_set_here: bool,
    root_outcome: Option<Vec<Outcome>>,
    epoch: Instant,
    ref_time: f64,
}

impl Control {
    pub(crate) fn new(
        cfg: Config,
        registry: crate::registry::Registry,
        transport: Box<dyn Transport>,
        ref_time: f64,
    ) -> Self {
        let self_id = transport.self_id();
        let ids = Arc::new(IdGenerator::new(self_id));
        let stats = Arc::new(StatsTable::new());
        let (events_tx, events_rx) = unbounded();
        let epoch = Instant::now();
        let seed = cfg
            .balancer_seed
            .unwrap_or(0x5EED)
            .wrapping_add(u64::from(self_id.0));
        let balancer = balance::build(cfg.balancer, &transport.iter_ids(), self_id, seed);
        let shared = ExecShared {
            worker: self_id,
            ids,
            stats: Arc::clone(&stats),
            registry,
            events: events_tx,
            buckets: Arc::new(AtomicU64::new(0)),
            epoch,
            ref_time,
        };
        Self {
            cfg,
            transport,
            balancer,
            stats,
            shared,
            events_rx,
            queue: TaskQueue::new(),
            started: HashMap::new(),
            records: HashMap::new(),
            restart: VecDeque::new(),
            running: None,
            exit_requested: false,
            exit_remote: false,
            exit_set_here: false,
            root_outcome: None,
            epoch,
            ref_time,
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.transport.is_root()
    }

    fn self_id(&self) -> WorkerId {
        self.transport.self_id()
    }

    /// Enqueue one locally created task. Always succeeds.
    pub fn submit_local(&mut self, task: TaskMsg) {
        self.queue.put(task);
    }

    /// Enqueue a batch of locally created tasks. Always succeeds.
    pub fn submit_batch(&mut self, tasks: Vec<TaskMsg>) {
        self.queue.put_list(tasks);
    }

    /// Create and enqueue the pool's root task.
    pub(crate) fn seed_root(&mut self, target: &str, arg: Vec<u8>) {
        let task = TaskMsg {
            id: self.shared.ids.next_id(),
            creator: self.self_id(),
            parent: None,
            index: 0,
            created_at: self.epoch.elapsed().as_secs_f64(),
            route: vec![self.self_id()],
            target: target.to_string(),
            args: vec![arg],
            state: TaskState::Pending,
        };
        info!(task = %task.id, target_name = target, "seeding root task");
        self.submit_local(task);
    }

    /// Drive this worker until the pool shuts down. Returns the root task's
    /// outcome when the root task finished here.
    pub(crate) fn run(&mut self) -> Result<Option<Vec<Outcome>>> {
        info!(worker = %self.self_id(), pool = self.transport.pool_size(), "control loop started");
        loop {
            let mut progress = self.drain_exec_events()?;
            progress |= self.drain_inbound();

            if self.exit_requested {
                // a remote exit stops us cold; a local one waits for the
                // token holder to come back first
                if self.exit_remote || self.running.is_none() {
                    break;
                }
                if !progress {
                    self.idle_wait()?;
                }
                continue;
            }

            self.update_self_load();
            let decision = self.balancer.take_decision(&mut self.queue, &self.stats);
            self.send_decision(decision);
            progress |= self.start_next()?;

            if !progress {
                self.idle_wait()?;
            }
        }
        self.clean_up();
        Ok(self.root_outcome.take())
    }

    fn drain_exec_events(&mut self) -> Result<bool> {
        let mut progress = false;
        while let Ok(event) = self.events_rx.try_recv() {
            progress = true;
            self.handle_exec_event(event)?;
        }
        Ok(progress)
    }

    fn handle_exec_event(&mut self, event: ExecEvent) -> Result<()> {
        match event {
            ExecEvent::Spawn {
                parent,
                tasks,
                bucket,
            } => {
                trace!(parent = %parent, children = tasks.len(), "async fan-out");
                self.register_bucket(parent, bucket);
                self.queue.put_list(tasks);
            }
            ExecEvent::Block {
                parent,
                busy,
                tasks,
                bucket,
                wait,
            } => {
                self.running = None;
                if let Some(entry) = self.started.get_mut(&parent) {
                    entry.busy = busy;
                    entry.state = TaskState::Waiting;
                }
                if let Some(spec) = bucket {
                    self.register_bucket(parent, spec);
                }
                self.queue.put_list(tasks);
                self.apply_wait(parent, wait);
            }
            ExecEvent::Finish { task, reply, root } => {
                self.running = None;
                self.started.remove(&task);
                if let Some(outcomes) = root {
                    info!(task = %task, "root task finished, shutting the pool down");
                    self.root_outcome = Some(outcomes);
                    self.exit_requested = true;
                    self.exit_set_here = true;
                } else if let Some((dest, msg)) = reply {
                    if dest == self.self_id() {
                        self.dispatch_results(vec![msg]);
                    } else {
                        self.post(dest, 0, Payload::Results(vec![msg]));
                    }
                }
            }
            ExecEvent::Exit { from } => {
                info!(task = %from, "pool termination requested");
                self.exit_requested = true;
                self.exit_set_here = true;
            }
        }
        Ok(())
    }

    fn drain_inbound(&mut self) -> bool {
        let mut progress = false;
        while let Some(env) = self.transport.try_recv() {
            progress = true;
            if !matches!(env.payload, Payload::Exit { .. }) {
                self.balancer.merge_node_status(&env.loads);
                self.stats.merge(&env.stats);
            }
            match env.payload {
                Payload::Tasks(mut tasks) => {
                    debug!(sender = %env.sender, count = tasks.len(), "tasks migrated in");
                    for task in &mut tasks {
                        task.route.push(self.self_id());
                        task.state = TaskState::Pending;
                    }
                    self.queue.put_list(tasks);
                    self.update_self_load();
                    self.post(env.sender, 0, Payload::Ack(env.ack_number));
                }
                Payload::Results(results) => self.dispatch_results(results),
                Payload::RequestTask => {
                    // the merged snapshot already tells the balancer how
                    // hungry the sender is; nothing else to do here
                }
                Payload::Ack(n) => self.balancer.acked(env.sender, n),
                Payload::Exit { code, message } => {
                    info!(sender = %env.sender, code, message = %message, "received pool shutdown");
                    self.exit_requested = true;
                    self.exit_remote = true;
                    return true;
                }
            }
        }
        progress
    }

    fn register_bucket(&mut self, parent: TaskId, spec: BucketSpec) {
        let record = self.records.entry(parent).or_default();
        record.buckets.push(Bucket {
            id: spec.id,
            outstanding: spec.children.into_iter().collect(),
            slots: (0..spec.slots).map(|_| None).collect(),
            failure: None,
            future: spec.future,
        });
    }

    fn apply_wait(&mut self, parent: TaskId, wait: WaitRequest) {
        match wait {
            WaitRequest::Sync { bucket } => {
                // the bucket was registered moments ago with all children
                // still pending, so it cannot be satisfied yet
                if let Some(record) = self.records.get_mut(&parent) {
                    record.wait = WaitKind::Sync(bucket);
                }
            }
            WaitRequest::Any { buckets } => match self.records.get_mut(&parent) {
                // every referenced bucket already drained before the wait
                // reached us
                None => self.push_restart(parent, Resume::AnyReady(0)),
                Some(record) => {
                    match buckets.iter().position(|b| !record.has_bucket(*b)) {
                        Some(idx) => self.push_restart(parent, Resume::AnyReady(idx)),
                        None => record.wait = WaitKind::Any(buckets),
                    }
                }
            },
            WaitRequest::All { buckets } => match self.records.get_mut(&parent) {
                None => self.push_restart(parent, Resume::AllReady),
                Some(record) => {
                    if buckets.iter().all(|b| !record.has_bucket(*b)) {
                        self.push_restart(parent, Resume::AllReady);
                    } else {
                        record.wait = WaitKind::All(buckets);
                    }
                }
            },
        }
    }

    fn push_restart(&mut self, parent: TaskId, resume: Resume) {
        self.restart.push_back((parent, resume));
    }

    /// Book incoming results against their buckets and decide which parents
    /// may resume.
    fn dispatch_results(&mut self, results: Vec<ResultMsg>) {
        for result in results {
            let parent = result.parent;
            let record = match self.records.get_mut(&parent) {
                Some(record) => record,
                None => panic!(
                    "result of task {} arrived for parent {} with no wait record",
                    result.task, parent
                ),
            };
            let idx = match record
                .buckets
                .iter()
                .position(|b| b.outstanding.contains(&result.task))
            {
                Some(idx) => idx,
                None => panic!(
                    "result of task {} matches no bucket of parent {}",
                    result.task, parent
                ),
            };

            let bucket = &mut record.buckets[idx];
            bucket.outstanding.remove(&result.task);
            for (offset, outcome) in result.outcomes.into_iter().enumerate() {
                if let Outcome::Failure(failure) = &outcome {
                    if bucket.failure.is_none() {
                        bucket.failure = Some(failure.clone());
                    }
                }
                bucket.slots[result.index + offset] = Some(outcome);
            }
            if !bucket.outstanding.is_empty() {
                continue;
            }

            // bucket drained: pull it out of the record and see whether the
            // parent can come back
            let Bucket {
                id: bucket_id,
                slots: raw_slots,
                failure,
                future,
                outstanding: _,
            } = record.buckets.swap_remove(idx);
            let slots: Vec<Outcome> = raw_slots
                .into_iter()
                .map(|slot| match slot {
                    Some(outcome) => outcome,
                    None => panic!("bucket {bucket_id:?} drained with an unfilled slot"),
                })
                .collect();
            let mut slots = Some(slots);
            if let Some(future) = &future {
                future.fulfill(slots.take().unwrap_or_default(), failure.clone());
            }

            let resume = match &record.wait {
                WaitKind::Sync(id) if *id == bucket_id => Some(Resume::Results {
                    slots: slots.take().unwrap_or_default(),
                    failure,
                }),
                WaitKind::Any(list) => {
                    list.iter().position(|b| *b == bucket_id).map(Resume::AnyReady)
                }
                WaitKind::All(list) if list.contains(&bucket_id) => {
                    if list.iter().all(|b| !record.has_bucket(*b)) {
                        Some(Resume::AllReady)
                    } else {
                        None
                    }
                }
                _ => None,
            };

            if let Some(resume) = resume {
                record.wait = WaitKind::None;
                if record.buckets.is_empty() {
                    self.records.remove(&parent);
                }
                self.push_restart(parent, resume);
            } else if record.buckets.is_empty() && matches!(record.wait, WaitKind::None) {
                self.records.remove(&parent);
            }
        }
    }

    /// Prefer resuming a satisfied suspended task; otherwise start the next
    /// queued one. Only called with the token free.
    fn start_next(&mut self) -> Result<bool> {
        if self.running.is_some() {
            return Ok(false);
        }

        if let Some((id, resume)) = self.restart.pop_front() {
            let entry = match self.started.get_mut(&id) {
                Some(entry) => entry,
                None => panic!("restartable task {id} is not in the started table"),
            };
            entry.state = TaskState::Running;
            if entry.resume_tx.send(resume).is_err() {
                panic!("task thread for {id} died while suspended");
            }
            trace!(task = %id, "resuming suspended task");
            self.running = Some(RunningTask {
                id,
                granted_at: Instant::now(),
            });
            return Ok(true);
        }

        if let Some(mut task) = self.queue.pop() {
            task.state = TaskState::Running;
            let id = task.id;
            let target = task.target.clone();
            trace!(task = %id, target_name = %target, "starting task");
            let resume_tx = exec::launch(task, self.shared.clone())?;
            self.started.insert(
                id,
                StartedTask {
                    resume_tx,
                    target,
                    busy: 0.0,
                    state: TaskState::Running,
                },
            );
            self.running = Some(RunningTask {
                id,
                granted_at: Instant::now(),
            });
            return Ok(true);
        }

        Ok(false)
    }

    fn update_self_load(&mut self) {
        let loads = LoadTuple {
            running: self.running_load(),
            queued: self.queue.load(&self.stats),
            restart: self.restart_load(),
            waiting: self.waiting_load(),
        };
        self.balancer.update_self_status(loads);
    }

    fn running_load(&self) -> f64 {
        match &self.running {
            Some(run) => match self.started.get(&run.id) {
                Some(entry) => {
                    let done = entry.busy + run.granted_at.elapsed().as_secs_f64() / self.ref_time;
                    self.stats.predict(&entry.target, done)
                }
                None => 0.0,
            },
            None => 0.0,
        }
    }

    fn restart_load(&self) -> f64 {
        self.restart
            .iter()
            .filter_map(|(id, _)| self.started.get(id))
            .map(|entry| self.stats.predict(&entry.target, entry.busy))
            .sum()
    }

    fn waiting_load(&self) -> f64 {
        let restarting: HashSet<&TaskId> = self.restart.iter().map(|(id, _)| id).collect();
        self.started
            .iter()
            .filter(|(id, entry)| entry.state == TaskState::Waiting && !restarting.contains(id))
            .map(|(_, entry)| self.stats.predict(&entry.target, entry.busy))
            .sum()
    }

    fn send_decision(&mut self, decision: Decision) {
        for batch in decision.pushes {
            debug!(dest = %batch.dest, count = batch.tasks.len(), ack = batch.ack, "pushing tasks");
            self.post(batch.dest, batch.ack, Payload::Tasks(batch.tasks));
        }
        for dest in decision.pull_from {
            trace!(dest = %dest, "requesting work");
            self.post(dest, 0, Payload::RequestTask);
        }
    }

    fn post(&mut self, receiver: WorkerId, ack: u32, payload: Payload) {
        let mut env = Envelope {
            sender: self.self_id(),
            receiver,
            loads: self.balancer.nodes(),
            stats: self.stats.snapshot(),
            prep_time: self.epoch.elapsed().as_secs_f64(),
            send_time: 0.0,
            ack_number: ack,
            payload,
        };
        env.send_time = self.epoch.elapsed().as_secs_f64();
        self.transport.send(env);
    }

    /// Park until a task event arrives or the poll interval elapses.
    fn idle_wait(&mut self) -> Result<()> {
        match self.events_rx.recv_timeout(self.cfg.control_latency) {
            Ok(event) => self.handle_exec_event(event),
            Err(_) => Ok(()),
        }
    }

    fn clean_up(&mut self) {
        for (target, stats) in self.stats.snapshot() {
            debug!(
                target_name = %target,
                mean = stats.mean * self.ref_time,
                std_dev = stats.std_dev * self.ref_time,
                calls = stats.samples,
                "target statistics at shutdown"
            );
        }
        if self.exit_set_here {
            for id in self.transport.iter_ids() {
                if id == self.self_id() {
                    continue;
                }
                self.post(
                    id,
                    0,
                    Payload::Exit {
                        code: 0,
                        message: "pool shutdown".to_string(),
                    },
                );
            }
        }
        // wake every parked task thread so it can unwind
        self.started.clear();
        self.restart.clear();
        self.transport.shutdown();
        info!(worker = %self.self_id(), "control loop stopped");
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("worker", &self.self_id())
            .field("queued", &self.queue.len())
            .field("started", &self.started.len())
            .field("running", &self.running.as_ref().map(|r| r.id))
            .finish()
    }
}
