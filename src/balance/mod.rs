//! Load-balancing strategy seam.
//!
//! The control loop consumes this interface once per iteration; the policy
//! behind it is injectable. The built-in implementation is the probabilistic
//! diffusion balancer in [`diffusion`].

pub mod diffusion;

pub use diffusion::DiffusionBalancer;

use crate::config::BalancerKind;
use crate::protocol::{LoadReport, TaskMsg, WorkerId};
use crate::queue::TaskQueue;
use crate::stats::StatsTable;
use std::collections::HashMap;

/// The four load components a worker advertises each iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadTuple {
    pub running: f64,
    pub queued: f64,
    pub restart: f64,
    pub waiting: f64,
}

/// One batch of tasks to migrate to `dest`. The receiver echoes `ack` back;
/// until that happens the sender treats `dest`'s advertised load as stale.
#[derive(Debug)]
pub struct PushBatch {
    pub dest: WorkerId,
    pub tasks: Vec<TaskMsg>,
    pub ack: u32,
}

/// Placement decisions for one control-loop iteration.
#[derive(Debug, Default)]
pub struct Decision {
    /// Workers to send a work request to.
    pub pull_from: Vec<WorkerId>,
    /// Task batches to push away.
    pub pushes: Vec<PushBatch>,
}

pub trait LoadBalancer: Send {
    /// Refresh this worker's own row in the load map.
    fn update_self_status(&mut self, loads: LoadTuple);

    /// Fold a load map snapshot received from another worker into ours.
    fn merge_node_status(&mut self, remote: &HashMap<WorkerId, LoadReport>);

    /// Current view of the pool, as shipped in every outbound envelope.
    fn nodes(&self) -> HashMap<WorkerId, LoadReport>;

    /// Decide which workers to ask for work and which queued tasks to push
    /// away. Pushed tasks are removed from `queue` before returning.
    fn take_decision(&mut self, queue: &mut TaskQueue, stats: &StatsTable) -> Decision;

    /// A previously pushed batch was acknowledged by its receiver.
    fn acked(&mut self, from: WorkerId, ack: u32);
}

pub fn build(
    kind: BalancerKind,
    ids: &[WorkerId],
    self_id: WorkerId,
    seed: u64,
) -> Box<dyn LoadBalancer> {
    match kind {
        BalancerKind::Diffusion => Box::new(DiffusionBalancer::new(ids, self_id, seed)),
    }
}
