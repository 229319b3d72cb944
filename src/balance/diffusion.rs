//! Probabilistic diffusion load balancer.
//!
//! Each worker compares its own active load against the pool average and
//! either asks busier workers for tasks or pushes queued tasks towards
//! under-loaded ones, with probabilities shaped by how far each peer sits
//! from the average. Randomness comes from a seedable generator so pool runs
//! can be replayed.

use super::{Decision, LoadBalancer, LoadTuple, PushBatch};
use crate::protocol::{LoadReport, WorkerId};
use crate::queue::TaskQueue;
use crate::stats::StatsTable;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

const MAX_PROB: f64 = 1.0;
const MIN_PROB: f64 = 0.05;
/// Minimum pause between consecutive work requests to the same peer.
const ASK_FOR_TASK_DELAY: Duration = Duration::from_millis(500);
/// A worker about to resume at least this much suspended work stops begging.
const RESTART_QUEUE_BLOCKING_FROM: f64 = 1.0;

#[derive(Debug)]
struct Node {
    report: LoadReport,
    last_contact: Instant,
    pending_acks: Vec<u32>,
    next_ack: u32,
}

#[derive(Debug)]
pub struct DiffusionBalancer {
    wid: WorkerId,
    nodes: HashMap<WorkerId, Node>,
    rng: Pcg64Mcg,
}

impl DiffusionBalancer {
    pub fn new(ids: &[WorkerId], self_id: WorkerId, seed: u64) -> Self {
        let now = Instant::now();
        // back-date the initial contact stamps so the first work request is
        // not suppressed by the ask delay
        let start = now.checked_sub(ASK_FOR_TASK_DELAY * 2).unwrap_or(now);
        let nodes = ids
            .iter()
            .map(|id| {
                (
                    *id,
                    Node {
                        report: LoadReport::default(),
                        last_contact: start,
                        pending_acks: Vec::new(),
                        next_ack: 0,
                    },
                )
            })
            .collect();
        Self {
            wid: self_id,
            nodes,
            rng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    fn self_report(&self) -> LoadReport {
        self.nodes
            .get(&self.wid)
            .map(|node| node.report)
            .unwrap_or_default()
    }
}

impl LoadBalancer for DiffusionBalancer {
    fn update_self_status(&mut self, loads: LoadTuple) {
        if let Some(node) = self.nodes.get_mut(&self.wid) {
            node.report = LoadReport {
                running: loads.running,
                queued: loads.queued,
                restart: loads.restart,
                waiting: loads.waiting,
                seq: node.report.seq + 1,
            };
        }
    }

    fn merge_node_status(&mut self, remote: &HashMap<WorkerId, LoadReport>) {
        for (id, theirs) in remote {
            if *id == self.wid {
                continue;
            }
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            // a peer we pushed to keeps advertising pre-push load until it
            // acknowledges the batch; ignore it until then
            if node.pending_acks.is_empty() && theirs.seq > node.report.seq {
                node.report = *theirs;
            }
        }
    }

    fn nodes(&self) -> HashMap<WorkerId, LoadReport> {
        self.nodes.iter().map(|(id, n)| (*id, n.report)).collect()
    }

    fn take_decision(&mut self, queue: &mut TaskQueue, stats: &StatsTable) -> Decision {
        let mut decision = Decision::default();
        let n = self.nodes.len() as f64;
        if n <= 1.0 {
            return decision;
        }

        let mut total = 0.0;
        let mut total_sq = 0.0;
        for node in self.nodes.values() {
            let active = node.report.active();
            total += active;
            total_sq += active * active;
        }
        let avg = total / n;
        let variance = total_sq / n - avg * avg;
        let std_dev = if variance > 0.0 { variance.sqrt() } else { 0.0 };

        let me = self.self_report();
        let self_load = me.active();
        let mut diff = self_load - avg;

        // under-loaded: ask busier peers for work, but not a peer we asked
        // only moments ago
        if diff <= 0.0
            && avg != 0.0
            && me.restart < RESTART_QUEUE_BLOCKING_FROM
            && (self_load == 0.0 || self.rng.gen::<f64>() < std_dev / (avg * self_load))
        {
            let now = Instant::now();
            for (id, node) in &mut self.nodes {
                if *id == self.wid {
                    continue;
                }
                if node.report.active() > diff
                    && now.duration_since(node.last_contact) > ASK_FOR_TASK_DELAY
                {
                    decision.pull_from.push(*id);
                    node.last_contact = now;
                }
            }
        }

        // over-loaded: push queued tasks towards peers picked by score
        if me.queued > 0.0
            && diff > -std_dev
            && avg != 0.0
            && std_dev != 0.0
            && self.rng.gen::<f64>() < std_dev * self_load / (avg * avg)
        {
            let score = |load: f64| -> f64 {
                if load < avg - 2.0 * std_dev {
                    MAX_PROB
                } else if load > avg + std_dev {
                    MIN_PROB
                } else {
                    // linear between avg - 2σ and avg + σ
                    let a = (MIN_PROB - MAX_PROB) / (3.0 * std_dev);
                    let b = MIN_PROB - a * (avg + std_dev);
                    a * load + b
                }
            };

            let mut scores: Vec<(WorkerId, f64)> = self
                .nodes
                .iter()
                .filter(|(id, _)| **id != self.wid)
                .map(|(id, node)| (*id, score(node.report.active())))
                .collect();
            // deterministic candidate order under a seeded rng
            scores.sort_by_key(|(id, _)| *id);

            let mut queued_left = me.queued;
            while diff > 1e-8 && !scores.is_empty() && queued_left > 0.0 {
                let pick = self.rng.gen_range(0..scores.len());
                let (dest, prob) = scores[pick];
                if self.rng.gen::<f64>() > prob {
                    scores.remove(pick);
                    continue;
                }

                let their_diff = self.nodes[&dest].report.active() - avg;
                let budget = if their_diff < 0.0 {
                    // bring the peer up to the average
                    (-their_diff).min(queued_left)
                } else if their_diff < std_dev {
                    // bring the peer up to average + σ
                    (std_dev - their_diff).min(queued_left)
                } else {
                    0.0
                };

                let (tasks, taken) = queue.take_with_budget(budget, stats);
                if !tasks.is_empty() {
                    diff -= taken;
                    queued_left -= taken;
                    if let Some(node) = self.nodes.get_mut(&dest) {
                        node.report.queued += taken;
                        let ack = node.next_ack;
                        node.next_ack += 1;
                        node.pending_acks.push(ack);
                        decision.pushes.push(PushBatch { dest, tasks, ack });
                    }
                }
                scores.remove(pick);
            }

            if let Some(node) = self.nodes.get_mut(&self.wid) {
                node.report.queued = queued_left;
            }
        }

        decision
    }

    fn acked(&mut self, from: WorkerId, ack: u32) {
        match self.nodes.get_mut(&from) {
            Some(node) => match node.pending_acks.iter().position(|a| *a == ack) {
                Some(idx) => {
                    node.pending_acks.remove(idx);
                }
                None => warn!(from = %from, ack, "ack for an unknown or already-settled batch"),
            },
            None => warn!(from = %from, ack, "ack from an unknown worker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TaskId, TaskMsg, TaskState};

    fn ids(n: u32) -> Vec<WorkerId> {
        (0..n).map(WorkerId).collect()
    }

    fn task(seq: u64) -> TaskMsg {
        TaskMsg {
            id: TaskId {
                creator: WorkerId(0),
                seq,
            },
            creator: WorkerId(0),
            parent: None,
            index: 0,
            created_at: seq as f64,
            route: vec![WorkerId(0)],
            target: "f".to_string(),
            args: vec![Vec::new()],
            state: TaskState::Pending,
        }
    }

    fn report(queued: f64, seq: u64) -> LoadReport {
        LoadReport {
            running: 0.0,
            queued,
            restart: 0.0,
            waiting: 0.0,
            seq,
        }
    }

    #[test]
    fn test_merge_respects_sequence_numbers() {
        let mut lb = DiffusionBalancer::new(&ids(2), WorkerId(0), 1);
        let mut remote = HashMap::new();
        remote.insert(WorkerId(1), report(5.0, 3));
        lb.merge_node_status(&remote);
        assert_eq!(lb.nodes()[&WorkerId(1)].queued, 5.0);

        // stale snapshot must not win
        remote.insert(WorkerId(1), report(9.0, 2));
        lb.merge_node_status(&remote);
        assert_eq!(lb.nodes()[&WorkerId(1)].queued, 5.0);
    }

    #[test]
    fn test_merge_never_touches_own_row() {
        let mut lb = DiffusionBalancer::new(&ids(2), WorkerId(0), 1);
        lb.update_self_status(LoadTuple {
            queued: 1.0,
            ..LoadTuple::default()
        });
        let own_seq = lb.nodes()[&WorkerId(0)].seq;
        let mut remote = HashMap::new();
        remote.insert(WorkerId(0), report(42.0, own_seq + 10));
        lb.merge_node_status(&remote);
        assert_eq!(lb.nodes()[&WorkerId(0)].queued, 1.0);
    }

    #[test]
    fn test_pending_ack_gates_merge() {
        let stats = StatsTable::new();
        stats.record("f", 1.0, false);
        stats.record("f", 1.0, false);

        let mut lb = DiffusionBalancer::new(&ids(2), WorkerId(0), 7);
        let mut queue = TaskQueue::new();
        for seq in 0..20 {
            queue.put(task(seq));
        }
        lb.update_self_status(LoadTuple {
            queued: 20.0,
            ..LoadTuple::default()
        });

        // loop until the probabilistic gate opens and a push happens
        let mut pushed = None;
        for _ in 0..200 {
            let decision = lb.take_decision(&mut queue, &stats);
            if let Some(batch) = decision.pushes.into_iter().next() {
                pushed = Some(batch);
                break;
            }
        }
        let batch = pushed.expect("diffusion never pushed despite heavy imbalance");
        assert_eq!(batch.dest, WorkerId(1));
        assert!(!batch.tasks.is_empty());

        // until the ack arrives, snapshots from that peer are ignored
        let mut remote = HashMap::new();
        remote.insert(WorkerId(1), report(0.0, 99));
        lb.merge_node_status(&remote);
        assert!(lb.nodes()[&WorkerId(1)].queued > 0.0);

        lb.acked(WorkerId(1), batch.ack);
        lb.merge_node_status(&remote);
        assert_eq!(lb.nodes()[&WorkerId(1)].queued, 0.0);
    }

    #[test]
    fn test_underloaded_worker_asks_for_tasks() {
        let stats = StatsTable::new();
        let mut lb = DiffusionBalancer::new(&ids(3), WorkerId(0), 3);
        let mut queue = TaskQueue::new();

        lb.update_self_status(LoadTuple::default());
        let mut remote = HashMap::new();
        remote.insert(WorkerId(1), report(10.0, 1));
        remote.insert(WorkerId(2), report(10.0, 1));
        lb.merge_node_status(&remote);

        let decision = lb.take_decision(&mut queue, &stats);
        assert!(!decision.pull_from.is_empty());
        assert!(decision.pushes.is_empty());

        // the ask-delay suppresses an immediate repeat
        let decision = lb.take_decision(&mut queue, &stats);
        assert!(decision.pull_from.is_empty());
    }

    #[test]
    fn test_single_worker_makes_no_decisions() {
        let stats = StatsTable::new();
        let mut lb = DiffusionBalancer::new(&ids(1), WorkerId(0), 3);
        let mut queue = TaskQueue::new();
        queue.put(task(0));
        lb.update_self_status(LoadTuple {
            queued: 1.0,
            ..LoadTuple::default()
        });
        let decision = lb.take_decision(&mut queue, &stats);
        assert!(decision.pull_from.is_empty());
        assert!(decision.pushes.is_empty());
        assert_eq!(queue.len(), 1);
    }
}
