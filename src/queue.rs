//! Ready-task storage, ordered by creation time.

use crate::protocol::{TaskId, TaskMsg};
use crate::stats::StatsTable;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Priority queue of pending tasks, oldest creation stamp first with FIFO
/// tie-break, plus removal by id for migration.
///
/// The heap holds lightweight keys and the map holds the tasks; a key whose
/// id is no longer in the map is a leftover from a removal and is skipped on
/// pop. `load()` is cached until the contents change, since the balancer asks
/// for it every loop iteration.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueKey>,
    tasks: HashMap<TaskId, TaskMsg>,
    insertions: u64,
    cached_load: f64,
    changed: bool,
}

#[derive(Debug)]
struct QueueKey {
    created_at: f64,
    insertion: u64,
    id: TaskId,
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.insertion == other.insertion
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the oldest stamp pops first,
        // earliest insertion breaking ties.
        other
            .created_at
            .total_cmp(&self.created_at)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, task: TaskMsg) {
        self.heap.push(QueueKey {
            created_at: task.created_at,
            insertion: self.insertions,
            id: task.id,
        });
        self.insertions += 1;
        self.tasks.insert(task.id, task);
        self.changed = true;
    }

    pub fn put_list(&mut self, tasks: Vec<TaskMsg>) {
        for task in tasks {
            self.put(task);
        }
    }

    pub fn pop(&mut self) -> Option<TaskMsg> {
        while let Some(key) = self.heap.pop() {
            if let Some(task) = self.tasks.remove(&key.id) {
                self.changed = true;
                return Some(task);
            }
        }
        None
    }

    pub fn remove(&mut self, id: TaskId) -> Option<TaskMsg> {
        let task = self.tasks.remove(&id);
        if task.is_some() {
            self.changed = true;
        }
        task
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Summed predicted execution time of every queued task.
    pub fn load(&mut self, stats: &StatsTable) -> f64 {
        if !self.changed {
            return self.cached_load;
        }
        self.cached_load = self
            .tasks
            .values()
            .map(|task| stats.predict(&task.target, 0.0) * task.units() as f64)
            .sum();
        self.changed = false;
        self.cached_load
    }

    /// Remove and return tasks whose predicted times sum to at most `budget`,
    /// together with the time actually taken out. Used by the balancer to
    /// assemble a push batch of roughly the requested size.
    pub fn take_with_budget(&mut self, budget: f64, stats: &StatsTable) -> (Vec<TaskMsg>, f64) {
        let mut picked = Vec::new();
        let mut total = 0.0;
        for (id, task) in &self.tasks {
            let time = stats.predict(&task.target, 0.0) * task.units() as f64;
            if total + time <= budget {
                picked.push(*id);
                total += time;
            }
        }
        let tasks = picked
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect();
        (tasks, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TaskState, WorkerId};

    fn task(seq: u64, created_at: f64) -> TaskMsg {
        TaskMsg {
            id: TaskId {
                creator: WorkerId(0),
                seq,
            },
            creator: WorkerId(0),
            parent: None,
            index: 0,
            created_at,
            route: vec![WorkerId(0)],
            target: "f".to_string(),
            args: vec![Vec::new()],
            state: TaskState::Pending,
        }
    }

    #[test]
    fn test_pop_orders_by_creation_time() {
        let mut queue = TaskQueue::new();
        queue.put(task(0, 3.0));
        queue.put(task(1, 1.0));
        queue.put(task(2, 2.0));

        assert_eq!(queue.pop().unwrap().id.seq, 1);
        assert_eq!(queue.pop().unwrap().id.seq, 2);
        assert_eq!(queue.pop().unwrap().id.seq, 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_equal_stamps_pop_fifo() {
        let mut queue = TaskQueue::new();
        for seq in 0..5 {
            queue.put(task(seq, 1.0));
        }
        for seq in 0..5 {
            assert_eq!(queue.pop().unwrap().id.seq, seq);
        }
    }

    #[test]
    fn test_remove_by_id_skips_stale_heap_entry() {
        let mut queue = TaskQueue::new();
        queue.put(task(0, 1.0));
        queue.put(task(1, 2.0));

        let removed = queue.remove(TaskId {
            creator: WorkerId(0),
            seq: 0,
        });
        assert!(removed.is_some());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().id.seq, 1);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_load_uses_predictions() {
        let stats = StatsTable::new();
        stats.record("f", 2.0, false);
        stats.record("f", 2.0, false);

        let mut queue = TaskQueue::new();
        queue.put(task(0, 1.0));
        queue.put(task(1, 2.0));
        assert!((queue.load(&stats) - 4.0).abs() < 1e-9);

        queue.pop();
        assert!((queue.load(&stats) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_take_with_budget_respects_limit() {
        let stats = StatsTable::new();
        stats.record("f", 1.0, false);
        stats.record("f", 1.0, false);

        let mut queue = TaskQueue::new();
        for seq in 0..6 {
            queue.put(task(seq, seq as f64));
        }

        let (taken, total) = queue.take_with_budget(2.5, &stats);
        assert_eq!(taken.len(), 2);
        assert!((total - 2.0).abs() < 1e-9);
        assert_eq!(queue.len(), 4);

        let (none, total) = queue.take_with_budget(0.0, &stats);
        assert!(none.is_empty());
        assert_eq!(total, 0.0);
    }
}
