//! Multi-worker pool scenarios over an in-process mesh: task migration,
//! identity uniqueness, token exclusion, ordering, and shutdown liveness.

use colony::{Config, LocalCluster, Registry, TaskContext, TaskId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Drive a pool of `n` in-process workers to completion and collect every
/// worker's return value.
fn run_pool<R>(n: usize, registry: Registry, target: &str, arg: u32) -> Vec<Option<R>>
where
    R: serde::de::DeserializeOwned + Send + 'static,
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut handles = Vec::new();
    for endpoint in LocalCluster::new(n) {
        let registry = registry.clone();
        let target = target.to_string();
        handles.push(thread::spawn(move || {
            colony::start_with_transport(
                Config::default(),
                registry,
                Box::new(endpoint),
                &target,
                arg,
            )
            .unwrap()
        }));
    }
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect()
}

fn fanout_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("fanout", |ctx: &mut TaskContext, level: u32| {
        if level <= 1 {
            Ok(1u64)
        } else {
            let parts: Vec<u64> = ctx.map("fanout", vec![level - 1, level - 1])?;
            Ok(parts.iter().sum())
        }
    });
    registry
}

#[test]
fn test_two_workers_recursive_fanout() {
    // depth 3 of binary branching: 8 leaves, sum invariant to placement
    let results = run_pool::<u64>(2, fanout_registry(), "fanout", 4);
    let produced: Vec<u64> = results.into_iter().flatten().collect();
    assert_eq!(produced, vec![8], "exactly one worker owns the root outcome");
}

#[test]
fn test_three_workers_deeper_fanout() {
    let results = run_pool::<u64>(3, fanout_registry(), "fanout", 6);
    let produced: Vec<u64> = results.into_iter().flatten().collect();
    assert_eq!(produced, vec![32]);
}

#[test]
fn test_pool_shutdown_reaches_every_worker() {
    // every join returning IS the liveness property: a worker that never
    // observes the exit envelope would hang its thread forever
    let results = run_pool::<u64>(4, fanout_registry(), "fanout", 5);
    assert_eq!(results.len(), 4);
    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
}

#[test]
fn test_task_ids_unique_pool_wide() {
    let seen: Arc<Mutex<HashSet<TaskId>>> = Arc::new(Mutex::new(HashSet::new()));
    let recorder = Arc::clone(&seen);

    let mut registry = Registry::new();
    registry.register("rec_record", move |ctx: &mut TaskContext, level: u32| {
        let fresh = recorder.lock().insert(ctx.task_id());
        assert!(fresh, "duplicate task id {}", ctx.task_id());
        if level <= 1 {
            // expensive enough that fan-outs never merge two leaves into
            // one batched task, which would skew the id count
            thread::sleep(Duration::from_millis(30));
            Ok(1u64)
        } else {
            let parts: Vec<u64> = ctx.map("rec_record", vec![level - 1, level - 1])?;
            Ok(parts.iter().sum())
        }
    });

    let results = run_pool::<u64>(2, registry, "rec_record", 5);
    let produced: Vec<u64> = results.into_iter().flatten().collect();
    assert_eq!(produced, vec![16]);
    // a full binary recursion tree of depth 5: 31 tasks, each id seen once
    assert_eq!(seen.lock().len(), 31);
}

#[test]
fn test_token_mutual_exclusion_per_worker() {
    const WORKERS: usize = 2;
    let active: Arc<Vec<AtomicUsize>> =
        Arc::new((0..WORKERS).map(|_| AtomicUsize::new(0)).collect());
    let peak: Arc<Vec<AtomicUsize>> =
        Arc::new((0..WORKERS).map(|_| AtomicUsize::new(0)).collect());

    let mut registry = Registry::new();
    let (active_in, peak_in) = (Arc::clone(&active), Arc::clone(&peak));
    registry.register("observe", move |ctx: &mut TaskContext, x: u32| {
        let worker = ctx.worker_id().0 as usize;
        let now = active_in[worker].fetch_add(1, Ordering::SeqCst) + 1;
        peak_in[worker].fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2));
        active_in[worker].fetch_sub(1, Ordering::SeqCst);
        Ok(x)
    });
    registry.register("observe_root", |ctx: &mut TaskContext, n: u32| {
        let echoed: Vec<u32> = ctx.map("observe", 0..n)?;
        Ok(echoed.len() as u32)
    });

    let results = run_pool::<u32>(WORKERS, registry, "observe_root", 40);
    let produced: Vec<u32> = results.into_iter().flatten().collect();
    assert_eq!(produced, vec![40]);
    for (worker, peak) in peak.iter().enumerate() {
        assert!(
            peak.load(Ordering::SeqCst) <= 1,
            "worker {worker} ran more than one task body at once"
        );
    }
}

#[test]
fn test_map_order_survives_migration_and_latency() {
    let mut registry = Registry::new();
    registry.register("jitter_double", |_ctx: &mut TaskContext, x: i64| {
        // pseudo-random per-input latency scrambles completion order
        thread::sleep(Duration::from_millis(((x * 7919) % 17) as u64));
        Ok(2 * x)
    });
    registry.register("ordering_root", |ctx: &mut TaskContext, n: u32| {
        ctx.map::<_, i64, _>("jitter_double", (0..i64::from(n)).collect::<Vec<_>>())
    });

    let results = run_pool::<Vec<i64>>(2, registry, "ordering_root", 24);
    let produced: Vec<Vec<i64>> = results.into_iter().flatten().collect();
    assert_eq!(produced.len(), 1);
    let expected: Vec<i64> = (0..24).map(|x| 2 * x).collect();
    assert_eq!(produced[0], expected);
}

#[test]
fn test_worker_ids_cover_the_pool() {
    let mut registry = Registry::new();
    registry.register("whoami", |ctx: &mut TaskContext, _: u32| {
        Ok(ctx.worker_id().0)
    });
    registry.register("poll_root", |ctx: &mut TaskContext, n: u32| {
        ctx.map::<_, u32, _>("whoami", vec![0u32; n as usize])
    });

    let results = run_pool::<Vec<u32>>(3, registry, "poll_root", 30);
    let produced: Vec<Vec<u32>> = results.into_iter().flatten().collect();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].len(), 30);
    // every reported id must at least be a real pool member
    assert!(produced[0].iter().all(|id| *id < 3));
}
