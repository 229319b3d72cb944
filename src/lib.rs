//! colony - cooperative distributed task pool
//!
//! A pool of worker processes executes a dynamically-expanding tree of
//! tasks: any task may fan out further tasks, blocking on their results or
//! collecting them through async handles, while queued work migrates between
//! workers to balance load. The scheduler never looks inside a target; it
//! only measures how long targets run and ships their encoded arguments and
//! results across the wire.
//!
//! # Quick Start
//!
//! ```no_run
//! use colony::{Config, Registry, TaskContext};
//!
//! let mut registry = Registry::new();
//! registry.register("square", |_ctx: &mut TaskContext, x: i64| Ok(x * x));
//! registry.register("sum_of_squares", |ctx: &mut TaskContext, n: i64| {
//!     let squares: Vec<i64> = ctx.map("square", 0..n)?;
//!     Ok(squares.iter().sum::<i64>())
//! });
//!
//! // every worker process of the pool runs this; the root worker seeds the
//! // task, the others lend their cycles
//! let result: Option<i64> = colony::start(
//!     Config::from_args(std::env::args().skip(1)),
//!     registry,
//!     "sum_of_squares",
//!     100i64,
//! )?;
//! if let Some(total) = result {
//!     println!("root task ran here: {total}");
//! }
//! # Ok::<(), colony::Error>(())
//! ```
//!
//! # Architecture
//!
//! - One control loop per worker owns the execution token: at most one task
//!   body runs per worker at any instant. Tasks suspend only inside the
//!   blocking calls on [`TaskContext`].
//! - Pending tasks wait in a creation-time priority queue whose load is the
//!   sum of statistically predicted remaining times, and an injectable
//!   balancer migrates queued tasks between workers.
//! - Transports are pluggable: an in-process channel mesh for single-host
//!   pools and tests, TCP for real clusters.

#![warn(missing_debug_implementations)]
#![allow(dead_code)] // During development

pub mod balance;
pub mod config;
pub mod control;
pub mod error;
pub mod exec;
pub mod future;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod transport;

// Re-export key types at crate root
pub use config::{BalancerKind, Config, ConfigBuilder, TransportKind};
pub use error::{Error, Result, TaskFailure};
pub use exec::TaskContext;
pub use future::{AsyncMapResult, AsyncResult, Waitable};
pub use pool::{start, start_with_transport};
pub use protocol::{TaskId, WorkerId};
pub use registry::Registry;
pub use transport::{LocalCluster, Transport};

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("square", |_ctx: &mut TaskContext, x: i64| Ok(x * x));
        registry.register("apply_square", |ctx: &mut TaskContext, x: i64| {
            ctx.apply::<_, i64>("square", x)
        });
        registry.register("map_squares", |ctx: &mut TaskContext, n: i64| {
            ctx.map::<_, i64, _>("square", 1..=n)
        });
        registry
    }

    fn solo() -> Box<dyn Transport> {
        match LocalCluster::new(1).pop() {
            Some(endpoint) => Box::new(endpoint),
            None => unreachable!(),
        }
    }

    #[test]
    fn test_single_worker_apply() {
        let result: Option<i64> =
            start_with_transport(Config::default(), registry(), solo(), "apply_square", 4i64)
                .unwrap();
        assert_eq!(result, Some(16));
    }

    #[test]
    fn test_single_worker_map() {
        let result: Option<Vec<i64>> =
            start_with_transport(Config::default(), registry(), solo(), "map_squares", 4i64)
                .unwrap();
        assert_eq!(result, Some(vec![1, 4, 9, 16]));
    }

    #[test]
    fn test_unregistered_root_target_is_rejected() {
        let result: Result<Option<i64>> =
            start_with_transport(Config::default(), registry(), solo(), "missing", 1i64);
        assert!(matches!(result, Err(Error::UnknownTarget(_))));
    }
}
