//! Process entry point.

use crate::config::Config;
use crate::control::Control;
use crate::error::{Error, Result};
use crate::protocol::Outcome;
use crate::registry::{decode, encode, Registry};
use crate::stats;
use crate::transport::{self, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

/// Run this worker to completion.
///
/// Call exactly once per process, on every worker of the pool. The transport
/// named by `cfg` is built here; its designated root worker seeds one task
/// wrapping `target(arg)`, every other worker starts with an empty queue and
/// waits for migrated work. The call returns when the pool shuts down:
/// `Ok(Some(value))` on whichever worker actually ran the root task to
/// completion (ownership may migrate), `Ok(None)` everywhere else, and the
/// root task's failure as an error.
pub fn start<A, R>(cfg: Config, registry: Registry, target: &str, arg: A) -> Result<Option<R>>
where
    A: Serialize,
    R: DeserializeOwned,
{
    cfg.validate()?;
    let endpoint = transport::build(&cfg)?;
    start_with_transport(cfg, registry, endpoint, target, arg)
}

/// [`start`] over an explicit transport endpoint. This is how in-process
/// pools wire several workers into one [`crate::transport::LocalCluster`]
/// mesh, each worker driven by its own thread.
pub fn start_with_transport<A, R>(
    cfg: Config,
    registry: Registry,
    endpoint: Box<dyn Transport>,
    target: &str,
    arg: A,
) -> Result<Option<R>>
where
    A: Serialize,
    R: DeserializeOwned,
{
    cfg.validate()?;
    if !registry.contains(target) {
        return Err(Error::UnknownTarget(target.to_string()));
    }
    let arg = encode(&arg)?;

    // one-time benchmark; every duration this worker records is expressed
    // relative to it
    let ref_time = stats::calibrate();
    info!(
        worker = %endpoint.self_id(),
        pool = endpoint.pool_size(),
        ref_time,
        "worker online"
    );

    let mut control = Control::new(cfg, registry, endpoint, ref_time);
    if control.is_root() {
        control.seed_root(target, arg);
    }

    match control.run()? {
        None => Ok(None),
        Some(outcomes) => match outcomes.into_iter().next() {
            Some(Outcome::Value(bytes)) => Ok(Some(decode(&bytes)?)),
            Some(Outcome::Failure(failure)) => Err(Error::Task(failure)),
            None => Err(Error::scheduler("root task produced no outcome")),
        },
    }
}
