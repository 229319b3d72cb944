//! Pluggable transport backends.
//!
//! A transport moves envelopes between workers; the control loop never cares
//! how. Delivery is best-effort: an envelope lost in transit is lost, there
//! is no redelivery or retry anywhere in the pool.

pub mod local;
pub mod tcp;

pub use local::{LocalCluster, LocalTransport};
pub use tcp::TcpTransport;

use crate::config::{Config, TransportKind};
use crate::error::{Error, Result};
use crate::protocol::{Envelope, WorkerId};

pub trait Transport: Send {
    /// Number of workers in the pool.
    fn pool_size(&self) -> usize;

    /// This worker's identity.
    fn self_id(&self) -> WorkerId;

    /// Whether this worker seeds the root task. Backend-defined; by
    /// convention the lowest id.
    fn is_root(&self) -> bool {
        self.self_id() == WorkerId(0)
    }

    /// Every worker id in the pool, including our own.
    fn iter_ids(&self) -> Vec<WorkerId>;

    /// Queue an envelope for delivery. Does not wait for the receiver; only
    /// a full in-flight bound may briefly hold the caller back.
    fn send(&self, env: Envelope);

    /// Pop the next delivered envelope, if any.
    fn try_recv(&self) -> Option<Envelope>;

    /// Flush every queued outbound envelope, then release io resources. The
    /// worker process must not exit before this returns.
    fn shutdown(&mut self);
}

/// Build the transport selected by `cfg`.
///
/// The `local` backend built this way is a pool of one; multi-worker
/// in-process meshes are assembled explicitly through [`LocalCluster`].
pub fn build(cfg: &Config) -> Result<Box<dyn Transport>> {
    match cfg.transport {
        TransportKind::Local => match LocalCluster::new(1).pop() {
            Some(endpoint) => Ok(Box::new(endpoint)),
            None => Err(Error::transport("empty local cluster")),
        },
        TransportKind::Tcp => Ok(Box::new(TcpTransport::connect(cfg)?)),
    }
}
