//! In-process full mesh over channels.
//!
//! Used for single-host pools and by the integration tests: every endpoint
//! of a [`LocalCluster`] can be handed to one thread running a control loop,
//! and together they behave like a pool of separate worker processes.

use super::Transport;
use crate::protocol::{Envelope, WorkerId};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Builder for a fully connected set of in-process endpoints.
#[derive(Debug)]
pub struct LocalCluster;

impl LocalCluster {
    /// Build `n` connected endpoints; endpoint `i` gets worker id `i`.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(n: usize) -> Vec<LocalTransport> {
        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| LocalTransport {
                id: WorkerId(i as u32),
                size: n,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    id: WorkerId,
    size: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
}

impl Transport for LocalTransport {
    fn pool_size(&self) -> usize {
        self.size
    }

    fn self_id(&self) -> WorkerId {
        self.id
    }

    fn iter_ids(&self) -> Vec<WorkerId> {
        (0..self.size as u32).map(WorkerId).collect()
    }

    fn send(&self, env: Envelope) {
        if let Some(peer) = self.peers.get(env.receiver.0 as usize) {
            // an exited peer just drops the envelope
            let _ = peer.send(env);
        }
    }

    fn try_recv(&self) -> Option<Envelope> {
        self.inbox.try_recv().ok()
    }

    fn shutdown(&mut self) {
        // delivery is direct; nothing queued on our side
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use std::collections::HashMap;

    fn envelope(from: WorkerId, to: WorkerId) -> Envelope {
        Envelope {
            sender: from,
            receiver: to,
            loads: HashMap::new(),
            stats: HashMap::new(),
            prep_time: 0.0,
            send_time: 0.0,
            ack_number: 0,
            payload: Payload::RequestTask,
        }
    }

    #[test]
    fn test_mesh_delivery() {
        let mut cluster = LocalCluster::new(3);
        let c = cluster.pop().unwrap();
        let b = cluster.pop().unwrap();
        let a = cluster.pop().unwrap();

        assert_eq!(a.self_id(), WorkerId(0));
        assert!(a.is_root());
        assert!(!b.is_root());
        assert_eq!(c.pool_size(), 3);
        assert_eq!(a.iter_ids().len(), 3);

        a.send(envelope(WorkerId(0), WorkerId(2)));
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());
        let got = c.try_recv().unwrap();
        assert_eq!(got.sender, WorkerId(0));
    }

    #[test]
    fn test_send_to_exited_peer_is_dropped() {
        let mut cluster = LocalCluster::new(2);
        let b = cluster.pop().unwrap();
        let a = cluster.pop().unwrap();
        drop(b);
        // must not panic or block
        a.send(envelope(WorkerId(0), WorkerId(1)));
    }
}
