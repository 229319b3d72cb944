//! Full-mesh TCP transport.
//!
//! Startup contract: a worker file with one `host:port` line per worker plus
//! this worker's index into it. Every pair of workers shares one connection;
//! the lower index accepts, the higher index dials and identifies itself
//! with a hello frame. Envelopes travel as length-prefixed MessagePack
//! frames, moved by one writer thread and one reader thread per connection.

use super::Transport;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, WorkerId};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct TcpTransport {
    id: WorkerId,
    size: usize,
    send_tx: Sender<Envelope>,
    recv_rx: Receiver<Envelope>,
    exit: Arc<AtomicBool>,
    streams: Vec<Option<TcpStream>>,
    writer: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    /// Establish the mesh. Blocks until every peer is connected; failure to
    /// reach one is fatal for this worker.
    pub fn connect(cfg: &Config) -> Result<Self> {
        let path = cfg
            .worker_file
            .as_ref()
            .ok_or_else(|| Error::config("tcp transport requires a worker file"))?;
        let index = cfg
            .worker_index
            .ok_or_else(|| Error::config("tcp transport requires a worker index"))?;

        let text = fs::read_to_string(path)?;
        let addrs: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        let size = addrs.len();
        if (index as usize) >= size {
            return Err(Error::config(format!(
                "worker index {index} out of range for a pool of {size}"
            )));
        }
        let id = WorkerId(index);
        let listener = TcpListener::bind(&addrs[index as usize])?;

        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

        // dial every lower index, announcing who we are
        for (peer, addr) in addrs.iter().enumerate().take(index as usize) {
            let mut stream = dial(addr)?;
            stream.write_all(&index.to_be_bytes())?;
            debug!(worker = %id, peer, "connected outbound");
            streams[peer] = Some(stream);
        }

        // accept one connection from every higher index
        for _ in (index as usize + 1)..size {
            let (mut stream, _) = listener.accept()?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello)?;
            let peer = u32::from_be_bytes(hello) as usize;
            if peer >= size || streams[peer].is_some() {
                return Err(Error::transport(format!(
                    "unexpected hello from worker {peer}"
                )));
            }
            debug!(worker = %id, peer, "accepted inbound");
            streams[peer] = Some(stream);
        }

        for stream in streams.iter().flatten() {
            let _ = stream.set_nodelay(true);
        }

        let (send_tx, send_rx) = bounded(cfg.max_inflight);
        let (recv_tx, recv_rx) = unbounded();
        let exit = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for (peer, stream) in streams.iter().enumerate() {
            if let Some(stream) = stream {
                let stream = stream.try_clone()?;
                let recv_tx = recv_tx.clone();
                readers.push(
                    thread::Builder::new()
                        .name(format!("colony-rx-{id}-{peer}"))
                        .spawn(move || reader_loop(stream, recv_tx))?,
                );
            }
        }

        let write_halves = streams
            .iter()
            .map(|stream| stream.as_ref().map(TcpStream::try_clone).transpose())
            .collect::<std::io::Result<Vec<_>>>()?;
        let writer_exit = Arc::clone(&exit);
        let idle = cfg.comm_latency;
        let writer = thread::Builder::new()
            .name(format!("colony-tx-{id}"))
            .spawn(move || writer_loop(write_halves, send_rx, writer_exit, idle))?;

        Ok(Self {
            id,
            size,
            send_tx,
            recv_rx,
            exit,
            streams,
            writer: Some(writer),
            readers,
        })
    }
}

impl Transport for TcpTransport {
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
        // bounded queue: a saturated writer back-pressures the control loop
        let _ = self.send_tx.send(env);
    }

    fn try_recv(&self) -> Option<Envelope> {
        self.recv_rx.try_recv().ok()
    }

    fn shutdown(&mut self) {
        self.exit.store(true, Ordering::Release);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        for stream in self.streams.iter().flatten() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.shutdown();
        }
    }
}

fn dial(addr: &str) -> Result<TcpStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(Error::transport(format!("cannot reach {addr}: {err}")));
                }
                // peers come up at different times; jitter the retries so a
                // whole mesh does not reconnect in lock step
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                thread::sleep(CONNECT_RETRY.mul_f64(jitter));
            }
        }
    }
}

fn reader_loop(mut stream: TcpStream, out: Sender<Envelope>) {
    loop {
        let mut len = [0u8; 4];
        if stream.read_exact(&mut len).is_err() {
            break;
        }
        let len = u32::from_be_bytes(len) as usize;
        let mut buf = vec![0u8; len];
        if stream.read_exact(&mut buf).is_err() {
            break;
        }
        match rmp_serde::from_slice::<Envelope>(&buf) {
            Ok(env) => {
                if out.send(env).is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "dropping undecodable frame"),
        }
    }
}

fn writer_loop(
    mut streams: Vec<Option<TcpStream>>,
    inbox: Receiver<Envelope>,
    exit: Arc<AtomicBool>,
    idle: Duration,
) {
    loop {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        match inbox.recv_timeout(idle.mul_f64(jitter)) {
            Ok(env) => write_frame(&mut streams, env),
            Err(RecvTimeoutError::Timeout) => {
                if exit.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // shutdown was signalled: everything already queued still goes out
    while let Ok(env) = inbox.try_recv() {
        write_frame(&mut streams, env);
    }
    for stream in streams.iter_mut().flatten() {
        let _ = stream.flush();
    }
}

fn write_frame(streams: &mut [Option<TcpStream>], env: Envelope) {
    let peer = env.receiver.0 as usize;
    let Some(stream) = streams.get_mut(peer).and_then(Option::as_mut) else {
        warn!(receiver = peer, "no connection for receiver; envelope dropped");
        return;
    };
    match rmp_serde::to_vec(&env) {
        Ok(bytes) => {
            let header = (bytes.len() as u32).to_be_bytes();
            if stream
                .write_all(&header)
                .and_then(|()| stream.write_all(&bytes))
                .is_err()
            {
                debug!(receiver = peer, "peer connection closed; envelope dropped");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode envelope"),
    }
}
