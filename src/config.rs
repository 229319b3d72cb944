use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Which transport backend moves envelopes between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Local,
    Tcp,
}

impl TransportKind {
    /// Parse a configured name. An unrecognized name falls back to the
    /// default with a warning rather than killing the worker.
    pub fn parse_or_default(name: &str) -> Self {
        match name {
            "local" => TransportKind::Local,
            "tcp" => TransportKind::Tcp,
            other => {
                warn!(
                    name = other,
                    "unknown transport backend, falling back to `local`"
                );
                TransportKind::default()
            }
        }
    }
}

/// Which load-balancing policy the control loop consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancerKind {
    #[default]
    Diffusion,
}

impl BalancerKind {
    pub fn parse_or_default(name: &str) -> Self {
        match name {
            "diffusion" => BalancerKind::Diffusion,
            other => {
                warn!(
                    name = other,
                    "unknown load balancer, falling back to `diffusion`"
                );
                BalancerKind::default()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub balancer: BalancerKind,
    /// Worker file for the tcp backend: one `host:port` line per worker.
    pub worker_file: Option<PathBuf>,
    /// This worker's line in the worker file.
    pub worker_index: Option<u32>,
    /// Seed for the balancer's rng; derived from the worker id when unset.
    pub balancer_seed: Option<u64>,
    /// How long the control loop sleeps when it has nothing to do.
    pub control_latency: Duration,
    /// Base idle interval of transport io threads, jittered per sleep.
    pub comm_latency: Duration,
    /// Bound on queued-but-unsent envelopes.
    pub max_inflight: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            balancer: BalancerKind::default(),
            worker_file: None,
            worker_index: None,
            balancer_seed: None,
            control_latency: Duration::from_millis(5),
            comm_latency: Duration::from_millis(10),
            max_inflight: 1024,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Build a config from argv-style arguments. Unknown names and malformed
    /// values are warned about and skipped; nothing here is fatal.
    pub fn from_args<I>(args: I) -> Config
    where
        I: IntoIterator<Item = String>,
    {
        let mut cfg = Config::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--transport" | "-t" => {
                    if let Some(value) = args.next() {
                        cfg.transport = TransportKind::parse_or_default(&value);
                    }
                }
                "--balancer" | "-b" => {
                    if let Some(value) = args.next() {
                        cfg.balancer = BalancerKind::parse_or_default(&value);
                    }
                }
                "--workers" | "-f" => {
                    cfg.worker_file = args.next().map(PathBuf::from);
                }
                "--index" | "-i" => {
                    if let Some(value) = args.next() {
                        match value.parse() {
                            Ok(index) => cfg.worker_index = Some(index),
                            Err(_) => warn!(value = %value, "ignoring unparsable worker index"),
                        }
                    }
                }
                "--seed" => {
                    if let Some(value) = args.next() {
                        match value.parse() {
                            Ok(seed) => cfg.balancer_seed = Some(seed),
                            Err(_) => warn!(value = %value, "ignoring unparsable balancer seed"),
                        }
                    }
                }
                other => warn!(argument = other, "ignoring unrecognized argument"),
            }
        }
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport == TransportKind::Tcp {
            if self.worker_file.is_none() {
                return Err(Error::config("tcp transport requires a worker file"));
            }
            if self.worker_index.is_none() {
                return Err(Error::config("tcp transport requires a worker index"));
            }
        }
        if self.max_inflight == 0 {
            return Err(Error::config("max_inflight must be > 0"));
        }
        if self.control_latency.is_zero() {
            return Err(Error::config("control_latency must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.transport = kind;
        self
    }

    pub fn balancer(mut self, kind: BalancerKind) -> Self {
        self.config.balancer = kind;
        self
    }

    pub fn worker_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.worker_file = Some(path.into());
        self
    }

    pub fn worker_index(mut self, index: u32) -> Self {
        self.config.worker_index = Some(index);
        self
    }

    pub fn balancer_seed(mut self, seed: u64) -> Self {
        self.config.balancer_seed = Some(seed);
        self
    }

    pub fn control_latency(mut self, latency: Duration) -> Self {
        self.config.control_latency = latency;
        self
    }

    pub fn comm_latency(mut self, latency: Duration) -> Self {
        self.config.comm_latency = latency;
        self
    }

    pub fn max_inflight(mut self, bound: usize) -> Self {
        self.config.max_inflight = bound;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_names_fall_back() {
        assert_eq!(
            TransportKind::parse_or_default("carrier-pigeon"),
            TransportKind::Local
        );
        assert_eq!(
            BalancerKind::parse_or_default("psychic"),
            BalancerKind::Diffusion
        );
    }

    #[test]
    fn test_from_args() {
        let cfg = Config::from_args(
            ["-t", "tcp", "-f", "workers.txt", "-i", "2", "--seed", "9"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(cfg.transport, TransportKind::Tcp);
        assert_eq!(cfg.worker_file, Some(PathBuf::from("workers.txt")));
        assert_eq!(cfg.worker_index, Some(2));
        assert_eq!(cfg.balancer_seed, Some(9));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_args_bad_values_are_skipped() {
        let cfg = Config::from_args(
            ["--index", "many", "--flag", "-t", "smoke-signals"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(cfg.worker_index, None);
        assert_eq!(cfg.transport, TransportKind::Local);
    }

    #[test]
    fn test_tcp_requires_worker_file() {
        let err = Config::builder()
            .transport(TransportKind::Tcp)
            .worker_index(0)
            .build();
        assert!(err.is_err());

        let ok = Config::builder()
            .transport(TransportKind::Tcp)
            .worker_file("workers.txt")
            .worker_index(0)
            .build();
        assert!(ok.is_ok());
    }
}
