use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown target `{0}`")]
    UnknownTarget(String),

    #[error("result not ready")]
    NotReady,

    #[error("worker shutting down")]
    ShuttingDown,

    #[error("task failed: {0}")]
    Task(#[from] TaskFailure),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn scheduler<S: Into<String>>(msg: S) -> Self {
        Error::Scheduler(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Error::Transport(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Error::Codec(msg.into())
    }
}

/// A target failure in a form that survives the wire.
///
/// Whatever went wrong inside a target (an `Err` return, a panic, an argument
/// that would not decode) is flattened into a kind + message pair before it is
/// shipped back to the worker where the parent waits, so no backend has to
/// serialize a live error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: String,
    pub message: String,
    pub detail: Option<String>,
}

impl TaskFailure {
    pub fn new<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail<D: Into<String>>(mut self, detail: D) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub(crate) fn panic(message: String) -> Self {
        Self::new("panic", message)
    }
}

impl From<Error> for TaskFailure {
    fn from(err: Error) -> Self {
        match err {
            // A failure that already crossed one fan-out level keeps its
            // original identity instead of being re-wrapped.
            Error::Task(failure) => failure,
            Error::Scheduler(msg) => TaskFailure::new("scheduler", msg),
            Error::Transport(msg) => TaskFailure::new("transport", msg),
            Error::Config(msg) => TaskFailure::new("config", msg),
            Error::Codec(msg) => TaskFailure::new("codec", msg),
            Error::UnknownTarget(name) => TaskFailure::new("unknown-target", name),
            Error::NotReady => TaskFailure::new("scheduler", "result not ready"),
            Error::ShuttingDown => TaskFailure::new("scheduler", "worker shutting down"),
            Error::Io(err) => TaskFailure::new("io", err.to_string()),
            Error::Other(msg) => TaskFailure::new("error", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_identity_preserved_through_error() {
        let failure = TaskFailure::new("ValueError", "x");
        let err = Error::from(failure.clone());
        assert_eq!(TaskFailure::from(err), failure);
    }

    #[test]
    fn test_failure_display() {
        let failure = TaskFailure::new("ValueError", "x");
        assert_eq!(failure.to_string(), "ValueError: x");
    }
}
