//! Name-keyed registry of target callables.
//!
//! Tasks migrate between processes, so a target cannot travel as a function
//! pointer: it travels as a name, and every worker registers the same set of
//! targets before the pool starts. The typed adapters below decode the
//! argument bytes, run the user closure, and encode the return value, keeping
//! the scheduler itself free of any knowledge of target types.

use crate::error::{Error, Result, TaskFailure};
use crate::exec::TaskContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::codec(e.to_string()))
}

pub(crate) trait Target: Send + Sync {
    fn run(&self, ctx: &mut TaskContext, arg: &[u8]) -> std::result::Result<Vec<u8>, TaskFailure>;
}

struct Adapter<A, R, F> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R, F> Target for Adapter<A, R, F>
where
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(&mut TaskContext, A) -> Result<R> + Send + Sync,
{
    fn run(&self, ctx: &mut TaskContext, arg: &[u8]) -> std::result::Result<Vec<u8>, TaskFailure> {
        let arg: A = decode(arg).map_err(TaskFailure::from)?;
        match (self.f)(ctx, arg) {
            Ok(value) => encode(&value).map_err(TaskFailure::from),
            Err(err) => Err(TaskFailure::from(err)),
        }
    }
}

/// The set of targets a worker can execute. Cheap to clone; all workers of a
/// pool must register identical names.
#[derive(Clone, Default)]
pub struct Registry {
    targets: HashMap<String, Arc<dyn Target>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`. The closure receives the task's
    /// [`TaskContext`], through which it may fan out children of its own.
    pub fn register<A, R, F>(&mut self, name: impl Into<String>, f: F)
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&mut TaskContext, A) -> Result<R> + Send + Sync + 'static,
    {
        self.targets.insert(
            name.into(),
            Arc::new(Adapter {
                f,
                _marker: PhantomData,
            }),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Target>> {
        self.targets.get(name).cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.targets.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("targets", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let bytes = encode(&(1u32, "x".to_string())).unwrap();
        let back: (u32, String) = decode(&bytes).unwrap();
        assert_eq!(back, (1, "x".to_string()));
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let mut registry = Registry::new();
        registry.register("square", |_ctx, x: i64| Ok(x * x));
        assert!(registry.contains("square"));
        assert!(!registry.contains("cube"));
        assert!(registry.get("square").is_some());
    }

    #[test]
    fn test_registry_clone_shares_targets() {
        let mut registry = Registry::new();
        registry.register("id", |_ctx, x: i64| Ok(x));
        let cloned = registry.clone();
        assert!(cloned.contains("id"));
    }
}
