//! Result handles for the non-blocking fan-out calls.

use crate::error::{Error, Result, TaskFailure};
use crate::exec::{BucketId, TaskContext};
use crate::protocol::Outcome;
use crate::registry::decode;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// Completion slot shared between an async handle and the control loop.
/// Written exactly once, when the handle's bucket drains.
#[derive(Debug, Default)]
pub(crate) struct FutureSlot {
    inner: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    ready: bool,
    slots: Vec<Outcome>,
    failure: Option<TaskFailure>,
}

impl FutureSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fulfill(&self, slots: Vec<Outcome>, failure: Option<TaskFailure>) {
        let mut state = self.inner.lock();
        state.slots = slots;
        state.failure = failure;
        state.ready = true;
    }

    fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    fn read(&self) -> Result<(Vec<Outcome>, Option<TaskFailure>)> {
        let state = self.inner.lock();
        if !state.ready {
            return Err(Error::NotReady);
        }
        Ok((state.slots.clone(), state.failure.clone()))
    }
}

/// Anything [`TaskContext::wait_any`]/[`TaskContext::wait_all`] can wait on.
pub trait Waitable {
    fn bucket(&self) -> BucketId;
    fn is_ready(&self) -> bool;
}

/// Handle returned by [`TaskContext::apply_async`].
#[derive(Debug)]
pub struct AsyncResult<R> {
    bucket: BucketId,
    slot: Arc<FutureSlot>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> AsyncResult<R> {
    pub(crate) fn new(bucket: BucketId, slot: Arc<FutureSlot>) -> Self {
        Self {
            bucket,
            slot,
            _marker: PhantomData,
        }
    }

    /// Non-blocking completion check.
    pub fn ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Suspend the calling task until the result is available.
    pub fn wait(&self, ctx: &mut TaskContext) -> Result<()> {
        if self.ready() {
            return Ok(());
        }
        ctx.wait_all(&[self as &dyn Waitable])
    }

    /// Whether the child completed without failure. Errs when called before
    /// the result is ready.
    pub fn successful(&self) -> Result<bool> {
        let (_, failure) = self.slot.read()?;
        Ok(failure.is_none())
    }
}

impl<R: DeserializeOwned> AsyncResult<R> {
    /// Block if needed, then return the value or re-raise the recorded
    /// failure.
    pub fn get(&self, ctx: &mut TaskContext) -> Result<R> {
        self.wait(ctx)?;
        let (slots, failure) = self.slot.read()?;
        if let Some(failure) = failure {
            return Err(Error::Task(failure));
        }
        match slots.into_iter().next() {
            Some(Outcome::Value(bytes)) => decode(&bytes),
            Some(Outcome::Failure(failure)) => Err(Error::Task(failure)),
            None => Err(Error::scheduler("async result completed with no slot")),
        }
    }
}

impl<R> Waitable for AsyncResult<R> {
    fn bucket(&self) -> BucketId {
        self.bucket
    }

    fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }
}

/// Handle returned by [`TaskContext::map_async`].
#[derive(Debug)]
pub struct AsyncMapResult<R> {
    bucket: BucketId,
    slot: Arc<FutureSlot>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> AsyncMapResult<R> {
    pub(crate) fn new(bucket: BucketId, slot: Arc<FutureSlot>) -> Self {
        Self {
            bucket,
            slot,
            _marker: PhantomData,
        }
    }

    pub fn ready(&self) -> bool {
        self.slot.is_ready()
    }

    pub fn wait(&self, ctx: &mut TaskContext) -> Result<()> {
        if self.ready() {
            return Ok(());
        }
        ctx.wait_all(&[self as &dyn Waitable])
    }

    pub fn successful(&self) -> Result<bool> {
        let (_, failure) = self.slot.read()?;
        Ok(failure.is_none())
    }
}

impl<R: DeserializeOwned> AsyncMapResult<R> {
    /// Block if needed, then return every value in original input order, or
    /// re-raise the bucket's sticky first failure.
    pub fn get(&self, ctx: &mut TaskContext) -> Result<Vec<R>> {
        self.wait(ctx)?;
        let (slots, failure) = self.slot.read()?;
        if let Some(failure) = failure {
            return Err(Error::Task(failure));
        }
        slots
            .into_iter()
            .map(|outcome| match outcome {
                Outcome::Value(bytes) => decode(&bytes),
                Outcome::Failure(failure) => Err(Error::Task(failure)),
            })
            .collect()
    }
}

impl<R> Waitable for AsyncMapResult<R> {
    fn bucket(&self) -> BucketId {
        self.bucket
    }

    fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_starts_pending() {
        let slot = FutureSlot::new();
        assert!(!slot.is_ready());
        assert!(matches!(slot.read(), Err(Error::NotReady)));
    }

    #[test]
    fn test_slot_fulfill() {
        let slot = FutureSlot::new();
        slot.fulfill(vec![Outcome::Value(vec![1, 2])], None);
        assert!(slot.is_ready());
        let (slots, failure) = slot.read().unwrap();
        assert_eq!(slots.len(), 1);
        assert!(failure.is_none());
    }

    #[test]
    fn test_handle_reports_failure() {
        let slot = Arc::new(FutureSlot::new());
        let failure = TaskFailure::new("ValueError", "x");
        slot.fulfill(
            vec![Outcome::Failure(failure.clone())],
            Some(failure.clone()),
        );
        let handle: AsyncResult<i64> = AsyncResult::new(BucketId(0), Arc::clone(&slot));
        assert!(handle.ready());
        assert_eq!(handle.successful().unwrap(), false);
    }

    #[test]
    fn test_successful_before_ready_errs() {
        let handle: AsyncResult<i64> = AsyncResult::new(BucketId(0), Arc::new(FutureSlot::new()));
        assert!(matches!(handle.successful(), Err(Error::NotReady)));
    }
}
