//! The contract between the chunk stores and the thread that owns the region files.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Result, anyhow};
use fastnbt::Value;
use strata_anvil::ChunkPos;
use tokio::sync::oneshot;

/// Result of a request handed to a [`ChunkIo`].
///
/// Await it from async code or [`Pending::wait`] for it from a plain thread.
/// Dropping it does not cancel the request.
#[must_use = "dropping a Pending discards the outcome but not the request"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// An already completed request.
    pub fn ready(result: Result<T>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Blocks the current thread until the request completes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(worker_gone()))
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(worker_gone())))
    }
}

fn worker_gone() -> anyhow::Error {
    anyhow!("I/O worker stopped before completing the request")
}

/// Asynchronous access to the chunk tags of one region folder.
pub trait ChunkIo: Send + Sync {
    fn load_async(&self, pos: ChunkPos) -> Pending<Option<Value>>;

    /// Schedules a write; `None` deletes the chunk.
    fn store(&self, pos: ChunkPos, tag: Option<Value>) -> Pending<()>;

    /// Completes once every write pending at call time has reached the files,
    /// fsyncing them afterwards when `flush` is set.
    fn synchronize(&self, flush: bool) -> Pending<()>;

    fn close(&self) -> Result<()>;

    fn load(&self, pos: ChunkPos) -> Result<Option<Value>> {
        self.load_async(pos).wait()
    }
}
