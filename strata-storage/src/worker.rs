//! One thread per region folder, owning every region file of it.
//!
//! Requests (loads, write registrations, synchronization barriers) are
//! answered first. Registered writes are coalesced per chunk and flushed to
//! the files one at a time, oldest first, whenever no request is waiting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow, bail};
use fastnbt::Value;
use log::{debug, error, warn};
use strata_anvil::{ChunkPos, RegionFileStorage};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::sync::oneshot;

use crate::io::{ChunkIo, Pending};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Task {
    Load { pos: ChunkPos, reply: Reply<Option<Value>> },
    Store { pos: ChunkPos, tag: Option<Value>, reply: Reply<()> },
    Synchronize { flush: bool, reply: Reply<()> },
    Shutdown,
}

pub struct IoWorker {
    name: String,
    sender: UnboundedSender<Task>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_requested: AtomicBool,
}

impl IoWorker {
    pub fn new(storage: RegionFileStorage, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = WorkerState::new(storage);
        let thread = std::thread::Builder::new()
            .name(format!("IOWorker-{name}"))
            .spawn(move || state.run(receiver))
            .with_context(|| format!("Failed to spawn I/O worker {name}"))?;

        Ok(Self {
            name,
            sender,
            thread: Mutex::new(Some(thread)),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn submit<T>(&self, make: impl FnOnce(Reply<T>) -> Task) -> Pending<T> {
        if self.shutdown_requested.load(Ordering::Acquire) {
            return Pending::ready(Err(anyhow!("I/O worker {} is shut down", self.name)));
        }
        let (reply, pending) = Pending::channel();
        // A closed channel drops the reply, which the Pending reports as an error
        let _ = self.sender.send(make(reply));
        pending
    }
}

impl ChunkIo for IoWorker {
    fn load_async(&self, pos: ChunkPos) -> Pending<Option<Value>> {
        self.submit(|reply| Task::Load { pos, reply })
    }

    fn store(&self, pos: ChunkPos, tag: Option<Value>) -> Pending<()> {
        self.submit(|reply| Task::Store { pos, tag, reply })
    }

    fn synchronize(&self, flush: bool) -> Pending<()> {
        self.submit(|reply| Task::Synchronize { flush, reply })
    }

    /// Writes every pending chunk, then closes the region files. Only the
    /// first call does anything.
    fn close(&self) -> Result<()> {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.sender.send(Task::Shutdown);

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                bail!("I/O worker {} panicked", self.name);
            }
        }
        Ok(())
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close I/O worker {}: {:#}", self.name, e);
        }
    }
}

struct PendingStore {
    tag: Option<Value>,
    waiters: Vec<Reply<()>>,
}

struct Barrier {
    waiting_for: HashSet<ChunkPos>,
    flush: bool,
    reply: Reply<()>,
    // First write of `waiting_for` that failed
    failed: Option<anyhow::Error>,
}

struct WorkerState {
    storage: RegionFileStorage,
    order: VecDeque<ChunkPos>,
    pending: HashMap<ChunkPos, PendingStore>,
    barriers: Vec<Barrier>,
}

impl WorkerState {
    fn new(storage: RegionFileStorage) -> Self {
        Self {
            storage,
            order: VecDeque::new(),
            pending: HashMap::new(),
            barriers: Vec::new(),
        }
    }

    fn run(mut self, mut receiver: UnboundedReceiver<Task>) {
        loop {
            match receiver.try_recv() {
                Ok(Task::Shutdown) => break,
                Ok(task) => {
                    self.handle(task);
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if self.store_next_pending() {
                continue;
            }

            match receiver.blocking_recv() {
                Some(Task::Shutdown) | None => break,
                Some(task) => self.handle(task),
            }
        }

        while self.store_next_pending() {}
        if let Err(e) = self.storage.close() {
            error!("Failed to close storage {}: {:#}", self.storage.folder().display(), e);
        }
        debug!("I/O worker for {} stopped", self.storage.folder().display());
    }

    fn handle(&mut self, task: Task) {
        match task {
            Task::Load { pos, reply } => {
                let result = match self.pending.get(&pos) {
                    Some(store) => Ok(store.tag.clone()),
                    None => self.storage.read(pos).inspect_err(|e| {
                        warn!("Failed to read chunk {pos}: {e:#}");
                    }),
                };
                let _ = reply.send(result);
            }
            Task::Store { pos, tag, reply } => match self.pending.get_mut(&pos) {
                Some(store) => {
                    store.tag = tag;
                    store.waiters.push(reply);
                }
                None => {
                    self.order.push_back(pos);
                    self.pending.insert(pos, PendingStore { tag, waiters: vec![reply] });
                }
            },
            Task::Synchronize { flush, reply } => {
                let barrier = Barrier {
                    waiting_for: self.pending.keys().copied().collect(),
                    flush,
                    reply,
                    failed: None,
                };
                if barrier.waiting_for.is_empty() {
                    self.release(barrier);
                } else {
                    self.barriers.push(barrier);
                }
            }
            Task::Shutdown => {}
        }
    }

    /// Writes the oldest pending chunk. Returns false if nothing was pending.
    fn store_next_pending(&mut self) -> bool {
        let Some(pos) = self.order.pop_front() else {
            return false;
        };
        let Some(store) = self.pending.remove(&pos) else {
            return true;
        };

        let failure = match self.storage.write(pos, store.tag.as_ref()) {
            Ok(()) => {
                for waiter in store.waiters {
                    let _ = waiter.send(Ok(()));
                }
                None
            }
            Err(e) => {
                error!("Failed to store chunk {pos}: {e:#}");
                let message = format!("Failed to store chunk {pos}: {e:#}");
                for waiter in store.waiters {
                    let _ = waiter.send(Err(anyhow!("{message}")));
                }
                Some(message)
            }
        };

        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.barriers)
            .into_iter()
            .map(|mut barrier| {
                if barrier.waiting_for.remove(&pos)
                    && let Some(message) = &failure
                {
                    barrier.failed.get_or_insert_with(|| anyhow!("{message}"));
                }
                barrier
            })
            .partition(|barrier| barrier.waiting_for.is_empty());
        self.barriers = waiting;
        for barrier in done {
            self.release(barrier);
        }
        true
    }

    /// Completes a barrier. It fails if any write it waited for failed, even
    /// when the flush succeeds.
    fn release(&mut self, barrier: Barrier) {
        let result = if barrier.flush {
            self.storage.flush().inspect_err(|e| {
                warn!("Failed to synchronize chunks: {e:#}");
            })
        } else {
            Ok(())
        };
        let result = match barrier.failed {
            Some(e) => Err(e),
            None => result,
        };
        let _ = barrier.reply.send(result);
    }
}
