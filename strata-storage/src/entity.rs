//! Per-chunk entity lists.
//!
//! Loads go through the I/O worker and are decoded on the blocking pool of
//! the storage's runtime. Chunks known to hold no entities are remembered so
//! they never hit the disk again.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use fastnbt::{IntArray, Value};
use log::{error, warn};
use strata_anvil::ChunkPos;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::datafix::{DataFixType, DataFixer};
use crate::io::{ChunkIo, Pending};
use crate::tag;

const ENTITIES_KEY: &str = "Entities";
const POSITION_KEY: &str = "Position";

pub trait EntityCodec<E>: Send + Sync {
    /// Decodes the stored list. Entities that fail to decode are left out.
    fn load_all(&self, pos: ChunkPos, entities: &[Value]) -> Vec<E>;

    /// `None` for entities that are not persisted.
    fn save(&self, entity: &E) -> Option<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntities<E> {
    pos: ChunkPos,
    entities: Vec<E>,
}

impl<E> ChunkEntities<E> {
    pub fn new(pos: ChunkPos, entities: Vec<E>) -> Self {
        Self { pos, entities }
    }

    pub fn empty(pos: ChunkPos) -> Self {
        Self::new(pos, Vec::new())
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn entities(&self) -> &[E] {
        &self.entities
    }

    pub fn into_entities(self) -> Vec<E> {
        self.entities
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct EntityStorage<E> {
    io: Arc<dyn ChunkIo>,
    codec: Arc<dyn EntityCodec<E>>,
    fixer: Arc<dyn DataFixer>,
    data_version: i32,
    empty_chunks: Arc<Mutex<HashSet<ChunkPos>>>,
    executor: Handle,
    in_flight: Arc<InFlight>,
}

impl<E: Send + 'static> EntityStorage<E> {
    pub fn new(
        io: Arc<dyn ChunkIo>,
        codec: Arc<dyn EntityCodec<E>>,
        fixer: Arc<dyn DataFixer>,
        data_version: i32,
        executor: Handle,
    ) -> Self {
        Self {
            io,
            codec,
            fixer,
            data_version,
            empty_chunks: Arc::default(),
            executor,
            in_flight: Arc::default(),
        }
    }

    /// Loads the entities of `pos`. The disk request is queued immediately,
    /// so it is ordered after every store issued before this call.
    ///
    /// Never fails: unreadable chunks come back empty. A panic while decoding
    /// is resumed on the awaiting task.
    pub fn load_entities(
        &self,
        pos: ChunkPos,
    ) -> impl Future<Output = ChunkEntities<E>> + Send + use<E> {
        let known_empty = self.empty_chunks().contains(&pos);
        let task = (!known_empty).then(|| self.spawn_load(pos));
        async move {
            let Some(task) = task else {
                return ChunkEntities::empty(pos);
            };
            match task.await {
                Ok(entities) => entities,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    error!("Loading entities of chunk {pos} was cancelled: {e}");
                    ChunkEntities::empty(pos)
                }
            }
        }
    }

    fn spawn_load(&self, pos: ChunkPos) -> JoinHandle<ChunkEntities<E>> {
        let load = self.io.load_async(pos);
        let guard = InFlightGuard::new(&self.in_flight);
        let codec = Arc::clone(&self.codec);
        let fixer = Arc::clone(&self.fixer);
        let empty_chunks = Arc::clone(&self.empty_chunks);
        let data_version = self.data_version;

        self.executor.spawn(async move {
            let _guard = guard;
            let tag = match load.await {
                Ok(Some(tag)) => tag,
                Ok(None) => {
                    lock(&empty_chunks).insert(pos);
                    return ChunkEntities::empty(pos);
                }
                Err(e) => {
                    error!("Failed to read chunk {pos}: {e:#}");
                    return ChunkEntities::empty(pos);
                }
            };

            let decode = tokio::task::spawn_blocking(move || {
                read_entities(pos, tag, codec.as_ref(), fixer.as_ref(), data_version)
            });
            match decode.await {
                Ok(entities) => ChunkEntities::new(pos, entities),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    error!("Decoding entities of chunk {pos} was cancelled: {e}");
                    ChunkEntities::empty(pos)
                }
            }
        })
    }

    pub fn store_entities(&self, entities: &ChunkEntities<E>) {
        let pos = entities.pos();
        if entities.is_empty() {
            if self.empty_chunks().insert(pos) {
                self.log_failure(pos, self.io.store(pos, None));
            }
            return;
        }

        let list = entities
            .entities()
            .iter()
            .filter_map(|entity| self.codec.save(entity))
            .collect();
        let mut chunk = tag::compound([
            (ENTITIES_KEY, Value::List(list)),
            (POSITION_KEY, Value::IntArray(IntArray::new(vec![pos.x, pos.z]))),
        ]);
        tag::set_data_version(&mut chunk, self.data_version);

        self.log_failure(pos, self.io.store(pos, Some(chunk)));
        self.empty_chunks().remove(&pos);
    }

    /// Waits until the worker has written everything queued so far (fsyncing
    /// when `sync`) and every started load has been decoded.
    pub async fn flush(&self, sync: bool) -> Result<()> {
        self.io.synchronize(sync).await?;
        self.in_flight.wait_idle().await;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.io.close()
    }

    fn log_failure(&self, pos: ChunkPos, store: Pending<()>) {
        self.executor.spawn(async move {
            if let Err(e) = store.await {
                error!("Failed to store chunk {pos}: {e:#}");
            }
        });
    }

    fn empty_chunks(&self) -> MutexGuard<'_, HashSet<ChunkPos>> {
        lock(&self.empty_chunks)
    }
}

fn lock(set: &Mutex<HashSet<ChunkPos>>) -> MutexGuard<'_, HashSet<ChunkPos>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_chunk_pos(chunk: &Value) -> Option<ChunkPos> {
    match tag::get(chunk, POSITION_KEY)? {
        Value::IntArray(coords) if coords.len() == 2 => Some(ChunkPos::new(coords[0], coords[1])),
        _ => None,
    }
}

fn read_entities<E>(
    pos: ChunkPos,
    chunk: Value,
    codec: &dyn EntityCodec<E>,
    fixer: &dyn DataFixer,
    data_version: i32,
) -> Vec<E> {
    match read_chunk_pos(&chunk) {
        Some(stored) if stored != pos => {
            error!("Chunk file at {pos} is in the wrong location. (Expected {pos}, got {stored})")
        }
        Some(_) => {}
        None => warn!("Failed to parse chunk {pos} position info"),
    }

    let stored_version = tag::data_version(&chunk).unwrap_or(-1);
    let chunk = fixer.update(DataFixType::EntityChunk, chunk, stored_version, data_version);
    match tag::get(&chunk, ENTITIES_KEY) {
        Some(Value::List(list)) => codec.load_all(pos, list),
        _ => Vec::new(),
    }
}
