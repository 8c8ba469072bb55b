use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::load::{LoadStatus, LoadTileDataOperation, TileDataPayload};
use crate::quadtree::TileRegistry;
use crate::tile::TileKey;

/// GPU resource creation failed for one tile. The tile simply goes without
/// that resource; the merge loop is never aborted over it.
#[derive(Debug)]
pub struct CompileError {
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compile error: {}", self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<String> for CompileError {
    fn from(message: String) -> Self {
        CompileError { message }
    }
}

/// Opaque handle to a GPU-compiled tile resource, produced by the compile
/// collaborator and attached to a tile node on merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompiledTile(pub u64);

/// Shared result slot for an asynchronous compile. Polled once per frame by
/// the merger rather than awaited; `poll` claims the result when ready.
#[derive(Clone, Default)]
pub struct CompileSlot {
    inner: Arc<Mutex<Option<Result<CompiledTile, CompileError>>>>,
}

impl CompileSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the compile collaborator when the resource is ready.
    pub fn fulfill(&self, result: Result<CompiledTile, CompileError>) {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(slot.is_none(), "compile slot fulfilled twice");
        *slot = Some(result);
    }

    /// Claims the result if the compile has finished.
    pub fn poll(&self) -> Option<Result<CompiledTile, CompileError>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// The GPU-compile collaborator. Runs on its own context; it must never
/// touch the scene graph, only fill the returned slot.
pub trait CompileContext: Send + Sync {
    fn submit(&self, key: &TileKey, payload: &TileDataPayload) -> CompileSlot;
}

/// A completed load waiting on its GPU compile.
struct ToCompile {
    op: Arc<LoadTileDataOperation>,
    slot: CompileSlot,
}

struct MergerQueues {
    /// Completed loads awaiting merge, in completion order.
    merge_queue: VecDeque<Arc<LoadTileDataOperation>>,
    /// Entries parked while their GPU compile runs, still in FIFO order.
    compile_queue: Vec<ToCompile>,
    /// 0 = unlimited.
    merges_per_frame: u32,
}

/// Bridges background load results into the live tile registry.
///
/// `merge` may be called from any worker thread; `update` runs only on the
/// frame thread and is the sole writer of tile nodes in this pipeline. One
/// mutex guards both queues, so pruning can safely race a concurrent
/// enqueue.
pub struct Merger {
    queues: Mutex<MergerQueues>,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

impl Merger {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(MergerQueues {
                merge_queue: VecDeque::new(),
                compile_queue: Vec::new(),
                merges_per_frame: 0,
            }),
        }
    }

    /// Maximum number of queue entries processed per `update` call.
    /// 0 means unlimited.
    pub fn set_merges_per_frame(&self, value: u32) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merges_per_frame = value;
    }

    /// Queues a completed load for a later merge. Non-blocking; callable
    /// from any thread.
    pub fn merge(&self, op: Arc<LoadTileDataOperation>) {
        debug_assert_eq!(op.status(), LoadStatus::Completed);
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merge_queue
            .push_back(op);
    }

    /// Entries queued across both internal queues.
    pub fn pending(&self) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.merge_queue.len() + queues.compile_queue.len()
    }

    /// Drops every queued entry without merging.
    pub fn clear(&self) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.merge_queue.clear();
        queues.compile_queue.clear();
    }

    /// Removes any queued entries for a pruned tile so they are never
    /// merged. Safe against a concurrent `update` draining the queues.
    pub fn remove(&self, key: &TileKey) -> usize {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let before = queues.merge_queue.len() + queues.compile_queue.len();
        queues.merge_queue.retain(|op| op.key() != key);
        queues.compile_queue.retain(|entry| entry.op.key() != key);
        before - queues.merge_queue.len() - queues.compile_queue.len()
    }

    /// Per-frame drain: attaches up to `merges_per_frame` completed results
    /// to their live tiles. Must be called from the thread that owns the
    /// registry, during the update phase, never while a record traversal is
    /// in flight. Never blocks on compiles; entries whose compile is still
    /// running are re-checked next frame in their original order.
    ///
    /// Returns the number of entries processed (merged or discarded).
    pub fn update(
        &self,
        tiles: &mut TileRegistry,
        compiler: Option<&dyn CompileContext>,
    ) -> usize {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let budget = match queues.merges_per_frame {
            0 => usize::MAX,
            n => n as usize,
        };
        let mut processed = 0;

        // Finished compiles first, preserving queue order for the rest.
        let mut parked = Vec::new();
        for entry in queues.compile_queue.drain(..) {
            if processed >= budget {
                parked.push(entry);
                continue;
            }
            match entry.slot.poll() {
                None => parked.push(entry),
                Some(Ok(compiled)) => {
                    Self::attach(tiles, entry.op, Some(compiled));
                    processed += 1;
                }
                Some(Err(err)) => {
                    warn!("compile for {} failed: {}", entry.op.key(), err);
                    processed += 1;
                }
            }
        }
        queues.compile_queue = parked;

        // Then fresh load results. With a compiler installed, an entry makes
        // a side trip through the compile queue; that hand-off defers the
        // entry rather than consuming budget.
        while processed < budget {
            let Some(op) = queues.merge_queue.pop_front() else {
                break;
            };

            if op.status() != LoadStatus::Completed {
                debug!("dropping cancelled load for {}", op.key());
                processed += 1;
                continue;
            }

            if !tiles.contains(op.key()) {
                // Pruning is routine; a vanished target is not an error.
                debug!("discarding merge for pruned tile {}", op.key());
                processed += 1;
                continue;
            }

            if let Some(compiler) = compiler {
                let slot = op.with_payload(|payload| compiler.submit(op.key(), payload));
                match slot {
                    Some(slot) => queues.compile_queue.push(ToCompile { op, slot }),
                    None => {
                        // Payload vanished between the status check and now;
                        // treat like a cancelled entry.
                        processed += 1;
                    }
                }
                continue;
            }

            Self::attach(tiles, op, None);
            processed += 1;
        }

        processed
    }

    fn attach(tiles: &mut TileRegistry, op: Arc<LoadTileDataOperation>, compiled: Option<CompiledTile>) {
        let Some(payload) = op.take_payload() else {
            // A payload can only be claimed once; hitting this would mean
            // the same operation sat in the queue twice.
            debug_assert!(false, "load operation merged twice");
            return;
        };
        if !tiles.complete_merge(op.key(), payload, compiled) {
            debug!("merge target {} disappeared during update", op.key());
        }
    }
}
