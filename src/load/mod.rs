use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use image::RgbaImage;
use tracing::{debug, warn};

use crate::merge::Merger;
use crate::tile::TileKey;

/// Errors produced by the load pipeline.
#[derive(Debug)]
pub enum LoadError {
    /// The data layer could not produce a payload for the key.
    Layer(String),
    /// The owning tile was pruned before the load finished. Not a true
    /// failure; the result is simply discarded.
    Cancelled,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Layer(msg) => write!(f, "data layer error: {msg}"),
            LoadError::Cancelled => write!(f, "load cancelled"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<String> for LoadError {
    fn from(value: String) -> Self {
        LoadError::Layer(value)
    }
}

/// Cooperative cancellation flag shared between a tile, its in-flight load,
/// and the data layer servicing it.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Single-channel elevation raster for one tile.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Heightfield {
    pub size: u32,
    pub heights: Vec<f32>,
}

impl Heightfield {
    pub fn new(size: u32, heights: Vec<f32>) -> Self {
        debug_assert_eq!(heights.len(), (size * size) as usize);
        Self { size, heights }
    }

    pub fn constant(size: u32, height: f32) -> Self {
        Self {
            size,
            heights: vec![height; (size * size) as usize],
        }
    }

    fn at(&self, x: u32, y: u32) -> f32 {
        self.heights[(y * self.size + x) as usize]
    }

    /// Bilinear sample over unit tile coordinates.
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        if self.size == 0 {
            return 0.0;
        }
        let last = (self.size - 1) as f32;
        let fx = (u.clamp(0.0, 1.0) * last).min(last);
        let fy = (v.clamp(0.0, 1.0) * last).min(last);
        let x0 = fx.floor() as u32;
        let y0 = fy.floor() as u32;
        let x1 = (x0 + 1).min(self.size - 1);
        let y1 = (y0 + 1).min(self.size - 1);
        let tx = fx - x0 as f32;
        let ty = fy - y0 as f32;
        let a = self.at(x0, y0) * (1.0 - tx) + self.at(x1, y0) * tx;
        let b = self.at(x0, y1) * (1.0 - tx) + self.at(x1, y1) * tx;
        a * (1.0 - ty) + b * ty
    }
}

/// Decoded imagery and elevation for one tile, produced off the frame
/// thread and handed to the merger untouched.
#[derive(Default)]
pub struct TileDataPayload {
    pub imagery: Option<RgbaImage>,
    pub elevation: Option<Heightfield>,
}

impl TileDataPayload {
    pub fn is_empty(&self) -> bool {
        self.imagery.is_none() && self.elevation.is_none()
    }
}

/// The external data-layer collaborator: given a key, fetch and decode the
/// tile's imagery and elevation. Implementations should poll the token at
/// their own suspension points and bail out with `LoadError::Cancelled`.
pub trait DataLayer: Send + Sync {
    fn create_tile(
        &self,
        key: &TileKey,
        cancel: &CancelToken,
    ) -> Result<TileDataPayload, LoadError>;
}

/// Poll-style lifecycle of a load operation. There are no hidden await
/// points; the frame thread only ever reads this state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

struct LoadSlot {
    status: LoadStatus,
    payload: Option<TileDataPayload>,
    error: Option<String>,
}

/// One outstanding or finished fetch-and-decode job for a tile.
///
/// Owned jointly by the issuing tile (which watches its status) and the
/// merger queue (which consumes the payload exactly once). Status
/// transitions and the result slot share one lock so a cancel racing a
/// completion resolves atomically: once the payload has been stored the
/// operation stays `Completed`, otherwise `Cancelled` wins and the payload
/// is dropped.
pub struct LoadTileDataOperation {
    key: TileKey,
    token: CancelToken,
    slot: Mutex<LoadSlot>,
}

impl LoadTileDataOperation {
    pub fn new(key: TileKey) -> Self {
        Self {
            key,
            token: CancelToken::new(),
            slot: Mutex::new(LoadSlot {
                status: LoadStatus::Pending,
                payload: None,
                error: None,
            }),
        }
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn status(&self) -> LoadStatus {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn error(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }

    /// Flags the operation cancelled. A completed operation keeps its
    /// payload; anything still pending is torn down.
    pub fn cancel(&self) {
        self.token.cancel();
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.status == LoadStatus::Pending {
            slot.status = LoadStatus::Cancelled;
            slot.payload = None;
        }
    }

    /// Executes the fetch on the calling (worker) thread. Never run this on
    /// the frame thread; it blocks on layer I/O.
    pub fn run(&self, layer: &dyn DataLayer) -> Result<(), LoadError> {
        if self.token.is_cancelled() {
            self.cancel();
            return Err(LoadError::Cancelled);
        }

        match layer.create_tile(&self.key, &self.token) {
            Ok(payload) => {
                let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
                if slot.status != LoadStatus::Pending {
                    // Pruned while the layer was working; the payload is
                    // not yet visible to anyone, so it just drops.
                    return Err(LoadError::Cancelled);
                }
                slot.payload = Some(payload);
                slot.status = LoadStatus::Completed;
                Ok(())
            }
            Err(LoadError::Cancelled) => {
                self.cancel();
                Err(LoadError::Cancelled)
            }
            Err(LoadError::Layer(msg)) => {
                let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
                if slot.status == LoadStatus::Pending {
                    slot.status = LoadStatus::Failed;
                    slot.error = Some(msg.clone());
                }
                Err(LoadError::Layer(msg))
            }
        }
    }

    /// Claims the completed payload. Yields the payload at most once per
    /// operation; the merger is the only caller.
    pub fn take_payload(&self) -> Option<TileDataPayload> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.status != LoadStatus::Completed {
            return None;
        }
        slot.payload.take()
    }

    /// Borrows the completed payload without consuming it, for handing to
    /// the GPU-compile collaborator.
    pub fn with_payload<R>(&self, f: impl FnOnce(&TileDataPayload) -> R) -> Option<R> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.payload.as_ref().map(f)
    }
}

/// Bounded worker pool that runs load operations and forwards completed
/// ones to the merger.
pub struct LoadScheduler {
    pool: rayon::ThreadPool,
}

impl LoadScheduler {
    pub fn new(concurrency: u32) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1) as usize)
            .thread_name(|i| format!("geode-load-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn concurrency(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queues the operation on the pool. On success the worker hands the
    /// operation to the merger; failures and cancellations end here, with
    /// the status left on the operation for the owning tile to observe.
    pub fn dispatch(
        &self,
        op: Arc<LoadTileDataOperation>,
        layer: Arc<dyn DataLayer>,
        merger: Arc<Merger>,
    ) {
        self.pool.spawn(move || match op.run(layer.as_ref()) {
            Ok(()) => merger.merge(op),
            Err(LoadError::Cancelled) => {
                debug!("load for {} cancelled", op.key());
            }
            Err(LoadError::Layer(msg)) => {
                warn!("load for {} failed: {}", op.key(), msg);
            }
        });
    }
}
