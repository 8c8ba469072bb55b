#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};

use geode::load::{CancelToken, DataLayer, Heightfield, LoadError, TileDataPayload};
use geode::merge::{CompileContext, CompileSlot, CompiledTile};
use geode::tile::TileKey;

/// Data layer that always succeeds with a tiny solid-color raster and a
/// flat heightfield. Counts how many loads it serviced.
pub struct SolidLayer {
    pub color: [u8; 4],
    pub elevation: f32,
    pub loads: AtomicUsize,
}

impl SolidLayer {
    pub fn new() -> Self {
        Self {
            color: [0, 128, 0, 255],
            elevation: 100.0,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl DataLayer for SolidLayer {
    fn create_tile(
        &self,
        _key: &TileKey,
        cancel: &CancelToken,
    ) -> Result<TileDataPayload, LoadError> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(TileDataPayload {
            imagery: Some(RgbaImage::from_pixel(4, 4, Rgba(self.color))),
            elevation: Some(Heightfield::constant(4, self.elevation)),
        })
    }
}

/// Data layer that fails a fixed number of times before recovering.
pub struct FlakyLayer {
    pub failures_left: AtomicUsize,
    inner: SolidLayer,
}

impl FlakyLayer {
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            inner: SolidLayer::new(),
        }
    }
}

impl DataLayer for FlakyLayer {
    fn create_tile(
        &self,
        key: &TileKey,
        cancel: &CancelToken,
    ) -> Result<TileDataPayload, LoadError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(LoadError::Layer("transient outage".to_string()));
        }
        self.inner.create_tile(key, cancel)
    }
}

/// Data layer that always fails with the given message.
pub struct FailingLayer {
    pub message: String,
}

impl FailingLayer {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl DataLayer for FailingLayer {
    fn create_tile(
        &self,
        _key: &TileKey,
        _cancel: &CancelToken,
    ) -> Result<TileDataPayload, LoadError> {
        Err(LoadError::Layer(self.message.clone()))
    }
}

/// Compile collaborator that fulfills every slot before returning,
/// handing out sequential resource ids.
pub struct ImmediateCompiler {
    next: AtomicU64,
    pub submissions: AtomicUsize,
}

impl ImmediateCompiler {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            submissions: AtomicUsize::new(0),
        }
    }
}

impl CompileContext for ImmediateCompiler {
    fn submit(&self, _key: &TileKey, _payload: &TileDataPayload) -> CompileSlot {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let slot = CompileSlot::new();
        slot.fulfill(Ok(CompiledTile(self.next.fetch_add(1, Ordering::SeqCst))));
        slot
    }
}

/// Compile collaborator that parks every submission until the test
/// fulfills it by hand.
#[derive(Default)]
pub struct ManualCompiler {
    pub slots: Mutex<Vec<(TileKey, CompileSlot)>>,
}

impl ManualCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fulfill_all(&self, start_id: u64) {
        let mut id = start_id;
        for (_, slot) in self.slots.lock().unwrap().drain(..) {
            slot.fulfill(Ok(CompiledTile(id)));
            id += 1;
        }
    }
}

impl CompileContext for ManualCompiler {
    fn submit(&self, key: &TileKey, _payload: &TileDataPayload) -> CompileSlot {
        let slot = CompileSlot::new();
        self.slots.lock().unwrap().push((*key, slot.clone()));
        slot
    }
}

/// Polls `condition` until it holds or the timeout expires.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
