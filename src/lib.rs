pub mod geometry;
pub mod load;
pub mod merge;
pub mod quadtree;
pub mod settings;
pub mod tile;
mod utils;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use geometry::GeometryPool;
use load::{DataLayer, LoadScheduler};
use merge::{CompileContext, Merger};
use quadtree::{TerrainTileHost, TileRegistry, Traversal};
use settings::TerrainSettings;
use tile::{ProfileId, TileKey};

pub use utils::clock::{FrameClock, FrameStamp};

#[derive(Debug)]
pub enum EngineError {
    Settings(settings::SettingsError),
    Scheduler(rayon::ThreadPoolBuildError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Settings(err) => write!(f, "settings error: {err}"),
            EngineError::Scheduler(err) => write!(f, "failed to build load scheduler: {err}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Settings(err) => Some(err),
            EngineError::Scheduler(err) => Some(err),
        }
    }
}

impl From<settings::SettingsError> for EngineError {
    fn from(value: settings::SettingsError) -> Self {
        EngineError::Settings(value)
    }
}

impl From<rayon::ThreadPoolBuildError> for EngineError {
    fn from(value: rayon::ThreadPoolBuildError) -> Self {
        EngineError::Scheduler(value)
    }
}

/// Information used to create a [`TerrainEngine`].
pub struct TerrainEngineInfo {
    pub settings: TerrainSettings,
    pub profile: ProfileId,
    pub layer: Arc<dyn DataLayer>,
    pub compiler: Option<Arc<dyn CompileContext>>,
}

/// The terrain streaming engine: owns the tile quadtree, the shared
/// geometry pool, the background load pool, and the merger that folds
/// finished loads into the live tiles.
///
/// Frame discipline: the thread calling [`TerrainEngine::update`] is the
/// single writer of tile state. The renderer's record traversal (which
/// calls [`TerrainEngine::ping`] for every visible tile) must not overlap
/// an `update` call; run update strictly before record each frame.
pub struct TerrainEngine {
    tiles: TileRegistry,
    merger: Arc<Merger>,
    scheduler: LoadScheduler,
    layer: Arc<dyn DataLayer>,
    compiler: Option<Arc<dyn CompileContext>>,
    geometry: Arc<GeometryPool>,
    profile: ProfileId,
    clock: FrameClock,
}

impl TerrainEngine {
    pub fn new(info: TerrainEngineInfo) -> Result<Self, EngineError> {
        info!("--INITIALIZING TERRAIN ENGINE--");
        info!(
            "Tile size: {} | SSE threshold: {} | Concurrency: {}",
            info.settings.tile_size, info.settings.screen_space_error, info.settings.concurrency
        );

        let scheduler = LoadScheduler::new(info.settings.concurrency)?;
        let geometry = Arc::new(GeometryPool::new(info.settings.skirt_ratio));
        let merger = Arc::new(Merger::new());
        merger.set_merges_per_frame(info.settings.merges_per_frame);

        let mut tiles = TileRegistry::new(info.settings, geometry.clone());
        let clock = FrameClock::new();
        tiles.seed_roots(info.profile, &clock.current());

        Ok(Self {
            tiles,
            merger,
            scheduler,
            layer: info.layer,
            compiler: info.compiler,
            geometry,
            profile: info.profile,
            clock,
        })
    }

    /// Runs one update frame: services pings collected since the last
    /// update (child creation, load dispatch, expiry), then merges
    /// completed loads into the live tiles under the per-frame budget.
    pub fn update(&mut self) -> FrameStamp {
        let stamp = self.clock.tick();
        self.tiles
            .service(&stamp, &self.scheduler, &self.layer, &self.merger);
        let merged = self
            .merger
            .update(&mut self.tiles, self.compiler.as_deref());
        if merged > 0 {
            debug!("frame {}: merged {} tiles", stamp.frame, merged);
        }
        stamp
    }

    /// Liveness report from the record traversal; see
    /// [`TerrainTileHost::ping`].
    pub fn ping(&mut self, key: &TileKey, parent_has_data: bool, traversal: &Traversal) {
        self.tiles.ping(key, parent_has_data, traversal);
    }

    pub fn host_mut(&mut self) -> &mut dyn TerrainTileHost {
        &mut self.tiles
    }

    pub fn tiles(&self) -> &TileRegistry {
        &self.tiles
    }

    pub fn merger(&self) -> &Arc<Merger> {
        &self.merger
    }

    pub fn geometry_pool(&self) -> &Arc<GeometryPool> {
        &self.geometry
    }

    pub fn frame(&self) -> u64 {
        self.clock.frame()
    }

    /// Full reset: cancels in-flight loads, drops all queued merges, and
    /// reseeds the root tiles.
    pub fn reset(&mut self) {
        info!("resetting terrain engine");
        self.merger.clear();
        self.tiles.release_all();
        self.tiles.seed_roots(self.profile, &self.clock.current());
    }
}

/// Installs the default global log subscriber. Safe to call more than
/// once; later calls are ignored.
pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
