use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use tracing::{debug, warn};

use crate::geometry::{GeometryPool, SharedGeometry};
use crate::load::{DataLayer, Heightfield, LoadScheduler, LoadStatus, LoadTileDataOperation, TileDataPayload};
use crate::merge::{CompiledTile, Merger};
use crate::settings::TerrainSettings;
use crate::tile::{ProfileId, TileKey};
use crate::utils::clock::FrameStamp;

/// What the record traversal observed for one tile this frame. The culler
/// computes range and screen-space error with its own projection math;
/// this crate only compares the error against the subdivision threshold.
#[derive(Clone, Copy, Debug)]
pub struct Traversal {
    pub stamp: FrameStamp,
    pub range: f32,
    pub screen_space_error: f32,
}

/// Lifecycle of a tile node.
///
/// `Created → AwaitingData → Populated → Subdividing → ChildrenActive`,
/// with pruning possible from any state. A `Subdividing` parent still
/// renders itself; a `ChildrenActive` parent defers to its children but is
/// retained as fallback in case they are later pruned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    Created,
    AwaitingData,
    Populated,
    Subdividing,
    ChildrenActive,
}

/// Everything the renderer needs to draw one tile: the pooled mesh, the
/// merged rasters, and the compiled GPU resource if a compile context is
/// installed. Tiles without imagery draw flat in `fallback_color`.
pub struct TileRenderModel {
    pub geometry: Arc<SharedGeometry>,
    pub imagery: Option<RgbaImage>,
    pub elevation: Option<Heightfield>,
    pub compiled: Option<CompiledTile>,
    pub fallback_color: [f32; 4],
}

/// A live quadtree node. Owned by the registry table; parent/child
/// structure is derived from the key space, so there are no ownership
/// cycles to manage.
pub struct TerrainTileNode {
    key: TileKey,
    parent: Option<TileKey>,
    state: TileState,
    do_not_expire: bool,
    retry: bool,
    last_error: Option<String>,
    last_frame: u64,
    last_time: Instant,
    last_range: f32,
    loader: Option<Arc<LoadTileDataOperation>>,
    model: TileRenderModel,
}

impl TerrainTileNode {
    fn new(
        key: TileKey,
        parent: Option<TileKey>,
        geometry: Arc<SharedGeometry>,
        fallback_color: [f32; 4],
        stamp: &FrameStamp,
    ) -> Self {
        Self {
            key,
            parent,
            state: TileState::Created,
            do_not_expire: false,
            retry: false,
            last_error: None,
            last_frame: stamp.frame,
            last_time: stamp.time,
            last_range: f32::MAX,
            loader: None,
            model: TileRenderModel {
                geometry,
                imagery: None,
                elevation: None,
                compiled: None,
                fallback_color,
            },
        }
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn parent(&self) -> Option<&TileKey> {
        self.parent.as_ref()
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    /// Whether merged data is resident, regardless of subdivision state.
    pub fn is_populated(&self) -> bool {
        matches!(
            self.state,
            TileState::Populated | TileState::Subdividing | TileState::ChildrenActive
        )
    }

    pub fn model(&self) -> &TileRenderModel {
        &self.model
    }

    pub fn do_not_expire(&self) -> bool {
        self.do_not_expire
    }

    /// Set on the seeded root tiles so the fallback coverage never expires.
    pub fn set_do_not_expire(&mut self, value: bool) {
        self.do_not_expire = value;
    }

    /// Whether the last load attempt failed and a retry is wanted.
    pub fn retry_pending(&self) -> bool {
        self.retry
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_ping_frame(&self) -> u64 {
        self.last_frame
    }

    pub fn last_range(&self) -> f32 {
        self.last_range
    }

    pub fn load_status(&self) -> Option<LoadStatus> {
        self.loader.as_ref().map(|op| op.status())
    }

    /// Attaches merged payload data to this node. Only the merger calls
    /// this, during the update phase.
    fn attach(&mut self, payload: TileDataPayload, compiled: Option<CompiledTile>) {
        if let Some(imagery) = payload.imagery {
            self.model.imagery = Some(imagery);
        }
        if let Some(elevation) = payload.elevation {
            self.model.elevation = Some(elevation);
        }
        if compiled.is_some() {
            self.model.compiled = compiled;
        }
    }

    /// Releases merged data and the compiled resource, reverting the tile
    /// to fallback rendering.
    pub fn detach(&mut self) {
        self.model.imagery = None;
        self.model.elevation = None;
        self.model.compiled = None;
    }
}

/// The contract between tiles and the system tracking which tiles are
/// active this frame. The record traversal pings every visible tile
/// through this interface; everything else reads the settings from it.
pub trait TerrainTileHost {
    fn ping(&mut self, key: &TileKey, parent_has_data: bool, traversal: &Traversal);
    fn settings(&self) -> &TerrainSettings;
}

/// Keeps track of every tile resident in the terrain. Owns the quadtree as
/// a flat key-indexed table, collects per-frame work during pings, and
/// services it (child creation, load dispatch, expiry) on the frame
/// boundary.
pub struct TileRegistry {
    settings: TerrainSettings,
    geometry: Arc<GeometryPool>,
    tiles: HashMap<TileKey, TerrainTileNode>,
    needs_children: Vec<TileKey>,
    needs_load: Vec<TileKey>,
}

impl TileRegistry {
    pub fn new(settings: TerrainSettings, geometry: Arc<GeometryPool>) -> Self {
        Self {
            settings,
            geometry,
            tiles: HashMap::new(),
            needs_children: Vec::new(),
            needs_load: Vec::new(),
        }
    }

    /// Creates the root tiles for the configured first level of detail and
    /// marks them permanent.
    pub fn seed_roots(&mut self, profile: ProfileId, stamp: &FrameStamp) {
        let level = self.settings.first_level_of_detail;
        let span = 1u32 << level;
        for y in 0..span {
            for x in 0..span {
                let key = TileKey::new(level, x, y, profile);
                let mut node = self.make_node(key, None, stamp);
                node.set_do_not_expire(true);
                self.tiles.insert(key, node);
            }
        }
        debug!("seeded {} root tiles at level {}", span * span, level);
    }

    fn make_node(&self, key: TileKey, parent: Option<TileKey>, stamp: &FrameStamp) -> TerrainTileNode {
        let geometry = self.geometry.get_or_create(self.settings.tile_size);
        TerrainTileNode::new(key, parent, geometry, self.settings.color, stamp)
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.tiles.contains_key(key)
    }

    pub fn get(&self, key: &TileKey) -> Option<&TerrainTileNode> {
        self.tiles.get(key)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TileKey> {
        self.tiles.keys()
    }

    /// Frame-boundary service pass: spawn requested children, dispatch
    /// requested loads, then expire tiles that stopped pinging. Runs on
    /// the frame thread, strictly before the record traversal.
    pub fn service(
        &mut self,
        stamp: &FrameStamp,
        scheduler: &LoadScheduler,
        layer: &Arc<dyn DataLayer>,
        merger: &Arc<Merger>,
    ) {
        let needs_children = std::mem::take(&mut self.needs_children);
        for key in needs_children {
            self.create_children(&key, stamp);
        }

        let needs_load = std::mem::take(&mut self.needs_load);
        for key in needs_load {
            self.request_load(&key, scheduler, layer, merger);
        }

        self.prune(stamp, merger.as_ref());
    }

    /// Attaches a merged payload to its target tile. Returns false if the
    /// tile was pruned in the meantime, which the merger treats as a
    /// routine discard.
    pub fn complete_merge(
        &mut self,
        key: &TileKey,
        payload: TileDataPayload,
        compiled: Option<CompiledTile>,
    ) -> bool {
        let required = self.settings.child_promotion.required() as usize;
        let parent = {
            let Some(tile) = self.tiles.get_mut(key) else {
                return false;
            };
            tile.attach(payload, compiled);
            tile.loader = None;
            tile.retry = false;
            tile.last_error = None;
            if matches!(tile.state, TileState::Created | TileState::AwaitingData) {
                tile.state = TileState::Populated;
            }
            tile.parent
        };
        if let Some(parent_key) = parent {
            self.try_promote(&parent_key, required);
        }
        true
    }

    /// Cancels everything in flight and empties the registry.
    pub fn release_all(&mut self) {
        for tile in self.tiles.values() {
            if let Some(op) = &tile.loader {
                op.cancel();
            }
        }
        self.tiles.clear();
        self.needs_children.clear();
        self.needs_load.clear();
    }

    fn create_children(&mut self, key: &TileKey, stamp: &FrameStamp) {
        match self.tiles.get(key) {
            Some(tile) if tile.state == TileState::Populated => {}
            _ => return,
        }
        for child_key in key.children() {
            if self.tiles.contains_key(&child_key) {
                continue;
            }
            let node = self.make_node(child_key, Some(*key), stamp);
            self.tiles.insert(child_key, node);
        }
        if let Some(tile) = self.tiles.get_mut(key) {
            tile.state = TileState::Subdividing;
        }
        debug!("subdividing {}", key);
    }

    fn request_load(
        &mut self,
        key: &TileKey,
        scheduler: &LoadScheduler,
        layer: &Arc<dyn DataLayer>,
        merger: &Arc<Merger>,
    ) {
        let Some(tile) = self.tiles.get_mut(key) else {
            return;
        };
        if tile.loader.is_some()
            || !matches!(tile.state, TileState::Created | TileState::AwaitingData)
        {
            return;
        }
        let op = Arc::new(LoadTileDataOperation::new(*key));
        tile.loader = Some(op.clone());
        tile.state = TileState::AwaitingData;
        tile.retry = false;
        scheduler.dispatch(op, layer.clone(), merger.clone());
    }

    fn try_promote(&mut self, key: &TileKey, required: usize) {
        match self.tiles.get(key) {
            Some(parent) if parent.state == TileState::Subdividing => {}
            _ => return,
        }
        let ready = key
            .children()
            .iter()
            .filter(|child| {
                self.tiles
                    .get(child)
                    .map_or(false, TerrainTileNode::is_populated)
            })
            .count();
        if ready >= required {
            if let Some(parent) = self.tiles.get_mut(key) {
                parent.state = TileState::ChildrenActive;
                debug!("{} deferring to children", key);
            }
        }
    }

    fn is_dormant(&self, tile: &TerrainTileNode, stamp: &FrameStamp) -> bool {
        let frames = stamp.frame.saturating_sub(tile.last_frame);
        if frames <= self.settings.min_frames_before_unload as u64 {
            return false;
        }
        stamp.time.duration_since(tile.last_time).as_secs_f64()
            >= self.settings.min_seconds_before_unload
    }

    fn subtree_dormant(&self, key: &TileKey, stamp: &FrameStamp) -> bool {
        let Some(tile) = self.tiles.get(key) else {
            return true;
        };
        if tile.do_not_expire || !self.is_dormant(tile, stamp) {
            return false;
        }
        key.children()
            .iter()
            .all(|child| !self.tiles.contains_key(child) || self.subtree_dormant(child, stamp))
    }

    /// Expires tiles that failed to ping recently. Subtrees go together so
    /// a child never outlives its parent, and a parent whose children are
    /// removed falls back to rendering itself.
    fn prune(&mut self, stamp: &FrameStamp, merger: &Merger) {
        let min_resident = self.settings.min_resident_tiles as usize;
        if self.tiles.len() <= min_resident {
            return;
        }

        let mut candidates: Vec<TileKey> = self
            .tiles
            .values()
            .filter(|tile| !tile.do_not_expire && self.is_dormant(tile, stamp))
            .map(|tile| tile.key)
            .collect();
        if candidates.is_empty() {
            return;
        }
        // Coarsest first, so a dormant ancestor claims its whole subtree.
        candidates.sort();

        let mut unloaded = 0u32;
        for key in candidates {
            if unloaded >= self.settings.max_tiles_to_unload_per_frame
                || self.tiles.len() <= min_resident
            {
                break;
            }
            if !self.tiles.contains_key(&key) {
                continue;
            }
            if !self.subtree_dormant(&key, stamp) {
                continue;
            }
            unloaded += self.remove_subtree(&key, merger);
        }

        if unloaded > 0 {
            debug!(
                "expired {} dormant tiles; {} remain resident",
                unloaded,
                self.tiles.len()
            );
        }
    }

    fn remove_subtree(&mut self, key: &TileKey, merger: &Merger) -> u32 {
        let mut count = 0;
        let mut stack = vec![*key];
        while let Some(current) = stack.pop() {
            if let Some(tile) = self.tiles.remove(&current) {
                if let Some(op) = &tile.loader {
                    op.cancel();
                }
                merger.remove(&current);
                count += 1;
                stack.extend(current.children());
            }
        }
        if let Some(parent_key) = key.parent() {
            if let Some(parent) = self.tiles.get_mut(&parent_key) {
                if matches!(
                    parent.state,
                    TileState::Subdividing | TileState::ChildrenActive
                ) {
                    parent.state = TileState::Populated;
                }
            }
        }
        count
    }
}

impl TerrainTileHost for TileRegistry {
    /// Per-frame liveness report from the record traversal. Stamps the
    /// tile, surfaces a failed load for retry, and queues work for the
    /// next service pass: a data request when the tile is empty (gated on
    /// the parent's data so loading stays progressive), or a subdivision
    /// request when the observed screen-space error demands finer detail.
    fn ping(&mut self, key: &TileKey, parent_has_data: bool, traversal: &Traversal) {
        let max_level = self.settings.max_level_of_detail;
        let sse_threshold = self.settings.screen_space_error;

        let (wants_data, wants_children) = {
            let Some(tile) = self.tiles.get_mut(key) else {
                debug!("ping for unknown tile {}", key);
                return;
            };
            tile.last_frame = traversal.stamp.frame;
            tile.last_time = traversal.stamp.time;
            tile.last_range = traversal.range;

            if let Some(op) = &tile.loader {
                match op.status() {
                    LoadStatus::Failed => {
                        warn!(
                            "tile {} load failed: {}",
                            key,
                            op.error().unwrap_or_default()
                        );
                        tile.retry = true;
                        tile.last_error = op.error();
                        tile.loader = None;
                    }
                    LoadStatus::Cancelled => {
                        tile.loader = None;
                    }
                    _ => {}
                }
            }

            let wants_data = tile.loader.is_none()
                && matches!(tile.state, TileState::Created | TileState::AwaitingData);
            let wants_children = tile.state == TileState::Populated
                && traversal.screen_space_error > sse_threshold
                && key.level < max_level;
            (wants_data, wants_children)
        };

        if wants_data && parent_has_data {
            self.needs_load.push(*key);
        }
        if wants_children {
            self.needs_children.push(*key);
        }
    }

    fn settings(&self) -> &TerrainSettings {
        &self.settings
    }
}
