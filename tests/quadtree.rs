mod common;

use std::sync::Arc;
use std::time::Duration;

use geode::geometry::GeometryPool;
use geode::load::{DataLayer, LoadScheduler, LoadStatus};
use geode::merge::Merger;
use geode::quadtree::{TerrainTileHost, TileRegistry, TileState, Traversal};
use geode::settings::{ChildPromotionPolicy, TerrainSettings};
use geode::tile::{ProfileId, TileKey};
use geode::{FrameClock, FrameStamp};

use common::{wait_for, FailingLayer, FlakyLayer, SolidLayer};

/// Hand-rolled frame loop over the registry, merger, and scheduler,
/// standing in for the engine so tests can interleave the phases freely.
struct Fixture {
    tiles: TileRegistry,
    merger: Arc<Merger>,
    scheduler: LoadScheduler,
    layer: Arc<dyn DataLayer>,
    clock: FrameClock,
}

impl Fixture {
    fn new(settings: TerrainSettings, layer: Arc<dyn DataLayer>) -> Self {
        let pool = Arc::new(GeometryPool::new(settings.skirt_ratio));
        let scheduler = LoadScheduler::new(settings.concurrency).unwrap();
        let mut tiles = TileRegistry::new(settings, pool);
        let clock = FrameClock::new();
        tiles.seed_roots(ProfileId::GLOBAL_GEODETIC, &clock.current());
        Self {
            tiles,
            merger: Arc::new(Merger::new()),
            scheduler,
            layer,
            clock,
        }
    }

    /// One full update frame: service, then merge.
    fn frame(&mut self) -> FrameStamp {
        let stamp = self.clock.tick();
        self.tiles
            .service(&stamp, &self.scheduler, &self.layer, &self.merger);
        self.merger.update(&mut self.tiles, None);
        stamp
    }

    /// Service-only frame, as if the merge phase were skipped.
    fn frame_without_merge(&mut self) -> FrameStamp {
        let stamp = self.clock.tick();
        self.tiles
            .service(&stamp, &self.scheduler, &self.layer, &self.merger);
        stamp
    }

    fn ping(&mut self, key: &TileKey, parent_has_data: bool, stamp: FrameStamp, sse: f32) {
        self.tiles.ping(
            key,
            parent_has_data,
            &Traversal {
                stamp,
                range: 1000.0,
                screen_space_error: sse,
            },
        );
    }

    fn state(&self, key: &TileKey) -> Option<TileState> {
        self.tiles.get(key).map(|tile| tile.state())
    }
}

fn settings() -> TerrainSettings {
    TerrainSettings {
        concurrency: 2,
        min_frames_before_unload: 3,
        ..Default::default()
    }
}

fn root() -> TileKey {
    TileKey::new(0, 0, 0, ProfileId::GLOBAL_GEODETIC)
}

const COARSE: f32 = 1.0; // below the subdivision threshold
const FINE: f32 = 1000.0; // demands subdivision

#[test]
fn tile_progresses_from_created_to_populated() {
    let mut fx = Fixture::new(settings(), Arc::new(SolidLayer::new()));
    assert_eq!(fx.state(&root()), Some(TileState::Created));

    let stamp = fx.frame();
    fx.ping(&root(), true, stamp, COARSE);

    let stamp = fx.frame();
    assert_eq!(fx.state(&root()), Some(TileState::AwaitingData));
    fx.ping(&root(), true, stamp, COARSE);

    assert!(wait_for(Duration::from_secs(5), || fx.merger.pending() > 0));
    let stamp = fx.frame();
    fx.ping(&root(), true, stamp, COARSE);

    assert_eq!(fx.state(&root()), Some(TileState::Populated));
    let tile = fx.tiles.get(&root()).unwrap();
    assert!(tile.model().imagery.is_some());
    assert!(tile.model().elevation.is_some());
}

fn populate_root(fx: &mut Fixture) {
    let stamp = fx.frame();
    fx.ping(&root(), true, stamp, COARSE);
    fx.frame();
    assert!(wait_for(Duration::from_secs(5), || fx.merger.pending() > 0));
    fx.frame();
    assert_eq!(fx.state(&root()), Some(TileState::Populated));
}

#[test]
fn high_screen_space_error_spawns_children() {
    let mut fx = Fixture::new(settings(), Arc::new(SolidLayer::new()));
    populate_root(&mut fx);

    let stamp = fx.clock.current();
    fx.ping(&root(), true, stamp, FINE);
    fx.frame();

    assert_eq!(fx.state(&root()), Some(TileState::Subdividing));
    for child in root().children() {
        assert_eq!(fx.state(&child), Some(TileState::Created));
    }
    assert_eq!(fx.tiles.len(), 5);
}

fn subdivide_and_load_children(fx: &mut Fixture) {
    populate_root(fx);
    let stamp = fx.clock.current();
    fx.ping(&root(), true, stamp, FINE);
    let stamp = fx.frame();

    // request data for all four children
    for child in root().children() {
        fx.ping(&child, true, stamp, COARSE);
    }
    fx.ping(&root(), true, stamp, FINE);
    fx.frame_without_merge();
    assert!(wait_for(Duration::from_secs(5), || fx.merger.pending() == 4));
}

#[test]
fn parent_defers_once_all_children_populate() {
    let mut fx = Fixture::new(settings(), Arc::new(SolidLayer::new()));
    subdivide_and_load_children(&mut fx);

    let stamp = fx.clock.current();
    for child in root().children() {
        fx.ping(&child, true, stamp, COARSE);
    }
    fx.ping(&root(), true, stamp, FINE);
    fx.frame();

    for child in root().children() {
        assert_eq!(fx.state(&child), Some(TileState::Populated));
    }
    assert_eq!(fx.state(&root()), Some(TileState::ChildrenActive));
}

#[test]
fn partial_promotion_policy_defers_earlier() {
    let mut cfg = settings();
    cfg.child_promotion = ChildPromotionPolicy::Partial(2);
    cfg.merges_per_frame = 2;
    let mut fx = Fixture::new(cfg, Arc::new(SolidLayer::new()));
    fx.merger.set_merges_per_frame(2);
    subdivide_and_load_children(&mut fx);

    let stamp = fx.clock.current();
    for child in root().children() {
        fx.ping(&child, true, stamp, COARSE);
    }
    fx.ping(&root(), true, stamp, FINE);
    fx.frame();

    // only two children merged this frame, which satisfies the policy
    let populated = root()
        .children()
        .iter()
        .filter(|c| fx.tiles.get(c).map_or(false, |t| t.is_populated()))
        .count();
    assert_eq!(populated, 2);
    assert_eq!(fx.state(&root()), Some(TileState::ChildrenActive));
}

#[test]
fn unpinged_children_are_pruned_and_parent_falls_back() {
    let mut fx = Fixture::new(settings(), Arc::new(SolidLayer::new()));
    subdivide_and_load_children(&mut fx);

    let stamp = fx.clock.current();
    for child in root().children() {
        fx.ping(&child, true, stamp, COARSE);
    }
    fx.ping(&root(), true, stamp, FINE);
    fx.frame();
    assert_eq!(fx.state(&root()), Some(TileState::ChildrenActive));

    // stop pinging the children; keep the root alive
    for _ in 0..6 {
        let stamp = fx.frame();
        fx.ping(&root(), true, stamp, COARSE);
    }

    for child in root().children() {
        assert!(fx.tiles.get(&child).is_none(), "child expired");
    }
    assert_eq!(fx.state(&root()), Some(TileState::Populated));
    assert_eq!(fx.tiles.len(), 1);
}

#[test]
fn pruning_queued_tiles_discards_their_merges() {
    // Scenario: loads complete, the tiles are pruned before the merge
    // phase ever runs, and the queued entries must disappear with them.
    let mut fx = Fixture::new(settings(), Arc::new(SolidLayer::new()));
    subdivide_and_load_children(&mut fx);
    assert_eq!(fx.merger.pending(), 4);

    // service-only frames with no child pings until they expire
    for _ in 0..6 {
        let stamp = fx.frame_without_merge();
        fx.ping(&root(), true, stamp, COARSE);
    }

    for child in root().children() {
        assert!(fx.tiles.get(&child).is_none());
    }
    assert_eq!(fx.merger.pending(), 0, "queued merges removed with the tiles");
    assert_eq!(fx.merger.update(&mut fx.tiles, None), 0);
}

#[test]
fn root_tiles_never_expire() {
    let mut fx = Fixture::new(settings(), Arc::new(SolidLayer::new()));
    assert!(fx.tiles.get(&root()).unwrap().do_not_expire());

    // never ping the root at all
    for _ in 0..10 {
        fx.frame();
    }
    assert_eq!(fx.tiles.len(), 1);
}

#[test]
fn failed_load_leaves_tile_awaiting_with_retry() {
    let mut fx = Fixture::new(settings(), Arc::new(FailingLayer::new("offline")));

    let stamp = fx.frame();
    fx.ping(&root(), true, stamp, COARSE);
    fx.frame();
    assert!(wait_for(Duration::from_secs(5), || {
        fx.tiles.get(&root()).unwrap().load_status() == Some(LoadStatus::Failed)
    }));

    let stamp = fx.clock.current();
    fx.ping(&root(), true, stamp, COARSE);

    let tile = fx.tiles.get(&root()).unwrap();
    assert_eq!(tile.state(), TileState::AwaitingData);
    assert!(tile.retry_pending());
    assert_eq!(tile.last_error(), Some("offline"));
    assert!(!tile.is_populated());
}

#[test]
fn transient_failures_recover_on_retry() {
    let mut fx = Fixture::new(settings(), Arc::new(FlakyLayer::new(1)));

    let mut stamp = fx.frame();
    for _ in 0..40 {
        fx.ping(&root(), true, stamp, COARSE);
        stamp = fx.frame();
        if fx.state(&root()) == Some(TileState::Populated) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(fx.state(&root()), Some(TileState::Populated));
}

#[test]
fn child_loads_wait_for_parent_data() {
    let mut fx = Fixture::new(settings(), Arc::new(SolidLayer::new()));
    let stamp = fx.frame();

    // parent has no data yet; a ping must not request a load
    fx.ping(&root(), false, stamp, COARSE);
    fx.frame();
    assert_eq!(fx.state(&root()), Some(TileState::Created));
    assert_eq!(fx.merger.pending(), 0);
}

#[test]
fn subdivision_respects_max_level_of_detail() {
    let mut cfg = settings();
    cfg.max_level_of_detail = 0;
    let mut fx = Fixture::new(cfg, Arc::new(SolidLayer::new()));
    populate_root(&mut fx);

    let stamp = fx.clock.current();
    fx.ping(&root(), true, stamp, FINE);
    fx.frame();

    assert_eq!(fx.state(&root()), Some(TileState::Populated));
    assert_eq!(fx.tiles.len(), 1, "no children beyond the LOD cap");
}
