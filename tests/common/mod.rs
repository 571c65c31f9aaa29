//! Shared fixtures for the end-to-end scenario tests

use glam::Vec3;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use strata_engine::assets::{EntityTemplate, LevelTemplate, PackageCatalog, PackageTemplate};
use strata_engine::entity::{EntityId, EntityScript, EntityState, GameScript, PreLoginDecision};
use strata_engine::streaming::{StreamingPolicy, StreamingRef};
use strata_engine::{Engine, EngineConfig, EntityClass, Guid};

pub const DM_FOO_GUID: Guid = Guid([1; 16]);
pub const L2_GUID: Guid = Guid([2; 16]);

/// Counters shared between a test and the script objects it plants
#[derive(Debug, Default)]
pub struct ScriptCounters {
    pub pre_begin_play: u32,
    pub begin_play: u32,
    pub ticks: u32,
    pub on_remove_from_world: u32,
    pub notify_loaded_world: Vec<(String, bool)>,
}

pub type SharedCounters = Rc<RefCell<ScriptCounters>>;

/// Entity script that records every hook invocation
pub struct RecordingScript {
    pub counters: SharedCounters,
    /// Entities this script nominates for seamless preservation
    pub travel_list: Vec<EntityId>,
}

impl RecordingScript {
    pub fn new(counters: SharedCounters) -> Self {
        RecordingScript {
            counters,
            travel_list: Vec::new(),
        }
    }
}

impl EntityScript for RecordingScript {
    fn pre_begin_play(&mut self, _state: &mut EntityState) {
        self.counters.borrow_mut().pre_begin_play += 1;
    }

    fn begin_play(&mut self, _state: &mut EntityState) {
        self.counters.borrow_mut().begin_play += 1;
    }

    fn tick(&mut self, _state: &mut EntityState, _delta: f32) {
        self.counters.borrow_mut().ticks += 1;
    }

    fn on_remove_from_world(&mut self, _state: &mut EntityState) {
        self.counters.borrow_mut().on_remove_from_world += 1;
    }

    fn get_seamless_travel_actor_list(
        &mut self,
        _state: &EntityState,
        _to_transition: bool,
        list: &mut Vec<EntityId>,
    ) {
        list.extend(self.travel_list.iter().copied());
    }

    fn notify_loaded_world(&mut self, _state: &mut EntityState, package: &str, is_final: bool) {
        self.counters
            .borrow_mut()
            .notify_loaded_world
            .push((package.to_string(), is_final));
    }
}

/// Observable game-rules state shared with the test
#[derive(Debug, Default)]
pub struct GameEvents {
    pub init_game_options: Vec<String>,
    pub post_seamless_travel: u32,
    pub prelogin_calls: u32,
}

pub type SharedGameEvents = Rc<RefCell<GameEvents>>;

/// Game script with configurable admission and travel behavior
pub struct TestGame {
    pub events: SharedGameEvents,
    pub prelogin: PreLoginDecision,
    pub travel_list: Rc<RefCell<Vec<EntityId>>>,
    pub elect_self: bool,
}

impl TestGame {
    pub fn new(events: SharedGameEvents) -> Self {
        TestGame {
            events,
            prelogin: PreLoginDecision::Accept,
            travel_list: Rc::new(RefCell::new(Vec::new())),
            elect_self: false,
        }
    }
}

impl GameScript for TestGame {
    fn player_controller_class(&self) -> String {
        "MyGame.PC".to_string()
    }

    fn init_game(&mut self, options: &str) {
        self.events
            .borrow_mut()
            .init_game_options
            .push(options.to_string());
    }

    fn pre_login(&mut self, _options: &str, _address: &str, _player_id: u64) -> PreLoginDecision {
        self.events.borrow_mut().prelogin_calls += 1;
        self.prelogin.clone()
    }

    fn get_seamless_travel_actor_list(&mut self, _to_transition: bool, list: &mut Vec<EntityId>) {
        list.extend(self.travel_list.borrow().iter().copied());
    }

    fn post_seamless_travel(&mut self) {
        self.events.borrow_mut().post_seamless_travel += 1;
    }

    fn migrate_new_host(&mut self) -> bool {
        self.elect_self
    }
}

/// A catalog with the maps the scenarios use: an entry map, a match map
/// with one distance-streamed sub-level, a transition map and a second
/// match map.
pub fn scenario_catalog() -> Arc<RwLock<PackageCatalog>> {
    let mut catalog = PackageCatalog::new();

    // Streamed sub-level with a scripted door and a kismet sequence.
    let mut sub_level = LevelTemplate::default();
    sub_level.has_bsp = true;
    sub_level.sequences.push("L2_Sequence".to_string());
    let mut door = EntityTemplate::new("Door_1", EntityClass::new("Game.Door"));
    door.location = Vec3::new(5000.0, 0.0, 0.0);
    door.is_static = true;
    sub_level.entities.push(door);
    let mut l2 = PackageTemplate::new("L2", L2_GUID);
    l2.net_object_counts = vec![8];
    l2.level = Some(sub_level);
    catalog.add(l2);

    // The match map declares L2 as a distance-based sub-level.
    let mut dm_foo_level = LevelTemplate::default();
    dm_foo_level.has_bsp = true;
    dm_foo_level.streaming_levels.push(StreamingRef::new(
        "L2",
        L2_GUID,
        StreamingPolicy::DistanceBased {
            origin: Vec3::new(5000.0, 0.0, 0.0),
            max_distance: 8000.0,
        },
    ));
    let mut dm_foo = PackageTemplate::new("DM-Foo", DM_FOO_GUID);
    dm_foo.net_object_counts = vec![100];
    dm_foo.level = Some(dm_foo_level);
    catalog.add(dm_foo);

    for (name, word) in [
        ("EntryMap", 10u32),
        ("Transition", 11),
        ("DM-A", 12),
        ("DM-B", 13),
        ("DM-C", 14),
    ] {
        let mut package = PackageTemplate::new(name, Guid::from_words(word, 0, 0, 0));
        package.net_object_counts = vec![16];
        package.level = Some(LevelTemplate::default());
        catalog.add(package);
    }

    Arc::new(RwLock::new(catalog))
}

pub fn make_engine(asset_latency: u32) -> Engine {
    Engine::new(scenario_catalog(), EngineConfig::default(), asset_latency)
}

/// Tick two engines in lockstep, server first
pub fn pump(server: &mut Engine, client: &mut Engine, frames: u32) {
    for _ in 0..frames {
        server.tick(1.0 / 60.0, &[]);
        client.tick(1.0 / 60.0, &[]);
    }
}
