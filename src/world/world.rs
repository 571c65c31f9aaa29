//! The world: root container for all resident levels
//!
//! Exactly one persistent level plus zero or more streamed levels. The
//! world owns the spatial hash, nav octree, physics and renderer scene
//! handles, and the net drivers; during a seamless transition ownership of
//! the drivers moves to the successor world on the same tick as the swap.

use crate::assets::{LevelTemplate, PackageTemplate};
use crate::context::EngineContext;
use crate::entity::{
    ClassTags, Entity, EntityClass, EntityId, EntityRef, EntityScript, GameScript, NetRole,
};
use crate::error::{EngineError, EngineResult};
use crate::guid::Guid;
use crate::net::NetDriver;
use crate::url::Url;
use crate::world::demo::DemoDriver;
use crate::world::level::{CrossLevelRef, Level, LevelRef, Sequence};
use crate::world::scene::{NavOctree, PhysicsScene, RendererScene, SpatialHash};
use crate::world::world_info::{NetMode, WorldInfo};
use glam::{Quat, Vec3};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::Rc;

/// Fixed slots at the head of the persistent level's actor list:
/// the world-info singleton and the default brush.
pub const FIXED_PERSISTENT_SLOTS: usize = 2;
/// Streamed levels fix only the world-info slot.
pub const FIXED_STREAMED_SLOTS: usize = 1;

/// The game-rules object: its entity plus the script driving it
pub struct GameInfo {
    pub entity: EntityRef,
    pub script: Box<dyn GameScript>,
    /// InitGame already ran; a game carried across a transition keeps it
    pub script_initialized: bool,
    /// Carried across seamless travel with the rest of the game state
    pub standby_cheat_triggered: bool,
}

/// Parameters for spawning an entity at runtime
pub struct SpawnParams {
    pub class: EntityClass,
    pub name: Option<String>,
    pub location: Vec3,
    pub rotation: Quat,
    pub is_static: bool,
    pub no_delete: bool,
    pub wants_tick: bool,
    pub remote_role: NetRole,
    pub guid: Option<Guid>,
    pub script: Option<Box<dyn EntityScript>>,
}

impl SpawnParams {
    pub fn new(class: EntityClass) -> Self {
        SpawnParams {
            class,
            name: None,
            location: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            is_static: false,
            no_delete: false,
            wants_tick: false,
            remote_role: NetRole::None,
            guid: None,
            script: None,
        }
    }
}

pub struct World {
    /// Name of the package the persistent level came from
    pub package_name: String,
    pub url: Url,
    pub info: WorldInfo,
    /// Resident levels; `levels[0]` is always the persistent level
    pub levels: Vec<LevelRef>,
    pub game: Option<GameInfo>,
    pub controllers: Vec<EntityRef>,
    pub pawns: Vec<EntityRef>,
    /// Serialization point: at most one level is mid-association
    pub current_level_pending_visibility: Option<LevelRef>,
    pub net_driver: Option<NetDriver>,
    pub peer_net_driver: Option<NetDriver>,
    pub demo_driver: Option<DemoDriver>,
    pub physics: PhysicsScene,
    pub renderer: RendererScene,
    pub spatial_hash: SpatialHash,
    pub nav_octree: NavOctree,
    pub initialized: bool,
    pub in_tick: bool,
    /// Load-request gate override: 0 lets code decide, <0 denies, >0 allows
    pub allow_level_load_override: i32,
    pub show_extent_line_checks: bool,
    pub show_line_checks: bool,
    pub show_point_checks: bool,
}

impl World {
    /// Build an empty world shell with just a world-info entity
    pub fn new(ctx: &mut EngineContext, package_name: &str, net_mode: NetMode) -> Self {
        let mut persistent = Level::new(package_name, Guid::NIL);
        let info_entity = Entity::new(
            ctx.alloc_entity_id(),
            "WorldInfo_0",
            EntityClass::world_info(),
        );
        persistent.add_actor(Rc::new(RefCell::new(info_entity)));

        World {
            package_name: package_name.to_string(),
            url: Url::default(),
            info: WorldInfo::new(net_mode),
            levels: vec![Rc::new(RefCell::new(persistent))],
            game: None,
            controllers: Vec::new(),
            pawns: Vec::new(),
            current_level_pending_visibility: None,
            net_driver: None,
            peer_net_driver: None,
            demo_driver: None,
            physics: PhysicsScene::default(),
            renderer: RendererScene::default(),
            spatial_hash: SpatialHash::default(),
            nav_octree: NavOctree::default(),
            initialized: false,
            in_tick: false,
            allow_level_load_override: 0,
            show_extent_line_checks: false,
            show_line_checks: false,
            show_point_checks: false,
        }
    }

    /// Build a world from a loaded level package
    pub fn from_package(
        ctx: &mut EngineContext,
        package: &PackageTemplate,
        net_mode: NetMode,
    ) -> EngineResult<World> {
        let template = package
            .level
            .as_ref()
            .ok_or_else(|| EngineError::PackageNotALevel {
                name: package.name.clone(),
            })?;

        let mut world = World::new(ctx, &package.name, net_mode);
        {
            let persistent = world.persistent_level();
            let mut level = persistent.borrow_mut();
            level.guid = package.guid;
            populate_level(ctx, &mut level, template);
        }
        world.info.streaming_levels = template.streaming_levels.clone();
        let persistent = world.persistent_level();
        world.register_level_entities(&persistent);
        Ok(world)
    }

    pub fn persistent_level(&self) -> LevelRef {
        self.levels[0].clone()
    }

    pub fn world_info_entity(&self) -> Option<EntityRef> {
        self.levels[0].borrow().world_info_entity()
    }

    /// Allocate shared scene resources and enforce the fixed-slot
    /// invariants, spawning a minimal default brush when missing.
    pub fn init(&mut self, ctx: &mut EngineContext) {
        self.physics.init();
        self.renderer.init();

        let persistent = self.persistent_level();
        let needs_brush = {
            let level = persistent.borrow();
            !level
                .actors
                .get(1)
                .and_then(|slot| slot.as_ref())
                .map_or(false, |e| e.borrow().state.class.tags.is_brush)
        };
        if needs_brush {
            let mut brush = Entity::new(ctx.alloc_entity_id(), "Brush_0", EntityClass::brush());
            brush.state.is_static = true;
            brush.state.no_delete = true;
            let brush = Rc::new(RefCell::new(brush));
            let mut level = persistent.borrow_mut();
            if level.actors.len() < 2 {
                level.actors.push(Some(brush));
            } else {
                level.actors.insert(1, Some(brush));
            }
        }

        self.initialized = true;
        debug!("world '{}' initialized", self.package_name);
    }

    pub fn is_server(&self) -> bool {
        self.info.is_server()
    }

    pub fn is_client(&self) -> bool {
        self.info.is_client()
    }

    pub fn has_begun_play(&self) -> bool {
        self.info.begun_play
    }

    pub fn find_entity(&self, id: EntityId) -> Option<EntityRef> {
        for level in &self.levels {
            for slot in level.borrow().actors.iter() {
                if let Some(entity) = slot {
                    if entity.borrow().state.id == id {
                        return Some(entity.clone());
                    }
                }
            }
        }
        None
    }

    pub fn add_controller(&mut self, entity: EntityRef) {
        if !self.controllers.iter().any(|c| Rc::ptr_eq(c, &entity)) {
            self.controllers.push(entity);
        }
    }

    pub fn remove_controller(&mut self, entity: &EntityRef) {
        self.controllers.retain(|c| !Rc::ptr_eq(c, entity));
    }

    pub fn add_pawn(&mut self, entity: EntityRef) {
        if !self.pawns.iter().any(|p| Rc::ptr_eq(p, &entity)) {
            self.pawns.push(entity);
        }
    }

    pub fn remove_pawn(&mut self, entity: &EntityRef) {
        self.pawns.retain(|p| !Rc::ptr_eq(p, entity));
    }

    /// Put a level's tagged entities into the world-singleton collections
    pub fn register_level_entities(&mut self, level: &LevelRef) {
        let actors: Vec<EntityRef> = level
            .borrow()
            .actors
            .iter()
            .flatten()
            .cloned()
            .collect();
        for entity in actors {
            let tags = entity.borrow().state.class.tags;
            if tags.is_controller {
                self.add_controller(entity.clone());
            }
            if tags.is_pawn {
                self.add_pawn(entity.clone());
            }
            if tags.is_nav_point {
                let id = entity.borrow().state.id;
                self.nav_octree.insert(id);
            }
        }
    }

    /// Drop a departing level's entities from the singleton collections
    pub fn unregister_level_entities(&mut self, level: &LevelRef) {
        let level_ref = level.borrow();
        let in_level = |entity: &EntityRef| level_ref.contains(entity);
        self.controllers.retain(|c| !in_level(c));
        self.pawns.retain(|p| !in_level(p));
        for slot in level_ref.actors.iter().flatten() {
            let state = slot.borrow();
            if state.state.class.tags.is_nav_point {
                self.nav_octree.remove(state.state.id);
            }
        }
    }

    /// Resolve the gametype from the URL and spawn the game-rules entity.
    /// Servers only; does nothing once a game exists.
    pub fn set_game_info(&mut self, ctx: &mut EngineContext, url: &Url) {
        if !self.is_server() || self.game.is_some() {
            return;
        }

        let requested = url.option("game").unwrap_or("").to_string();
        let remapped = ctx.remap_game_class(&requested);
        let class_path = if remapped.is_empty() {
            "Engine.GameInfo".to_string()
        } else {
            remapped
        };
        let script = ctx.create_game_script(&class_path);

        let mut entity = Entity::new(
            ctx.alloc_entity_id(),
            "GameInfo_0",
            EntityClass::with_tags(
                &class_path,
                ClassTags {
                    is_game_info: true,
                    ..Default::default()
                },
            ),
        );
        entity.state.wants_tick = true;
        let entity = Rc::new(RefCell::new(entity));
        self.persistent_level().borrow_mut().add_actor(entity.clone());

        info!("game class is '{}'", class_path);
        self.game = Some(GameInfo {
            entity,
            script,
            script_initialized: false,
            standby_cheat_triggered: false,
        });
    }

    /// Begin gameplay: init the game rules, route begin-play exactly once
    /// per entity, initialize sequences, and sort the actor lists.
    pub fn begin_play(&mut self, ctx: &mut EngineContext, url: &Url, reset_time: bool) {
        if !self.initialized {
            debug_assert!(false, "begin_play on uninitialized world");
            warn!("begin_play called on uninitialized world '{}'", self.package_name);
            return;
        }

        if reset_time {
            self.info.reset_time();
        }
        self.url = url.clone();
        let options = url.options_string();

        // Attach every entity's components before gameplay starts.
        for level in self.levels.clone() {
            self.attach_level_components(&level);
        }

        // Reset sort indices until the lists are rearranged below.
        for level in &self.levels {
            let mut level = level.borrow_mut();
            level.first_dynamic = 0;
            level.first_net_relevant = 0;
        }

        // Physics for the persistent level: BSP first, then bodies.
        let persistent = self.persistent_level();
        if persistent.borrow().has_bsp {
            self.physics.init_bsp_mesh(&self.package_name);
        }
        for slot in persistent.borrow().actors.iter().flatten() {
            let mut state = slot.borrow_mut();
            if !state.state.physics_initialized {
                self.physics.init_body(state.state.id);
                state.state.physics_initialized = true;
            }
        }

        if !self.has_begun_play() {
            info!("bringing '{}' up for play", self.package_name);
            self.info.begun_play = true;
            self.info.startup = true;

            for level in self.levels.clone() {
                route_pre_begin_play(&level);
            }

            if let Some(game) = self.game.as_mut() {
                if !game.script_initialized {
                    game.script.init_game(&options);
                    game.script_initialized = true;
                }
            }

            for level in self.levels.clone() {
                route_begin_play(&level);
            }

            // Parent and start every level's sequences.
            let root_name = format!("{}_Main_Sequence", self.package_name);
            for level in &self.levels {
                for sequence in level.borrow_mut().sequences.iter_mut() {
                    sequence.parent = Some(root_name.clone());
                    sequence.begin_play();
                }
            }

            self.info.startup = false;
        }

        for (index, level) in self.levels.clone().into_iter().enumerate() {
            let fixed = if index == 0 {
                FIXED_PERSISTENT_SLOTS
            } else {
                FIXED_STREAMED_SLOTS
            };
            level.borrow_mut().sort_actor_list(fixed);
        }

        let _ = ctx;
    }

    /// Attach all of a level's entity components in one pass
    pub fn attach_level_components(&mut self, level: &LevelRef) {
        let actors: Vec<EntityRef> = level.borrow().actors.iter().flatten().cloned().collect();
        for entity in actors {
            let mut state = entity.borrow_mut();
            let id = state.state.id;
            for component in state.state.components.iter_mut() {
                if !component.attached {
                    self.renderer.attach(id, &component.name);
                    component.attached = true;
                }
            }
            self.spatial_hash.insert(id);
        }
        level.borrow_mut().components_attached = true;
    }

    /// Detach components and drop scene registrations for a level
    pub fn detach_level_components(&mut self, level: &LevelRef) {
        let actors: Vec<EntityRef> = level.borrow().actors.iter().flatten().cloned().collect();
        for entity in actors {
            let mut state = entity.borrow_mut();
            let id = state.state.id;
            self.renderer.detach_entity(id);
            self.spatial_hash.remove(id);
            if state.state.physics_initialized {
                self.physics.term_body(id);
                state.state.physics_initialized = false;
            }
            for component in state.state.components.iter_mut() {
                component.attached = false;
            }
        }
        level.borrow_mut().components_attached = false;
    }

    /// Tear the world down at session end or before a swap
    pub fn cleanup(&mut self, ctx: &mut EngineContext, session_ended: bool) {
        for level in self.levels.clone() {
            self.detach_level_components(&level);
            for record in level.borrow_mut().cross_refs.iter_mut() {
                record.target = None;
            }
        }
        self.nav_octree.clear();
        if session_ended {
            self.info.begun_play = false;
        }
        let _ = ctx;
        debug!("world '{}' cleaned up", self.package_name);
    }

    /// Advance one frame of simulation on the game thread
    pub fn tick(&mut self, ctx: &mut EngineContext, delta: f32) {
        self.in_tick = true;
        self.info.advance_time(delta);

        crate::net::control::process_net(self, ctx);

        let tickables: Vec<EntityRef> = self
            .levels
            .iter()
            .flat_map(|level| level.borrow().tickable.clone())
            .collect();
        for entity in tickables {
            let skip = {
                let state = entity.borrow();
                state.state.pending_kill || !state.state.wants_tick
            };
            if !skip {
                Entity::route(&entity, |script, state| script.tick(state, delta));
            }
        }

        crate::migration::tick_host_migration(self, ctx, delta);

        self.in_tick = false;
    }

    /// Turn this world into a listen server on the given URL
    pub fn listen(&mut self, ctx: &mut EngineContext, url: &Url) -> EngineResult<()> {
        if self.net_driver.is_some() {
            return Ok(());
        }
        let mut driver = NetDriver::new_server(ctx.config.max_client_rate);
        driver.listen_addr = Some(format!(
            "{}:{}",
            if url.host.is_empty() { "0.0.0.0" } else { &url.host },
            url.port.unwrap_or(ctx.config.default_port)
        ));
        self.build_server_master_map(ctx, &mut driver);
        info!("listen server up at {}", driver.listen_addr.as_deref().unwrap_or("?"));
        self.net_driver = Some(driver);
        self.info.net_mode = NetMode::ListenServer;
        Ok(())
    }

    /// Fill the master package map from every package this world serves
    pub fn build_server_master_map(&self, ctx: &EngineContext, driver: &mut NetDriver) {
        driver.master_map.clear();
        let catalog = ctx.assets.catalog();
        let catalog = catalog.read();
        let mut add = |name: &str| {
            if let Some(package) = catalog.get(name) {
                driver.master_map.add_local_package(
                    &package.name,
                    package.guid,
                    package.local_generation(),
                    package.net_object_counts.clone(),
                );
            }
        };
        add(&self.package_name);
        for streaming in &self.info.streaming_levels {
            add(&streaming.package_name);
        }
    }

    /// Spawn the player controller entity for a joined connection
    pub fn spawn_player_controller(
        &mut self,
        ctx: &mut EngineContext,
        player_id: u64,
    ) -> EngineResult<EntityRef> {
        let class_path = self
            .game
            .as_ref()
            .map(|game| game.script.player_controller_class())
            .unwrap_or_else(|| "Engine.PlayerController".to_string());

        let tags = ClassTags {
            is_controller: true,
            is_player_controller: true,
            ..Default::default()
        };
        let mut params = SpawnParams::new(EntityClass::with_tags(&class_path, tags));
        params.name = Some(format!("PC_{:016X}", player_id));
        params.wants_tick = true;
        params.remote_role = NetRole::AutonomousProxy;
        crate::entity::spawn_entity(self, ctx, params, 0)
    }

    /// Close any channels referencing a destroyed or removed entity on
    /// both net drivers: the server destroys the channel, the client nulls
    /// the actor and marks it broken.
    pub fn notify_entity_destroyed(&mut self, id: EntityId) {
        for driver in [self.net_driver.as_mut(), self.peer_net_driver.as_mut()]
            .into_iter()
            .flatten()
        {
            for connection in driver.client_connections.iter_mut() {
                connection.destroy_actor_channel(id);
            }
            if let Some(server) = driver.server_connection.as_mut() {
                server.break_actor_channel(id);
            }
        }
    }

    /// Whether any level is mid-association
    pub fn is_visibility_request_pending(&self) -> bool {
        self.info
            .streaming_levels
            .iter()
            .any(|streaming| {
                streaming
                    .loaded_level
                    .as_ref()
                    .map_or(false, |level| level.borrow().init.visibility_request_pending)
            })
    }

    /// Total entity and tickable counts across resident levels
    pub fn actor_counts(&self) -> (usize, usize) {
        let mut total = 0;
        let mut tickable = 0;
        for level in &self.levels {
            let level = level.borrow();
            total += level.live_actor_count();
            tickable += level.tickable.len();
        }
        (total, tickable)
    }
}

/// Instantiate a level template's entities, sequences and cross-level
/// records into a level. Slot 0 always holds a world-info entity; one is
/// synthesized when the template does not lead with one.
pub fn populate_level(ctx: &mut EngineContext, level: &mut Level, template: &LevelTemplate) {
    let leads_with_info = template
        .entities
        .first()
        .map_or(false, |t| t.class.tags.is_world_info);
    if level.actors.is_empty() && !leads_with_info {
        let info = Entity::new(ctx.alloc_entity_id(), "WorldInfo_0", EntityClass::world_info());
        level.add_actor(Rc::new(RefCell::new(info)));
    }

    for (index, template_entity) in template.entities.iter().enumerate() {
        // A template's own leading world-info is redundant once slot 0
        // is occupied.
        if index == 0 && template_entity.class.tags.is_world_info && !level.actors.is_empty() {
            continue;
        }
        let mut entity = Entity::new(
            ctx.alloc_entity_id(),
            &template_entity.name,
            template_entity.class.clone(),
        );
        entity.state.guid = template_entity.guid;
        entity.state.location = template_entity.location;
        entity.state.is_static = template_entity.is_static;
        entity.state.no_delete = template_entity.no_delete;
        entity.state.wants_tick = template_entity.wants_tick;
        entity.state.remote_role = template_entity.remote_role;
        entity.state.components = template_entity
            .components
            .iter()
            .map(|name| crate::entity::Component {
                name: name.clone(),
                attached: false,
            })
            .collect();
        if let Some(factory) = &template_entity.script {
            entity.script = Some(factory());
        }
        level.add_actor(Rc::new(RefCell::new(entity)));
    }

    for name in &template.sequences {
        level.sequences.push(Sequence::new(name));
    }

    for record in &template.cross_refs {
        let owner = level
            .actors
            .iter()
            .flatten()
            .find(|e| e.borrow().state.name == record.owner_name)
            .cloned();
        if let Some(owner) = owner {
            level.cross_refs.push(CrossLevelRef {
                guid: record.target_guid,
                owner: Rc::downgrade(&owner),
                field: record.field.clone(),
                target: None,
            });
        }
    }

    level.has_bsp = template.has_bsp;
    level.declared_sub_levels = template
        .streaming_levels
        .iter()
        .map(|streaming| streaming.package_name.clone())
        .collect();
}

/// Route pre-begin-play on every entity of a level
pub fn route_pre_begin_play(level: &LevelRef) {
    let actors: Vec<EntityRef> = level.borrow().actors.iter().flatten().cloned().collect();
    for entity in actors {
        if entity.borrow().state.pending_kill {
            continue;
        }
        Entity::route(&entity, |script, state| script.pre_begin_play(state));
    }
}

/// Route begin-play on every entity of a level, exactly once per entity
/// per resident lifetime
pub fn route_begin_play(level: &LevelRef) {
    let actors: Vec<EntityRef> = level.borrow().actors.iter().flatten().cloned().collect();
    for entity in actors {
        let skip = {
            let state = entity.borrow();
            state.state.pending_kill || state.state.begun_play
        };
        if skip {
            continue;
        }
        entity.borrow_mut().state.begun_play = true;
        Entity::route(&entity, |script, state| script.begin_play(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineContext;

    fn make_ctx() -> EngineContext {
        EngineContext::for_tests()
    }

    #[test]
    fn test_new_world_has_world_info_at_slot_zero() {
        let mut ctx = make_ctx();
        let world = World::new(&mut ctx, "EntryMap", NetMode::Standalone);
        let info = world.world_info_entity().expect("missing world info");
        assert!(info.borrow().state.class.tags.is_world_info);
        assert_eq!(world.levels.len(), 1);
    }

    #[test]
    fn test_init_spawns_default_brush_at_slot_one() {
        let mut ctx = make_ctx();
        let mut world = World::new(&mut ctx, "EntryMap", NetMode::Standalone);
        world.init(&mut ctx);
        let persistent = world.persistent_level();
        let level = persistent.borrow();
        let brush = level.actors[1].as_ref().expect("missing brush slot");
        assert!(brush.borrow().state.class.tags.is_brush);
        // init is idempotent on the brush slot
        drop(level);
        drop(persistent);
        world.init(&mut ctx);
        assert!(world.persistent_level().borrow().actors.len() >= 2);
    }

    #[test]
    fn test_set_game_info_spawns_game_entity_above_fixed_slots() {
        let mut ctx = make_ctx();
        let mut world = World::new(&mut ctx, "EntryMap", NetMode::ListenServer);
        world.init(&mut ctx);
        let url = Url::parse("EntryMap?game=MyGame.Arena?Listen").expect("bad url");
        world.set_game_info(&mut ctx, &url);

        let game = world.game.as_ref().expect("no game info");
        assert_eq!(game.entity.borrow().state.class.path, "MyGame.Arena");
        let persistent = world.persistent_level();
        let level = persistent.borrow();
        let slot = level
            .actors
            .iter()
            .position(|s| {
                s.as_ref()
                    .map_or(false, |e| e.borrow().state.class.tags.is_game_info)
            })
            .expect("game info not in actor list");
        assert!(slot > 1);
    }

    #[test]
    fn test_begin_play_routes_once_and_zeroes_time() {
        let mut ctx = make_ctx();
        let mut world = World::new(&mut ctx, "EntryMap", NetMode::Standalone);
        world.init(&mut ctx);
        world.info.time_seconds = 42.0;

        let url = Url::parse("EntryMap").expect("bad url");
        world.begin_play(&mut ctx, &url, true);
        assert_eq!(world.info.time_seconds, 0.0);
        assert!(world.has_begun_play());
        assert!(!world.info.startup);

        let info = world.world_info_entity().expect("no world info");
        assert!(info.borrow().state.begun_play);

        // A second begin_play with reset_time=false keeps time
        world.info.time_seconds = 5.0;
        world.begin_play(&mut ctx, &url, false);
        assert_eq!(world.info.time_seconds, 5.0);
    }
}
