//! Entity registry operations
//!
//! Spawn, remove and destroy keep the per-level actor arrays and the
//! world-singleton collections consistent. Removal nulls slots rather
//! than compacting so stored indices stay stable during tick.

use crate::context::EngineContext;
use crate::entity::{Entity, EntityRef};
use crate::error::{EngineError, EngineResult};
use crate::world::{SpawnParams, World};
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

/// Spawn an entity into a resident level. Routes `pre_begin_play`, and
/// `begin_play` as well once gameplay has started.
pub fn spawn_entity(
    world: &mut World,
    ctx: &mut EngineContext,
    params: SpawnParams,
    level_index: usize,
) -> EngineResult<EntityRef> {
    if params.class.tags.is_abstract {
        return Err(EngineError::AbstractClass {
            class: params.class.path,
        });
    }

    let id = ctx.alloc_entity_id();
    let name = params.name.unwrap_or_else(|| {
        let base = params.class.path.rsplit('.').next().unwrap_or("Entity");
        format!("{}_{}", base, id.0)
    });

    let mut entity = Entity::new(id, &name, params.class);
    entity.state.location = params.location;
    entity.state.rotation = params.rotation;
    entity.state.is_static = params.is_static;
    entity.state.no_delete = params.no_delete;
    entity.state.wants_tick = params.wants_tick;
    entity.state.remote_role = params.remote_role;
    entity.state.guid = params.guid;
    entity.script = params.script;

    let entity = Rc::new(RefCell::new(entity));

    let level = world
        .levels
        .get(level_index)
        .cloned()
        .ok_or(EngineError::WorldNotInitialized)?;
    level.borrow_mut().add_actor(entity.clone());

    // Attach to the shared scenes immediately; streamed startup entities
    // go through the incremental path instead.
    world.spatial_hash.insert(id);
    {
        let mut state = entity.borrow_mut();
        for component in state.state.components.iter_mut() {
            world.renderer.attach(id, &component.name);
            component.attached = true;
        }
    }

    let tags = entity.borrow().state.class.tags;
    if tags.is_controller {
        world.add_controller(entity.clone());
    }
    if tags.is_pawn {
        world.add_pawn(entity.clone());
    }
    if tags.is_nav_point {
        world.nav_octree.insert(id);
    }

    Entity::route(&entity, |script, state| script.pre_begin_play(state));
    if world.has_begun_play() && !world.info.startup {
        entity.borrow_mut().state.begun_play = true;
        Entity::route(&entity, |script, state| script.begin_play(state));
    }

    debug!("spawned '{}' into level {}", entity.borrow().state.name, level_index);
    Ok(entity)
}

/// Null the entity's registry slot without compacting. Silent when the
/// entity is already gone.
pub fn remove_entity(world: &mut World, entity: &EntityRef) {
    for level in world.levels.clone() {
        if level.borrow_mut().null_actor_slot(entity) {
            break;
        }
    }
    world.remove_controller(entity);
    world.remove_pawn(entity);
}

/// Destroy an entity: mark pending-kill, null its slot, drop its scene
/// registrations and close channels referencing it on both net drivers.
/// Returns false (silently) on double-destroy.
pub fn destroy_entity(world: &mut World, entity: &EntityRef) -> bool {
    {
        let mut state = entity.borrow_mut();
        if state.state.pending_kill {
            return false;
        }
        state.state.pending_kill = true;
    }

    let id = entity.borrow().state.id;
    world.renderer.detach_entity(id);
    world.spatial_hash.remove(id);
    {
        let mut state = entity.borrow_mut();
        if state.state.physics_initialized {
            world.physics.term_body(id);
            state.state.physics_initialized = false;
        }
    }
    if entity.borrow().state.class.tags.is_nav_point {
        world.nav_octree.remove(id);
    }

    world.notify_entity_destroyed(id);
    remove_entity(world, entity);
    true
}

/// Whether the entity still occupies a slot in any resident level
pub fn contains_entity(world: &World, entity: &EntityRef) -> bool {
    world.levels.iter().any(|level| level.borrow().contains(entity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineContext;
    use crate::entity::{ClassTags, EntityClass, NetRole};
    use crate::world::{NetMode, SpawnParams};

    fn make_world() -> (EngineContext, World) {
        let mut ctx = EngineContext::for_tests();
        let mut world = World::new(&mut ctx, "EntryMap", NetMode::Standalone);
        world.init(&mut ctx);
        (ctx, world)
    }

    #[test]
    fn test_spawn_rejects_abstract_class() {
        let (mut ctx, mut world) = make_world();
        let params = SpawnParams::new(EntityClass::with_tags(
            "Game.BaseWeapon",
            ClassTags {
                is_abstract: true,
                ..Default::default()
            },
        ));
        assert!(spawn_entity(&mut world, &mut ctx, params, 0).is_err());
    }

    #[test]
    fn test_spawn_and_contains() {
        let (mut ctx, mut world) = make_world();
        let params = SpawnParams::new(EntityClass::new("Game.Door"));
        let entity = spawn_entity(&mut world, &mut ctx, params, 0).expect("spawn failed");
        assert!(contains_entity(&world, &entity));
    }

    #[test]
    fn test_spawn_controller_registers_in_world_collection() {
        let (mut ctx, mut world) = make_world();
        let mut params = SpawnParams::new(EntityClass::with_tags(
            "Game.PC",
            ClassTags {
                is_controller: true,
                is_player_controller: true,
                ..Default::default()
            },
        ));
        params.wants_tick = true;
        let entity = spawn_entity(&mut world, &mut ctx, params, 0).expect("spawn failed");
        assert_eq!(world.controllers.len(), 1);
        assert!(world.persistent_level().borrow().tickable.len() >= 1);

        destroy_entity(&mut world, &entity);
        assert!(world.controllers.is_empty());
        assert!(!contains_entity(&world, &entity));
    }

    #[test]
    fn test_destroy_is_silent_on_double_remove() {
        let (mut ctx, mut world) = make_world();
        let params = SpawnParams::new(EntityClass::new("Game.Door"));
        let entity = spawn_entity(&mut world, &mut ctx, params, 0).expect("spawn failed");
        assert!(destroy_entity(&mut world, &entity));
        assert!(!destroy_entity(&mut world, &entity));
    }

    #[test]
    fn test_spawn_after_begin_play_routes_begin_play() {
        let (mut ctx, mut world) = make_world();
        let url = crate::url::Url::parse("EntryMap").expect("bad url");
        world.begin_play(&mut ctx, &url, true);

        let mut params = SpawnParams::new(EntityClass::new("Game.Door"));
        params.remote_role = NetRole::SimulatedProxy;
        let entity = spawn_entity(&mut world, &mut ctx, params, 0).expect("spawn failed");
        assert!(entity.borrow().state.begun_play);
    }
}
