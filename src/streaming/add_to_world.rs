//! Level association and dissociation
//!
//! Association is incremental and time-sliced: each sub-phase is gated by
//! its own flag in the level's init-state vector, runs until the slice
//! budget is exceeded, and resumes on the next frame. Exactly one level
//! may be mid-association; dissociation is synchronous and only runs when
//! nothing is mid-association.

use crate::context::EngineContext;
use crate::entity::{Entity, EntityRef};
use crate::streaming::cross_refs::fixup_cross_level_refs;
use crate::streaming::frame_budget::{SliceBudget, ADD_TO_WORLD_BUDGET};
use crate::world::world::{route_begin_play, route_pre_begin_play};
use crate::world::{LevelRef, World, FIXED_STREAMED_SLOTS};
use log::{debug, warn};
use std::rc::Rc;
use std::time::Duration;

/// Entities processed per incremental batch before re-checking the budget
const INCREMENTAL_BATCH: usize = 50;

/// Run (or continue) making a streamed level visible. Progress is
/// recorded in the level's init-state vector; returns after one slice.
pub fn add_to_world(world: &mut World, ctx: &mut EngineContext, streaming_index: usize) {
    add_to_world_with_budget(world, ctx, streaming_index, ADD_TO_WORLD_BUDGET);
}

pub fn add_to_world_with_budget(
    world: &mut World,
    ctx: &mut EngineContext,
    streaming_index: usize,
    budget_limit: Duration,
) {
    let Some(level) = world.info.streaming_levels[streaming_index].loaded_level.clone() else {
        debug_assert!(false, "add_to_world without a loaded level");
        return;
    };
    debug_assert!(!world.info.streaming_levels[streaming_index].is_visible);

    let mut budget = SliceBudget::new(budget_limit);

    // Serialization point: only the level being made visible may proceed.
    let mut execute_next_step = match &world.current_level_pending_visibility {
        Some(pending) => Rc::ptr_eq(pending, &level),
        None => true,
    };
    let mut performed_last_step = false;
    level.borrow_mut().init.visibility_request_pending = true;

    if execute_next_step && !level.borrow().init.actors_moved {
        world.current_level_pending_visibility = Some(level.clone());
        if !world.levels.iter().any(|existing| Rc::ptr_eq(existing, &level)) {
            world.levels.push(level.clone());
        }

        move_level_actors(world, streaming_index, &level);
        world.register_level_entities(&level);

        level.borrow_mut().init.actors_moved = true;
        budget.record_step();
        execute_next_step = !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.components_updated {
        let done = incremental_update_components(world, &level, &mut budget);
        level.borrow_mut().init.components_updated = done;
        execute_next_step = done && !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.bsp_physics_initialized {
        if level.borrow().has_bsp {
            let package_name = level.borrow().package_name.clone();
            world.physics.init_bsp_mesh(&package_name);
        }
        level.borrow_mut().init.bsp_physics_initialized = true;
        budget.record_step();
        execute_next_step = !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.actor_physics_initialized {
        let done = incremental_init_actor_physics(world, &level, &mut budget);
        level.borrow_mut().init.actor_physics_initialized = done;
        execute_next_step = done && !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.actors_initialized {
        route_pre_begin_play(&level);
        level.borrow_mut().init.actors_initialized = true;
        budget.record_step();
        execute_next_step = !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.begin_play_routed {
        // Startup guard lets script tell level-streaming spawns apart
        // from gameplay-time spawns.
        world.info.startup = true;
        route_begin_play(&level);
        world.info.startup = false;
        level.borrow_mut().init.begin_play_routed = true;
        budget.record_step();
        execute_next_step = !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.cross_level_refs_fixed {
        fixup_cross_level_refs(world, false, &level);
        level.borrow_mut().init.cross_level_refs_fixed = true;
        budget.record_step();
        execute_next_step = !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.sequence_begin_play_routed {
        route_sequence_begin_play(world, &level);
        level.borrow_mut().init.sequence_begin_play_routed = true;
        budget.record_step();
        execute_next_step = !budget.exceeded();
    }

    if execute_next_step && !level.borrow().init.actors_sorted {
        level.borrow_mut().sort_actor_list(FIXED_STREAMED_SLOTS);
        level.borrow_mut().init.actors_sorted = true;
        budget.record_step();
        performed_last_step = true;
    }

    if performed_last_step {
        let package_name = level.borrow().package_name.clone();
        debug!("level '{}' is now visible", package_name);

        level.borrow_mut().init.reset();
        world.current_level_pending_visibility = None;

        for player in ctx.local_players.iter_mut() {
            player.visibility_updates.push((package_name.clone(), true));
        }
        ctx.texture_streaming.add_level(&package_name);
    }

    let pending = level.borrow().init.visibility_request_pending;
    world.info.streaming_levels[streaming_index].is_visible = !pending;
}

/// Apply the streaming ref's offset delta and rotation to every entity,
/// associate them with this world and clear stale script events.
fn move_level_actors(world: &mut World, streaming_index: usize, level: &LevelRef) {
    let streaming = &mut world.info.streaming_levels[streaming_index];
    let relative_offset = streaming.offset - streaming.old_offset;
    streaming.old_offset = streaming.offset;
    let move_actors = relative_offset.length() > f32::EPSILON;
    let rotation = streaming.rotation;
    let rotate_actors = {
        let applied = level.borrow().applied_rotation;
        rotation != applied
    };

    let mut level_mut = level.borrow_mut();
    level_mut.applied_offset += relative_offset;
    level_mut.applied_rotation = rotation;
    for slot in level_mut.actors.iter().flatten() {
        let mut entity = slot.borrow_mut();
        if move_actors {
            entity.state.location += relative_offset;
        } else if rotate_actors {
            entity.state.location = rotation * entity.state.location;
            entity.state.rotation = rotation * entity.state.rotation;
        }
        entity.state.generated_events.clear();
    }
}



/// Attach renderer components and spatial entries in budgeted batches.
/// Returns true when every entity is attached.
fn incremental_update_components(
    world: &mut World,
    level: &LevelRef,
    budget: &mut SliceBudget,
) -> bool {
    loop {
        let batch: Vec<EntityRef> = {
            let level = level.borrow();
            level
                .actors
                .iter()
                .skip(level.component_update_cursor)
                .take(INCREMENTAL_BATCH)
                .flatten()
                .cloned()
                .collect()
        };
        let advanced = {
            let mut level = level.borrow_mut();
            let remaining = level.actors.len() - level.component_update_cursor;
            let step = remaining.min(INCREMENTAL_BATCH);
            level.component_update_cursor += step;
            step
        };

        for entity in &batch {
            let mut state = entity.borrow_mut();
            let id = state.state.id;
            for component in state.state.components.iter_mut() {
                if !component.attached {
                    world.renderer.attach(id, &component.name);
                    component.attached = true;
                }
            }
            world.spatial_hash.insert(id);
        }
        budget.record_step();

        let done = level.borrow().component_update_cursor >= level.borrow().actors.len();
        if done {
            let mut level = level.borrow_mut();
            level.components_attached = true;
            level.component_update_cursor = 0;
            return true;
        }
        if budget.exceeded() || advanced == 0 {
            return false;
        }
    }
}

/// Initialize rigid-body state per entity in budgeted batches
fn incremental_init_actor_physics(
    world: &mut World,
    level: &LevelRef,
    budget: &mut SliceBudget,
) -> bool {
    loop {
        let batch: Vec<EntityRef> = {
            let level = level.borrow();
            level
                .actors
                .iter()
                .skip(level.physics_init_cursor)
                .take(INCREMENTAL_BATCH)
                .flatten()
                .cloned()
                .collect()
        };
        let advanced = {
            let mut level = level.borrow_mut();
            let remaining = level.actors.len() - level.physics_init_cursor;
            let step = remaining.min(INCREMENTAL_BATCH);
            level.physics_init_cursor += step;
            step
        };

        for entity in &batch {
            let mut state = entity.borrow_mut();
            if !state.state.physics_initialized {
                world.physics.init_body(state.state.id);
                state.state.physics_initialized = true;
            }
        }
        budget.record_step();

        let done = level.borrow().physics_init_cursor >= level.borrow().actors.len();
        if done {
            level.borrow_mut().physics_init_cursor = 0;
            return true;
        }
        if budget.exceeded() || advanced == 0 {
            return false;
        }
    }
}

/// Parent the level's sequences under the owning root sequence and start
/// them. When this world is itself hosted inside an outer streamed world
/// (nested seamless host), the outer world's root sequence owns them.
fn route_sequence_begin_play(world: &mut World, level: &LevelRef) {
    let package_name = level.borrow().package_name.clone();
    let mut root_name = format!("{}_Main_Sequence", world.package_name);
    for streaming in &world.info.streaming_levels {
        if !matches!(
            streaming.policy,
            crate::streaming::StreamingPolicy::Persistent
        ) {
            continue;
        }
        let Some(host_level) = streaming.loaded_level.as_ref() else {
            continue;
        };
        if Rc::ptr_eq(host_level, level) {
            continue;
        }
        let host = host_level.borrow();
        if host.declared_sub_levels.iter().any(|name| *name == package_name) {
            root_name = format!("{}_Main_Sequence", host.package_name);
            break;
        }
    }

    for sequence in level.borrow_mut().sequences.iter_mut() {
        sequence.parent = Some(root_name.clone());
        sequence.begin_play();
    }
}

/// Dissociate a streamed level from the world. Blocking; refuses to run
/// while another level is mid-association.
pub fn remove_from_world(world: &mut World, ctx: &mut EngineContext, streaming_index: usize) {
    if world.current_level_pending_visibility.is_some() {
        return;
    }
    let Some(level) = world.info.streaming_levels[streaming_index].loaded_level.clone() else {
        warn!("remove_from_world without a loaded level");
        return;
    };
    debug_assert!(world.info.streaming_levels[streaming_index].is_visible);
    let package_name = level.borrow().package_name.clone();

    fixup_cross_level_refs(world, true, &level);

    for sequence in level.borrow_mut().sequences.iter_mut() {
        sequence.clean_up();
    }

    if level.borrow().has_bsp {
        world.physics.term_bsp_mesh(&package_name);
    }

    // Route the removal hook exactly once per entity per unload and drop
    // any channels referencing them. Begin-play state resets so a later
    // re-association counts as a new resident lifetime.
    let actors: Vec<EntityRef> = level.borrow().actors.iter().flatten().cloned().collect();
    for entity in actors {
        Entity::route(&entity, |script, state| script.on_remove_from_world(state));
        let id = {
            let mut state = entity.borrow_mut();
            state.state.begun_play = false;
            state.state.id
        };
        world.notify_entity_destroyed(id);
    }

    world.unregister_level_entities(&level);
    world.detach_level_components(&level);
    world.levels.retain(|existing| !Rc::ptr_eq(existing, &level));

    for player in ctx.local_players.iter_mut() {
        player.visibility_updates.push((package_name.clone(), false));
    }
    ctx.texture_streaming.remove_level(&package_name);

    world.info.streaming_levels[streaming_index].is_visible = false;
    debug!("level '{}' removed from world", package_name);
}
