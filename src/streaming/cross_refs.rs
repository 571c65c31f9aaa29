//! Cross-level reference fixup
//!
//! Levels carry data records saying "this field of one of my entities
//! wants the entity with guid G, wherever it lives." When a level joins
//! the world, unresolved records everywhere get a chance to resolve;
//! when a level departs, pointers into it are nulled but the records
//! stay so they re-resolve if the level returns.

use crate::entity::EntityRef;
use crate::guid::Guid;
use crate::world::level::LevelRef;
use crate::world::World;
use log::debug;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Bound on the per-chunk guid hash, to keep memory flat on big worlds
pub const MAX_GUID_HASH_SIZE: usize = 5000;

/// Resolve or clear cross-level references after `level` was added to or
/// is being removed from the world.
pub fn fixup_cross_level_refs(world: &mut World, is_removing_level: bool, level: &LevelRef) {
    if is_removing_level {
        clear_refs_into_level(world, level);
    } else {
        resolve_unresolved_refs(world);
    }
}

/// Null every resolved pointer that targets an entity inside the
/// departing level. Records are kept for later re-resolution.
fn clear_refs_into_level(world: &mut World, departing: &LevelRef) {
    let mut cleared = 0usize;
    for level in &world.levels {
        // Intra-level references need no fixing up on removal.
        if Rc::ptr_eq(level, departing) {
            continue;
        }
        for record in level.borrow_mut().cross_refs.iter_mut() {
            let Some(target) = record.target.as_ref().and_then(|weak| weak.upgrade()) else {
                continue;
            };
            if departing.borrow().contains(&target) {
                record.target = None;
                cleared += 1;
            }
        }
    }
    if cleared > 0 {
        debug!(
            "cleared {} cross-level pointer(s) into departing level '{}'",
            cleared,
            departing.borrow().package_name
        );
    }
}

/// Walk every resident entity in chunks, building a temporary guid hash
/// per chunk and resolving what matches, then discarding the hash.
fn resolve_unresolved_refs(world: &mut World) {
    let mut unresolved: usize = world
        .levels
        .iter()
        .map(|level| {
            level
                .borrow()
                .cross_refs
                .iter()
                .filter(|record| record.target.is_none())
                .count()
        })
        .sum();
    if unresolved == 0 {
        return;
    }

    let entities: Vec<EntityRef> = world
        .levels
        .iter()
        .flat_map(|level| {
            level
                .borrow()
                .actors
                .iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect();

    for chunk in entities.chunks(MAX_GUID_HASH_SIZE) {
        let mut guid_hash: FxHashMap<Guid, EntityRef> = FxHashMap::default();
        for entity in chunk {
            if let Some(guid) = entity.borrow().state.guid {
                if guid.is_valid() {
                    guid_hash.insert(guid, entity.clone());
                }
            }
        }

        for level in &world.levels {
            for record in level.borrow_mut().cross_refs.iter_mut() {
                if record.target.is_some() {
                    continue;
                }
                if let Some(target) = guid_hash.get(&record.guid) {
                    record.target = Some(Rc::downgrade(target));
                    unresolved -= 1;
                }
            }
        }
        if unresolved == 0 {
            break;
        }
    }

    if unresolved > 0 {
        debug!("{} cross-level reference(s) still unresolved", unresolved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineContext;
    use crate::entity::{Entity, EntityClass};
    use crate::world::level::{CrossLevelRef, Level};
    use crate::world::{NetMode, World};
    use std::cell::RefCell;

    fn make_world_with_two_levels() -> (EngineContext, World, LevelRef, EntityRef) {
        let mut ctx = EngineContext::for_tests();
        let mut world = World::new(&mut ctx, "EntryMap", NetMode::Standalone);

        // Target entity lives in a streamed level.
        let mut streamed = Level::new("L2", Guid::from_words(2, 0, 0, 0));
        let mut target = Entity::new(ctx.alloc_entity_id(), "Switch_1", EntityClass::new("Game.Switch"));
        target.state.guid = Some(Guid::from_words(9, 9, 9, 9));
        let target = Rc::new(RefCell::new(target));
        streamed.add_actor(target.clone());
        let streamed = Rc::new(RefCell::new(streamed));
        world.levels.push(streamed.clone());

        // A record in the persistent level wants that guid.
        let persistent = world.persistent_level();
        let owner = persistent.borrow().world_info_entity().expect("no info");
        persistent.borrow_mut().cross_refs.push(CrossLevelRef {
            guid: Guid::from_words(9, 9, 9, 9),
            owner: Rc::downgrade(&owner),
            field: "linked_switch".to_string(),
            target: None,
        });
        (ctx, world, streamed, target)
    }

    #[test]
    fn test_resolution_links_by_guid() {
        let (_ctx, mut world, streamed, target) = make_world_with_two_levels();
        fixup_cross_level_refs(&mut world, false, &streamed);

        let persistent = world.persistent_level();
        let level = persistent.borrow();
        let record = &level.cross_refs[0];
        let resolved = record
            .target
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .expect("not resolved");
        assert!(Rc::ptr_eq(&resolved, &target));
    }

    #[test]
    fn test_removal_nulls_pointer_but_keeps_record() {
        let (_ctx, mut world, streamed, _target) = make_world_with_two_levels();
        fixup_cross_level_refs(&mut world, false, &streamed);
        fixup_cross_level_refs(&mut world, true, &streamed);

        let persistent = world.persistent_level();
        let level = persistent.borrow();
        assert_eq!(level.cross_refs.len(), 1);
        assert!(level.cross_refs[0].target.is_none());
    }

    #[test]
    fn test_reresolution_after_return() {
        let (_ctx, mut world, streamed, target) = make_world_with_two_levels();
        fixup_cross_level_refs(&mut world, false, &streamed);
        fixup_cross_level_refs(&mut world, true, &streamed);
        fixup_cross_level_refs(&mut world, false, &streamed);

        let persistent = world.persistent_level();
        let level = persistent.borrow();
        let resolved = level.cross_refs[0]
            .target
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .expect("record did not re-resolve");
        assert!(Rc::ptr_eq(&resolved, &target));
    }
}
