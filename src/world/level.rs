//! Levels: streamable units of a map
//!
//! A level owns a flat array of entity slots. Removal nulls a slot without
//! compacting so stored indices stay stable during tick; the array is only
//! re-sorted between ticks. Slot 0 is always the world-info entity and, in
//! the persistent level, slot 1 is the default brush.

use crate::entity::{EntityRef, EntityWeak, NetRole};
use crate::guid::Guid;
use glam::{Quat, Vec3};
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

pub type LevelRef = Rc<RefCell<Level>>;

/// Incremental association progress. Each flag gates one re-enterable
/// sub-phase of add-to-world; all-true means the level is fully visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitState {
    pub actors_moved: bool,
    pub components_updated: bool,
    pub bsp_physics_initialized: bool,
    pub actor_physics_initialized: bool,
    pub actors_initialized: bool,
    pub begin_play_routed: bool,
    pub cross_level_refs_fixed: bool,
    pub sequence_begin_play_routed: bool,
    pub actors_sorted: bool,
    pub visibility_request_pending: bool,
}

impl InitState {
    pub fn reset(&mut self) {
        *self = InitState::default();
    }
}

/// A visual-scripted event graph attached to a level
#[derive(Debug, Clone)]
pub struct Sequence {
    pub name: String,
    pub begun_play: bool,
    /// Name of the root sequence this was parented under, if any
    pub parent: Option<String>,
}

impl Sequence {
    pub fn new(name: &str) -> Self {
        Sequence {
            name: name.to_string(),
            begun_play: false,
            parent: None,
        }
    }

    pub fn begin_play(&mut self) {
        self.begun_play = true;
    }

    pub fn clean_up(&mut self) {
        self.begun_play = false;
        self.parent = None;
    }
}

/// A data record: "a field of `owner` wants to point at the entity with
/// this guid, which may live in another level." The record persists across
/// unloads; only the resolved pointer is nulled when the target departs.
#[derive(Debug)]
pub struct CrossLevelRef {
    pub guid: Guid,
    pub owner: EntityWeak,
    pub field: String,
    pub target: Option<EntityWeak>,
}

/// One streamable unit of the map
pub struct Level {
    pub package_name: String,
    pub guid: Guid,
    /// Entity slots. Nulled on removal, compacted only by sort.
    pub actors: Vec<Option<EntityRef>>,
    /// Entities with the tick-wanted flag, rebuilt by sort
    pub tickable: Vec<EntityRef>,
    pub sequences: Vec<Sequence>,
    pub cross_refs: Vec<CrossLevelRef>,
    pub init: InitState,
    /// Index of the first replicated slot after sorting
    pub first_net_relevant: usize,
    /// Index of the first dynamic slot after sorting
    pub first_dynamic: usize,
    /// Offset currently applied to entity locations
    pub applied_offset: Vec3,
    pub applied_rotation: Quat,
    /// Whether this level has a BSP model to hand to physics
    pub has_bsp: bool,
    /// Sub-level packages this level declares; used to find the owning
    /// root sequence when worlds nest under a seamless host
    pub declared_sub_levels: Vec<String>,
    pub components_attached: bool,
    /// Incremental progress markers for the time-sliced phases
    pub component_update_cursor: usize,
    pub physics_init_cursor: usize,
}

impl Level {
    pub fn new(package_name: &str, guid: Guid) -> Self {
        Level {
            package_name: package_name.to_string(),
            guid,
            actors: Vec::new(),
            tickable: Vec::new(),
            sequences: Vec::new(),
            cross_refs: Vec::new(),
            init: InitState::default(),
            first_net_relevant: 0,
            first_dynamic: 0,
            applied_offset: Vec3::ZERO,
            applied_rotation: Quat::IDENTITY,
            has_bsp: false,
            declared_sub_levels: Vec::new(),
            components_attached: false,
            component_update_cursor: 0,
            physics_init_cursor: 0,
        }
    }

    /// The world-info singleton occupying slot 0
    pub fn world_info_entity(&self) -> Option<EntityRef> {
        self.actors.first().and_then(|slot| slot.clone())
    }

    pub fn add_actor(&mut self, entity: EntityRef) {
        if entity.borrow().state.wants_tick {
            self.tickable.push(entity.clone());
        }
        self.actors.push(Some(entity));
    }

    /// Null the slot holding `entity`. Silent when the entity is already
    /// gone; iteration tolerates the hole.
    pub fn null_actor_slot(&mut self, entity: &EntityRef) -> bool {
        let mut found = false;
        for slot in self.actors.iter_mut() {
            let matches = slot.as_ref().map_or(false, |e| Rc::ptr_eq(e, entity));
            if matches {
                *slot = None;
                found = true;
                break;
            }
        }
        self.tickable.retain(|e| !Rc::ptr_eq(e, entity));
        found
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.actors
            .iter()
            .any(|slot| slot.as_ref().map_or(false, |e| Rc::ptr_eq(e, entity)))
    }

    /// Count of live (non-null, non-pending-kill) entities
    pub fn live_actor_count(&self) -> usize {
        self.actors
            .iter()
            .filter(|slot| {
                slot.as_ref()
                    .map_or(false, |e| !e.borrow().state.pending_kill)
            })
            .count()
    }

    /// Partition the actor list so runtime iterators can skip prefixes:
    /// fixed slots first, then static non-replicated, static replicated,
    /// and dynamic entities in arbitrary order. Also rebuilds the
    /// tickable list. Must only run between ticks.
    pub fn sort_actor_list(&mut self, fixed_slots: usize) {
        self.tickable.clear();

        let fixed_slots = fixed_slots.min(self.actors.len());
        let mut sorted: Vec<Option<EntityRef>> = Vec::with_capacity(self.actors.len());
        for slot in &self.actors[..fixed_slots] {
            sorted.push(slot.clone());
        }

        let live = |slot: &Option<EntityRef>| -> Option<EntityRef> {
            slot.as_ref()
                .filter(|e| !e.borrow().state.pending_kill)
                .cloned()
        };

        // Static, not replicated.
        for slot in &self.actors[fixed_slots..] {
            if let Some(entity) = live(slot) {
                let state = entity.borrow();
                if state.state.is_static && state.state.remote_role == NetRole::None {
                    drop(state);
                    sorted.push(Some(entity));
                }
            }
        }
        self.first_net_relevant = sorted.len();

        // Static, replicated.
        for slot in &self.actors[fixed_slots..] {
            if let Some(entity) = live(slot) {
                let state = entity.borrow();
                if state.state.is_static && state.state.remote_role > NetRole::None {
                    drop(state);
                    sorted.push(Some(entity));
                }
            }
        }
        self.first_dynamic = sorted.len();

        // Dynamic remainder; these are the tick candidates.
        for slot in &self.actors[fixed_slots..] {
            if let Some(entity) = live(slot) {
                let wants_tick = {
                    let state = entity.borrow();
                    if state.state.is_static {
                        continue;
                    }
                    state.state.wants_tick
                };
                if wants_tick {
                    self.tickable.push(entity.clone());
                }
                sorted.push(Some(entity));
            }
        }

        debug!(
            "sorted actor list for '{}': {} slots, net-relevant from {}, dynamic from {}",
            self.package_name,
            sorted.len(),
            self.first_net_relevant,
            self.first_dynamic
        );
        self.actors = sorted;
    }

    /// Rebuild the tickable list without re-sorting, used after spawns
    pub fn rebuild_tickable(&mut self) {
        self.tickable.clear();
        for slot in &self.actors {
            if let Some(entity) = slot {
                let state = entity.borrow();
                if !state.state.pending_kill && !state.state.is_static && state.state.wants_tick {
                    drop(state);
                    self.tickable.push(entity.clone());
                }
            }
        }
    }
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("package_name", &self.package_name)
            .field("actors", &self.actors.len())
            .field("tickable", &self.tickable.len())
            .field("init", &self.init)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ClassTags, Entity, EntityClass, EntityId};

    fn make_entity(id: u64, is_static: bool, remote_role: NetRole, wants_tick: bool) -> EntityRef {
        let mut entity = Entity::new(EntityId(id), &format!("E_{}", id), EntityClass::new("Game.Thing"));
        entity.state.is_static = is_static;
        entity.state.remote_role = remote_role;
        entity.state.wants_tick = wants_tick;
        Rc::new(RefCell::new(entity))
    }

    fn make_level_with_info() -> Level {
        let mut level = Level::new("TestMap", Guid::from_words(1, 0, 0, 0));
        let info = Entity::new(
            EntityId(0),
            "WorldInfo_0",
            EntityClass::with_tags(
                "Engine.WorldInfo",
                ClassTags {
                    is_world_info: true,
                    ..Default::default()
                },
            ),
        );
        level.add_actor(Rc::new(RefCell::new(info)));
        level
    }

    #[test]
    fn test_sort_partitions_by_static_and_relevance() {
        let mut level = make_level_with_info();
        level.add_actor(make_entity(10, false, NetRole::SimulatedProxy, true));
        level.add_actor(make_entity(11, true, NetRole::None, false));
        level.add_actor(make_entity(12, true, NetRole::SimulatedProxy, false));
        level.add_actor(make_entity(13, false, NetRole::None, false));

        level.sort_actor_list(1);

        // slot 0 stays fixed, then static/None, static/replicated, dynamic
        assert_eq!(level.first_net_relevant, 2);
        assert_eq!(level.first_dynamic, 3);
        assert_eq!(level.actors.len(), 5);
        let ids: Vec<u64> = level
            .actors
            .iter()
            .map(|slot| slot.as_ref().expect("hole after sort").borrow().state.id.0)
            .collect();
        assert_eq!(ids[0], 0);
        assert_eq!(ids[1], 11);
        assert_eq!(ids[2], 12);
        assert!(ids[3..].contains(&10));
        assert!(ids[3..].contains(&13));
        assert_eq!(level.tickable.len(), 1);
    }

    #[test]
    fn test_null_slot_does_not_compact() {
        let mut level = make_level_with_info();
        let doomed = make_entity(20, false, NetRole::None, true);
        level.add_actor(doomed.clone());
        level.add_actor(make_entity(21, false, NetRole::None, false));

        assert!(level.null_actor_slot(&doomed));
        assert_eq!(level.actors.len(), 3);
        assert!(level.actors[1].is_none());
        assert!(level.tickable.is_empty());

        // double-remove is silent
        assert!(!level.null_actor_slot(&doomed));
    }

    #[test]
    fn test_sort_drops_nulled_and_pending_kill_slots() {
        let mut level = make_level_with_info();
        let doomed = make_entity(30, false, NetRole::None, false);
        let killed = make_entity(31, false, NetRole::None, false);
        killed.borrow_mut().state.pending_kill = true;
        level.add_actor(doomed.clone());
        level.add_actor(killed);
        level.null_actor_slot(&doomed);

        level.sort_actor_list(1);
        assert_eq!(level.actors.len(), 1);
    }
}
