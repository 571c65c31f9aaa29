//! Script hooks
//!
//! The scripting VM is an external collaborator. Entities expose a bounded
//! set of named hooks instead of reflective event dispatch; the engine
//! calls them at well-defined lifecycle points.

use super::{EntityId, EntityState};

/// Hooks a scripted entity may implement. All default to no-ops so plain
/// data entities carry no script object at all.
pub trait EntityScript {
    /// Runs during level initialization, before gameplay starts
    fn pre_begin_play(&mut self, _state: &mut EntityState) {}

    /// Runs exactly once per resident lifetime when gameplay starts
    fn begin_play(&mut self, _state: &mut EntityState) {}

    fn tick(&mut self, _state: &mut EntityState, _delta: f32) {}

    /// Runs exactly once when the owning level is dissociated from the
    /// world. Not called on destroy, and not called for entities that
    /// are preserved through a seamless transition.
    fn on_remove_from_world(&mut self, _state: &mut EntityState) {}

    /// Nominate additional entities to preserve through a seamless
    /// transition. `to_transition` is true on the hop into the
    /// intermediate map, false on the final hop.
    fn get_seamless_travel_actor_list(
        &mut self,
        _state: &EntityState,
        _to_transition: bool,
        _list: &mut Vec<EntityId>,
    ) {
    }

    /// Fired on local player controllers when a world finishes loading
    fn notify_loaded_world(&mut self, _state: &mut EntityState, _package: &str, _is_final: bool) {}
}

/// Outcome of the PreLogin script callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreLoginDecision {
    Accept,
    Reject(String),
    /// Buffer nothing; the connection is welcomed later via resume_login
    Pause,
}

/// Hooks on the game-rules object. The GameInfo entity owns the game's
/// authoritative decisions: admission, travel preservation, migration.
pub trait GameScript {
    /// Map a requested gametype through the remap table, if any
    fn remap_game_class(&self, requested: &str) -> String {
        requested.to_string()
    }

    /// Class spawned for joining players
    fn player_controller_class(&self) -> String {
        "Engine.PlayerController".to_string()
    }

    fn init_game(&mut self, _options: &str) {}

    /// Admission control for a pending client
    fn pre_login(&mut self, _options: &str, _address: &str, _player_id: u64) -> PreLoginDecision {
        PreLoginDecision::Accept
    }

    fn get_seamless_travel_actor_list(&mut self, _to_transition: bool, _list: &mut Vec<EntityId>) {}

    /// Fired on the destination map's GameInfo after the final hop
    fn post_seamless_travel(&mut self) {}

    fn can_begin_host_migration(&self) -> bool {
        true
    }

    /// Election decision: should this peer become the new host?
    fn migrate_new_host(&mut self) -> bool {
        false
    }
}

/// Default game rules used when a URL names no gametype
pub struct DefaultGame;

impl GameScript for DefaultGame {}
