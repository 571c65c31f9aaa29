//! Seamless travel
//!
//! A two-phase world swap: load the transition map in the background,
//! swap the live world to it while keeping a nominated set of entities
//! and every net driver, then load and swap to the destination the same
//! way. Network connections never drop.

use crate::context::{EngineContext, ProgressKind};
use crate::entity::{Entity, EntityId, EntityRef, NetRole};
use crate::error::{EngineError, EngineResult};
use crate::guid::Guid;
use crate::migration::HostMigrationProgress;
use crate::url::Url;
use crate::world::World;
use log::{debug, error, info, warn};
use rustc_hash::FxHashSet;
use std::rc::Rc;

/// Drives one seamless transition at a time
#[derive(Default)]
pub struct SeamlessTravelHandler {
    pending_url: Url,
    pending_guid: Option<Guid>,
    /// Package whose load completed and is ready to swap in
    loaded_package: Option<String>,
    switched_to_default_map: bool,
    transition_in_progress: bool,
    pause_at_midpoint: bool,
    need_cancel_cleanup: bool,
}

impl SeamlessTravelHandler {
    pub fn is_in_transition(&self) -> bool {
        self.transition_in_progress
    }

    pub fn has_switched_to_default_map(&self) -> bool {
        self.switched_to_default_map
    }

    pub fn pending_map(&self) -> &str {
        &self.pending_url.map
    }

    /// Begin a transition to the given URL. A repeat request for the same
    /// destination coalesces, replacing the options; a request for a
    /// different destination cancels the outstanding one first.
    pub fn start_travel(
        &mut self,
        world: &mut World,
        ctx: &mut EngineContext,
        url_text: &str,
        guid: Option<Guid>,
    ) -> EngineResult<()> {
        let mut url = Url::parse(url_text).ok_or_else(|| EngineError::InvalidUrl {
            url: url_text.to_string(),
        })?;
        if url.has_option("Restart") {
            url = ctx.last_url.clone();
            if url.map.is_empty() {
                return Err(EngineError::InvalidUrl {
                    url: url_text.to_string(),
                });
            }
        }

        // Travel while the peers are still electing a new host would race
        // the migration rendezvous.
        if matches!(
            world.info.host_migration.progress,
            HostMigrationProgress::FindingNewHost | HostMigrationProgress::MigratingAsClient
        ) {
            return Err(EngineError::TravelRefused {
                reason: "host migration is selecting a new host".to_string(),
            });
        }

        if ctx.assets.catalog().read().find(&url.map, guid).is_none() {
            return Err(EngineError::PackageNotFound {
                name: url.map.clone(),
            });
        }

        info!("seamless travel to: {}", url.map);
        let mut cancelled_existing = false;
        if self.transition_in_progress {
            if self.pending_url.map == url.map {
                // Same destination: replace the options and keep going.
                self.pending_url = url;
                return Ok(());
            }
            warn!(
                "cancelling travel to '{}' to go to '{}' instead",
                self.pending_url.map, url.map
            );
            self.cancel_travel();
            cancelled_existing = true;
        }

        // A running demo recording cannot span a map change.
        if world.demo_driver.is_some() {
            world.exec("DEMOSTOP");
        }

        self.pending_url = url;
        self.pending_guid = guid;
        self.switched_to_default_map = false;
        self.transition_in_progress = true;
        self.pause_at_midpoint = false;
        self.need_cancel_cleanup = false;
        world.info.seamless_phase = 1;

        let transition_map = ctx.config.transition_map.clone();
        if world.package_name == transition_map || self.pending_url.map == transition_map {
            debug!("already in transition map or it is the destination, continuing");
            self.switched_to_default_map = true;
            if cancelled_existing {
                // The old destination's load must finish and be collected
                // before the new one starts.
                self.pause_at_midpoint = true;
                self.need_cancel_cleanup = true;
            } else {
                self.start_loading_destination(ctx);
            }
        } else {
            ctx.assets.load_async(&transition_map, None);
        }
        Ok(())
    }

    /// Abandon the transition in progress
    pub fn cancel_travel(&mut self) {
        self.loaded_package = None;
        self.transition_in_progress = false;
    }

    /// Suspend the transition while the intermediate map is live so the
    /// caller can do bulk work before the final hop. Rejected once the
    /// destination load has started.
    pub fn set_pause_at_midpoint(&mut self, ctx: &mut EngineContext, paused: bool) {
        if !self.transition_in_progress {
            warn!("attempt to pause seamless travel when no transition is in progress");
        } else if self.switched_to_default_map && paused {
            warn!("attempt to pause seamless travel after started loading final destination");
        } else {
            self.pause_at_midpoint = paused;
            if !paused && self.switched_to_default_map {
                self.start_loading_destination(ctx);
            }
        }
    }

    fn start_loading_destination(&mut self, ctx: &mut EngineContext) {
        if self.transition_in_progress && self.switched_to_default_map {
            let has_localized = ctx
                .assets
                .catalog()
                .read()
                .get(&self.pending_url.map)
                .map_or(false, |package| package.has_localized_variant);
            if has_localized {
                ctx.assets.load_async(
                    &format!("{}{}", self.pending_url.map, crate::assets::LOCALIZED_SUFFIX),
                    None,
                );
            }
            ctx.assets.load_async(&self.pending_url.map, self.pending_guid);
        } else {
            error!(
                "called start_loading_destination when not ready (in progress: {}, switched: {})",
                self.transition_in_progress, self.switched_to_default_map
            );
            debug_assert!(false, "destination load started out of order");
        }
    }

    /// Advance the transition by one frame; may swap the active world
    pub fn tick(&mut self, world: &mut World, ctx: &mut EngineContext) {
        if self.need_cancel_cleanup {
            if ctx.assets.is_async_loading() {
                // Extra loader time so cleanup finishes faster.
                ctx.assets.tick();
            }
            if !ctx.assets.is_async_loading() {
                ctx.assets.drain_completions();
                crate::streaming::collect_garbage(world, ctx);
                self.need_cancel_cleanup = false;
                self.set_pause_at_midpoint(ctx, false);
            }
            return;
        }

        if self.transition_in_progress {
            // Allocate extra async-loader time during the transition.
            ctx.assets.tick();
            self.note_completed_loads(ctx);
        }

        if self.loaded_package.is_none() {
            return;
        }

        // The client must verify outstanding packages before finishing,
        // except destination-phase entries that wait on the switch itself.
        if !world.info.next_url.is_empty() {
            return;
        }
        let packages_settled = match world
            .net_driver
            .as_ref()
            .and_then(|driver| driver.server_connection.as_ref())
        {
            None => true,
            Some(connection) => {
                connection.pending_packages.is_empty()
                    || (!self.switched_to_default_map
                        && connection.pending_packages[0].loading_phase == 1)
            }
        };
        if !packages_settled {
            return;
        }

        let Some(package_name) = self.loaded_package.take() else {
            return;
        };
        self.perform_swap(world, ctx, &package_name);
    }

    /// Watch for the awaited package becoming resident
    fn note_completed_loads(&mut self, ctx: &mut EngineContext) {
        if self.loaded_package.is_some() {
            return;
        }
        let awaited = if self.switched_to_default_map {
            self.pending_url.map.clone()
        } else {
            ctx.config.transition_map.clone()
        };
        if ctx.assets.is_resident(&awaited) {
            self.loaded_package = Some(awaited);
        }
    }

    fn perform_swap(&mut self, world: &mut World, ctx: &mut EngineContext, package_name: &str) {
        let package = match ctx.assets.resident(package_name) {
            Some(package) if package.level.is_some() => package.clone(),
            _ => {
                error!("unable to travel to '{}' - package is not a level", package_name);
                self.cancel_travel();
                ctx.progress.set_progress(
                    ProgressKind::ConnectionFailure,
                    "Connection Failed",
                    &format!("Unable to travel to '{}'", package_name),
                );
                return;
            }
        };
        let is_final_hop = self.switched_to_default_map;
        info!(
            "seamless swap to '{}' ({})",
            package_name,
            if is_final_hop { "final" } else { "intermediate" }
        );

        // Quiesce the world before touching shared resources.
        ctx.flush_rendering_commands();
        crate::streaming::flush_level_streaming(world, ctx, &[], true, None);
        world.physics.term();
        world.cleanup(ctx, is_final_hop);
        // Unload requests against the departing world are moot.
        ctx.gc.reset();

        let preserved = self.mark_preserved_entities(world, ctx, is_final_hop);

        let mut new_world = match World::from_package(ctx, &package, world.info.net_mode) {
            Ok(new_world) => new_world,
            Err(e) => {
                error!("unable to travel to '{}': {}", package_name, e);
                self.cancel_travel();
                ctx.progress.set_progress(
                    ProgressKind::ConnectionFailure,
                    "Connection Failed",
                    &format!("Unable to travel to '{}'", package_name),
                );
                return;
            }
        };
        new_world.init(ctx);

        self.reparent_or_destroy(world, &mut new_world, &preserved);

        // The drivers move to the successor world on this same tick.
        new_world.net_driver = world.net_driver.take();
        new_world.peer_net_driver = world.peer_net_driver.take();
        new_world.demo_driver = world.demo_driver.take();

        // Game state rides along until the final hop rebuilds it.
        let standby_cheat = world
            .game
            .as_ref()
            .map_or(false, |game| game.standby_cheat_triggered);
        if !is_final_hop {
            new_world.game = world.game.take();
        }
        new_world.info.time_seconds = world.info.time_seconds;
        new_world.info.real_time_seconds = world.info.real_time_seconds;
        new_world.info.audio_time_seconds = world.info.audio_time_seconds;
        new_world.info.seamless_phase = world.info.seamless_phase;

        // Swap the world pointer; dropping the old world releases
        // everything that was not reparented.
        let old_world = std::mem::replace(world, new_world);
        let old_persistent = Rc::downgrade(&old_world.levels[0]);
        let old_name = old_world.package_name.clone();
        drop(old_world);
        ctx.flush_rendering_commands();
        if old_persistent.strong_count() > 0 {
            error!("world '{}' was not released by the swap", old_name);
            debug_assert!(false, "old world still reachable after swap");
        }

        // Rebuild game state on the destination.
        if is_final_hop && !world.is_client() {
            world.set_game_info(ctx, &self.pending_url.clone());
            if let Some(game) = world.game.as_mut() {
                game.standby_cheat_triggered = standby_cheat;
            }
        }

        world.begin_play(ctx, &self.pending_url.clone(), false);

        // Loading-complete notifications for every local player.
        for player in ctx.local_players.iter_mut() {
            player
                .loaded_world_notifies
                .push((package_name.to_string(), is_final_hop));
            if let Some(controller) = player.controller.clone() {
                Entity::route(&controller, |script, state| {
                    script.notify_loaded_world(state, package_name, is_final_hop)
                });
            }
        }

        if is_final_hop {
            ctx.last_url = self.pending_url.clone();
            // Flag the transition complete before the script callback so
            // travel can chain from inside it.
            self.transition_in_progress = false;
            world.info.seamless_phase = 0;
            if let Some(game) = world.game.as_mut() {
                game.script.post_seamless_travel();
            }
        } else {
            self.switched_to_default_map = true;
            if !self.pause_at_midpoint {
                self.start_loading_destination(ctx);
            }
        }
    }

    /// Decide which entities survive the swap
    fn mark_preserved_entities(
        &self,
        world: &mut World,
        ctx: &mut EngineContext,
        is_final_hop: bool,
    ) -> FxHashSet<EntityId> {
        let mut preserved: FxHashSet<EntityId> = FxHashSet::default();

        // The game rides to the intermediate map but not the final one.
        if !is_final_hop {
            if let Some(game) = world.game.as_ref() {
                preserved.insert(game.entity.borrow().state.id);
            }
        }

        // Player controllers always survive.
        if world.is_client() {
            for player in ctx.local_players.iter() {
                if let Some(controller) = player.controller.as_ref() {
                    preserved.insert(controller.borrow().state.id);
                }
            }
        } else {
            for controller in world.controllers.iter() {
                if controller.borrow().state.class.tags.is_player_controller {
                    preserved.insert(controller.borrow().state.id);
                }
            }
        }

        // Script nominates the rest: the game first, then each local
        // player's controller.
        let to_transition = !is_final_hop;
        let mut nominated: Vec<EntityId> = Vec::new();
        if let Some(game) = world.game.as_mut() {
            game.script
                .get_seamless_travel_actor_list(to_transition, &mut nominated);
        }
        for player in ctx.local_players.iter() {
            if let Some(controller) = player.controller.clone() {
                let script = controller.borrow_mut().script.take();
                if let Some(mut script) = script {
                    script.get_seamless_travel_actor_list(
                        &controller.borrow().state,
                        to_transition,
                        &mut nominated,
                    );
                    controller.borrow_mut().script = Some(script);
                }
            }
        }
        preserved.extend(nominated);
        preserved
    }

    /// Rename preserved dynamic entities into the new persistent level;
    /// everything else is marked pending-kill and its channels dropped.
    fn reparent_or_destroy(
        &self,
        old_world: &mut World,
        new_world: &mut World,
        preserved: &FxHashSet<EntityId>,
    ) {
        let old_persistent = old_world.persistent_level();
        let slots: Vec<EntityRef> = old_persistent
            .borrow()
            .actors
            .iter()
            .flatten()
            .cloned()
            .collect();

        for entity in slots {
            let (id, keep) = {
                let state = entity.borrow();
                let movable = !state.state.is_static && !state.state.no_delete;
                let keep = movable
                    && (preserved.contains(&state.state.id)
                        || state.state.role < NetRole::Authority);
                (state.state.id, keep)
            };
            if keep {
                old_persistent.borrow_mut().null_actor_slot(&entity);
                old_world.remove_controller(&entity);
                old_world.remove_pawn(&entity);

                let new_persistent = new_world.persistent_level();
                new_persistent.borrow_mut().add_actor(entity.clone());
                let tags = entity.borrow().state.class.tags;
                if tags.is_controller {
                    new_world.add_controller(entity.clone());
                }
                if tags.is_pawn {
                    new_world.add_pawn(entity.clone());
                }
                debug!("preserved '{}' across travel", entity.borrow().state.name);
            } else {
                entity.borrow_mut().state.pending_kill = true;
                old_world.notify_entity_destroyed(id);
            }
        }

        // Entities in streamed levels die with the old world.
        for level in old_world.levels.iter().skip(1) {
            for slot in level.borrow().actors.iter().flatten() {
                slot.borrow_mut().state.pending_kill = true;
            }
        }
    }
}
