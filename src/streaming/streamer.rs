//! Per-frame level streaming decisions
//!
//! Reads viewer positions against each streaming ref's policy, kicks
//! async loads, drives incremental association, synchronous dissociation
//! and deferred unloads. At most one residency state transition happens
//! per ref per frame.

use crate::context::EngineContext;
use crate::streaming::add_to_world::{add_to_world, remove_from_world};
use crate::world::world::populate_level;
use crate::world::{Level, World};
use crate::assets::LOCALIZED_SUFFIX;
use glam::Vec3;
use log::{debug, warn};
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::rc::Rc;

/// Decide residency for every streaming ref and advance transitions.
/// `views` may be empty, in which case the origin stands in.
pub fn update_level_streaming(world: &mut World, ctx: &mut EngineContext, views: &[Vec3]) {
    // An association still in progress is the signal to issue fewer
    // load requests this frame.
    ctx.load_throttler
        .start_frame(world.is_visibility_request_pending());
    let mut levels_have_load_request_pending = false;
    // Deterministic tie-break when several refs name one package: the
    // first ref in array order owns this frame's transition.
    let mut packages_seen: FxHashSet<String> = FxHashSet::default();

    let mut index = 0;
    while index < world.info.streaming_levels.len() {
        let package_name = world.info.streaming_levels[index].package_name.clone();
        if !packages_seen.insert(package_name.clone()) {
            index += 1;
            continue;
        }

        // Work to make a level visible spans frames; a level pending
        // visibility cannot be unloaded or hidden until it finishes.
        let has_visibility_request_pending = world.info.streaming_levels[index]
            .loaded_level
            .as_ref()
            .map_or(false, |level| level.borrow().init.visibility_request_pending);

        let streaming = &world.info.streaming_levels[index];
        let mut should_be_loaded = has_visibility_request_pending
            || (!ctx.config.use_background_level_streaming
                && !streaming.is_requesting_unload_and_removal);
        let mut should_be_visible = has_visibility_request_pending;

        if !streaming.is_requesting_unload_and_removal {
            let mut evaluate = |view: Vec3| {
                should_be_loaded =
                    should_be_loaded || ctx.config.is_editor || streaming.should_be_loaded(view);
                should_be_visible =
                    should_be_visible || (should_be_loaded && streaming.should_be_visible(view));
            };
            if views.is_empty() {
                evaluate(Vec3::ZERO);
            } else {
                for view in views {
                    evaluate(*view);
                }
            }
        }
        let should_block_on_load = streaming.should_block_on_load;

        // Give the collector a chance to run between consecutive loads.
        let levels_pending_purge = ctx.gc.num_pending() > 0;
        let allow_load_requests =
            (allow_level_load_requests(world, ctx) && !levels_pending_purge) || should_block_on_load;

        if levels_pending_purge
            && should_be_loaded
            && world.info.streaming_levels[index].loaded_level.is_none()
        {
            ctx.gc_requested = true;
        }

        if should_be_loaded && world.info.streaming_levels[index].loaded_level.is_none() {
            if !world.info.streaming_levels[index].has_load_request_pending {
                // Already (or still) in memory from an earlier residency?
                if ctx.assets.is_resident(&package_name) {
                    attach_loaded_level(world, ctx, index);
                } else if allow_load_requests && ctx.load_throttler.can_issue() {
                    ctx.load_throttler.record_issue();
                    let guid = world.info.streaming_levels[index].guid;
                    let localized = ctx
                        .assets
                        .catalog()
                        .read()
                        .get(&package_name)
                        .map_or(false, |package| package.has_localized_variant);
                    if localized {
                        // Localized part loads first if it exists; the
                        // base package request below follows anyway.
                        ctx.assets
                            .load_async(&format!("{}{}", package_name, LOCALIZED_SUFFIX), None);
                    }
                    ctx.assets.load_async(&package_name, Some(guid));

                    if ctx.config.is_editor || !ctx.config.use_background_level_streaming {
                        ctx.assets.flush(None);
                        ctx.assets.drain_completions();
                        if ctx.assets.is_resident(&package_name) {
                            attach_loaded_level(world, ctx, index);
                        } else {
                            debug!("failed to load {}", package_name);
                        }
                    }
                    world.info.streaming_levels[index].has_load_request_pending =
                        world.info.streaming_levels[index].loaded_level.is_none();
                }
            } else if ctx.assets.is_resident(&package_name) {
                // The async load finished; resolve the level pointer.
                attach_loaded_level(world, ctx, index);
            }

            if world.info.streaming_levels[index].has_load_request_pending
                && should_block_on_load
                && !ctx.config.is_editor
            {
                world.info.requested_block_on_async_loading = true;
                debug!("requested blocking on load for level {}", package_name);
            }
        }

        if world.info.streaming_levels[index].loaded_level.is_some() {
            world.info.streaming_levels[index].has_load_request_pending = false;
            let is_visible = world.info.streaming_levels[index].is_visible;

            if should_be_visible && !is_visible {
                add_to_world(world, ctx, index);
            } else if !should_be_visible && is_visible {
                remove_from_world(world, ctx, index);
            }

            let is_visible = world.info.streaming_levels[index].is_visible;
            if should_be_loaded || is_visible {
                ctx.gc.cancel_unload(&package_name);
                world.info.streaming_levels[index].has_unload_request_pending = false;
            } else if !world.info.streaming_levels[index].has_unload_request_pending {
                ctx.gc.request_unload(&package_name);
                world.info.streaming_levels[index].has_unload_request_pending = true;
            }
        } else if ctx.config.is_editor || !ctx.config.use_background_level_streaming {
            world.info.streaming_levels[index].has_load_request_pending = false;
        }

        // Refs marked for removal leave the array once fully unloaded.
        if world.info.streaming_levels[index].is_requesting_unload_and_removal
            && !should_be_loaded
            && !world.info.streaming_levels[index].is_visible
        {
            world.info.streaming_levels.remove(index);
            continue;
        }

        levels_have_load_request_pending |=
            world.info.streaming_levels[index].has_load_request_pending;
        index += 1;
    }

    // Initial loading blocks so play never starts on a half-loaded map.
    if levels_have_load_request_pending
        && (!world.has_begun_play() || world.info.time_seconds < 1.0)
    {
        ctx.assets.flush(None);
        ctx.assets.drain_completions();
        attach_all_resident(world, ctx);
    }
}

/// Whether the streamer may issue load requests this frame
pub fn allow_level_load_requests(world: &World, ctx: &EngineContext) -> bool {
    if ctx.config.is_editor {
        return true;
    }
    if world.allow_level_load_override != 0 {
        return world.allow_level_load_override > 0;
    }
    // Pending requests while gameplay is running hold new loads back.
    !(ctx.assets.is_async_loading() && world.info.time_seconds > 1.0)
}

/// Resolve a streaming ref's level pointer from a resident package
fn attach_loaded_level(world: &mut World, ctx: &mut EngineContext, index: usize) {
    let streaming = &world.info.streaming_levels[index];
    let package_name = streaming.package_name.clone();
    let expected_guid = streaming.guid;

    let Some(package) = ctx.assets.resident(&package_name).cloned() else {
        return;
    };
    if expected_guid.is_valid() && package.guid != expected_guid {
        warn!(
            "package '{}' guid mismatch on attach; ignoring load",
            package_name
        );
        return;
    }
    let Some(template) = package.level.as_ref() else {
        warn!("package '{}' is not a level", package_name);
        return;
    };

    let mut level = Level::new(&package_name, package.guid);
    populate_level(ctx, &mut level, template);
    world.info.streaming_levels[index].loaded_level = Some(Rc::new(RefCell::new(level)));
    world.info.streaming_levels[index].has_load_request_pending = false;
    ctx.gc.cancel_unload(&package_name);
    debug!("level '{}' attached", package_name);
}

/// Resolve any refs whose packages became resident during a flush
fn attach_all_resident(world: &mut World, ctx: &mut EngineContext) {
    for index in 0..world.info.streaming_levels.len() {
        if world.info.streaming_levels[index].loaded_level.is_none()
            && ctx
                .assets
                .is_resident(&world.info.streaming_levels[index].package_name)
        {
            attach_loaded_level(world, ctx, index);
        }
    }
}

/// Block until level streaming reaches steady state: no level loading,
/// none mid-association. Optionally only flushes visibility work, and
/// optionally excludes packages carrying a name suffix from the flush.
pub fn flush_level_streaming(
    world: &mut World,
    ctx: &mut EngineContext,
    views: &[Vec3],
    only_flush_visibility: bool,
    exclude_suffix: Option<&str>,
) {
    // Adding and removing entities mid-tick is not survivable.
    debug_assert!(!world.in_tick);

    let old_override = world.allow_level_load_override;
    world.allow_level_load_override = if only_flush_visibility { 0 } else { 1 };

    update_level_streaming(world, ctx, views);

    if !only_flush_visibility {
        ctx.assets.flush(exclude_suffix);
        ctx.assets.drain_completions();
    }

    update_level_streaming(world, ctx, views);

    // Association is spread across frames; loop until it settles.
    while world.is_visibility_request_pending() {
        if !only_flush_visibility {
            ctx.assets.flush(None);
            ctx.assets.drain_completions();
        }
        update_level_streaming(world, ctx, views);
    }
    debug_assert!(world.current_level_pending_visibility.is_none());

    // One more pass so every remove-from-world request lands.
    update_level_streaming(world, ctx, views);

    if !only_flush_visibility {
        world.info.requested_block_on_async_loading = false;
    }
    world.allow_level_load_override = old_override;
}
