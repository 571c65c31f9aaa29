//! Minimal listen-server demo: loads an entry map with one
//! distance-streamed level, walks a viewer toward it and back, and logs
//! the residency transitions.

use anyhow::Result;
use glam::Vec3;
use parking_lot::RwLock;
use std::sync::Arc;
use strata_engine::assets::{EntityTemplate, LevelTemplate, PackageCatalog, PackageTemplate};
use strata_engine::streaming::{StreamingPolicy, StreamingRef};
use strata_engine::{Engine, EngineConfig, EntityClass, Guid};

fn build_catalog() -> Arc<RwLock<PackageCatalog>> {
    let mut catalog = PackageCatalog::new();

    let mut streamed = PackageTemplate::new("Outpost", Guid::from_words(2, 0, 0, 0));
    let mut streamed_level = LevelTemplate::default();
    streamed_level.has_bsp = true;
    let mut door = EntityTemplate::new("Door_1", EntityClass::new("Demo.Door"));
    door.location = Vec3::new(5000.0, 0.0, 0.0);
    door.is_static = true;
    streamed_level.entities.push(door);
    streamed.level = Some(streamed_level);
    catalog.add(streamed);

    let mut entry = PackageTemplate::new("EntryMap", Guid::from_words(1, 0, 0, 0));
    let mut entry_level = LevelTemplate::default();
    entry_level.has_bsp = true;
    entry_level.streaming_levels.push(StreamingRef::new(
        "Outpost",
        Guid::from_words(2, 0, 0, 0),
        StreamingPolicy::DistanceBased {
            origin: Vec3::new(5000.0, 0.0, 0.0),
            max_distance: 8000.0,
        },
    ));
    entry.level = Some(entry_level);
    catalog.add(entry);

    Arc::new(RwLock::new(catalog))
}

fn main() -> Result<()> {
    env_logger::init();

    let mut engine = Engine::new(build_catalog(), EngineConfig::default(), 2);
    engine.load_map("EntryMap?Listen?game=Demo.Arena")?;

    for frame in 0..240u32 {
        // Walk out past the streaming radius and back.
        let x = if frame < 120 {
            frame as f32 * 200.0
        } else {
            (240 - frame) as f32 * 200.0
        };
        engine.tick(1.0 / 60.0, &[Vec3::new(x, 0.0, 0.0)]);
    }

    engine.exec("LOGACTORCOUNTS");
    let (total, tickable) = engine.world.actor_counts();
    println!(
        "final world: {} entities ({} tickable), {} streamed level(s) resident",
        total,
        tickable,
        engine.world.levels.len() - 1
    );
    Ok(())
}
