//! World container and levels

pub mod demo;
pub mod exec;
pub mod level;
pub mod scene;
pub mod world;
pub mod world_info;

pub use demo::DemoDriver;
pub use level::{CrossLevelRef, InitState, Level, LevelRef, Sequence};
pub use scene::{NavOctree, PhysicsScene, RendererScene, SpatialHash};
pub use world::{GameInfo, SpawnParams, World, FIXED_PERSISTENT_SLOTS, FIXED_STREAMED_SLOTS};
pub use world_info::{NetMode, WorldInfo};
