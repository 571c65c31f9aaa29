//! strata-engine: a soft real-time world simulation runtime
//!
//! The core owns the in-memory scene graph, associates and dissociates
//! streamed levels incrementally, drives per-frame simulation of
//! scripted entities, and coordinates host/client/peer network state
//! during live play and mid-match host migration.

pub mod assets;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod guid;
pub mod migration;
pub mod net;
pub mod streaming;
pub mod travel;
pub mod url;
pub mod world;

pub use assets::{AssetServer, PackageCatalog, PackageTemplate};
pub use context::{EngineConfig, EngineContext, LocalPlayer, ProgressKind};
pub use engine::Engine;
pub use entity::{Entity, EntityClass, EntityId, EntityRef, EntityScript, GameScript, NetRole};
pub use error::{EngineError, EngineResult};
pub use guid::Guid;
pub use migration::HostMigrationProgress;
pub use travel::SeamlessTravelHandler;
pub use url::{TravelType, Url};
pub use world::{Level, LevelRef, NetMode, World};
