//! Engine context
//!
//! Collaborator handles and cross-world state threaded by reference
//! through the call graph: the asset server, progress sink, auth module,
//! local players, pending travel requests and engine configuration.
//! Nothing here is global; every caller receives the context explicitly.

use crate::assets::{AssetServer, PackageCatalog};
use crate::entity::{DefaultGame, EntityId, EntityRef, GameScript};
use crate::net::message::PeerAddr;
use crate::streaming::frame_budget::LoadThrottler;
use crate::streaming::gc::LevelPurgeSet;
use crate::url::{TravelType, Url};
use log::{info, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Kinds of user-visible progress messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    ConnectionFailure,
    PeerConnectionFailure,
    PeerHostMigrationFailure,
}

#[derive(Debug, Clone)]
pub struct ProgressMessage {
    pub kind: ProgressKind,
    pub title: String,
    pub message: String,
}

/// Records user-visible progress messages for the front end to display
#[derive(Debug, Default)]
pub struct ProgressLog {
    pub messages: Vec<ProgressMessage>,
}

impl ProgressLog {
    pub fn set_progress(&mut self, kind: ProgressKind, title: &str, message: &str) {
        warn!("progress [{:?}] {}: {}", kind, title, message);
        self.messages.push(ProgressMessage {
            kind,
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    pub fn last(&self) -> Option<&ProgressMessage> {
        self.messages.last()
    }
}

/// Texture-LOD streaming manager notifications
#[derive(Debug, Default)]
pub struct TextureStreamingLog {
    pub added_levels: Vec<String>,
    pub removed_levels: Vec<String>,
}

impl TextureStreamingLog {
    pub fn add_level(&mut self, package_name: &str) {
        self.added_levels.push(package_name.to_string());
    }

    pub fn remove_level(&mut self, package_name: &str) {
        self.removed_levels.push(package_name.to_string());
    }
}

/// A local player: the controller it drives plus notifications received
#[derive(Default)]
pub struct LocalPlayer {
    pub controller: Option<EntityRef>,
    /// `(package, is_final_hop)` per world-loaded notification
    pub loaded_world_notifies: Vec<(String, bool)>,
    /// `(package, visible)` per level visibility change
    pub visibility_updates: Vec<(String, bool)>,
}

/// Session info delivered with a migrated-session travel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedSessionInfo {
    pub session_name: String,
    pub search_class_path: String,
    pub platform_blob: Vec<u8>,
}

pub type GameScriptFactory = Rc<dyn Fn() -> Box<dyn GameScript>>;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Accepted protocol range for incoming connections
    pub min_net_version: u32,
    pub net_version: u32,
    /// Upper bound of the server-side netspeed clamp
    pub max_client_rate: i32,
    /// Rate a client requests after its challenge
    pub client_netspeed: i32,
    pub default_port: u16,
    /// Map used as the intermediate hop of a seamless transition
    pub transition_map: String,
    pub use_background_level_streaming: bool,
    pub is_editor: bool,
    pub allow_host_migration: bool,
    pub host_migration_timeout: f32,
    /// Delay before the elected host starts its own travel
    pub host_travel_countdown: f32,
    /// Gametype remap table applied to `?game=` options
    pub game_class_remap: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_net_version: 17,
            net_version: 19,
            max_client_rate: 15000,
            client_netspeed: 10000,
            default_port: 7777,
            transition_map: "Transition".to_string(),
            use_background_level_streaming: true,
            is_editor: false,
            allow_host_migration: true,
            host_migration_timeout: 30.0,
            host_travel_countdown: 1.0,
            game_class_remap: Vec::new(),
        }
    }
}

/// Shared engine state threaded through the call graph
pub struct EngineContext {
    pub assets: AssetServer,
    pub progress: ProgressLog,
    pub auth: Box<dyn crate::net::AuthModule>,
    pub texture_streaming: TextureStreamingLog,
    pub local_players: Vec<LocalPlayer>,
    pub gc: LevelPurgeSet,
    /// Cap on level load requests kicked per frame
    pub load_throttler: LoadThrottler,
    pub config: EngineConfig,
    /// Absolute/relative travel requested by failure handling or peers
    pub pending_client_travel: Option<(String, TravelType)>,
    /// Travel the elected migration host should start on itself
    pub pending_host_travel: Option<String>,
    /// Peer addresses the server asked this client to connect to
    pub peer_connect_requests: Vec<PeerAddr>,
    pub migrated_session: Option<MigratedSessionInfo>,
    /// URL of the last successful travel, reused by `?Restart`
    pub last_url: Url,
    /// Rendering-command barrier invocations, one per well-defined point
    pub render_flushes: u32,
    /// A soft garbage-collection pass was requested for this frame
    pub gc_requested: bool,
    game_factories: FxHashMap<String, GameScriptFactory>,
    next_entity_id: u64,
}

impl EngineContext {
    pub fn new(catalog: Arc<RwLock<PackageCatalog>>, config: EngineConfig, asset_latency: u32) -> Self {
        EngineContext {
            assets: AssetServer::new(catalog, asset_latency),
            progress: ProgressLog::default(),
            auth: Box::new(crate::net::NullAuth),
            texture_streaming: TextureStreamingLog::default(),
            local_players: Vec::new(),
            gc: LevelPurgeSet::default(),
            load_throttler: LoadThrottler::default(),
            config,
            pending_client_travel: None,
            pending_host_travel: None,
            peer_connect_requests: Vec::new(),
            migrated_session: None,
            last_url: Url::default(),
            render_flushes: 0,
            gc_requested: false,
            game_factories: FxHashMap::default(),
            next_entity_id: 0,
        }
    }

    /// Context over an empty catalog, for unit tests
    pub fn for_tests() -> Self {
        EngineContext::new(
            Arc::new(RwLock::new(PackageCatalog::new())),
            EngineConfig::default(),
            0,
        )
    }

    pub fn alloc_entity_id(&mut self) -> EntityId {
        let id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;
        id
    }

    /// Register the script factory for a gametype class path
    pub fn register_game(&mut self, class_path: &str, factory: GameScriptFactory) {
        self.game_factories.insert(class_path.to_string(), factory);
    }

    /// Apply the gametype remap table to a requested class path
    pub fn remap_game_class(&self, requested: &str) -> String {
        for (from, to) in &self.config.game_class_remap {
            if from == requested {
                return to.clone();
            }
        }
        requested.to_string()
    }

    pub fn create_game_script(&self, class_path: &str) -> Box<dyn GameScript> {
        match self.game_factories.get(class_path) {
            Some(factory) => factory(),
            None => Box::new(DefaultGame),
        }
    }

    /// Request a client travel, e.g. to `?failed` after a lost connection
    pub fn set_client_travel(&mut self, url: &str, travel_type: TravelType) {
        info!("client travel requested: {} ({:?})", url, travel_type);
        self.pending_client_travel = Some((url.to_string(), travel_type));
    }

    /// Barrier with the rendering thread, invoked before world swaps,
    /// physics teardown and collection passes
    pub fn flush_rendering_commands(&mut self) {
        self.render_flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_are_unique_and_monotonic() {
        let mut ctx = EngineContext::for_tests();
        let a = ctx.alloc_entity_id();
        let b = ctx.alloc_entity_id();
        assert!(b > a);
    }

    #[test]
    fn test_game_class_remap() {
        let mut ctx = EngineContext::for_tests();
        ctx.config
            .game_class_remap
            .push(("OldGame.Arena".to_string(), "MyGame.Arena".to_string()));
        assert_eq!(ctx.remap_game_class("OldGame.Arena"), "MyGame.Arena");
        assert_eq!(ctx.remap_game_class("Other"), "Other");
    }

    #[test]
    fn test_progress_log_records() {
        let mut ctx = EngineContext::for_tests();
        ctx.progress
            .set_progress(ProgressKind::ConnectionFailure, "Connection Failed", "reason");
        let last = ctx.progress.last().expect("no message");
        assert_eq!(last.kind, ProgressKind::ConnectionFailure);
    }
}
