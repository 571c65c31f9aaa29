//! World-info: per-world global state
//!
//! The original engine kept this on a singleton actor in slot 0; the data
//! lives here as a plain struct while the slot-0 entity remains a marker
//! that keeps the actor-list invariants intact.

use crate::migration::HostMigrationState;
use crate::streaming::StreamingRef;

/// How this process participates in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMode {
    Standalone,
    DedicatedServer,
    ListenServer,
    Client,
}

/// Global per-world state: timing, streaming descriptors, net mode
#[derive(Debug)]
pub struct WorldInfo {
    pub time_seconds: f32,
    pub real_time_seconds: f32,
    pub audio_time_seconds: f32,
    pub delta_seconds: f32,
    pub net_mode: NetMode,
    /// Set once gameplay has started; script calls are enabled after this
    pub begun_play: bool,
    /// Set while begin-play is being routed during level association so
    /// script can distinguish startup spawns from gameplay-time spawns
    pub startup: bool,
    /// Residency descriptors driving the level streamer
    pub streaming_levels: Vec<StreamingRef>,
    /// Non-empty while a server travel is pending; blocks transitions
    pub next_url: String,
    /// Loading phase stamped on packages announced mid-transition, so
    /// destination-map packages wait for the world switch to verify
    pub seamless_phase: u8,
    pub host_migration: HostMigrationState,
    /// Set when a blocking load was requested and the loader must be
    /// flushed before the next frame proceeds
    pub requested_block_on_async_loading: bool,
}

impl WorldInfo {
    pub fn new(net_mode: NetMode) -> Self {
        WorldInfo {
            time_seconds: 0.0,
            real_time_seconds: 0.0,
            audio_time_seconds: 0.0,
            delta_seconds: 0.0,
            net_mode,
            begun_play: false,
            startup: false,
            streaming_levels: Vec::new(),
            next_url: String::new(),
            seamless_phase: 0,
            host_migration: HostMigrationState::default(),
            requested_block_on_async_loading: false,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(
            self.net_mode,
            NetMode::Standalone | NetMode::DedicatedServer | NetMode::ListenServer
        )
    }

    pub fn is_client(&self) -> bool {
        self.net_mode == NetMode::Client
    }

    pub fn advance_time(&mut self, delta: f32) {
        self.delta_seconds = delta;
        self.time_seconds += delta;
        self.real_time_seconds += delta;
        self.audio_time_seconds += delta;
    }

    pub fn reset_time(&mut self) {
        self.time_seconds = 0.0;
        self.real_time_seconds = 0.0;
        self.audio_time_seconds = 0.0;
    }
}
