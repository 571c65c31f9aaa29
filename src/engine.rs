//! Engine facade
//!
//! Owns the context, the active world and the seamless travel handler,
//! and drives the per-frame order: asset loader, world simulation and
//! net traffic, level streaming, travel, deferred collection.

use crate::assets::PackageCatalog;
use crate::context::{EngineConfig, EngineContext, ProgressKind};
use crate::error::{EngineError, EngineResult};
use crate::guid::Guid;
use crate::net::Transport;
use crate::travel::SeamlessTravelHandler;
use crate::url::Url;
use crate::world::{NetMode, World};
use glam::Vec3;
use log::info;
use parking_lot::RwLock;
use std::sync::Arc;

pub struct Engine {
    pub ctx: EngineContext,
    pub world: World,
    pub travel: SeamlessTravelHandler,
}

impl Engine {
    pub fn new(catalog: Arc<RwLock<PackageCatalog>>, config: EngineConfig, asset_latency: u32) -> Self {
        let mut ctx = EngineContext::new(catalog, config, asset_latency);
        let world = World::new(&mut ctx, "Untitled", NetMode::Standalone);
        Engine {
            ctx,
            world,
            travel: SeamlessTravelHandler::default(),
        }
    }

    /// Hard travel: load a map and make it the active world
    pub fn load_map(&mut self, url_text: &str) -> EngineResult<()> {
        let url = Url::parse(url_text).ok_or_else(|| EngineError::InvalidUrl {
            url: url_text.to_string(),
        })?;
        if !self.ctx.assets.force_resident(&url.map) {
            return Err(EngineError::PackageNotFound {
                name: url.map.clone(),
            });
        }
        let Some(package) = self.ctx.assets.resident(&url.map).cloned() else {
            return Err(EngineError::PackageNotFound {
                name: url.map.clone(),
            });
        };

        let net_mode = if url.has_option("Listen") {
            NetMode::ListenServer
        } else {
            NetMode::Standalone
        };
        let mut world = World::from_package(&mut self.ctx, &package, net_mode)?;
        world.init(&mut self.ctx);
        if world.is_server() {
            world.set_game_info(&mut self.ctx, &url);
        }
        world.begin_play(&mut self.ctx, &url, true);
        if url.has_option("Listen") {
            world.listen(&mut self.ctx, &url)?;
        }
        info!("loaded map '{}'", url.map);
        self.ctx.last_url = url;
        // Pending unloads referred to the world being replaced.
        self.ctx.gc.reset();
        self.world = world;
        Ok(())
    }

    /// Advance one frame on the game thread
    pub fn tick(&mut self, delta: f32, views: &[Vec3]) {
        self.ctx.assets.tick();
        for result in self.ctx.assets.drain_completions() {
            if !result.ok {
                self.ctx.progress.set_progress(
                    ProgressKind::ConnectionFailure,
                    "Connection Failed",
                    &format!("Failed to find package '{}'", result.package_name),
                );
                if self.world.is_client() {
                    if let Some(connection) = self
                        .world
                        .net_driver
                        .as_mut()
                        .and_then(|driver| driver.server_connection.as_mut())
                    {
                        connection.close();
                    }
                }
            }
        }

        self.world.tick(&mut self.ctx, delta);
        crate::streaming::update_level_streaming(&mut self.world, &mut self.ctx, views);
        self.travel.tick(&mut self.world, &mut self.ctx);

        if self.world.info.requested_block_on_async_loading {
            self.ctx.assets.flush(None);
            self.ctx.assets.drain_completions();
            self.world.info.requested_block_on_async_loading = false;
        }

        if self.ctx.gc_requested {
            self.ctx.gc_requested = false;
            self.collect_garbage();
        }
    }

    /// Begin a seamless transition; failures surface a progress message
    pub fn seamless_travel(&mut self, url: &str, guid: Option<Guid>) -> EngineResult<()> {
        match self
            .travel
            .start_travel(&mut self.world, &mut self.ctx, url, guid)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.travel.is_in_transition() {
                    self.ctx.progress.set_progress(
                        ProgressKind::ConnectionFailure,
                        "Connection Failed",
                        &e.to_string(),
                    );
                }
                Err(e)
            }
        }
    }

    /// Connect to a server as a client over the given transport
    pub fn client_connect(&mut self, transport: Box<dyn Transport>, url: &str, player_id: u64) {
        let url = Url::parse(url).unwrap_or_default();
        crate::net::control::client_connect(
            &mut self.world,
            &mut self.ctx,
            transport,
            &url,
            player_id,
        );
    }

    /// Resume a login the PreLogin callback paused
    pub fn resume_login(&mut self, connection_index: usize) {
        crate::net::control::resume_login(&mut self.world, &mut self.ctx, connection_index);
    }

    /// Run a deferred collection pass behind a rendering barrier
    pub fn collect_garbage(&mut self) {
        self.ctx.flush_rendering_commands();
        crate::streaming::collect_garbage(&mut self.world, &mut self.ctx);
    }

    /// Block until streaming reaches steady state
    pub fn flush_level_streaming(
        &mut self,
        views: &[Vec3],
        only_flush_visibility: bool,
        exclude_suffix: Option<&str>,
    ) {
        crate::streaming::flush_level_streaming(
            &mut self.world,
            &mut self.ctx,
            views,
            only_flush_visibility,
            exclude_suffix,
        );
    }

    /// Dispatch a console command; false means unrecognized
    pub fn exec(&mut self, line: &str) -> bool {
        self.world.exec(line)
    }
}
