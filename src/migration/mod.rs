//! Host migration
//!
//! When the authoritative server is lost, the surviving peers coordinate
//! over the peer net driver: everyone broadcasts the disconnect, script
//! elects a new host, the winner spins up a listen server and tells the
//! others where to travel.

use crate::context::{EngineContext, ProgressKind};
use crate::net::message::ControlMessage;
use crate::url::TravelType;
use crate::world::World;
use log::{debug, info, warn};

/// Progress through the migration lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostMigrationProgress {
    #[default]
    None,
    /// Broadcasting disconnects and waiting for election
    FindingNewHost,
    /// This peer was elected and is standing up a server
    MigratingAsHost,
    /// Another peer was elected; waiting for its travel message
    MigratingAsClient,
    /// Travel to the new host has been issued
    ClientTravel,
    /// The new host is up; its own travel fires after a countdown
    HostReadyToTravel,
    Failed,
}

/// Per-world migration state, latched by the control channel
#[derive(Debug)]
pub struct HostMigrationState {
    pub progress: HostMigrationProgress,
    pub enabled: bool,
    pub elapsed: f32,
    pub travel_countdown: f32,
    pub travel_url: String,
}

impl Default for HostMigrationState {
    fn default() -> Self {
        HostMigrationState {
            progress: HostMigrationProgress::None,
            enabled: true,
            elapsed: 0.0,
            travel_countdown: 0.0,
            travel_url: String::new(),
        }
    }
}

/// Record a state transition
pub fn update_state(world: &mut World, new_state: HostMigrationProgress) {
    let old_state = world.info.host_migration.progress;
    if old_state != new_state {
        info!("host migration: {:?} -> {:?}", old_state, new_state);
    }
    world.info.host_migration.progress = new_state;
}

/// Begin (or keep driving) host migration after a lost server
/// connection. Called repeatedly as successive disconnect events arrive;
/// while finding a new host every call re-broadcasts the disconnect to
/// every peer. Returns true while migration is in progress.
pub fn begin_host_migration(world: &mut World, ctx: &mut EngineContext) -> bool {
    if !ctx.config.allow_host_migration || !world.info.host_migration.enabled {
        return false;
    }
    if world.peer_net_driver.is_none() {
        return false;
    }
    let script_allows = world
        .game
        .as_ref()
        .map_or(true, |game| game.script.can_begin_host_migration());
    if !script_allows {
        return false;
    }

    let has_peers = world
        .peer_net_driver
        .as_ref()
        .map_or(false, |driver| !driver.client_connections.is_empty());

    // Only start once; there will be multiple disconnect messages.
    if has_peers && world.info.host_migration.progress == HostMigrationProgress::None {
        debug!("notifying peers of server loss");
        update_state(world, HostMigrationProgress::FindingNewHost);
    }

    if world.info.host_migration.progress == HostMigrationProgress::FindingNewHost {
        let player_id = local_player_id(world);
        if let Some(driver) = world.peer_net_driver.as_mut() {
            for connection in driver.client_connections.iter_mut() {
                let _ = connection.send(&ControlMessage::PeerDisconnectHost { player_id });
                connection.flush_net();
            }
        }
    }

    matches!(
        world.info.host_migration.progress,
        HostMigrationProgress::FindingNewHost
            | HostMigrationProgress::MigratingAsHost
            | HostMigrationProgress::MigratingAsClient
            | HostMigrationProgress::ClientTravel
            | HostMigrationProgress::HostReadyToTravel
    )
}

/// Per-tick migration update: timeout tracking, election, host travel
pub fn tick_host_migration(world: &mut World, ctx: &mut EngineContext, delta: f32) {
    let progress = world.info.host_migration.progress;
    if matches!(
        progress,
        HostMigrationProgress::None | HostMigrationProgress::Failed
    ) {
        return;
    }

    world.info.host_migration.elapsed += delta;
    let elapsed = world.info.host_migration.elapsed;
    let timeout = ctx.config.host_migration_timeout;

    if elapsed >= timeout {
        warn!("timeout waiting for host migration");
        fail_migration(world, ctx);
        return;
    }

    match progress {
        HostMigrationProgress::FindingNewHost => {
            let peer_count = world
                .peer_net_driver
                .as_ref()
                .map_or(0, |driver| driver.client_connections.len());
            if peer_count == 0 {
                warn!("no valid peers to migrate to");
                fail_migration(world, ctx);
                return;
            }

            // Keep telling peers about the disconnect until the
            // election completes or the user leaves the session.
            let player_id = local_player_id(world);
            if let Some(driver) = world.peer_net_driver.as_mut() {
                for connection in driver.client_connections.iter_mut() {
                    let _ = connection.send(&ControlMessage::PeerDisconnectHost { player_id });
                    connection.flush_net();
                }
            }

            let all_peers_lost_host = world
                .peer_net_driver
                .as_ref()
                .map_or(false, |driver| {
                    driver
                        .client_connections
                        .iter()
                        .all(|connection| connection.lost_connection_to_host)
                });
            let reached_midpoint = elapsed > timeout * 0.5;

            if all_peers_lost_host || reached_midpoint {
                let elected = world
                    .game
                    .as_mut()
                    .map_or(false, |game| game.script.migrate_new_host());
                if elected {
                    become_host(world, ctx);
                }
            }
        }
        HostMigrationProgress::HostReadyToTravel => {
            world.info.host_migration.travel_countdown -= delta;
            if world.info.host_migration.travel_countdown < 0.0 {
                let url = world.info.host_migration.travel_url.clone();
                ctx.pending_host_travel = Some(url);
            }
        }
        _ => {}
    }
}

/// The election picked this peer: stand up a listen server and direct the
/// survivors to it.
fn become_host(world: &mut World, ctx: &mut EngineContext) {
    if world.info.host_migration.progress == HostMigrationProgress::HostReadyToTravel {
        return;
    }
    update_state(world, HostMigrationProgress::MigratingAsHost);

    let player_id = local_player_id(world);
    if let Some(driver) = world.peer_net_driver.as_mut() {
        for connection in driver.client_connections.iter_mut() {
            let _ = connection.send(&ControlMessage::PeerNewHostFound { player_id });
            connection.flush_net();
        }
    }

    // The dead server connection is no longer useful.
    world.net_driver = None;
    let listen_url =
        crate::url::Url::parse(&format!("{}?Listen", world.package_name)).unwrap_or_default();
    if world.listen(ctx, &listen_url).is_err() {
        fail_migration(world, ctx);
        return;
    }
    let address = world
        .net_driver
        .as_ref()
        .and_then(|driver| driver.listen_addr.clone())
        .unwrap_or_default();

    if let Some(driver) = world.peer_net_driver.as_mut() {
        for connection in driver.client_connections.iter_mut() {
            let _ = connection.send(&ControlMessage::PeerNewHostTravel {
                address: address.clone(),
            });
            connection.flush_net();
        }
    }

    world.info.host_migration.travel_countdown = ctx.config.host_travel_countdown;
    world.info.host_migration.travel_url = format!("{}?Listen", world.package_name);
    update_state(world, HostMigrationProgress::HostReadyToTravel);
}

/// A peer told us it was elected; latch unless already migrating
pub fn on_peer_new_host_found(world: &mut World) {
    if world.info.host_migration.progress != HostMigrationProgress::FindingNewHost {
        debug!("ignoring new-host notification; already found a new host");
        return;
    }
    update_state(world, HostMigrationProgress::MigratingAsClient);
}

/// The new host told us where to go
pub fn on_peer_new_host_travel(world: &mut World, ctx: &mut EngineContext, address: &str) {
    update_state(world, HostMigrationProgress::ClientTravel);
    ctx.set_client_travel(address, TravelType::Absolute);
}

/// Travel via a migrated matchmaking session; ignored once a plain
/// travel is already underway
pub fn on_peer_new_host_travel_session(
    world: &mut World,
    ctx: &mut EngineContext,
    address: &str,
    session: crate::context::MigratedSessionInfo,
) -> bool {
    if world.info.host_migration.progress == HostMigrationProgress::ClientTravel {
        debug!("ignoring migrated session; already traveling to a new host");
        return false;
    }
    update_state(world, HostMigrationProgress::ClientTravel);
    ctx.migrated_session = Some(session);
    ctx.set_client_travel(address, TravelType::Absolute);
    true
}

fn fail_migration(world: &mut World, ctx: &mut EngineContext) {
    world.info.host_migration.progress = HostMigrationProgress::Failed;
    ctx.progress.set_progress(
        ProgressKind::PeerHostMigrationFailure,
        "Connection Failed",
        "Connection to host timed out",
    );
}

fn local_player_id(world: &World) -> u64 {
    world
        .net_driver
        .as_ref()
        .and_then(|driver| driver.server_connection.as_ref())
        .map(|connection| connection.player_id)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineContext;
    use crate::net::NetDriver;
    use crate::world::{NetMode, World};

    fn make_world_with_peers(peer_count: usize) -> (EngineContext, World) {
        let mut ctx = EngineContext::for_tests();
        let mut world = World::new(&mut ctx, "DM-Foo", NetMode::Client);
        let mut driver = NetDriver::new_peer();
        for index in 0..peer_count {
            let (transport, _far) = crate::net::MemoryTransport::pair(
                &format!("10.0.0.{}:7777", index + 2),
                "10.0.0.1:7777",
            );
            driver.accept(Box::new(transport));
        }
        world.peer_net_driver = Some(driver);
        (ctx, world)
    }

    #[test]
    fn test_begin_migration_latches_once() {
        let (mut ctx, mut world) = make_world_with_peers(2);
        assert!(begin_host_migration(&mut world, &mut ctx));
        assert_eq!(
            world.info.host_migration.progress,
            HostMigrationProgress::FindingNewHost
        );
        // Repeated calls keep re-broadcasting but do not change state.
        assert!(begin_host_migration(&mut world, &mut ctx));
        assert_eq!(
            world.info.host_migration.progress,
            HostMigrationProgress::FindingNewHost
        );
    }

    #[test]
    fn test_migration_requires_peer_driver() {
        let mut ctx = EngineContext::for_tests();
        let mut world = World::new(&mut ctx, "DM-Foo", NetMode::Client);
        assert!(!begin_host_migration(&mut world, &mut ctx));
    }

    #[test]
    fn test_timeout_fails_migration() {
        let (mut ctx, mut world) = make_world_with_peers(1);
        ctx.config.host_migration_timeout = 1.0;
        begin_host_migration(&mut world, &mut ctx);
        tick_host_migration(&mut world, &mut ctx, 2.0);
        assert_eq!(
            world.info.host_migration.progress,
            HostMigrationProgress::Failed
        );
        assert_eq!(
            ctx.progress.last().expect("no progress").kind,
            crate::context::ProgressKind::PeerHostMigrationFailure
        );
    }

    #[test]
    fn test_new_host_found_latched_after_election() {
        let (mut ctx, mut world) = make_world_with_peers(1);
        begin_host_migration(&mut world, &mut ctx);
        on_peer_new_host_found(&mut world);
        assert_eq!(
            world.info.host_migration.progress,
            HostMigrationProgress::MigratingAsClient
        );
        // A second notification is ignored.
        on_peer_new_host_found(&mut world);
        assert_eq!(
            world.info.host_migration.progress,
            HostMigrationProgress::MigratingAsClient
        );
    }

    #[test]
    fn test_travel_session_ignored_after_client_travel() {
        let (mut ctx, mut world) = make_world_with_peers(1);
        begin_host_migration(&mut world, &mut ctx);
        on_peer_new_host_travel(&mut world, &mut ctx, "10.0.0.2:7777");
        assert_eq!(
            world.info.host_migration.progress,
            HostMigrationProgress::ClientTravel
        );
        let accepted = on_peer_new_host_travel_session(
            &mut world,
            &mut ctx,
            "10.0.0.3:7777",
            crate::context::MigratedSessionInfo {
                session_name: "Game".to_string(),
                search_class_path: "MyGame.Search".to_string(),
                platform_blob: Vec::new(),
            },
        );
        assert!(!accepted);
        assert_eq!(
            ctx.pending_client_travel.as_ref().expect("no travel").0,
            "10.0.0.2:7777"
        );
    }
}
