//! Control channel state machines
//!
//! One state machine per connection. The server walks a client from
//! hello through version negotiation, package-map synchronization, login
//! and join; the client mirrors it and keeps `Uses` verification strictly
//! in arrival order so net indices stay deterministic. Peer connections
//! speak the peer subset used for introduction and host migration.

use crate::context::{EngineContext, MigratedSessionInfo, ProgressKind};
use crate::entity::PreLoginDecision;
use crate::migration;
use crate::net::connection::{ClientPhase, Connection, ControlState};
use crate::net::message::{ControlMessage, PeerAddr};
use crate::net::package_map::PackageInfo;
use crate::net::transport::Transport;
use crate::net::{NetDriver, MIN_CLIENT_RATE};
use crate::url::{TravelType, Url};
use crate::world::World;
use log::{debug, info, warn};

const CONNECTION_FAILED_TITLE: &str = "Connection Failed";

/// Open a client connection to a server over the given transport and
/// start the handshake.
pub fn client_connect(
    world: &mut World,
    ctx: &mut EngineContext,
    transport: Box<dyn Transport>,
    url: &Url,
    player_id: u64,
) {
    let mut connection = Connection::new(transport);
    connection.player_id = player_id;
    connection.request_url = url.to_string();
    connection.client_phase = ClientPhase::AwaitingChallenge;
    let hello = ControlMessage::Hello {
        min_version: ctx.config.min_net_version,
        current_version: ctx.config.net_version,
        supports_auth: true,
    };
    if connection.send(&hello).is_err() {
        warn!("failed to send hello");
    }
    connection.flush_net();
    world.net_driver = Some(NetDriver::new_client(connection));
    world.info.net_mode = crate::world::NetMode::Client;
}

/// Pump every driver owned by the world and dispatch control traffic
pub fn process_net(world: &mut World, ctx: &mut EngineContext) {
    // Primary driver: server connections or the connection to the server.
    if let Some(mut driver) = world.net_driver.take() {
        driver.pump_accepts();

        for index in 0..driver.client_connections.len() {
            let messages = driver.client_connections[index].drain_messages();
            for message in messages {
                handle_server_message(world, ctx, &mut driver, index, message);
            }
        }

        if let Some(mut connection) = driver.server_connection.take() {
            handle_client_connection_loss(world, ctx, &mut connection);
            for message in connection.drain_messages() {
                handle_client_message(world, ctx, &mut connection, message);
            }
            process_pending_packages(ctx, &mut connection);
            try_send_join(ctx, &mut connection);
            driver.server_connection = Some(connection);
        }

        driver.flush_all();
        driver.prune_closed();
        world.net_driver = Some(driver);
    }

    process_demo_playback(world, ctx);

    // Peer driver: mesh traffic for introduction and host migration.
    if let Some(mut driver) = world.peer_net_driver.take() {
        driver.pump_accepts();
        for index in 0..driver.client_connections.len() {
            let messages = driver.client_connections[index].drain_messages();
            for message in messages {
                handle_peer_message(world, ctx, &mut driver, index, message);
            }
        }
        driver.flush_all();
        world.peer_net_driver = Some(driver);
    }
}

/// Demo playback accepts only dependency traffic, with verification
/// forced synchronous: playback cannot wait on loads.
fn process_demo_playback(world: &mut World, ctx: &mut EngineContext) {
    let Some(mut driver) = world.demo_driver.take() else {
        return;
    };
    let mut aborted = false;
    while let Some(frame) = driver.next_frame() {
        let message = match ControlMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable demo frame: {}", e);
                continue;
            }
        };
        debug!("demo playback received: {}", message.name());
        match message {
            ControlMessage::Uses { info } => {
                let info = PackageInfo::from_wire(&info);
                driver.package_map.add_info(info.clone());
                ctx.assets.flush(None);
                if !ctx.assets.is_resident(&info.package_name) {
                    ctx.assets.load_async(&info.package_name, Some(info.guid));
                    ctx.assets.flush(None);
                }
                match ctx.assets.resident(&info.package_name) {
                    Some(package) if package.local_generation() >= info.remote_generation => {
                        if let Some(entry) = driver.package_map.find_mut(info.guid) {
                            entry.local_generation = package.local_generation();
                            entry.net_object_counts = package.net_object_counts.clone();
                            entry.resolved = true;
                        }
                        driver.package_map.compute();
                    }
                    Some(package) => {
                        // Indices would be mismatched against the older
                        // local version; stop playback.
                        warn!(
                            "aborting demo playback: '{}' generation {} behind {}",
                            info.package_name,
                            package.local_generation(),
                            info.remote_generation
                        );
                        ctx.progress.set_progress(
                            ProgressKind::ConnectionFailure,
                            CONNECTION_FAILED_TITLE,
                            &format!("Package '{}' version mismatch", info.package_name),
                        );
                        aborted = true;
                        break;
                    }
                    None => {
                        warn!(
                            "aborting demo playback: unable to synchronize '{}'",
                            info.package_name
                        );
                        aborted = true;
                        break;
                    }
                }
            }
            ControlMessage::Unload { guid } => {
                driver.package_map.remove_by_guid(guid);
                driver.package_map.compute();
            }
            other => {
                debug!("demo playback ignoring {}", other.name());
            }
        }
    }
    if !aborted {
        world.demo_driver = Some(driver);
    }
}

/// Surface a lost server connection once, then try host migration and
/// fall back to the entry map.
fn handle_client_connection_loss(
    world: &mut World,
    ctx: &mut EngineContext,
    connection: &mut Connection,
) {
    if connection.is_open() || connection.loss_reported {
        return;
    }
    connection.loss_reported = true;
    ctx.progress.set_progress(
        ProgressKind::ConnectionFailure,
        CONNECTION_FAILED_TITLE,
        "Connection to server lost",
    );
    if !migration::begin_host_migration(world, ctx) {
        ctx.set_client_travel("?failed", TravelType::Absolute);
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

fn handle_server_message(
    world: &mut World,
    ctx: &mut EngineContext,
    driver: &mut NetDriver,
    index: usize,
    message: ControlMessage,
) {
    debug!("server received: {}", message.name());
    match message {
        ControlMessage::Hello {
            min_version,
            current_version,
            supports_auth,
        } => {
            let connection = &mut driver.client_connections[index];
            if connection.state != ControlState::AwaitingHello {
                protocol_violation(connection, "unexpected Hello");
                return;
            }
            if current_version < ctx.config.min_net_version
                || min_version > ctx.config.net_version
            {
                let _ = connection.send(&ControlMessage::Upgrade {
                    min_version: ctx.config.min_net_version,
                    current_version: ctx.config.net_version,
                });
                connection.flush_net();
                connection.close();
                return;
            }
            connection.supports_auth = supports_auth;
            connection.negotiated_version = current_version.min(ctx.config.net_version);
            connection.challenge = format!("{:08X}", rand::random::<u32>());
            let challenge = ControlMessage::Challenge {
                negotiated_version: connection.negotiated_version,
                nonce: connection.challenge.clone(),
            };
            let _ = connection.send(&challenge);
            connection.flush_net();
            connection.state = ControlState::AwaitingLogin;
        }

        ControlMessage::Netspeed { rate } => {
            let max_client_rate = driver.max_client_rate;
            let connection = &mut driver.client_connections[index];
            connection.current_net_speed = rate.clamp(MIN_CLIENT_RATE, max_client_rate);
            debug!("client netspeed is {}", connection.current_net_speed);
        }

        ControlMessage::Have { guid, generation } => {
            let connection = &mut driver.client_connections[index];
            match connection.package_map.find_mut(guid) {
                Some(info) => {
                    info.remote_generation = generation;
                    // Compute before any deferred removal executes so all
                    // object counts are settled first.
                    connection.package_map.compute();
                    if let Some(slot) = connection
                        .pending_remove_package_guids
                        .iter()
                        .position(|pending| *pending == guid)
                    {
                        connection.pending_remove_package_guids.remove(slot);
                        connection.package_map.remove_by_guid(guid);
                        connection.package_map.compute();
                    }
                }
                None => {
                    // A GUID the client should not be using; kick it.
                    protocol_violation(connection, "Have for unknown package");
                }
            }
        }

        ControlMessage::Abort { guid } => {
            let connection = &mut driver.client_connections[index];
            if let Some(slot) = connection
                .pending_remove_package_guids
                .iter()
                .position(|pending| *pending == guid)
            {
                connection.pending_remove_package_guids.remove(slot);
                connection.package_map.remove_by_guid(guid);
                connection.package_map.compute();
            } else {
                debug!("received Abort with unexpected guid {}", guid);
            }
        }

        ControlMessage::Skip { guid } => {
            let connection = &mut driver.client_connections[index];
            if let Some(info) = connection.package_map.find(guid) {
                info!("client skipped download of '{}'", info.package_name);
                connection.package_map.remove_by_guid(guid);
                connection.package_map.compute();
            }
        }

        ControlMessage::Login {
            response,
            request_url,
            player_id,
        } => {
            let max_client_rate = driver.max_client_rate;
            let connection = &mut driver.client_connections[index];
            if connection.state != ControlState::AwaitingLogin {
                protocol_violation(connection, "Login before Challenge");
                return;
            }
            connection.client_response = response;
            connection.request_url = request_url.clone();
            connection.player_id = player_id;
            debug!("login request: {}", request_url);

            // A bandwidth cap in the URL acts like a sticky netspeed.
            let bandwidth_limit = Url::parse(&request_url).and_then(|url| {
                url.option("BandwidthLimit")
                    .and_then(|value| value.parse::<f32>().ok())
            });
            if let Some(limit) = bandwidth_limit {
                connection.current_net_speed =
                    (limit as i32).clamp(MIN_CLIENT_RATE, max_client_rate);
            }

            let options = login_options(&request_url);
            let address = connection.remote_addr();
            let decision = match world.game.as_mut() {
                Some(game) => game.script.pre_login(&options, &address, player_id),
                None => PreLoginDecision::Accept,
            };
            match decision {
                PreLoginDecision::Reject(reason) => {
                    debug!("prelogin failure: {}", reason);
                    let connection = &mut driver.client_connections[index];
                    let _ = connection.send(&ControlMessage::Failure { reason });
                    connection.flush_net();
                    connection.close();
                }
                PreLoginDecision::Pause => {
                    debug!("login process paused, waiting for resume");
                    let connection = &mut driver.client_connections[index];
                    connection.login_paused = true;
                    connection.welcome_ready = true;
                    connection.state = ControlState::PreLoginPending;
                }
                PreLoginDecision::Accept => {
                    welcome_player(world, driver, index);
                }
            }
        }

        ControlMessage::Join => {
            let connection = &mut driver.client_connections[index];
            // No Join before Welcome; no second controller either.
            if !connection.welcomed {
                protocol_violation(connection, "Join before Welcome");
                return;
            }
            if connection.controller.is_some() {
                return;
            }
            connection.package_map.compute();
            let player_id = connection.player_id;
            debug!("join request: {}", connection.request_url);
            match world.spawn_player_controller(ctx, player_id) {
                Ok(controller) => {
                    let connection = &mut driver.client_connections[index];
                    let id = controller.borrow().state.id;
                    connection.open_actor_channel(id, &controller);
                    connection.controller = Some(controller);
                    connection.state = ControlState::InGame;
                    info!("join succeeded: playerid={:016X}", player_id);
                }
                Err(e) => {
                    let reason = e.to_string();
                    debug!("join failure: {}", reason);
                    let connection = &mut driver.client_connections[index];
                    let _ = connection.send(&ControlMessage::Failure { reason });
                    connection.flush_net();
                }
            }
        }

        ControlMessage::JoinSplit {
            player_id,
            request_url,
        } => {
            handle_join_split(world, ctx, driver, index, player_id, request_url);
        }

        ControlMessage::PcSwap { child_index } => {
            let connection = &mut driver.client_connections[index];
            let valid = if child_index >= 0 {
                (child_index as usize) < connection.children.len()
            } else {
                true
            };
            if !valid {
                debug!("received invalid swap message with child index {}", child_index);
                return;
            }
            let swapped = world
                .controllers
                .iter()
                .find(|controller| controller.borrow().state.pending_swap)
                .cloned();
            match swapped {
                Some(controller) => {
                    crate::entity::destroy_entity(world, &controller);
                }
                None => debug!("no controller awaiting swap"),
            }
        }

        ControlMessage::PeerListen { port } => {
            let connection = &driver.client_connections[index];
            let peer = PeerAddr {
                player_id: connection.player_id,
                ip: parse_ip(&connection.remote_addr()),
                port,
            };
            info!("new listening peer at {}", peer.connect_str());
            for (other_index, other) in driver.client_connections.iter_mut().enumerate() {
                if other_index != index {
                    let _ = other.send(&ControlMessage::PeerConnect { peer: peer.clone() });
                    other.flush_net();
                }
            }
        }

        ControlMessage::Failure { reason } => {
            let connection = &mut driver.client_connections[index];
            warn!("client reported failure: {}", reason);
            connection.close();
        }

        ControlMessage::DebugText { text } => {
            debug!("received DebugText [{}]", text);
        }

        ControlMessage::ServerAuthRequest => ctx.auth.server_auth_request(),
        ControlMessage::AuthRequestPeer { remote_uid } => ctx.auth.auth_request_peer(remote_uid),
        ControlMessage::AuthBlob { chunk } => {
            let connection = &mut driver.client_connections[index];
            connection.auth_blob_buffer.push_str(&chunk.blob);
            if chunk.current + 1 >= chunk.num {
                let blob = std::mem::take(&mut connection.auth_blob_buffer);
                ctx.auth.auth_blob(&blob);
            }
        }
        ControlMessage::AuthBlobPeer { remote_uid, chunk } => {
            ctx.auth.auth_blob_peer(remote_uid, &chunk.blob);
        }
        ControlMessage::AuthKillPeer { remote_uid } => ctx.auth.auth_kill_peer(remote_uid),
        ControlMessage::AuthRetry => ctx.auth.auth_retry(),

        other => {
            debug!("unexpected control message on server: {}", other.name());
        }
    }
}

fn handle_join_split(
    world: &mut World,
    ctx: &mut EngineContext,
    driver: &mut NetDriver,
    index: usize,
    player_id: u64,
    request_url: String,
) {
    let options = login_options(&request_url);
    let address = driver.client_connections[index].remote_addr();
    let parent_paused = driver.client_connections[index].login_paused;

    let mut child = Connection::new_child();
    child.player_id = player_id;
    child.request_url = request_url;

    let decision = match world.game.as_mut() {
        Some(game) => game.script.pre_login(&options, &address, player_id),
        None => PreLoginDecision::Accept,
    };

    match decision {
        PreLoginDecision::Reject(reason) => {
            // If any splitscreen viewport fails to join, all viewports on
            // that client fail with it.
            debug!("splitscreen prelogin failure: {}", reason);
            let parent = &mut driver.client_connections[index];
            let _ = parent.send(&ControlMessage::Failure { reason });
            parent.flush_net();
        }
        PreLoginDecision::Pause => {
            child.login_paused = true;
            child.welcome_ready = true;
            driver.client_connections[index].children.push(child);
        }
        PreLoginDecision::Accept if parent_paused => {
            // A paused parent login holds its children too.
            child.login_paused = true;
            child.welcome_ready = true;
            driver.client_connections[index].children.push(child);
        }
        PreLoginDecision::Accept => {
            driver.client_connections[index].children.push(child);
            let child_index = driver.client_connections[index].children.len() - 1;
            welcome_split_player(world, ctx, driver, index, child_index);
        }
    }
}

/// Copy the master package map, announce each entry, and welcome the
/// player with the level and gametype.
pub fn welcome_player(world: &mut World, driver: &mut NetDriver, index: usize) {
    let master = driver.master_map.clone();
    let connection = &mut driver.client_connections[index];
    connection.package_map.copy_from(&master);

    let level_name = world.package_name.clone();
    let game_path = world
        .game
        .as_ref()
        .map(|game| game.entity.borrow().state.class.path.clone())
        .unwrap_or_default();
    let _ = connection.send(&ControlMessage::Welcome {
        level_name,
        game_path,
    });
    for info in master.list.iter() {
        let _ = connection.send(&ControlMessage::Uses {
            info: info.to_wire(info.local_generation),
        });
    }
    connection.flush_net();
    // Initial join data does not count against netspeed throttling;
    // the connection is not fully open until it all arrives anyway.
    connection.queued_bytes = 0;
    connection.welcomed = true;
    connection.welcome_ready = false;
    connection.state = ControlState::Welcomed;
}

/// Spawn the controller for an accepted split-screen child; the child
/// shares its parent's transport so no Welcome round-trip is needed.
pub fn welcome_split_player(
    world: &mut World,
    ctx: &mut EngineContext,
    driver: &mut NetDriver,
    index: usize,
    child_index: usize,
) {
    let player_id = driver.client_connections[index].children[child_index].player_id;
    debug!("splitscreen join request: playerid={:016X}", player_id);
    match world.spawn_player_controller(ctx, player_id) {
        Ok(controller) => {
            let child = &mut driver.client_connections[index].children[child_index];
            child.welcomed = true;
            child.controller = Some(controller);
            child.state = ControlState::InGame;
        }
        Err(e) => {
            let reason = e.to_string();
            debug!("splitscreen join failure: {}", reason);
            let parent = &mut driver.client_connections[index];
            parent.children.remove(child_index);
            let _ = parent.send(&ControlMessage::Failure { reason });
            parent.flush_net();
        }
    }
}

/// Resume a login the PreLogin callback paused; welcomes the connection
/// and any children held with it.
pub fn resume_login(world: &mut World, ctx: &mut EngineContext, index: usize) {
    let Some(mut driver) = world.net_driver.take() else {
        return;
    };
    if index < driver.client_connections.len() {
        let ready = {
            let connection = &mut driver.client_connections[index];
            if connection.login_paused && connection.welcome_ready {
                connection.login_paused = false;
                true
            } else {
                false
            }
        };
        if ready {
            welcome_player(world, &mut driver, index);
            let held_children: Vec<usize> = driver.client_connections[index]
                .children
                .iter()
                .enumerate()
                .filter(|(_, child)| child.login_paused && child.welcome_ready)
                .map(|(child_index, _)| child_index)
                .collect();
            for child_index in held_children {
                driver.client_connections[index].children[child_index].login_paused = false;
                welcome_split_player(world, ctx, &mut driver, index, child_index);
            }
        }
    }
    world.net_driver = Some(driver);
}

fn protocol_violation(connection: &mut Connection, reason: &str) {
    warn!("protocol violation: {}", reason);
    let _ = connection.send(&ControlMessage::Failure {
        reason: reason.to_string(),
    });
    connection.flush_net();
    connection.close();
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

fn handle_client_message(
    world: &mut World,
    ctx: &mut EngineContext,
    connection: &mut Connection,
    message: ControlMessage,
) {
    debug!("client received: {}", message.name());
    match message {
        ControlMessage::Challenge {
            negotiated_version,
            nonce,
        } => {
            connection.negotiated_version = negotiated_version;
            let _ = connection.send(&ControlMessage::Netspeed {
                rate: ctx.config.client_netspeed,
            });
            let login = ControlMessage::Login {
                response: format!("{}-ack", nonce),
                request_url: connection.request_url.clone(),
                player_id: connection.player_id,
            };
            let _ = connection.send(&login);
            connection.flush_net();
            connection.client_phase = ClientPhase::AwaitingWelcome;
        }

        ControlMessage::Upgrade {
            min_version,
            current_version,
        } => {
            ctx.progress.set_progress(
                ProgressKind::ConnectionFailure,
                CONNECTION_FAILED_TITLE,
                &format!(
                    "Server requires protocol versions {}-{}",
                    min_version, current_version
                ),
            );
            connection.close();
            ctx.set_client_travel("?failed", TravelType::Absolute);
        }

        ControlMessage::Welcome {
            level_name,
            game_path,
        } => {
            let level_name = Url::strip_play_world_prefix(&level_name).to_string();
            info!("welcomed to '{}' (game '{}')", level_name, game_path);
            connection.client_world_package = level_name.clone();
            if !ctx.assets.is_resident(&level_name) {
                ctx.assets.load_async(&level_name, None);
            }
            connection.client_phase = ClientPhase::LoadingWorld { level_name };
        }

        ControlMessage::Uses { info } => {
            let mut info = PackageInfo::from_wire(&info);
            info.loading_phase = world.info.seamless_phase;
            // Add to the map immediately even before verification so the
            // entry order matches the server.
            connection.package_map.add_info(info.clone());
            // Verify strictly in arrival order; anything behind an
            // unverified entry waits in the queue.
            if !connection.pending_packages.is_empty()
                || !verify_package_info(ctx, connection, &mut info)
            {
                connection.pending_packages.push_back(info);
            }
        }

        ControlMessage::Unload { guid } => {
            if let Some(slot) = connection
                .pending_packages
                .iter()
                .position(|pending| pending.guid == guid)
            {
                connection.pending_packages.remove(slot);
                // The server expects a response for a pending package.
                let _ = connection.send(&ControlMessage::Abort { guid });
                connection.flush_net();
            }
            connection.package_map.remove_by_guid(guid);
            connection.package_map.compute();
        }

        ControlMessage::Failure { reason } => {
            let detail = if reason.is_empty() {
                "Connection to the server failed".to_string()
            } else {
                reason.clone()
            };
            ctx.progress.set_progress(
                ProgressKind::ConnectionFailure,
                CONNECTION_FAILED_TITLE,
                &detail,
            );
            connection.close();
            if !migration::begin_host_migration(world, ctx) {
                let entry_url = if reason.is_empty() { "?failed" } else { "?closed" };
                ctx.set_client_travel(entry_url, TravelType::Absolute);
            }
        }

        ControlMessage::PeerConnect { peer } => {
            if world.peer_net_driver.is_some() {
                info!(
                    "told about peer {:016X} at {}",
                    peer.player_id,
                    peer.connect_str()
                );
                ctx.peer_connect_requests.push(peer);
            } else {
                debug!("PeerConnect ignored: no peer net driver");
            }
        }

        ControlMessage::DebugText { text } => {
            debug!("received DebugText [{}]", text);
        }

        ControlMessage::ClientAuthRequest {
            server_uid,
            public_ip,
            public_port,
            secure,
        } => ctx.auth.client_auth_request(server_uid, public_ip, public_port, secure),
        ControlMessage::AuthRequestPeer { remote_uid } => ctx.auth.auth_request_peer(remote_uid),
        ControlMessage::AuthBlob { chunk } => {
            connection.auth_blob_buffer.push_str(&chunk.blob);
            if chunk.current + 1 >= chunk.num {
                let blob = std::mem::take(&mut connection.auth_blob_buffer);
                ctx.auth.auth_blob(&blob);
            }
        }
        ControlMessage::AuthBlobPeer { remote_uid, chunk } => {
            ctx.auth.auth_blob_peer(remote_uid, &chunk.blob);
        }
        ControlMessage::AuthKillPeer { remote_uid } => ctx.auth.auth_kill_peer(remote_uid),
        ControlMessage::AuthRetry => ctx.auth.auth_retry(),
        ControlMessage::ClientAuthEndSessionRequest => ctx.auth.end_session_request(),

        other => {
            debug!("unexpected control message on client: {}", other.name());
        }
    }
}

/// Verify an announced package: locate it, match its guid, and report the
/// local generation. Returns false when verification must wait for an
/// async load; failures close the connection and count as handled.
pub fn verify_package_info(
    ctx: &mut EngineContext,
    connection: &mut Connection,
    info: &mut PackageInfo,
) -> bool {
    let catalog = ctx.assets.catalog();
    let found = catalog.read().get(&info.package_name).cloned();
    let Some(package) = found else {
        ctx.progress.set_progress(
            ProgressKind::ConnectionFailure,
            CONNECTION_FAILED_TITLE,
            &format!("Failed to find required package '{}'", info.package_name),
        );
        if ctx.pending_client_travel.is_none() {
            ctx.set_client_travel("?failed", TravelType::Absolute);
        }
        connection.close();
        return true;
    };

    if package.guid != info.guid {
        warn!(
            "package '{}' mismatched - server {} local {}",
            info.package_name, info.guid, package.guid
        );
        ctx.progress.set_progress(
            ProgressKind::ConnectionFailure,
            CONNECTION_FAILED_TITLE,
            &format!("Package '{}' version mismatch", info.package_name),
        );
        if ctx.pending_client_travel.is_none() {
            ctx.set_client_travel("?failed", TravelType::Absolute);
        }
        connection.close();
        return true;
    }

    if !ctx.assets.is_resident(&info.package_name) {
        if ctx.assets.is_async_loading() {
            // Delay until async loading settles.
            return false;
        }
        ctx.assets.load_async(&info.package_name, Some(info.guid));
        return false;
    }

    info.local_generation = package.local_generation();
    info.net_object_counts = package.net_object_counts.clone();
    info.resolved = true;
    if let Some(entry) = connection.package_map.find_mut(info.guid) {
        entry.local_generation = info.local_generation;
        entry.net_object_counts = info.net_object_counts.clone();
        entry.resolved = true;
    }
    connection.package_map.compute();
    let _ = connection.send(&ControlMessage::Have {
        guid: info.guid,
        generation: info.local_generation,
    });
    true
}

/// Retry queued package verification strictly in order
fn process_pending_packages(ctx: &mut EngineContext, connection: &mut Connection) {
    while let Some(front) = connection.pending_packages.front() {
        let mut info = front.clone();
        if verify_package_info(ctx, connection, &mut info) {
            connection.pending_packages.pop_front();
        } else {
            break;
        }
    }
}

/// Send Join once welcomed, loaded and fully synchronized
fn try_send_join(ctx: &mut EngineContext, connection: &mut Connection) {
    let ClientPhase::LoadingWorld { level_name } = connection.client_phase.clone() else {
        return;
    };
    if !connection.pending_packages.is_empty() {
        return;
    }
    if !ctx.assets.is_resident(&level_name) {
        if !ctx.assets.is_async_loading() {
            ctx.assets.load_async(&level_name, None);
        }
        return;
    }
    connection.package_map.compute();
    let _ = connection.send(&ControlMessage::Join);
    connection.flush_net();
    connection.client_phase = ClientPhase::Joined;
    info!("join sent for '{}'", level_name);
}

// ---------------------------------------------------------------------------
// Peer-to-peer
// ---------------------------------------------------------------------------

fn handle_peer_message(
    world: &mut World,
    ctx: &mut EngineContext,
    driver: &mut NetDriver,
    index: usize,
    message: ControlMessage,
) {
    debug!("peer received: {}", message.name());
    match message {
        ControlMessage::PeerJoin { player_id } => {
            let connection = &mut driver.client_connections[index];
            let accepted = player_id != 0;
            if accepted {
                connection.player_id = player_id;
                debug!("join request from peer {:016X} accepted", player_id);
            } else {
                debug!("invalid net id for peer");
            }
            let _ = connection.send(&ControlMessage::PeerJoinResponse { accepted });
            connection.flush_net();
            if !accepted {
                ctx.progress.set_progress(
                    ProgressKind::PeerConnectionFailure,
                    CONNECTION_FAILED_TITLE,
                    "Peer join request was denied",
                );
                connection.close();
            }
        }

        ControlMessage::PeerJoinResponse { accepted } => {
            let connection = &mut driver.client_connections[index];
            if accepted {
                debug!("peer join request was accepted");
                connection.state = ControlState::InGame;
            } else {
                ctx.progress.set_progress(
                    ProgressKind::PeerConnectionFailure,
                    CONNECTION_FAILED_TITLE,
                    "Peer join request was denied",
                );
                connection.flush_net();
                connection.close();
            }
        }

        ControlMessage::Failure { reason } => {
            let connection = &mut driver.client_connections[index];
            ctx.progress.set_progress(
                ProgressKind::PeerConnectionFailure,
                CONNECTION_FAILED_TITLE,
                &reason,
            );
            connection.close();
        }

        ControlMessage::PeerDisconnectHost { player_id } => {
            let connection = &mut driver.client_connections[index];
            debug!(
                "peer {:016X} lost its connection to the host",
                if player_id != 0 { player_id } else { connection.player_id }
            );
            connection.lost_connection_to_host = true;
        }

        ControlMessage::PeerNewHostFound { player_id: _ } => {
            migration::on_peer_new_host_found(world);
        }

        ControlMessage::PeerNewHostTravel { address } => {
            let address = if address.is_empty() {
                driver.client_connections[index].remote_addr()
            } else {
                address
            };
            migration::on_peer_new_host_travel(world, ctx, &address);
        }

        ControlMessage::PeerNewHostTravelSession {
            address,
            session_name,
            search_class_path,
            platform_blob,
        } => {
            let address = if address.is_empty() {
                driver.client_connections[index].remote_addr()
            } else {
                address
            };
            let accepted = migration::on_peer_new_host_travel_session(
                world,
                ctx,
                &address,
                MigratedSessionInfo {
                    session_name,
                    search_class_path,
                    platform_blob,
                },
            );
            if !accepted {
                debug!("migrated session travel ignored");
            }
        }

        ControlMessage::DebugText { text } => {
            debug!("received DebugText [{}]", text);
        }

        ControlMessage::AuthRequestPeer { remote_uid } => ctx.auth.auth_request_peer(remote_uid),
        ControlMessage::AuthBlobPeer { remote_uid, chunk } => {
            ctx.auth.auth_blob_peer(remote_uid, &chunk.blob);
        }
        ControlMessage::AuthKillPeer { remote_uid } => ctx.auth.auth_kill_peer(remote_uid),

        other => {
            debug!("unknown/unexpected peer control message {}", other.name());
        }
    }
}

fn login_options(request_url: &str) -> String {
    match request_url.find('?') {
        Some(index) => request_url[index..].to_string(),
        None => String::new(),
    }
}

fn parse_ip(addr: &str) -> [u8; 4] {
    let host = addr.split(':').next().unwrap_or("");
    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(host.split('.')) {
        *slot = part.parse().unwrap_or(0);
    }
    octets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_options_extraction() {
        assert_eq!(login_options("DM-Foo?Name=Alice?Listen"), "?Name=Alice?Listen");
        assert_eq!(login_options("DM-Foo"), "");
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip("10.0.0.2:7777"), [10, 0, 0, 2]);
        assert_eq!(parse_ip("not-an-ip"), [0, 0, 0, 0]);
    }
}
