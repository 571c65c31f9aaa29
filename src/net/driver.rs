//! Net drivers
//!
//! A driver owns either a set of client connections (server role), a
//! single server connection (client role), or a mesh of peer connections
//! (peer driver). Drivers move between worlds during seamless travel.

use crate::net::connection::Connection;
use crate::net::package_map::PackageMap;
use crate::net::transport::{TcpTransport, Transport};
use log::{info, warn};
use std::net::TcpListener;

pub struct NetDriver {
    pub is_peer: bool,
    /// Set on clients: the connection to the authoritative server
    pub server_connection: Option<Connection>,
    /// Set on servers and peer drivers
    pub client_connections: Vec<Connection>,
    /// Authoritative package list copied to each welcomed connection
    pub master_map: PackageMap,
    pub max_client_rate: i32,
    pub listen_addr: Option<String>,
    listener: Option<TcpListener>,
}

impl NetDriver {
    pub fn new_server(max_client_rate: i32) -> Self {
        NetDriver {
            is_peer: false,
            server_connection: None,
            client_connections: Vec::new(),
            master_map: PackageMap::default(),
            max_client_rate,
            listen_addr: None,
            listener: None,
        }
    }

    pub fn new_client(connection: Connection) -> Self {
        NetDriver {
            is_peer: false,
            server_connection: Some(connection),
            client_connections: Vec::new(),
            master_map: PackageMap::default(),
            max_client_rate: 0,
            listen_addr: None,
            listener: None,
        }
    }

    pub fn new_peer() -> Self {
        NetDriver {
            is_peer: true,
            server_connection: None,
            client_connections: Vec::new(),
            master_map: PackageMap::default(),
            max_client_rate: 0,
            listen_addr: None,
            listener: None,
        }
    }

    /// Bind a real socket for incoming connections
    pub fn listen_tcp(&mut self, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!("listening on tcp port {}", port);
        self.listen_addr = Some(format!("0.0.0.0:{}", port));
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept an incoming transport as a new client connection
    pub fn accept(&mut self, transport: Box<dyn Transport>) -> &mut Connection {
        info!("accepted connection from {}", transport.remote_addr());
        self.client_connections.push(Connection::new(transport));
        self.client_connections.last_mut().expect("just pushed")
    }

    /// Accept any sockets waiting on the TCP listener
    pub fn pump_accepts(&mut self) {
        let mut accepted: Vec<Box<dyn Transport>> = Vec::new();
        {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => match TcpTransport::new(stream, addr) {
                        Ok(transport) => {
                            accepted.push(Box::new(transport));
                        }
                        Err(e) => warn!("failed to set up accepted connection: {}", e),
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        }
        for transport in accepted {
            self.accept(transport);
        }
    }

    /// Flush every connection's queued traffic
    pub fn flush_all(&mut self) {
        if let Some(connection) = self.server_connection.as_mut() {
            connection.flush_net();
        }
        for connection in self.client_connections.iter_mut() {
            connection.flush_net();
        }
    }

    /// Drop connections whose transports have gone away
    pub fn prune_closed(&mut self) {
        self.client_connections.retain(|connection| {
            let open = connection.is_open();
            if !open {
                info!("dropping closed connection to {}", connection.remote_addr());
            }
            open
        });
    }

    /// Driver console commands, reached via `PEER <subcommand>`
    pub fn exec(&mut self, command: &str) -> bool {
        match command.trim().to_ascii_uppercase().as_str() {
            "SOCKETS" => {
                info!(
                    "peer driver: {} connection(s){}",
                    self.client_connections.len(),
                    self.listen_addr
                        .as_deref()
                        .map(|addr| format!(", listening at {}", addr))
                        .unwrap_or_default()
                );
                for connection in &self.client_connections {
                    info!(
                        "  peer {:016X} at {} (open: {})",
                        connection.player_id,
                        connection.remote_addr(),
                        connection.is_open()
                    );
                }
                true
            }
            "" => false,
            other => {
                warn!("unknown peer command '{}'", other);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::MemoryTransport;

    #[test]
    fn test_accept_and_prune() {
        let mut driver = NetDriver::new_server(10000);
        let (a, _b) = MemoryTransport::pair("server", "client");
        driver.accept(Box::new(a));
        assert_eq!(driver.client_connections.len(), 1);

        driver.client_connections[0].close();
        driver.prune_closed();
        assert!(driver.client_connections.is_empty());
    }

    #[test]
    fn test_peer_exec_sockets() {
        let mut driver = NetDriver::new_peer();
        assert!(driver.exec("SOCKETS"));
        assert!(!driver.exec(""));
    }
}
