//! External authentication module
//!
//! The control channel only sequences and multiplexes opaque auth blobs;
//! their content belongs to an external module reached through this
//! trait. Chunked blobs are reassembled by the connection before
//! delivery.

/// Sink for the opaque authentication handshake
pub trait AuthModule {
    fn client_auth_request(&mut self, _server_uid: u64, _ip: [u8; 4], _port: i32, _secure: bool) {}

    fn server_auth_request(&mut self) {}

    fn auth_request_peer(&mut self, _remote_uid: u64) {}

    /// Receives a fully reassembled blob
    fn auth_blob(&mut self, _blob: &str) {}

    fn auth_blob_peer(&mut self, _remote_uid: u64, _blob: &str) {}

    fn auth_kill_peer(&mut self, _remote_uid: u64) {}

    fn auth_retry(&mut self) {}

    fn end_session_request(&mut self) {}
}

/// Default module for sessions without authentication
pub struct NullAuth;

impl AuthModule for NullAuth {}
