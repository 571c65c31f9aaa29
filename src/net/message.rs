//! Control channel messages
//!
//! One byte of type tag on the wire, then a bincode-encoded payload.
//! Tags are stable wire contract; new messages get new tags.

use crate::guid::Guid;
use crate::net::{NetError, NetResult};
use serde::{Deserialize, Serialize};

/// Package dependency announcement payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePackageInfo {
    pub package_name: String,
    pub guid: Guid,
    pub remote_generation: u32,
    /// Base package to load when this package is a forced export
    pub forced_export_base_package: Option<String>,
}

/// Address of a peer, as introduced by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub player_id: u64,
    pub ip: [u8; 4],
    pub port: u16,
}

impl PeerAddr {
    pub fn connect_str(&self) -> String {
        format!(
            "{}.{}.{}.{}:{}",
            self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port
        )
    }
}

/// One chunk of an opaque auth blob; `current`/`num` sequence the chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChunk {
    pub blob: String,
    pub current: u8,
    pub num: u8,
}

/// The closed set of control-channel messages
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// C→S: advertised protocol range and auth capability
    Hello {
        min_version: u32,
        current_version: u32,
        supports_auth: bool,
    },
    /// S→C: rejection carrying the server's accepted range
    Upgrade { min_version: u32, current_version: u32 },
    /// S→C: version accepted; nonce for the login response
    Challenge { negotiated_version: u32, nonce: String },
    /// C→S: requested rate cap, clamped server-side
    Netspeed { rate: i32 },
    /// S→C: package dependency announcement
    Uses { info: WirePackageInfo },
    /// C→S: package acknowledged at the given local generation
    Have { guid: Guid, generation: u32 },
    /// S→C: package is being removed from the server's map
    Unload { guid: Guid },
    /// C→S: reply to Unload for a package that was pending verify
    Abort { guid: Guid },
    /// C→S: declined to download a package
    Skip { guid: Guid },
    /// C→S: login request
    Login {
        response: String,
        request_url: String,
        player_id: u64,
    },
    /// S→C: level and gametype; client starts loading
    Welcome { level_name: String, game_path: String },
    /// C→S: ready to play
    Join,
    /// C→S: additional split-screen login on an open connection
    JoinSplit { player_id: u64, request_url: String },
    /// C→S: acknowledges a server-initiated controller swap
    PcSwap { child_index: i32 },
    /// either: textual reason for closing the connection
    Failure { reason: String },
    /// either: non-fatal diagnostic
    DebugText { text: String },
    /// C→S: new listening peer's port
    PeerListen { port: u16 },
    /// S→C: introduction to another peer
    PeerConnect { peer: PeerAddr },
    /// P→P: identify self on a peer control channel
    PeerJoin { player_id: u64 },
    /// P→P: join verdict
    PeerJoinResponse { accepted: bool },
    /// P→P: "I lost the server"
    PeerDisconnectHost { player_id: u64 },
    /// P→P: "I have been elected"
    PeerNewHostFound { player_id: u64 },
    /// P→P: "travel to me at this address"
    PeerNewHostTravel { address: String },
    /// P→P: "travel to me via this migrated session"
    PeerNewHostTravelSession {
        address: String,
        session_name: String,
        search_class_path: String,
        platform_blob: Vec<u8>,
    },
    ClientAuthRequest {
        server_uid: u64,
        public_ip: [u8; 4],
        public_port: i32,
        secure: bool,
    },
    ServerAuthRequest,
    AuthRequestPeer { remote_uid: u64 },
    AuthBlob { chunk: AuthChunk },
    AuthBlobPeer { remote_uid: u64, chunk: AuthChunk },
    AuthKillPeer { remote_uid: u64 },
    AuthRetry,
    ClientAuthEndSessionRequest,
}

impl ControlMessage {
    pub fn tag(&self) -> u8 {
        match self {
            ControlMessage::Hello { .. } => 0,
            ControlMessage::Welcome { .. } => 1,
            ControlMessage::Upgrade { .. } => 2,
            ControlMessage::Challenge { .. } => 3,
            ControlMessage::Netspeed { .. } => 4,
            ControlMessage::Login { .. } => 5,
            ControlMessage::Failure { .. } => 6,
            ControlMessage::Join => 7,
            ControlMessage::JoinSplit { .. } => 8,
            ControlMessage::Skip { .. } => 9,
            ControlMessage::Abort { .. } => 10,
            ControlMessage::PcSwap { .. } => 11,
            ControlMessage::DebugText { .. } => 12,
            ControlMessage::Uses { .. } => 13,
            ControlMessage::Have { .. } => 14,
            ControlMessage::Unload { .. } => 15,
            ControlMessage::PeerListen { .. } => 16,
            ControlMessage::PeerConnect { .. } => 17,
            ControlMessage::PeerJoin { .. } => 18,
            ControlMessage::PeerJoinResponse { .. } => 19,
            ControlMessage::PeerDisconnectHost { .. } => 20,
            ControlMessage::PeerNewHostFound { .. } => 21,
            ControlMessage::PeerNewHostTravel { .. } => 22,
            ControlMessage::PeerNewHostTravelSession { .. } => 23,
            ControlMessage::ClientAuthRequest { .. } => 24,
            ControlMessage::ServerAuthRequest => 25,
            ControlMessage::AuthRequestPeer { .. } => 26,
            ControlMessage::AuthBlob { .. } => 27,
            ControlMessage::AuthBlobPeer { .. } => 28,
            ControlMessage::AuthKillPeer { .. } => 29,
            ControlMessage::AuthRetry => 30,
            ControlMessage::ClientAuthEndSessionRequest => 31,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "Hello",
            ControlMessage::Welcome { .. } => "Welcome",
            ControlMessage::Upgrade { .. } => "Upgrade",
            ControlMessage::Challenge { .. } => "Challenge",
            ControlMessage::Netspeed { .. } => "Netspeed",
            ControlMessage::Login { .. } => "Login",
            ControlMessage::Failure { .. } => "Failure",
            ControlMessage::Join => "Join",
            ControlMessage::JoinSplit { .. } => "JoinSplit",
            ControlMessage::Skip { .. } => "Skip",
            ControlMessage::Abort { .. } => "Abort",
            ControlMessage::PcSwap { .. } => "PCSwap",
            ControlMessage::DebugText { .. } => "DebugText",
            ControlMessage::Uses { .. } => "Uses",
            ControlMessage::Have { .. } => "Have",
            ControlMessage::Unload { .. } => "Unload",
            ControlMessage::PeerListen { .. } => "PeerListen",
            ControlMessage::PeerConnect { .. } => "PeerConnect",
            ControlMessage::PeerJoin { .. } => "PeerJoin",
            ControlMessage::PeerJoinResponse { .. } => "PeerJoinResponse",
            ControlMessage::PeerDisconnectHost { .. } => "PeerDisconnectHost",
            ControlMessage::PeerNewHostFound { .. } => "PeerNewHostFound",
            ControlMessage::PeerNewHostTravel { .. } => "PeerNewHostTravel",
            ControlMessage::PeerNewHostTravelSession { .. } => "PeerNewHostTravelSession",
            ControlMessage::ClientAuthRequest { .. } => "ClientAuthRequest",
            ControlMessage::ServerAuthRequest => "ServerAuthRequest",
            ControlMessage::AuthRequestPeer { .. } => "AuthRequestPeer",
            ControlMessage::AuthBlob { .. } => "AuthBlob",
            ControlMessage::AuthBlobPeer { .. } => "AuthBlobPeer",
            ControlMessage::AuthKillPeer { .. } => "AuthKillPeer",
            ControlMessage::AuthRetry => "AuthRetry",
            ControlMessage::ClientAuthEndSessionRequest => "ClientAuthEndSessionRequest",
        }
    }

    /// Serialize to a wire frame: tag byte plus payload
    pub fn encode(&self) -> NetResult<Vec<u8>> {
        fn payload<T: Serialize>(tag: u8, value: &T) -> NetResult<Vec<u8>> {
            let mut bytes = vec![tag];
            bincode::serialize_into(&mut bytes, value).map_err(|e| NetError::Encode {
                message: e.to_string(),
            })?;
            Ok(bytes)
        }

        match self {
            ControlMessage::Hello {
                min_version,
                current_version,
                supports_auth,
            } => payload(self.tag(), &(min_version, current_version, supports_auth)),
            ControlMessage::Upgrade {
                min_version,
                current_version,
            } => payload(self.tag(), &(min_version, current_version)),
            ControlMessage::Challenge {
                negotiated_version,
                nonce,
            } => payload(self.tag(), &(negotiated_version, nonce)),
            ControlMessage::Netspeed { rate } => payload(self.tag(), rate),
            ControlMessage::Uses { info } => payload(self.tag(), info),
            ControlMessage::Have { guid, generation } => payload(self.tag(), &(guid, generation)),
            ControlMessage::Unload { guid } => payload(self.tag(), guid),
            ControlMessage::Abort { guid } => payload(self.tag(), guid),
            ControlMessage::Skip { guid } => payload(self.tag(), guid),
            ControlMessage::Login {
                response,
                request_url,
                player_id,
            } => payload(self.tag(), &(response, request_url, player_id)),
            ControlMessage::Welcome {
                level_name,
                game_path,
            } => payload(self.tag(), &(level_name, game_path)),
            ControlMessage::Join => Ok(vec![self.tag()]),
            ControlMessage::JoinSplit {
                player_id,
                request_url,
            } => payload(self.tag(), &(player_id, request_url)),
            ControlMessage::PcSwap { child_index } => payload(self.tag(), child_index),
            ControlMessage::Failure { reason } => payload(self.tag(), reason),
            ControlMessage::DebugText { text } => payload(self.tag(), text),
            ControlMessage::PeerListen { port } => payload(self.tag(), port),
            ControlMessage::PeerConnect { peer } => payload(self.tag(), peer),
            ControlMessage::PeerJoin { player_id } => payload(self.tag(), player_id),
            ControlMessage::PeerJoinResponse { accepted } => payload(self.tag(), accepted),
            ControlMessage::PeerDisconnectHost { player_id } => payload(self.tag(), player_id),
            ControlMessage::PeerNewHostFound { player_id } => payload(self.tag(), player_id),
            ControlMessage::PeerNewHostTravel { address } => payload(self.tag(), address),
            ControlMessage::PeerNewHostTravelSession {
                address,
                session_name,
                search_class_path,
                platform_blob,
            } => payload(
                self.tag(),
                &(address, session_name, search_class_path, platform_blob),
            ),
            ControlMessage::ClientAuthRequest {
                server_uid,
                public_ip,
                public_port,
                secure,
            } => payload(self.tag(), &(server_uid, public_ip, public_port, secure)),
            ControlMessage::ServerAuthRequest => Ok(vec![self.tag()]),
            ControlMessage::AuthRequestPeer { remote_uid } => payload(self.tag(), remote_uid),
            ControlMessage::AuthBlob { chunk } => payload(self.tag(), chunk),
            ControlMessage::AuthBlobPeer { remote_uid, chunk } => {
                payload(self.tag(), &(remote_uid, chunk))
            }
            ControlMessage::AuthKillPeer { remote_uid } => payload(self.tag(), remote_uid),
            ControlMessage::AuthRetry => Ok(vec![self.tag()]),
            ControlMessage::ClientAuthEndSessionRequest => Ok(vec![self.tag()]),
        }
    }

    /// Decode one wire frame
    pub fn decode(frame: &[u8]) -> NetResult<ControlMessage> {
        fn read<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> NetResult<T> {
            bincode::deserialize(bytes).map_err(|e| NetError::Decode {
                message: e.to_string(),
            })
        }

        let (tag, body) = frame.split_first().ok_or(NetError::Decode {
            message: "empty frame".to_string(),
        })?;

        let message = match tag {
            0 => {
                let (min_version, current_version, supports_auth) = read(body)?;
                ControlMessage::Hello {
                    min_version,
                    current_version,
                    supports_auth,
                }
            }
            1 => {
                let (level_name, game_path) = read(body)?;
                ControlMessage::Welcome {
                    level_name,
                    game_path,
                }
            }
            2 => {
                let (min_version, current_version) = read(body)?;
                ControlMessage::Upgrade {
                    min_version,
                    current_version,
                }
            }
            3 => {
                let (negotiated_version, nonce) = read(body)?;
                ControlMessage::Challenge {
                    negotiated_version,
                    nonce,
                }
            }
            4 => ControlMessage::Netspeed { rate: read(body)? },
            5 => {
                let (response, request_url, player_id) = read(body)?;
                ControlMessage::Login {
                    response,
                    request_url,
                    player_id,
                }
            }
            6 => ControlMessage::Failure { reason: read(body)? },
            7 => ControlMessage::Join,
            8 => {
                let (player_id, request_url) = read(body)?;
                ControlMessage::JoinSplit {
                    player_id,
                    request_url,
                }
            }
            9 => ControlMessage::Skip { guid: read(body)? },
            10 => ControlMessage::Abort { guid: read(body)? },
            11 => ControlMessage::PcSwap {
                child_index: read(body)?,
            },
            12 => ControlMessage::DebugText { text: read(body)? },
            13 => ControlMessage::Uses { info: read(body)? },
            14 => {
                let (guid, generation) = read(body)?;
                ControlMessage::Have { guid, generation }
            }
            15 => ControlMessage::Unload { guid: read(body)? },
            16 => ControlMessage::PeerListen { port: read(body)? },
            17 => ControlMessage::PeerConnect { peer: read(body)? },
            18 => ControlMessage::PeerJoin {
                player_id: read(body)?,
            },
            19 => ControlMessage::PeerJoinResponse {
                accepted: read(body)?,
            },
            20 => ControlMessage::PeerDisconnectHost {
                player_id: read(body)?,
            },
            21 => ControlMessage::PeerNewHostFound {
                player_id: read(body)?,
            },
            22 => ControlMessage::PeerNewHostTravel {
                address: read(body)?,
            },
            23 => {
                let (address, session_name, search_class_path, platform_blob) = read(body)?;
                ControlMessage::PeerNewHostTravelSession {
                    address,
                    session_name,
                    search_class_path,
                    platform_blob,
                }
            }
            24 => {
                let (server_uid, public_ip, public_port, secure) = read(body)?;
                ControlMessage::ClientAuthRequest {
                    server_uid,
                    public_ip,
                    public_port,
                    secure,
                }
            }
            25 => ControlMessage::ServerAuthRequest,
            26 => ControlMessage::AuthRequestPeer {
                remote_uid: read(body)?,
            },
            27 => ControlMessage::AuthBlob { chunk: read(body)? },
            28 => {
                let (remote_uid, chunk) = read(body)?;
                ControlMessage::AuthBlobPeer { remote_uid, chunk }
            }
            29 => ControlMessage::AuthKillPeer {
                remote_uid: read(body)?,
            },
            30 => ControlMessage::AuthRetry,
            31 => ControlMessage::ClientAuthEndSessionRequest,
            tag => return Err(NetError::UnknownTag { tag: *tag }),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_hello() {
        let message = ControlMessage::Hello {
            min_version: 17,
            current_version: 19,
            supports_auth: true,
        };
        let frame = message.encode().expect("encode failed");
        assert_eq!(frame[0], 0);
        assert_eq!(ControlMessage::decode(&frame).expect("decode failed"), message);
    }

    #[test]
    fn test_roundtrip_uses() {
        let message = ControlMessage::Uses {
            info: WirePackageInfo {
                package_name: "DM-Foo".to_string(),
                guid: Guid::from_words(1, 2, 3, 4),
                remote_generation: 2,
                forced_export_base_package: Some("Base".to_string()),
            },
        };
        let frame = message.encode().expect("encode failed");
        assert_eq!(ControlMessage::decode(&frame).expect("decode failed"), message);
    }

    #[test]
    fn test_roundtrip_bare_messages() {
        for message in [
            ControlMessage::Join,
            ControlMessage::ServerAuthRequest,
            ControlMessage::AuthRetry,
            ControlMessage::ClientAuthEndSessionRequest,
        ] {
            let frame = message.encode().expect("encode failed");
            assert_eq!(frame.len(), 1);
            assert_eq!(ControlMessage::decode(&frame).expect("decode failed"), message);
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(matches!(
            ControlMessage::decode(&[200]),
            Err(NetError::UnknownTag { tag: 200 })
        ));
        assert!(ControlMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_peer_addr_connect_str() {
        let peer = PeerAddr {
            player_id: 2,
            ip: [10, 0, 0, 2],
            port: 7777,
        };
        assert_eq!(peer.connect_str(), "10.0.0.2:7777");
    }
}
