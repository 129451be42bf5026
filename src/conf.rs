//! This module defines types used to configure the connection manager and its
//! parts.

use std::time::Duration;

use rand::{distributions::Alphanumeric, Rng};

use crate::{encryption::EncryptionModes, PeerId};

/// The Azureus-style client id prefix announced to peers.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-PG0001-";

/// The global configuration for the connection manager and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults and a freshly
    /// generated client id.
    pub fn new() -> Self {
        Self {
            engine: EngineConf::new(),
            torrent: TorrentConf::new(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration that applies to the engine as a whole, across torrents.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to other peers.
    pub client_id: PeerId,

    /// The maximum number of fully established peer connections, across all
    /// torrents.
    pub max_open_connections: usize,

    /// The maximum number of half-open connections: outbound dials that have
    /// not yet completed their handshake.
    pub max_half_open_connections: usize,

    /// The encryption modes this client is willing to use at all. A peer's
    /// own allowed set is intersected with this during negotiation.
    pub allowed_encryption: EncryptionModes,

    /// Outbound dials older than this are torn down by the stale sweep of
    /// [`cancel_pending_connects`](crate::manager::ConnectionManager::cancel_pending_connects).
    pub stale_connect_threshold: Duration,
}

impl EngineConf {
    pub fn new() -> Self {
        Self {
            client_id: generate_client_id(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_open_connections: 150,
            // Unacknowledged dials are expensive on some home routers, so the
            // dial pipeline is kept narrow.
            max_half_open_connections: 8,
            allowed_encryption: EncryptionModes::all(),
            stale_connect_threshold: Duration::from_secs(10),
        }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a single torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,
}

impl TorrentConf {
    pub fn new() -> Self {
        Self {
            max_connected_peer_count: 50,
        }
    }
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a peer id in the Azureus style: the client prefix followed by
/// random alphanumeric characters.
fn generate_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let suffix = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(id.len() - CLIENT_ID_PREFIX.len());
    for (dst, byte) in id[CLIENT_ID_PREFIX.len()..].iter_mut().zip(suffix) {
        *dst = byte;
    }
    id
}
