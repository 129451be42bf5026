//! The torrent-side state the connection manager drives: peer lists, the
//! policy mode, rate limiters, events, and error bookkeeping.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use futures::future::{self, BoxFuture};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use url::Url;

use crate::{
    conf::TorrentConf,
    counter::ConnectionMonitor,
    error::Error,
    peer::{Peer, PeerSession},
    piece_picker::PiecePicker,
    Sha1Hash, TorrentId,
};

static NEXT_TORRENT_ID: AtomicU32 = AtomicU32::new(0);

/// A shared rate limiter. Limiters are owned by the embedder and shared by
/// reference; the connection manager only claims from them, never mutates
/// their configuration.
pub trait RateLimiter: Send + Sync {
    /// Claims capacity for a transfer of `bytes`, completing when the
    /// transfer may proceed.
    fn claim(&self, bytes: usize) -> BoxFuture<'_, ()>;
}

/// A limiter that never delays.
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn claim(&self, _bytes: usize) -> BoxFuture<'_, ()> {
        Box::pin(future::ready(()))
    }
}

/// The policy object attached to a torrent. It decides whether connections
/// are currently welcome and which candidates are worth dialing; the
/// connection manager supplies the mechanism.
///
/// `can_accept_connections` and `should_connect` may be called while the
/// torrent's peer lists are locked and must not call back into them.
pub trait Mode: Send + Sync {
    fn can_accept_connections(&self) -> bool {
        true
    }

    fn should_connect(&self, _peer: &Peer) -> bool {
        true
    }

    /// Invoked when a session is promoted to connected. Returning an error
    /// vetoes the peer and tears the session down.
    fn handle_peer_connected(&self, _session: &Arc<PeerSession>) -> Result<(), Error> {
        Ok(())
    }
}

/// The default, permissive mode.
pub struct StandardMode;

impl Mode for StandardMode {}

/// Why a connection attempt to a peer did not produce a connected session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionFailureReason {
    /// The transport-level connect failed.
    Unreachable,
    /// No allowed encryption mode could complete negotiation.
    EncryptionNegotiationFailed,
    /// The remote handshake was missing or invalid.
    HandshakeFailed,
    /// The session failed after the handshake, during promotion.
    Unknown,
}

/// Events a torrent surfaces to its embedder.
#[derive(Debug)]
pub enum TorrentEvent {
    ConnectionAttemptFailed {
        uri: Url,
        reason: ConnectionFailureReason,
    },
    PeerDisconnected {
        uri: Url,
    },
}

/// Why a torrent was moved into its terminal error state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorReason {
    /// A block read from storage failed while serving a peer request.
    ReadFailure,
}

#[derive(Debug)]
pub struct TorrentError {
    pub reason: ErrorReason,
    pub error: Error,
}

/// The per-torrent peer lists.
///
/// A peer appears in at most one of {available, connecting, busy} or, via its
/// session, {handshaking, connected} at a time; `active` holds every peer
/// with a live session (handshaking or connected).
#[derive(Default)]
pub(crate) struct PeerLists {
    /// Candidates eligible for dialing. Peers reinserted after cleanup go to
    /// the front so the dial scheduler prefers them.
    pub available: VecDeque<Arc<Peer>>,
    /// Peers in flight in the outbound pipeline, up to transport connect.
    pub connecting: Vec<Arc<Peer>>,
    /// Peers accepted past admission: the union of handshaking and connected.
    pub active: Vec<Arc<Peer>>,
    /// Peers that recently failed to reach; a cooldown pool.
    pub busy: Vec<Arc<Peer>>,
    /// Sessions past transport connect but not yet past the handshake.
    pub handshaking: Vec<Arc<PeerSession>>,
    /// Sessions fully past the handshake.
    pub connected: Vec<Arc<PeerSession>>,
}

impl PeerLists {
    fn knows_uri(&self, uri: &Url) -> bool {
        self.available.iter().any(|p| p.uri() == uri)
            || self.connecting.iter().any(|p| p.uri() == uri)
            || self.active.iter().any(|p| p.uri() == uri)
            || self.busy.iter().any(|p| p.uri() == uri)
    }
}

/// The parameters for registering a torrent with the connection manager.
pub struct TorrentParams {
    pub info_hash: Sha1Hash,
    /// The torrent's piece length, used to resolve block requests to
    /// absolute torrent offsets.
    pub piece_len: u32,
    pub conf: TorrentConf,
    pub mode: Box<dyn Mode>,
    pub download_limiter: Option<Arc<dyn RateLimiter>>,
    pub upload_limiter: Option<Arc<dyn RateLimiter>>,
}

/// One torrent as seen by the connection manager: its peer lists, policy
/// mode, limiters, piece picker, and event surface.
pub struct TorrentManager {
    id: TorrentId,
    info_hash: Sha1Hash,
    piece_len: u32,
    conf: TorrentConf,
    mode: Box<dyn Mode>,
    peers: Mutex<PeerLists>,
    picker: PiecePicker,
    /// Peers the system has decided not to reconnect to.
    inactive: Mutex<HashSet<Url>>,
    /// How many peers we are actively uploading to (have unchoked).
    uploading_to: AtomicU32,
    error: Mutex<Option<TorrentError>>,
    monitor: ConnectionMonitor,
    download_limiter: Arc<dyn RateLimiter>,
    upload_limiter: Arc<dyn RateLimiter>,
    event_chan: UnboundedSender<TorrentEvent>,
    event_port: Mutex<Option<UnboundedReceiver<TorrentEvent>>>,
    /// Whether the torrent is currently registered with a connection
    /// manager. Pipelines re-check this after every suspension point.
    attached: AtomicBool,
}

impl TorrentManager {
    pub fn new(params: TorrentParams) -> Arc<Self> {
        let (event_chan, event_port) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: NEXT_TORRENT_ID.fetch_add(1, Ordering::Relaxed),
            info_hash: params.info_hash,
            piece_len: params.piece_len,
            conf: params.conf,
            mode: params.mode,
            peers: Mutex::new(PeerLists::default()),
            picker: PiecePicker::new(),
            inactive: Mutex::new(HashSet::new()),
            uploading_to: AtomicU32::new(0),
            error: Mutex::new(None),
            monitor: ConnectionMonitor::new(),
            download_limiter: params
                .download_limiter
                .unwrap_or_else(|| Arc::new(Unlimited)),
            upload_limiter: params.upload_limiter.unwrap_or_else(|| Arc::new(Unlimited)),
            event_chan,
            event_port: Mutex::new(Some(event_port)),
            attached: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    pub fn piece_len(&self) -> u32 {
        self.piece_len
    }

    pub fn conf(&self) -> &TorrentConf {
        &self.conf
    }

    pub fn mode(&self) -> &dyn Mode {
        &*self.mode
    }

    pub fn picker(&self) -> &PiecePicker {
        &self.picker
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn download_limiter(&self) -> &dyn RateLimiter {
        &*self.download_limiter
    }

    pub fn upload_limiter(&self) -> &dyn RateLimiter {
        &*self.upload_limiter
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }

    pub(crate) fn peers(&self) -> MutexGuard<'_, PeerLists> {
        self.peers.lock().unwrap()
    }

    /// Adds a discovered candidate to the available list. Peers already known
    /// in any list are ignored.
    pub fn add_peer(&self, peer: Arc<Peer>) {
        let mut peers = self.peers();
        if peers.knows_uri(peer.uri()) {
            log::debug!("Torrent {} already knows peer {}", self.id, peer.uri());
            return;
        }
        peers.available.push_back(peer);
    }

    /// Moves peers out of the cooldown pool back into the available list.
    pub fn reclaim_busy_peers(&self) {
        let mut peers = self.peers();
        let busy = std::mem::take(&mut peers.busy);
        peers.available.extend(busy);
    }

    pub fn available_count(&self) -> usize {
        self.peers().available.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.peers().connecting.len()
    }

    pub fn connected_count(&self) -> usize {
        self.peers().connected.len()
    }

    pub fn busy_count(&self) -> usize {
        self.peers().busy.len()
    }

    /// Marks a peer as one the system will not reconnect to: cleanup will not
    /// return it to the available pool.
    pub fn mark_inactive(&self, uri: Url) {
        self.inactive.lock().unwrap().insert(uri);
    }

    pub fn is_inactive(&self, uri: &Url) -> bool {
        self.inactive.lock().unwrap().contains(uri)
    }

    pub fn uploading_to(&self) -> u32 {
        self.uploading_to.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_uploading_to(&self) {
        self.uploading_to.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_uploading_to(&self) {
        let _ = self
            .uploading_to
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    /// Takes the torrent's event receiver. Yields the receiver only on the
    /// first call.
    pub fn take_events(&self) -> Option<UnboundedReceiver<TorrentEvent>> {
        self.event_port.lock().unwrap().take()
    }

    pub(crate) fn raise_connection_attempt_failed(
        &self,
        peer: &Peer,
        reason: ConnectionFailureReason,
    ) {
        peer.record_failed_attempt();
        log::info!(
            "Torrent {} connection attempt to {} failed: {:?}",
            self.id,
            peer.uri(),
            reason
        );
        let _ = self.event_chan.send(TorrentEvent::ConnectionAttemptFailed {
            uri: peer.uri().clone(),
            reason,
        });
    }

    pub(crate) fn raise_peer_disconnected(&self, uri: Url) {
        log::debug!("Torrent {} peer {} disconnected", self.id, uri);
        let _ = self
            .event_chan
            .send(TorrentEvent::PeerDisconnected { uri });
    }

    /// Moves the torrent into its terminal error state. Only the first error
    /// is kept.
    pub fn try_set_error(&self, reason: ErrorReason, error: Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            log::warn!("Torrent {} entered error state {:?}: {}", self.id, reason, error);
            *slot = Some(TorrentError { reason, error });
        }
    }

    pub fn error_reason(&self) -> Option<ErrorReason> {
        self.error.lock().unwrap().as_ref().map(|e| e.reason)
    }
}
