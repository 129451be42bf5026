//! Peer candidates and live peer sessions.

pub mod codec;
pub(crate) mod wire;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
};

use tokio::{sync::Mutex as AsyncMutex, time::Instant};
use url::Url;

use crate::{
    conn::Connection,
    counter::ConnectionMonitor,
    encryption::{CipherPair, EncryptionModes, PlainText, StreamCipher},
    error::{Error, Result},
    torrent::TorrentManager,
    Bitfield, BlockInfo, PeerId,
};
use codec::{Handshake, Message};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A peer candidate: the network identity of a remote endpoint, together with
/// the bookkeeping that drives reconnection and encryption tier narrowing.
///
/// A candidate lives in at most one of a torrent's peer lists at a time.
pub struct Peer {
    uri: Url,
    /// The peer's self-reported id, known once a handshake has completed.
    peer_id: Mutex<Option<PeerId>>,
    failed_connection_attempts: AtomicU32,
    cleaned_up_count: AtomicU32,
    /// The encryption modes this peer may still be offered, narrowed as
    /// negotiations fail. Stored as raw bits so narrowing is a single atomic
    /// and-not.
    allowed_encryption: AtomicU8,
}

impl Peer {
    pub fn new(uri: Url, allowed_encryption: EncryptionModes) -> Self {
        Self {
            uri,
            peer_id: Mutex::new(None),
            failed_connection_attempts: AtomicU32::new(0),
            cleaned_up_count: AtomicU32::new(0),
            allowed_encryption: AtomicU8::new(allowed_encryption.bits()),
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        *self.peer_id.lock().unwrap()
    }

    pub(crate) fn set_peer_id(&self, id: PeerId) {
        *self.peer_id.lock().unwrap() = Some(id);
    }

    pub fn failed_connection_attempts(&self) -> u32 {
        self.failed_connection_attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failed_attempt(&self) {
        self.failed_connection_attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    /// How many cleanup cycles this peer has passed through.
    pub fn cleaned_up_count(&self) -> u32 {
        self.cleaned_up_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_cleanup(&self) {
        self.cleaned_up_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allowed_encryption(&self) -> EncryptionModes {
        EncryptionModes::from_bits(self.allowed_encryption.load(Ordering::Relaxed))
    }

    /// Removes the given modes from the peer's allowed set. Narrowing is
    /// monotonic; nothing ever adds modes back.
    pub(crate) fn narrow_encryption(&self, removed: EncryptionModes) {
        self.allowed_encryption
            .fetch_and(!removed.bits(), Ordering::Relaxed);
    }
}

/// An optional per-session component torn down with the session, such as the
/// peer exchange manager.
pub trait SessionExtension: Send + Sync {
    fn dispose(&self);
}

struct SendQueue {
    queue: VecDeque<Message>,
    /// True while a send pump is running (or while the outbound pipeline has
    /// the queue reserved). Only one pump runs per session.
    processing: bool,
}

struct Timers {
    when_connected: Instant,
    last_message_sent: Instant,
    last_message_received: Instant,
    last_block_received: Instant,
}

/// The choke and interest state of a session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
pub struct Status {
    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    pub is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    pub is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    pub is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// The per-peer runtime state created on a successful handshake (or, for
/// inbound peers, on acceptance by the listener layer).
///
/// A session is destroyed exactly once, by cleanup.
pub struct PeerSession {
    id: u64,
    peer: Arc<Peer>,
    conn: Arc<dyn Connection>,
    /// The negotiated encryptor. Held by the send pump while it runs; a
    /// plain text placeholder until negotiation completes.
    encryptor: AsyncMutex<Box<dyn StreamCipher>>,
    /// Where inbound sessions keep their decryptor until the receive loop is
    /// spawned. Outbound sessions hand theirs straight to the loop.
    decryptor: Mutex<Option<Box<dyn StreamCipher>>>,
    encryption_type: Mutex<EncryptionModes>,
    send_queue: Mutex<SendQueue>,
    status: Mutex<Status>,
    timers: Mutex<Timers>,
    pieces_sent: AtomicU32,
    requesting_pieces_count: AtomicU32,
    disposed: AtomicBool,
    cleanup_started: AtomicBool,
    /// The remote's advertised piece availability.
    pieces: Mutex<Option<Bitfield>>,
    extensions: Mutex<Vec<Box<dyn SessionExtension>>>,
    monitor: ConnectionMonitor,
}

impl PeerSession {
    /// Creates a session for an outbound connection whose transport just
    /// connected. Ciphers are installed once negotiation completes.
    pub fn outbound(peer: Arc<Peer>, conn: Arc<dyn Connection>) -> Arc<Self> {
        Self::create(peer, conn, None)
    }

    /// Creates a session for an accepted connection whose handshake the
    /// listener layer has already consumed, so the cipher pair is known.
    pub fn inbound(peer: Arc<Peer>, conn: Arc<dyn Connection>, ciphers: CipherPair) -> Arc<Self> {
        Self::create(peer, conn, Some(ciphers))
    }

    fn create(
        peer: Arc<Peer>,
        conn: Arc<dyn Connection>,
        ciphers: Option<CipherPair>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (encryptor, decryptor, encryption_type) = match ciphers {
            Some(pair) => (pair.encryptor, Some(pair.decryptor), pair.mode),
            None => (
                Box::new(PlainText) as Box<dyn StreamCipher>,
                None,
                EncryptionModes::none(),
            ),
        };
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            conn,
            encryptor: AsyncMutex::new(encryptor),
            decryptor: Mutex::new(decryptor),
            encryption_type: Mutex::new(encryption_type),
            send_queue: Mutex::new(SendQueue {
                queue: VecDeque::new(),
                processing: false,
            }),
            status: Mutex::new(Status::default()),
            timers: Mutex::new(Timers {
                when_connected: now,
                last_message_sent: now,
                last_message_received: now,
                last_block_received: now,
            }),
            pieces_sent: AtomicU32::new(0),
            requesting_pieces_count: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
            pieces: Mutex::new(None),
            extensions: Mutex::new(Vec::new()),
            monitor: ConnectionMonitor::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// The encryption mode the session's connection was negotiated with.
    pub fn encryption_type(&self) -> EncryptionModes {
        *self.encryption_type.lock().unwrap()
    }

    pub(crate) async fn install_encryptor(
        &self,
        cipher: Box<dyn StreamCipher>,
        mode: EncryptionModes,
    ) {
        *self.encryptor.lock().await = cipher;
        *self.encryption_type.lock().unwrap() = mode;
    }

    pub(crate) fn encryptor(&self) -> &AsyncMutex<Box<dyn StreamCipher>> {
        &self.encryptor
    }

    pub(crate) fn take_decryptor(&self) -> Option<Box<dyn StreamCipher>> {
        self.decryptor.lock().unwrap().take()
    }

    // --- send queue ---

    /// Enqueues an outbound message. Returns true if the queue was idle, in
    /// which case the caller must start the send pump; the processing flag is
    /// then already reserved for it.
    pub(crate) fn enqueue(&self, msg: Message) -> bool {
        let mut sq = self.send_queue.lock().unwrap();
        sq.queue.push_back(msg);
        if sq.processing {
            false
        } else {
            sq.processing = true;
            true
        }
    }

    /// Pops the next queued message. When the queue is empty the processing
    /// flag is cleared in the same critical section, so a concurrent enqueue
    /// either sees the message or starts a new pump.
    pub(crate) fn dequeue(&self) -> Option<Message> {
        let mut sq = self.send_queue.lock().unwrap();
        match sq.queue.pop_front() {
            Some(msg) => Some(msg),
            None => {
                sq.processing = false;
                None
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.send_queue.lock().unwrap().queue.len()
    }

    pub(crate) fn set_processing_queue(&self, processing: bool) {
        self.send_queue.lock().unwrap().processing = processing;
    }

    pub fn is_processing_queue(&self) -> bool {
        self.send_queue.lock().unwrap().processing
    }

    /// Removes a queued, not yet read piece reply matching the cancelled
    /// block. Returns whether one was removed.
    pub(crate) fn cancel_queued_piece(&self, block: &BlockInfo) -> bool {
        let mut sq = self.send_queue.lock().unwrap();
        let pos = sq.queue.iter().position(|msg| match msg {
            Message::Piece {
                piece_index,
                offset,
                data,
                ..
            } => *piece_index == block.piece_index && *offset == block.offset && data.is_empty(),
            _ => false,
        });
        match pos {
            Some(pos) => {
                sq.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    // --- status flags ---

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    pub(crate) fn with_status(&self, f: impl FnOnce(&mut Status)) {
        f(&mut self.status.lock().unwrap());
    }

    // --- timers ---

    pub fn when_connected(&self) -> Instant {
        self.timers.lock().unwrap().when_connected
    }

    pub fn last_message_sent(&self) -> Instant {
        self.timers.lock().unwrap().last_message_sent
    }

    pub fn last_message_received(&self) -> Instant {
        self.timers.lock().unwrap().last_message_received
    }

    pub fn last_block_received(&self) -> Instant {
        self.timers.lock().unwrap().last_block_received
    }

    /// Baselines the connection timers at promotion: the connection time and
    /// the time the last block was received.
    pub(crate) fn restart_when_connected(&self) {
        let mut timers = self.timers.lock().unwrap();
        let now = Instant::now();
        timers.when_connected = now;
        timers.last_block_received = now;
    }

    pub(crate) fn restart_last_message_sent(&self) {
        self.timers.lock().unwrap().last_message_sent = Instant::now();
    }

    pub(crate) fn restart_last_message_received(&self) {
        self.timers.lock().unwrap().last_message_received = Instant::now();
    }

    pub(crate) fn restart_last_block_received(&self) {
        self.timers.lock().unwrap().last_block_received = Instant::now();
    }

    // --- counters ---

    pub fn pieces_sent(&self) -> u32 {
        self.pieces_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn record_piece_sent(&self) {
        self.pieces_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// How many piece replies the remote currently has outstanding with us.
    pub fn requesting_pieces_count(&self) -> u32 {
        self.requesting_pieces_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_requesting_pieces(&self) {
        self.requesting_pieces_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_requesting_pieces(&self) {
        let _ = self
            .requesting_pieces_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    // --- piece availability ---

    pub(crate) fn set_pieces(&self, bitfield: Bitfield) {
        *self.pieces.lock().unwrap() = Some(bitfield);
    }

    pub(crate) fn record_have(&self, piece_index: usize) {
        let mut pieces = self.pieces.lock().unwrap();
        let bitfield = pieces.get_or_insert_with(Bitfield::new);
        if bitfield.len() <= piece_index {
            bitfield.resize(piece_index + 1, false);
        }
        bitfield.set(piece_index, true);
    }

    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.pieces
            .lock()
            .unwrap()
            .as_ref()
            .map(|bitfield| bitfield.get(piece_index).map(|bit| *bit).unwrap_or(false))
            .unwrap_or(false)
    }

    // --- extensions ---

    pub fn add_extension(&self, extension: Box<dyn SessionExtension>) {
        self.extensions.lock().unwrap().push(extension);
    }

    pub(crate) fn dispose_extensions(&self) {
        for extension in self.extensions.lock().unwrap().drain(..) {
            extension.dispose();
        }
    }

    // --- handshake and teardown ---

    /// Dispatches the remote handshake: verifies the info hash and records
    /// the remote's id. The protocol string was already verified by the
    /// codec.
    pub(crate) fn handle_handshake(
        &self,
        manager: &TorrentManager,
        handshake: Handshake,
    ) -> Result<()> {
        if handshake.info_hash != manager.info_hash() {
            log::warn!(
                "Peer {} handshake invalid info hash {}",
                self.peer.uri(),
                hex::encode(&handshake.info_hash)
            );
            return Err(Error::InvalidInfoHash);
        }
        log::debug!(
            "Peer {} handshake, remote id {}",
            self.peer.uri(),
            hex::encode(&handshake.peer_id)
        );
        self.peer.set_peer_id(handshake.peer_id);
        Ok(())
    }

    /// Marks the start of cleanup. Returns true if cleanup had already begun,
    /// making the caller's invocation a no-op.
    pub(crate) fn begin_cleanup(&self) -> bool {
        self.cleanup_started.swap(true, Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.conn.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_peer, FakeConnection};

    fn test_session() -> Arc<PeerSession> {
        let (conn, _remote) = FakeConnection::pair();
        PeerSession::outbound(Arc::new(test_peer(1)), conn)
    }

    #[test]
    fn test_enqueue_reserves_the_pump_once() {
        let session = test_session();
        assert!(session.enqueue(Message::Interested));
        // a pump is already running, the second enqueue must not start one
        assert!(!session.enqueue(Message::KeepAlive));
        assert_eq!(session.queue_len(), 2);

        assert!(matches!(session.dequeue(), Some(Message::Interested)));
        assert!(matches!(session.dequeue(), Some(Message::KeepAlive)));
        // queue drained: the processing flag is released...
        assert!(session.dequeue().is_none());
        assert!(!session.is_processing_queue());
        // ...so the next enqueue starts a new pump
        assert!(session.enqueue(Message::KeepAlive));
    }

    #[test]
    fn test_cancel_removes_only_unread_piece_replies() {
        let session = test_session();
        let block = BlockInfo {
            piece_index: 2,
            offset: 0,
            len: 16,
        };
        session.set_processing_queue(true);
        session.enqueue(Message::Piece {
            piece_index: 2,
            offset: 0,
            len: 16,
            data: Vec::new(),
        });
        // a piece whose data was already read from disk is not cancellable
        session.enqueue(Message::Piece {
            piece_index: 3,
            offset: 0,
            len: 4,
            data: vec![0; 4],
        });

        assert!(session.cancel_queued_piece(&block));
        assert!(!session.cancel_queued_piece(&block));
        assert!(!session.cancel_queued_piece(&BlockInfo {
            piece_index: 3,
            offset: 0,
            len: 4,
        }));
        assert_eq!(session.queue_len(), 1);
    }

    #[test]
    fn test_requesting_pieces_count_does_not_underflow() {
        let session = test_session();
        session.inc_requesting_pieces();
        session.dec_requesting_pieces();
        session.dec_requesting_pieces();
        assert_eq!(session.requesting_pieces_count(), 0);
    }

    #[test]
    fn test_have_extends_availability() {
        let session = test_session();
        assert!(!session.has_piece(9));
        session.record_have(9);
        assert!(session.has_piece(9));
        assert!(!session.has_piece(8));
    }
}
