//! The connection manager: it dials peers across all registered torrents
//! under global caps, runs the outbound and inbound admission pipelines,
//! pumps each session's send queue and receive loop, and funnels every
//! teardown through one cleanup path.

use std::{
    cmp,
    sync::{Arc, Mutex},
};

use tokio::time::Instant;

use crate::{
    conf::EngineConf,
    conn::{Connection, ConnectionFactory, TcpConnectionFactory},
    disk::DiskHandle,
    encryption::{CipherPair, EncryptionModes, Negotiator, PlainTextNegotiator, StreamCipher},
    peer::{
        codec::{Handshake, Message},
        wire, Peer, PeerSession,
    },
    pool::BufferPool,
    torrent::{ConnectionFailureReason, ErrorReason, TorrentManager},
    BlockInfo, PeerId, BLOCK_LEN,
};

/// A peer is recycled through cleanup at most this many times before it is
/// dropped from the available pool for good.
const MAX_CLEANUP_REUSES: u32 = 5;

/// The single-subscriber hook consulted before dialing a candidate.
pub type BanPeerHook = Box<dyn Fn(&Peer) -> bool + Send + Sync>;

/// One in-flight outbound dial. The entry lives from just before the
/// transport connect until its pipeline resolves (promotion or failure), so
/// cancellation can reach dials that are still negotiating or handshaking.
struct PendingDial {
    manager: Arc<TorrentManager>,
    conn: Arc<dyn Connection>,
    started: Instant,
}

struct Inner {
    conf: EngineConf,
    factory: Box<dyn ConnectionFactory>,
    negotiator: Box<dyn Negotiator>,
    disk: DiskHandle,
    pool: BufferPool,
    /// The registered torrents, in dial rotation order: the scheduler moves
    /// each dialed torrent to the back.
    torrents: Mutex<Vec<Arc<TorrentManager>>>,
    /// The global set of in-flight outbound dials.
    pending_dials: Mutex<Vec<PendingDial>>,
    ban_hook: Mutex<Option<BanPeerHook>>,
}

/// The connection manager handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a connection manager with the default TCP transport and the
    /// bundled plain text negotiator.
    pub fn new(conf: EngineConf, disk: DiskHandle) -> Self {
        Self::with_parts(
            conf,
            disk,
            Box::new(TcpConnectionFactory),
            Box::new(PlainTextNegotiator),
        )
    }

    /// Creates a connection manager with a custom transport factory and
    /// encryption negotiator.
    pub fn with_parts(
        conf: EngineConf,
        disk: DiskHandle,
        factory: Box<dyn ConnectionFactory>,
        negotiator: Box<dyn Negotiator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conf,
                factory,
                negotiator,
                disk,
                pool: BufferPool::new(),
                torrents: Mutex::new(Vec::new()),
                pending_dials: Mutex::new(Vec::new()),
                ban_hook: Mutex::new(None),
            }),
        }
    }

    pub fn conf(&self) -> &EngineConf {
        &self.inner.conf
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.conf.client_id
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Installs the ban hook. Banned candidates are consumed without being
    /// dialed; a ban does not count as a failed connection attempt.
    pub fn set_ban_peer_hook(&self, hook: BanPeerHook) {
        *self.inner.ban_hook.lock().unwrap() = Some(hook);
    }

    fn should_ban_peer(&self, peer: &Peer) -> bool {
        self.inner
            .ban_hook
            .lock()
            .unwrap()
            .as_ref()
            .map(|hook| hook(peer))
            .unwrap_or(false)
    }

    /// Registers a torrent with the connection manager.
    pub fn add(&self, torrent: &Arc<TorrentManager>) {
        log::info!(
            "Adding torrent {} ({})",
            torrent.id(),
            hex::encode(&torrent.info_hash())
        );
        torrent.set_attached(true);
        self.inner.torrents.lock().unwrap().push(Arc::clone(torrent));
    }

    /// Detaches a torrent: it leaves the dial rotation, its pending dials are
    /// cancelled, and its in-flight pipelines abort at their next admission
    /// check. Established sessions are the embedder's to stop.
    pub fn remove(&self, torrent: &Arc<TorrentManager>) {
        log::info!("Removing torrent {}", torrent.id());
        torrent.set_attached(false);
        self.inner
            .torrents
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, torrent));
        self.cancel_pending_connects(Some(torrent));
    }

    /// A snapshot of the number of fully connected peers across all torrents.
    pub fn open_connections(&self) -> usize {
        let torrents = self.inner.torrents.lock().unwrap();
        torrents.iter().map(|t| t.peers().connected.len()).sum()
    }

    pub fn pending_connect_count(&self) -> usize {
        self.inner.pending_dials.lock().unwrap().len()
    }

    /// Starts as many outbound dials as the global budget permits.
    ///
    /// Torrents are scanned head to tail and the first one that yields a dial
    /// is rotated to the back of the list, so no torrent can monopolize dial
    /// slots while others have candidates. Returns when a cap is hit or no
    /// torrent has a dialable peer.
    pub fn try_connect(&self) {
        loop {
            if self.open_connections() > self.inner.conf.max_open_connections
                || self.pending_connect_count() > self.inner.conf.max_half_open_connections
            {
                break;
            }

            let snapshot: Vec<_> = self.inner.torrents.lock().unwrap().clone();
            let mut dialed = None;
            for torrent in &snapshot {
                if self.try_dial_torrent(torrent) {
                    dialed = Some(Arc::clone(torrent));
                    break;
                }
            }

            match dialed {
                Some(torrent) => {
                    let mut torrents = self.inner.torrents.lock().unwrap();
                    if let Some(pos) = torrents.iter().position(|t| Arc::ptr_eq(t, &torrent)) {
                        let torrent = torrents.remove(pos);
                        torrents.push(torrent);
                    }
                }
                None => break,
            }
        }
    }

    /// Attempts to start one dial for the torrent. Returns whether the
    /// torrent yielded a dial (and should be rotated).
    fn try_dial_torrent(&self, torrent: &Arc<TorrentManager>) -> bool {
        if !torrent.mode().can_accept_connections() {
            return false;
        }
        let peer = {
            let mut peers = torrent.peers();
            if peers.connected.len() >= torrent.conf().max_connected_peer_count {
                return false;
            }
            let pos = match peers
                .available
                .iter()
                .position(|p| torrent.mode().should_connect(p))
            {
                Some(pos) => pos,
                None => return false,
            };
            match peers.available.remove(pos) {
                Some(peer) => peer,
                None => return false,
            }
        };
        if self.should_ban_peer(&peer) {
            // the candidate is consumed, but a ban is neither a dial nor a
            // failed attempt
            log::debug!("Not dialing banned peer {}", peer.uri());
            return false;
        }
        if peer.allowed_encryption().is_empty() {
            // every tier has been narrowed away; the candidate is spent
            log::debug!("Peer {} has no encryption modes left", peer.uri());
            return true;
        }

        log::info!("Dialing peer {} for torrent {}", peer.uri(), torrent.id());
        let conn = match self.inner.factory.create(peer.uri()) {
            Some(conn) => conn,
            None => {
                log::debug!("No transport for peer {}", peer.uri());
                return true;
            }
        };

        self.inner.pending_dials.lock().unwrap().push(PendingDial {
            manager: Arc::clone(torrent),
            conn: Arc::clone(&conn),
            started: Instant::now(),
        });
        torrent.peers().connecting.push(Arc::clone(&peer));

        let this = self.clone();
        let torrent = Arc::clone(torrent);
        tokio::spawn(async move {
            this.run_outbound(torrent, peer, conn).await;
        });
        true
    }

    async fn run_outbound(
        self,
        torrent: Arc<TorrentManager>,
        peer: Arc<Peer>,
        conn: Arc<dyn Connection>,
    ) {
        self.dial_outbound(&torrent, peer, &conn).await;
        self.unregister_pending(&conn);
        // a dial slot freed up either way
        self.try_connect();
    }

    /// The outbound pipeline from transport connect up to session creation.
    async fn dial_outbound(
        &self,
        torrent: &Arc<TorrentManager>,
        peer: Arc<Peer>,
        conn: &Arc<dyn Connection>,
    ) {
        let connect_res = conn.connect().await;
        torrent.peers().connecting.retain(|p| p.uri() != peer.uri());

        if !torrent.is_attached() || !torrent.mode().can_accept_connections() {
            conn.dispose();
            return;
        }

        if let Err(e) = connect_res {
            log::info!("Failed to connect to peer {}: {}", peer.uri(), e);
            conn.dispose();
            torrent.peers().busy.push(Arc::clone(&peer));
            torrent.raise_connection_attempt_failed(&peer, ConnectionFailureReason::Unreachable);
            return;
        }

        log::info!("Connected to peer {}", peer.uri());
        let session = PeerSession::outbound(peer, Arc::clone(conn));
        self.establish_outbound(torrent, &session).await;
    }

    /// Negotiates encryption, exchanges handshakes, and promotes the session
    /// into the connected set.
    async fn establish_outbound(&self, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) {
        if self.open_connections() > self.inner.conf.max_open_connections {
            self.cleanup(torrent, session);
            return;
        }
        session.set_processing_queue(true);
        {
            let mut peers = torrent.peers();
            peers.active.push(Arc::clone(session.peer()));
            peers.handshaking.push(Arc::clone(session));
        }

        let handshake = Handshake::new(torrent.info_hash(), self.inner.conf.client_id);
        let pair = match self
            .inner
            .negotiator
            .check_outgoing(
                &**session.connection(),
                session.peer().allowed_encryption(),
                self.inner.conf.allowed_encryption,
                &torrent.info_hash(),
                handshake,
            )
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                log::info!(
                    "Peer {} encryption negotiation failed: {}",
                    session.peer().uri(),
                    e
                );
                session
                    .peer()
                    .narrow_encryption(EncryptionModes::RC4_FULL | EncryptionModes::RC4_HEADER);
                torrent.raise_connection_attempt_failed(
                    session.peer(),
                    ConnectionFailureReason::EncryptionNegotiationFailed,
                );
                self.cleanup(torrent, session);
                return;
            }
        };
        let CipherPair {
            encryptor,
            mut decryptor,
            mode,
        } = pair;
        session.install_encryptor(encryptor, mode).await;

        let handshake_res =
            match wire::receive_handshake(&**session.connection(), decryptor.as_mut()).await {
                Ok(handshake) => session.handle_handshake(torrent, handshake),
                Err(e) => Err(e),
            };
        if let Err(e) = handshake_res {
            log::info!("Peer {} handshake failed: {}", session.peer().uri(), e);
            // drop only the mode that was just exercised
            session.peer().narrow_encryption(mode);
            torrent.raise_connection_attempt_failed(
                session.peer(),
                ConnectionFailureReason::HandshakeFailed,
            );
            self.cleanup(torrent, session);
            return;
        }

        {
            let mut peers = torrent.peers();
            peers.handshaking.retain(|s| !Arc::ptr_eq(s, session));
            peers.connected.push(Arc::clone(session));
        }
        if let Err(e) = torrent.mode().handle_peer_connected(session) {
            log::warn!(
                "Peer {} rejected at promotion: {}",
                session.peer().uri(),
                e
            );
            torrent
                .raise_connection_attempt_failed(session.peer(), ConnectionFailureReason::Unknown);
            self.cleanup(torrent, session);
            return;
        }

        if session.queue_len() > 0 {
            self.spawn_send_pump(torrent, session);
        } else {
            session.set_processing_queue(false);
        }
        self.spawn_receive_loop(torrent, session, decryptor);
        session.restart_when_connected();
        log::info!("Peer {} connected", session.peer().uri());
    }

    /// Admits a peer whose socket was accepted and whose handshake the
    /// listener layer has already consumed. Returns whether the session was
    /// kept.
    pub fn incoming_connection_accepted(
        &self,
        torrent: &Arc<TorrentManager>,
        session: Arc<PeerSession>,
    ) -> bool {
        let peer = Arc::clone(session.peer());
        let cap = cmp::min(
            self.inner.conf.max_open_connections,
            torrent.conf().max_connected_peer_count,
        );
        let is_self = peer
            .peer_id()
            .map_or(false, |id| id == self.inner.conf.client_id);
        if self.open_connections() >= cap || is_self {
            log::debug!("Rejecting incoming connection from {}", peer.uri());
            self.cleanup(torrent, &session);
            return false;
        }
        {
            let mut peers = torrent.peers();
            if peers.active.iter().any(|p| p.uri() == peer.uri()) {
                // the existing session keeps running; only this handle dies
                log::debug!("Already connected to peer {}", peer.uri());
                session.connection().dispose();
                return false;
            }
            session.set_processing_queue(true);
            peers.available.retain(|p| p.uri() != peer.uri());
            peers.active.push(Arc::clone(&peer));
            peers.connected.push(Arc::clone(&session));
        }
        session.restart_when_connected();

        if let Err(e) = torrent.mode().handle_peer_connected(&session) {
            log::warn!("Peer {} rejected at admission: {}", peer.uri(), e);
            self.cleanup(torrent, &session);
            return false;
        }
        let decryptor = match session.take_decryptor() {
            Some(decryptor) => decryptor,
            None => {
                log::warn!("Incoming session for {} has no decryptor", peer.uri());
                self.cleanup(torrent, &session);
                return false;
            }
        };

        if session.queue_len() > 0 {
            self.spawn_send_pump(torrent, &session);
        } else {
            session.set_processing_queue(false);
        }
        self.spawn_receive_loop(torrent, &session, decryptor);
        log::info!("Accepted incoming connection from {}", peer.uri());
        true
    }

    /// Sends a message to the peer, starting the send pump if it is idle.
    pub fn enqueue_message(
        &self,
        torrent: &Arc<TorrentManager>,
        session: &Arc<PeerSession>,
        msg: Message,
    ) {
        if session.enqueue(msg) {
            self.spawn_send_pump(torrent, session);
        }
    }

    /// Unchokes the peer, allowing it to request pieces from us.
    pub fn unchoke_peer(&self, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) {
        let mut changed = false;
        session.with_status(|status| {
            if status.is_peer_choked {
                status.is_peer_choked = false;
                changed = true;
            }
        });
        if changed {
            torrent.increment_uploading_to();
            self.enqueue_message(torrent, session, Message::Unchoke);
        }
    }

    /// Chokes the peer; outstanding queued piece replies still go out.
    pub fn choke_peer(&self, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) {
        let mut changed = false;
        session.with_status(|status| {
            if !status.is_peer_choked {
                status.is_peer_choked = true;
                changed = true;
            }
        });
        if changed {
            torrent.decrement_uploading_to();
            self.enqueue_message(torrent, session, Message::Choke);
        }
    }

    fn spawn_send_pump(&self, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) {
        let this = self.clone();
        let torrent = Arc::clone(torrent);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            this.process_queue(torrent, session).await;
        });
    }

    /// The send queue pump. Only one pump runs per session; the processing
    /// flag gates re-entry and `dequeue` releases it when the queue runs dry.
    async fn process_queue(self, torrent: Arc<TorrentManager>, session: Arc<PeerSession>) {
        let mut encryptor = session.encryptor().lock().await;
        while let Some(mut msg) = session.dequeue() {
            // piece replies read their block from disk into a pool buffer
            if let Message::Piece {
                piece_index,
                offset,
                len,
                data,
            } = &mut msg
            {
                let block = BlockInfo {
                    piece_index: *piece_index,
                    offset: *offset,
                    len: *len,
                };
                let buf = self.inner.pool.get_buffer(*len as usize);
                let (buf, res) = self
                    .inner
                    .disk
                    .read(
                        torrent.id(),
                        block.absolute_offset(torrent.piece_len()),
                        buf,
                        *len as usize,
                    )
                    .await;
                if let Err(e) = res {
                    self.inner.pool.free_buffer(buf);
                    torrent.try_set_error(ErrorReason::ReadFailure, e);
                    session.set_processing_queue(false);
                    return;
                }
                *data = buf;
                session.record_piece_sent();
            }

            let send_res = wire::send_message(
                &**session.connection(),
                encryptor.as_mut(),
                &msg,
                torrent.upload_limiter(),
                session.monitor(),
                torrent.monitor(),
            )
            .await;

            // the pool buffer is returned on every path, sent or not
            let is_piece = if let Message::Piece { data, .. } = &mut msg {
                self.inner.pool.free_buffer(std::mem::take(data));
                true
            } else {
                false
            };

            match send_res {
                Ok(()) => {
                    if is_piece {
                        session.dec_requesting_pieces();
                    }
                    session.restart_last_message_sent();
                }
                Err(e) => {
                    log::debug!("Peer {} send failed: {}", session.peer().uri(), e);
                    self.cleanup(&torrent, &session);
                    session.set_processing_queue(false);
                    return;
                }
            }
        }
    }

    fn spawn_receive_loop(
        &self,
        torrent: &Arc<TorrentManager>,
        session: &Arc<PeerSession>,
        decryptor: Box<dyn StreamCipher>,
    ) {
        let this = self.clone();
        let torrent = Arc::clone(torrent);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            this.receive_messages(torrent, session, decryptor).await;
        });
    }

    /// The receive loop: pulls framed messages off the wire until the
    /// session is torn down.
    async fn receive_messages(
        self,
        torrent: Arc<TorrentManager>,
        session: Arc<PeerSession>,
        mut decryptor: Box<dyn StreamCipher>,
    ) {
        loop {
            match wire::receive_message(
                &**session.connection(),
                decryptor.as_mut(),
                torrent.download_limiter(),
                session.monitor(),
                torrent.monitor(),
                &self.inner.pool,
            )
            .await
            {
                Ok(msg) => {
                    if session.is_disposed() {
                        // a late message on a torn down session; only the
                        // borrowed piece buffer needs care
                        if let Message::Piece { data, .. } = msg {
                            self.inner.pool.free_buffer(data);
                        }
                        continue;
                    }
                    session.restart_last_message_received();
                    self.handle_message(&torrent, &session, msg);
                }
                Err(e) => {
                    log::debug!("Peer {} receive loop ended: {}", session.peer().uri(), e);
                    self.cleanup(&torrent, &session);
                    break;
                }
            }
        }
    }

    /// Dispatches one received message to its handler.
    fn handle_message(
        &self,
        torrent: &Arc<TorrentManager>,
        session: &Arc<PeerSession>,
        msg: Message,
    ) {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            session.peer().uri()
        );
        match msg {
            Message::KeepAlive => {}
            Message::Choke => session.with_status(|status| status.is_choked = true),
            Message::Unchoke => session.with_status(|status| status.is_choked = false),
            Message::Interested => {
                session.with_status(|status| status.is_peer_interested = true)
            }
            Message::NotInterested => {
                session.with_status(|status| status.is_peer_interested = false)
            }
            Message::Have { piece_index } => session.record_have(piece_index),
            Message::Bitfield(bitfield) => session.set_pieces(bitfield),
            Message::Request(block) => self.handle_request(torrent, session, block),
            Message::Cancel(block) => {
                if session.cancel_queued_piece(&block) {
                    session.dec_requesting_pieces();
                }
            }
            Message::Piece { data, .. } => {
                // download bookkeeping happens upstream; here only the
                // transfer timestamp and the borrowed buffer matter
                session.restart_last_block_received();
                self.inner.pool.free_buffer(data);
            }
        }
    }

    fn handle_request(
        &self,
        torrent: &Arc<TorrentManager>,
        session: &Arc<PeerSession>,
        block: BlockInfo,
    ) {
        if session.status().is_peer_choked {
            log::debug!("Choked peer {} requested a block", session.peer().uri());
            return;
        }
        if block.len == 0 || block.len > BLOCK_LEN {
            log::warn!(
                "Peer {} requested invalid block length {}",
                session.peer().uri(),
                block.len
            );
            return;
        }
        session.inc_requesting_pieces();
        self.enqueue_message(
            torrent,
            session,
            Message::Piece {
                piece_index: block.piece_index,
                offset: block.offset,
                len: block.len,
                data: Vec::new(),
            },
        );
    }

    /// The single choke point for tearing down a session. Idempotent and
    /// best-effort: its accounting always completes.
    pub(crate) fn cleanup(&self, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) {
        if session.begin_cleanup() {
            return;
        }
        let peer = Arc::clone(session.peer());
        log::debug!("Cleaning up session with peer {}", peer.uri());

        let can_reuse =
            session.connection().can_reconnect() && !torrent.is_inactive(peer.uri());
        torrent.picker().cancel_requests(session.id());
        peer.record_cleanup();
        session.dispose_extensions();
        if !session.status().is_peer_choked {
            torrent.decrement_uploading_to();
        }
        {
            let mut peers = torrent.peers();
            peers.connected.retain(|s| !Arc::ptr_eq(s, session));
            peers.handshaking.retain(|s| !Arc::ptr_eq(s, session));
            peers.active.retain(|p| p.uri() != peer.uri());

            // if we got our own details, this check makes sure we don't try
            // connecting to ourselves again
            let is_self = peer
                .peer_id()
                .map_or(false, |id| id == self.inner.conf.client_id);
            let already_available = peers.available.iter().any(|p| p.uri() == peer.uri());
            if can_reuse
                && !is_self
                && !already_available
                && peer.cleaned_up_count() < MAX_CLEANUP_REUSES
            {
                peers.available.push_front(Arc::clone(&peer));
            }
        }
        torrent.raise_peer_disconnected(peer.uri().clone());
        session.dispose();
    }

    /// Disposes the connection of every pending dial that belongs to the
    /// given torrent, or that has been in flight longer than the stale
    /// threshold. Entries are not removed here; each pipeline drops its own
    /// entry when it resolves.
    pub fn cancel_pending_connects(&self, torrent: Option<&Arc<TorrentManager>>) {
        let pending = self.inner.pending_dials.lock().unwrap();
        for dial in pending.iter() {
            let matches_manager = torrent.map_or(false, |t| Arc::ptr_eq(&dial.manager, t));
            if matches_manager
                || dial.started.elapsed() > self.inner.conf.stale_connect_threshold
            {
                log::debug!("Cancelling pending connect to {}", dial.conn.uri());
                dial.conn.dispose();
            }
        }
    }

    fn unregister_pending(&self, conn: &Arc<dyn Connection>) {
        self.inner
            .pending_dials
            .lock()
            .unwrap()
            .retain(|dial| !Arc::ptr_eq(&dial.conn, conn));
    }
}
