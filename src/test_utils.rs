//! Shared fakes and builders for the crate's tests.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::{self, BoxFuture};
use tokio::sync::Notify;
use tokio_util::codec::Encoder;
use url::Url;

use crate::{
    conf::TorrentConf,
    conn::{Connection, ConnectionFactory},
    disk::BlockSource,
    encryption::{CipherPair, EncryptionModes, Negotiator, PlainText},
    error::{Error, Result},
    peer::{
        codec::{Handshake, HandshakeCodec},
        Peer, PeerSession,
    },
    torrent::{Mode, RateLimiter, TorrentManager, TorrentParams},
    Sha1Hash, BLOCK_LEN,
};

pub(crate) const TEST_INFO_HASH: Sha1Hash = [0x21; 20];
pub(crate) const TEST_PIECE_LEN: u32 = 4 * BLOCK_LEN;

/// Creates a peer candidate with a unique loopback URI per `n`.
pub(crate) fn test_peer(n: u16) -> Peer {
    let uri = Url::parse(&format!("tcp://127.0.0.1:{}", 10000 + n)).unwrap();
    Peer::new(uri, EncryptionModes::all())
}

pub(crate) fn test_torrent() -> Arc<TorrentManager> {
    test_torrent_with(TorrentConf::new(), Box::new(crate::torrent::StandardMode))
}

pub(crate) fn test_torrent_with(conf: TorrentConf, mode: Box<dyn Mode>) -> Arc<TorrentManager> {
    TorrentManager::new(TorrentParams {
        info_hash: TEST_INFO_HASH,
        piece_len: TEST_PIECE_LEN,
        conf,
        mode,
        download_limiter: None,
        upload_limiter: None,
    })
}

/// How a fake connection behaves when its `connect` is awaited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectBehavior {
    /// Connect completes immediately.
    Immediate,
    /// Connect stays pending until the handle is disposed.
    Never,
    /// Connect fails immediately, like a refused TCP connection.
    Fail,
}

#[derive(Default)]
struct Inbox {
    buf: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Inbox {
    fn push(&self, bytes: &[u8]) {
        self.buf.lock().unwrap().extend(bytes.iter().copied());
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// An in-memory connection with scripted connect behavior. Created standalone
/// (nothing ever arrives) or as a [`pair`](FakeConnection::pair) whose ends
/// feed each other.
pub(crate) struct FakeConnection {
    uri: Url,
    behavior: ConnectBehavior,
    inbox: Arc<Inbox>,
    outbox: Arc<Inbox>,
    disposed: AtomicBool,
    dispose_notify: Notify,
    connect_attempts: AtomicUsize,
    can_reconnect: AtomicBool,
}

impl FakeConnection {
    pub(crate) fn new(uri: Url, behavior: ConnectBehavior) -> Arc<Self> {
        Arc::new(Self {
            uri,
            behavior,
            inbox: Arc::new(Inbox::default()),
            outbox: Arc::new(Inbox::default()),
            disposed: AtomicBool::new(false),
            dispose_notify: Notify::new(),
            connect_attempts: AtomicUsize::new(0),
            can_reconnect: AtomicBool::new(true),
        })
    }

    /// Creates two connected ends: bytes sent on one are received on the
    /// other.
    pub(crate) fn pair() -> (Arc<Self>, Arc<Self>) {
        Self::pair_for(
            Url::parse("tcp://127.0.0.1:7001").unwrap(),
            Url::parse("tcp://127.0.0.1:7002").unwrap(),
        )
    }

    pub(crate) fn pair_for(local_uri: Url, remote_uri: Url) -> (Arc<Self>, Arc<Self>) {
        let to_remote = Arc::new(Inbox::default());
        let to_local = Arc::new(Inbox::default());
        let make = |uri: Url, inbox: &Arc<Inbox>, outbox: &Arc<Inbox>| {
            Arc::new(Self {
                uri,
                behavior: ConnectBehavior::Immediate,
                inbox: Arc::clone(inbox),
                outbox: Arc::clone(outbox),
                disposed: AtomicBool::new(false),
                dispose_notify: Notify::new(),
                connect_attempts: AtomicUsize::new(0),
                can_reconnect: AtomicBool::new(true),
            })
        };
        let local = make(local_uri, &to_local, &to_remote);
        let remote = make(remote_uri, &to_remote, &to_local);
        (local, remote)
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn set_can_reconnect(&self, can: bool) {
        self.can_reconnect.store(can, Ordering::SeqCst);
    }

    /// Signals a clean EOF to whoever reads from the other end.
    pub(crate) fn close_remote(&self) {
        self.outbox.close();
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn uri(&self) -> &Url {
        &self.uri
    }

    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            ConnectBehavior::Immediate => {
                if self.is_disposed() {
                    Err(Error::Disposed)
                } else {
                    Ok(())
                }
            }
            ConnectBehavior::Fail => Err(Error::Io(io::ErrorKind::ConnectionRefused.into())),
            ConnectBehavior::Never => {
                let notified = self.dispose_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.is_disposed() {
                    notified.await;
                }
                Err(Error::Disposed)
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        self.outbox.push(buf);
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let data_notified = self.inbox.notify.notified();
            let dispose_notified = self.dispose_notify.notified();
            tokio::pin!(data_notified, dispose_notified);
            data_notified.as_mut().enable();
            dispose_notified.as_mut().enable();

            if self.is_disposed() {
                return Err(Error::Disposed);
            }
            {
                let mut inbox = self.inbox.buf.lock().unwrap();
                if !inbox.is_empty() {
                    let n = buf.len().min(inbox.len());
                    for (dst, byte) in buf.iter_mut().zip(inbox.drain(..n)) {
                        *dst = byte;
                    }
                    return Ok(n);
                }
                if self.inbox.closed.load(Ordering::SeqCst) {
                    return Ok(0);
                }
            }
            tokio::select! {
                _ = &mut data_notified => {}
                _ = &mut dispose_notified => {}
            }
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.dispose_notify.notify_waiters();
        // the other end sees a closed stream, like a TCP FIN
        self.outbox.close();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn can_reconnect(&self) -> bool {
        self.can_reconnect.load(Ordering::SeqCst)
    }
}

/// A factory serving pre-registered connections by URI.
#[derive(Default)]
pub(crate) struct FakeConnectionFactory {
    conns: Mutex<HashMap<Url, Arc<dyn Connection>>>,
}

impl FakeConnectionFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, conn: Arc<dyn Connection>) {
        self.conns
            .lock()
            .unwrap()
            .insert(conn.uri().clone(), conn);
    }
}

impl ConnectionFactory for FakeConnectionFactory {
    fn create(&self, uri: &Url) -> Option<Arc<dyn Connection>> {
        self.conns.lock().unwrap().get(uri).cloned()
    }
}

impl ConnectionFactory for Arc<FakeConnectionFactory> {
    fn create(&self, uri: &Url) -> Option<Arc<dyn Connection>> {
        ConnectionFactory::create(&**self, uri)
    }
}

/// A negotiator emulating a remote with a fixed allowed-mode set: the
/// strongest mode allowed by the local policy, the peer, and the remote wins.
pub(crate) struct TieredNegotiator {
    remote_allowed: EncryptionModes,
}

impl TieredNegotiator {
    pub(crate) fn new(remote_allowed: EncryptionModes) -> Self {
        Self { remote_allowed }
    }
}

#[async_trait]
impl Negotiator for TieredNegotiator {
    async fn check_outgoing(
        &self,
        conn: &dyn Connection,
        allowed: EncryptionModes,
        settings: EncryptionModes,
        _info_hash: &Sha1Hash,
        handshake: Handshake,
    ) -> Result<CipherPair> {
        let effective = allowed.intersection(settings).intersection(self.remote_allowed);
        let mode = [
            EncryptionModes::RC4_FULL,
            EncryptionModes::RC4_HEADER,
            EncryptionModes::PLAIN_TEXT,
        ]
        .iter()
        .copied()
        .find(|mode| effective.contains(*mode))
        .ok_or(Error::NegotiationFailed)?;

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf)?;
        conn.send(&buf).await?;

        Ok(CipherPair {
            encryptor: Box::new(PlainText),
            decryptor: Box::new(PlainText),
            mode,
        })
    }
}

/// A rate limiter that never delays but records every claim.
#[derive(Default)]
pub(crate) struct CountingLimiter {
    claims: Mutex<Vec<usize>>,
}

impl CountingLimiter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn claims(&self) -> Vec<usize> {
        self.claims.lock().unwrap().clone()
    }
}

impl RateLimiter for CountingLimiter {
    fn claim(&self, bytes: usize) -> BoxFuture<'_, ()> {
        self.claims.lock().unwrap().push(bytes);
        Box::pin(future::ready(()))
    }
}

/// A mode with scriptable answers that counts promoted peers.
pub(crate) struct ScriptedMode {
    accept_connections: AtomicBool,
    allow_dials: AtomicBool,
    veto_promotions: AtomicBool,
    peers_connected: AtomicUsize,
}

impl ScriptedMode {
    pub(crate) fn permissive() -> Self {
        Self {
            accept_connections: AtomicBool::new(true),
            allow_dials: AtomicBool::new(true),
            veto_promotions: AtomicBool::new(false),
            peers_connected: AtomicUsize::new(0),
        }
    }

    pub(crate) fn refusing_connections() -> Self {
        let mode = Self::permissive();
        mode.accept_connections.store(false, Ordering::SeqCst);
        mode
    }

    pub(crate) fn vetoing_promotions() -> Self {
        let mode = Self::permissive();
        mode.veto_promotions.store(true, Ordering::SeqCst);
        mode
    }

    pub(crate) fn peers_connected(&self) -> usize {
        self.peers_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_allow_dials(&self, allow: bool) {
        self.allow_dials.store(allow, Ordering::SeqCst);
    }
}

impl Mode for ScriptedMode {
    fn can_accept_connections(&self) -> bool {
        self.accept_connections.load(Ordering::SeqCst)
    }

    fn should_connect(&self, _peer: &Peer) -> bool {
        self.allow_dials.load(Ordering::SeqCst)
    }

    fn handle_peer_connected(&self, _session: &Arc<PeerSession>) -> std::result::Result<(), Error> {
        if self.veto_promotions.load(Ordering::SeqCst) {
            return Err(Error::ConnectionRejected);
        }
        self.peers_connected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Mode for Arc<ScriptedMode> {
    fn can_accept_connections(&self) -> bool {
        (**self).can_accept_connections()
    }

    fn should_connect(&self, peer: &Peer) -> bool {
        (**self).should_connect(peer)
    }

    fn handle_peer_connected(&self, session: &Arc<PeerSession>) -> std::result::Result<(), Error> {
        (**self).handle_peer_connected(session)
    }
}

/// A block source backed by a byte vector.
pub(crate) struct MemoryBlockSource {
    data: Vec<u8>,
}

impl MemoryBlockSource {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlockSource for MemoryBlockSource {
    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of torrent",
            ));
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }
}

/// A block source whose every read fails.
pub(crate) struct FailingBlockSource;

impl BlockSource for FailingBlockSource {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "storage gone"))
    }
}
