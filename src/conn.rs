//! The connection abstraction the pipelines and sessions operate on.
//!
//! A [`Connection`] is a bidirectional byte transport to a remote peer.
//! Disposing a connection is the universal cancellation primitive: it makes
//! every blocked and future operation on the handle fail with
//! [`Error::Disposed`](crate::error::Error::Disposed) at its next suspension
//! point. There is no preemption; cancellation is observed cooperatively.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{Mutex, Notify},
};
use url::Url;

use crate::error::{Error, Result};

/// A bidirectional transport to a remote peer.
///
/// Send and receive may be driven concurrently by different tasks (the send
/// pump and the receive loop); implementations must support that.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The URI this connection was created for.
    fn uri(&self) -> &Url;

    /// Establishes the transport. Must be called once, before any transfer.
    async fn connect(&self) -> Result<()>;

    /// Sends the whole buffer.
    async fn send(&self, buf: &[u8]) -> Result<()>;

    /// Receives at most `buf.len()` bytes and returns the number of bytes
    /// read. `Ok(0)` signals a clean remote close.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Tears the connection down, failing every pending and future operation.
    /// Disposal is sticky and idempotent.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// Whether the peer may be re-dialed after this handle is torn down.
    /// Transports without a reconnectable address (e.g. accepted-only
    /// incoming streams) return false.
    fn can_reconnect(&self) -> bool {
        true
    }
}

/// Creates connection handles from peer URIs.
pub trait ConnectionFactory: Send + Sync {
    /// Returns `None` if the URI's scheme is not supported by this factory.
    fn create(&self, uri: &Url) -> Option<Arc<dyn Connection>>;
}

/// A plain TCP connection for `tcp://ip:port` URIs.
pub struct TcpConnection {
    uri: Url,
    addr: SocketAddr,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    disposed: AtomicBool,
    dispose_notify: Notify,
}

impl TcpConnection {
    /// Returns `None` if the URI does not contain an IP literal and a port.
    pub fn new(uri: Url) -> Option<Self> {
        let addr = match (uri.host(), uri.port()) {
            (Some(url::Host::Ipv4(ip)), Some(port)) => SocketAddr::new(ip.into(), port),
            (Some(url::Host::Ipv6(ip)), Some(port)) => SocketAddr::new(ip.into(), port),
            _ => return None,
        };
        Some(Self {
            uri,
            addr,
            read_half: Mutex::new(None),
            write_half: Mutex::new(None),
            disposed: AtomicBool::new(false),
            dispose_notify: Notify::new(),
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn uri(&self) -> &Url {
        &self.uri
    }

    async fn connect(&self) -> Result<()> {
        let notified = self.dispose_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        tokio::select! {
            _ = &mut notified => Err(Error::Disposed),
            res = TcpStream::connect(self.addr) => {
                let stream = res?;
                if self.is_disposed() {
                    return Err(Error::Disposed);
                }
                let (read, write) = stream.into_split();
                *self.read_half.lock().await = Some(read);
                *self.write_half.lock().await = Some(write);
                Ok(())
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<()> {
        let notified = self.dispose_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        tokio::select! {
            _ = &mut notified => Err(Error::Disposed),
            res = async {
                let mut guard = self.write_half.lock().await;
                let stream = guard.as_mut().ok_or(Error::Disposed)?;
                stream.write_all(buf).await?;
                Ok(())
            } => res,
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let notified = self.dispose_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        tokio::select! {
            _ = &mut notified => Err(Error::Disposed),
            res = async {
                let mut guard = self.read_half.lock().await;
                let stream = guard.as_mut().ok_or(Error::Disposed)?;
                let n = stream.read(buf).await?;
                Ok(n)
            } => res,
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.dispose_notify.notify_waiters();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// The default factory: TCP only.
pub struct TcpConnectionFactory;

impl ConnectionFactory for TcpConnectionFactory {
    fn create(&self, uri: &Url) -> Option<Arc<dyn Connection>> {
        if uri.scheme() != "tcp" {
            return None;
        }
        TcpConnection::new(uri.clone()).map(|conn| Arc::new(conn) as Arc<dyn Connection>)
    }
}
