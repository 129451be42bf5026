//! The disk read task serving piece payloads for uploads.
//!
//! The task owns one [`BlockSource`] per registered torrent. Reads run on
//! the blocking thread pool so that slow storage never stalls the event
//! loop, and block data is staged in a task-local scratch buffer: the
//! caller's own buffer never crosses into the task, so it can be handed
//! back on every outcome. A read failure is reported to the requester
//! rather than killing the task; the disk task itself only terminates on
//! shutdown.

use std::{collections::HashMap, io, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    task,
};

use crate::{
    error::{Error, Result},
    TorrentId,
};

/// Reads blocks of a torrent from its backing storage.
pub trait BlockSource: Send + Sync + 'static {
    /// Fills `buf` with torrent data starting at the absolute byte `offset`
    /// within the torrent.
    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        source: Arc<dyn BlockSource>,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    ReadBlock {
        id: TorrentId,
        offset: u64,
        len: usize,
        tx: oneshot::Sender<Result<Vec<u8>>>,
    },
    Shutdown,
}

/// The entity serving block reads for all registered torrents.
pub struct Disk {
    sources: HashMap<TorrentId, Arc<dyn BlockSource>>,
    cmd_port: CommandReceiver,
}

impl Disk {
    pub fn new() -> (Self, DiskHandle) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                sources: HashMap::new(),
                cmd_port,
            },
            DiskHandle { chan: cmd_chan },
        )
    }

    /// Starts the disk event loop which is run until shutdown.
    pub async fn start(&mut self) {
        log::info!("Starting disk read event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent { id, source } => {
                    if self.sources.insert(id, source).is_some() {
                        log::warn!("Torrent {} block source replaced", id);
                    }
                }
                Command::RemoveTorrent { id } => {
                    self.sources.remove(&id);
                }
                Command::ReadBlock { id, offset, len, tx } => {
                    log::trace!("Reading {} bytes of torrent {} at {}", len, id, offset);
                    let source = match self.sources.get(&id) {
                        Some(source) => Arc::clone(source),
                        None => {
                            log::warn!("Torrent {} not found", id);
                            let _ = tx.send(Err(Error::InvalidTorrentId));
                            continue;
                        }
                    };
                    // storage access is potentially blocking; keep it off the
                    // event loop
                    task::spawn_blocking(move || {
                        let mut data = vec![0; len];
                        let res = source
                            .read(offset, &mut data)
                            .map(|()| data)
                            .map_err(Error::from);
                        if let Err(e) = &res {
                            log::warn!("Torrent {} read failure at {}: {}", id, offset, e);
                        }
                        let _ = tx.send(res);
                    });
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk read event loop");
                    break;
                }
            }
        }
    }
}

/// A cloneable handle through which sessions issue block reads.
#[derive(Clone)]
pub struct DiskHandle {
    chan: CommandSender,
}

impl DiskHandle {
    pub fn register_torrent(&self, id: TorrentId, source: Arc<dyn BlockSource>) {
        let _ = self.chan.send(Command::NewTorrent { id, source });
    }

    pub fn remove_torrent(&self, id: TorrentId) {
        let _ = self.chan.send(Command::RemoveTorrent { id });
    }

    /// Fills the first `len` bytes of `buf` with torrent data starting at the
    /// absolute `offset`. The block is staged in a disk-task scratch buffer;
    /// `buf` never leaves the caller and is handed back in every outcome, so
    /// it can always be returned to its pool.
    pub async fn read(
        &self,
        id: TorrentId,
        offset: u64,
        mut buf: Vec<u8>,
        len: usize,
    ) -> (Vec<u8>, Result<()>) {
        let (tx, rx) = oneshot::channel();
        if self
            .chan
            .send(Command::ReadBlock { id, offset, len, tx })
            .is_err()
        {
            return (buf, Err(Error::ChannelClosed));
        }
        match rx.await {
            Ok(Ok(data)) => {
                buf[..len].copy_from_slice(&data);
                (buf, Ok(()))
            }
            Ok(Err(e)) => (buf, Err(e)),
            Err(_) => (buf, Err(Error::ChannelClosed)),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.chan.send(Command::Shutdown);
    }
}

/// Creates the disk task, spawns its event loop, and returns its handle.
pub fn spawn() -> DiskHandle {
    let (mut disk, handle) = Disk::new();
    task::spawn(async move {
        disk.start().await;
    });
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryBlockSource;

    #[tokio::test]
    async fn test_read_block() {
        let handle = spawn();
        let data: Vec<u8> = (0..=255).collect();
        handle.register_torrent(0, Arc::new(MemoryBlockSource::new(data)));

        let buf = vec![0; 8];
        let (buf, res) = handle.read(0, 16, buf, 4).await;
        res.unwrap();
        assert_eq!(&buf[..4], &[16, 17, 18, 19]);
        // bytes past the requested length are untouched
        assert_eq!(&buf[4..], &[0; 4]);
    }

    #[tokio::test]
    async fn test_read_unknown_torrent_returns_buffer() {
        let handle = spawn();
        let (buf, res) = handle.read(42, 0, vec![0; 4], 4).await;
        assert_eq!(buf.len(), 4);
        assert!(matches!(res, Err(Error::InvalidTorrentId)));
    }

    #[tokio::test]
    async fn test_read_past_end_fails() {
        let handle = spawn();
        handle.register_torrent(0, Arc::new(MemoryBlockSource::new(vec![0; 8])));

        let (_buf, res) = handle.read(0, 6, vec![0; 4], 4).await;
        assert!(res.is_err());
    }
}
