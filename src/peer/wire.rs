//! Framed message transfer over a connection and its negotiated ciphers.
//!
//! All transfers happen in small chunks so that rate limiting stays
//! fine-grained, and every chunk is recorded on both the session's and the
//! torrent's monitor. Piece payloads are spliced directly in and out of the
//! shared buffer pool here, which keeps buffer ownership (pool -> message ->
//! network) in one place.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::codec::{
    Handshake, HandshakeCodec, Message, MessageId, PeerCodec, HANDSHAKE_LEN, MAX_FRAME_LEN,
};
use crate::{
    conn::Connection,
    counter::ConnectionMonitor,
    encryption::StreamCipher,
    error::{Error, Result},
    pool::BufferPool,
    torrent::RateLimiter,
};

/// The transfer chunk size. Chosen small enough that rate limiting can be
/// enforced at a fine granularity.
pub(crate) const CHUNK_LEN: usize = 2096 + 64;

/// Receives exactly `buf.len()` bytes in chunks, claiming each chunk from the
/// limiter and recording it on the monitors.
async fn recv_chunked(
    conn: &dyn Connection,
    buf: &mut [u8],
    limiter: Option<&dyn RateLimiter>,
    monitors: Option<(&ConnectionMonitor, &ConnectionMonitor)>,
) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let chunk_len = (buf.len() - pos).min(CHUNK_LEN);
        if let Some(limiter) = limiter {
            limiter.claim(chunk_len).await;
        }
        let count = conn.recv(&mut buf[pos..pos + chunk_len]).await?;
        if count == 0 {
            return Err(Error::ConnectionClosed);
        }
        if let Some((peer_monitor, torrent_monitor)) = monitors {
            peer_monitor.record_download(count);
            torrent_monitor.record_download(count);
        }
        pos += count;
    }
    Ok(())
}

/// Receives the remote handshake. Handshakes are not rate limited and do not
/// count towards transfer statistics.
pub(crate) async fn receive_handshake(
    conn: &dyn Connection,
    decryptor: &mut dyn StreamCipher,
) -> Result<Handshake> {
    let mut buf = vec![0; HANDSHAKE_LEN];
    recv_chunked(conn, &mut buf, None, None).await?;
    decryptor.apply(&mut buf);
    let mut bytes = BytesMut::from(&buf[..]);
    HandshakeCodec.decode(&mut bytes)?.ok_or(Error::InvalidMessage)
}

/// Receives one framed message. Piece payloads are read into a buffer
/// borrowed from `pool`; the caller owns its return.
pub(crate) async fn receive_message(
    conn: &dyn Connection,
    decryptor: &mut dyn StreamCipher,
    limiter: &dyn RateLimiter,
    peer_monitor: &ConnectionMonitor,
    torrent_monitor: &ConnectionMonitor,
    pool: &BufferPool,
) -> Result<Message> {
    let monitors = Some((peer_monitor, torrent_monitor));

    let mut header = [0; 4];
    recv_chunked(conn, &mut header, Some(limiter), monitors).await?;
    decryptor.apply(&mut header);
    let frame_len = u32::from_be_bytes(header) as usize;
    if frame_len == 0 {
        return Ok(Message::KeepAlive);
    }
    if frame_len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge);
    }

    let mut id = [0; 1];
    recv_chunked(conn, &mut id, Some(limiter), monitors).await?;
    decryptor.apply(&mut id);
    let payload_len = frame_len - 1;

    if id[0] == MessageId::Piece as u8 {
        if payload_len < 8 {
            return Err(Error::InvalidMessage);
        }
        let mut prefix = [0; 8];
        recv_chunked(conn, &mut prefix, Some(limiter), monitors).await?;
        decryptor.apply(&mut prefix);
        let mut prefix = &prefix[..];
        let piece_index = prefix.get_u32() as usize;
        let offset = prefix.get_u32();

        let data_len = payload_len - 8;
        let mut data = pool.get_buffer(data_len);
        if let Err(e) = recv_chunked(conn, &mut data, Some(limiter), monitors).await {
            pool.free_buffer(data);
            return Err(e);
        }
        decryptor.apply(&mut data);
        Ok(Message::Piece {
            piece_index,
            offset,
            len: data_len as u32,
            data,
        })
    } else {
        let mut payload = vec![0; payload_len];
        recv_chunked(conn, &mut payload, Some(limiter), monitors).await?;
        decryptor.apply(&mut payload);

        let mut frame = BytesMut::with_capacity(4 + frame_len);
        frame.put_u32(frame_len as u32);
        frame.put_slice(&id);
        frame.put_slice(&payload);
        PeerCodec.decode(&mut frame)?.ok_or(Error::InvalidMessage)
    }
}

/// Sends one framed message through the encryptor, in rate limited chunks.
pub(crate) async fn send_message(
    conn: &dyn Connection,
    encryptor: &mut dyn StreamCipher,
    msg: &Message,
    limiter: &dyn RateLimiter,
    peer_monitor: &ConnectionMonitor,
    torrent_monitor: &ConnectionMonitor,
) -> Result<()> {
    let mut buf = BytesMut::new();
    PeerCodec.encode(msg, &mut buf)?;
    encryptor.apply(&mut buf);

    for chunk in buf.chunks(CHUNK_LEN) {
        limiter.claim(chunk.len()).await;
        conn.send(chunk).await?;
        peer_monitor.record_upload(chunk.len());
        torrent_monitor.record_upload(chunk.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encryption::PlainText,
        test_utils::{CountingLimiter, FakeConnection},
        BlockInfo, BLOCK_LEN,
    };

    #[tokio::test]
    async fn test_message_transfer_records_monitors() {
        let (local, remote) = FakeConnection::pair();
        let limiter = CountingLimiter::new();
        let peer_monitor = ConnectionMonitor::new();
        let torrent_monitor = ConnectionMonitor::new();
        let pool = BufferPool::new();

        let msg = Message::Request(BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        });
        send_message(
            &*local,
            &mut PlainText,
            &msg,
            &limiter,
            &peer_monitor,
            &torrent_monitor,
        )
        .await
        .unwrap();
        assert_eq!(peer_monitor.upload.total(), 17);
        assert_eq!(torrent_monitor.upload.total(), 17);

        let received = receive_message(
            &*remote,
            &mut PlainText,
            &limiter,
            &peer_monitor,
            &torrent_monitor,
            &pool,
        )
        .await
        .unwrap();
        assert_eq!(received, msg);
        assert_eq!(peer_monitor.download.total(), 17);
    }

    #[tokio::test]
    async fn test_piece_payload_is_pool_backed() {
        let (local, remote) = FakeConnection::pair();
        let limiter = CountingLimiter::new();
        let peer_monitor = ConnectionMonitor::new();
        let torrent_monitor = ConnectionMonitor::new();
        let pool = BufferPool::new();

        let msg = Message::Piece {
            piece_index: 1,
            offset: 0,
            len: 6,
            data: b"abcdef".to_vec(),
        };
        send_message(
            &*local,
            &mut PlainText,
            &msg,
            &limiter,
            &peer_monitor,
            &torrent_monitor,
        )
        .await
        .unwrap();

        let received = receive_message(
            &*remote,
            &mut PlainText,
            &limiter,
            &peer_monitor,
            &torrent_monitor,
            &pool,
        )
        .await
        .unwrap();
        assert_eq!(pool.outstanding(), 1);
        match received {
            Message::Piece { data, .. } => {
                assert_eq!(data, b"abcdef");
                pool.free_buffer(data);
            }
            other => panic!("expected piece, got {:?}", other),
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_large_transfer_is_chunked_for_the_limiter() {
        let (local, remote) = FakeConnection::pair();
        let limiter = CountingLimiter::new();
        let peer_monitor = ConnectionMonitor::new();
        let torrent_monitor = ConnectionMonitor::new();
        let pool = BufferPool::new();

        let msg = Message::Piece {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
            data: vec![0xfe; BLOCK_LEN as usize],
        };
        let send = {
            let local = local.clone();
            let limiter = CountingLimiter::new();
            tokio::spawn(async move {
                let peer_monitor = ConnectionMonitor::new();
                let torrent_monitor = ConnectionMonitor::new();
                send_message(
                    &*local,
                    &mut PlainText,
                    &msg,
                    &limiter,
                    &peer_monitor,
                    &torrent_monitor,
                )
                .await
            })
        };

        let received = receive_message(
            &*remote,
            &mut PlainText,
            &limiter,
            &peer_monitor,
            &torrent_monitor,
            &pool,
        )
        .await
        .unwrap();
        send.await.unwrap().unwrap();

        // a block sized payload must be claimed in multiple chunks, each no
        // larger than the chunk length
        let claims = limiter.claims();
        assert!(claims.len() > 1);
        assert!(claims.iter().all(|&c| c <= CHUNK_LEN));
        assert_eq!(
            claims.iter().sum::<usize>(),
            4 + 9 + BLOCK_LEN as usize // header + piece prefix + payload
        );

        match received {
            Message::Piece { data, .. } => pool.free_buffer(data),
            other => panic!("expected piece, got {:?}", other),
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_receive_fails_on_remote_close() {
        let (local, remote) = FakeConnection::pair();
        let limiter = CountingLimiter::new();
        let peer_monitor = ConnectionMonitor::new();
        let torrent_monitor = ConnectionMonitor::new();
        let pool = BufferPool::new();

        local.close_remote();
        let res = receive_message(
            &*remote,
            &mut PlainText,
            &limiter,
            &peer_monitor,
            &torrent_monitor,
            &pool,
        )
        .await;
        assert!(matches!(res, Err(Error::ConnectionClosed)));
    }
}
