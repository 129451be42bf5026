//! A process-wide pool of piece payload buffers.
//!
//! Piece messages carry block-sized payloads that are allocated and released
//! at a high rate while uploading. The pool recycles these allocations.
//! Ownership of a borrowed buffer passes pool -> message -> network, and on
//! every exit path the buffer must be returned exactly once.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

/// The maximum number of free buffers kept for reuse; buffers returned beyond
/// this are simply dropped.
const MAX_FREE_BUFFERS: usize = 128;

#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows a zeroed buffer of exactly `len` bytes from the pool.
    pub fn get_buffer(&self, len: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let recycled = {
            let mut free = self.free.lock().unwrap();
            let pos = free.iter().position(|buf| buf.capacity() >= len);
            pos.map(|pos| free.swap_remove(pos))
        };
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0; len],
        }
    }

    /// Returns a borrowed buffer to the pool.
    pub fn free_buffer(&self, mut buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_FREE_BUFFERS {
            buf.clear();
            free.push(buf);
        }
    }

    /// The number of buffers currently borrowed and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
