//! Bookkeeping of in-flight block requests, per peer session.
//!
//! Piece selection itself lives elsewhere; the connection manager only needs
//! to know which requests a session has outstanding so that they can be
//! cancelled when the session is torn down.

use std::{collections::HashMap, sync::Mutex};

use crate::BlockInfo;

#[derive(Debug, Default)]
pub struct PiecePicker {
    /// Outstanding block requests, keyed by the requesting session's id.
    requests: Mutex<HashMap<u64, Vec<BlockInfo>>>,
}

impl PiecePicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a block request made through the given session.
    pub fn register_request(&self, session: u64, block: BlockInfo) {
        self.requests
            .lock()
            .unwrap()
            .entry(session)
            .or_default()
            .push(block);
    }

    /// Cancels all requests registered for the session and returns how many
    /// were dropped.
    pub fn cancel_requests(&self, session: u64) -> usize {
        self.requests
            .lock()
            .unwrap()
            .remove(&session)
            .map(|blocks| blocks.len())
            .unwrap_or(0)
    }

    /// The number of outstanding requests for the session.
    pub fn request_count(&self, session: u64) -> usize {
        self.requests
            .lock()
            .unwrap()
            .get(&session)
            .map(|blocks| blocks.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn block(piece_index: usize, offset: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len: BLOCK_LEN,
        }
    }

    #[test]
    fn test_cancel_drops_only_the_sessions_requests() {
        let picker = PiecePicker::new();
        picker.register_request(1, block(0, 0));
        picker.register_request(1, block(0, BLOCK_LEN));
        picker.register_request(2, block(3, 0));

        assert_eq!(picker.cancel_requests(1), 2);
        assert_eq!(picker.request_count(1), 0);
        assert_eq!(picker.request_count(2), 1);

        // cancelling again is a no-op
        assert_eq!(picker.cancel_requests(1), 0);
    }
}
