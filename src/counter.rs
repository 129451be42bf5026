//! Byte accounting for peer connections and torrents.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing byte counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Transfer statistics of a single connection or of a whole torrent.
///
/// The wire layer records every chunk it moves on both the session's monitor
/// and the owning torrent's monitor.
#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    pub download: Counter,
    pub upload: Counter,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: usize) {
        self.download.add(bytes as u64);
    }

    pub fn record_upload(&self, bytes: usize) {
        self.upload.add(bytes as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_accumulates_both_directions() {
        let monitor = ConnectionMonitor::new();
        monitor.record_download(100);
        monitor.record_download(50);
        monitor.record_upload(8);
        assert_eq!(monitor.download.total(), 150);
        assert_eq!(monitor.upload.total(), 8);
    }
}
