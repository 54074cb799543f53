//! Chunked framing for MTU-limited channels (BLE characteristics)
//!
//! A logical message is carried as a run of fixed-size chunks:
//! ```text
//! [ 250 bytes ][ 250 bytes ] ... [ < 250 bytes ]
//! ```
//!
//! A chunk of exactly [`CHUNK_SIZE`] bytes means "more data coming". Any
//! shorter chunk terminates the message, so a message whose length is an
//! exact multiple of the chunk size (including the empty message) is
//! followed by a zero-length chunk.
//!
//! Reassembly is best-effort: a stream that loses its terminator never
//! completes and is dropped once it goes stale. Nothing here reports errors.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::timing;

/// Maximum payload carried by one transport frame
pub const CHUNK_SIZE: usize = 250;

/// Number of frames [`encode`] produces for a message of `len` bytes
pub fn chunk_count(len: usize) -> usize {
    len / CHUNK_SIZE + 1
}

/// Split a message into transport frames, in send order
pub fn encode(message: &[u8]) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(chunk_count(message.len()));
    let mut full = message.chunks_exact(CHUNK_SIZE);

    for chunk in &mut full {
        chunks.push(Bytes::copy_from_slice(chunk));
    }

    // The remainder is always shorter than CHUNK_SIZE (possibly empty)
    chunks.push(Bytes::copy_from_slice(full.remainder()));

    chunks
}

/// Accumulated fragments for one channel
#[derive(Debug)]
struct ReassemblyBuffer {
    data: BytesMut,
    last_fragment: Instant,
}

impl ReassemblyBuffer {
    fn new(now: Instant) -> Self {
        Self {
            data: BytesMut::with_capacity(CHUNK_SIZE * 4),
            last_fragment: now,
        }
    }

    fn is_stale(&self, now: Instant, staleness: Duration) -> bool {
        now.saturating_duration_since(self.last_fragment) > staleness
    }
}

/// Per-channel reassembly of chunked messages
///
/// Channels are independent: fragments pushed for one key never touch the
/// buffer of another.
#[derive(Debug)]
pub struct Reassembler<K> {
    buffers: HashMap<K, ReassemblyBuffer>,
    staleness: Duration,
}

impl<K: Eq + Hash + Clone> Reassembler<K> {
    /// Create a reassembler with the default staleness window
    pub fn new() -> Self {
        Self::with_staleness(Duration::from_millis(timing::FRAGMENT_STALENESS_MS))
    }

    /// Create a reassembler that discards buffers idle longer than `staleness`
    pub fn with_staleness(staleness: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            staleness,
        }
    }

    /// Feed one received frame, returning the message it completes (if any)
    pub fn push(&mut self, channel: &K, fragment: &[u8]) -> Option<Bytes> {
        self.push_at(channel, fragment, Instant::now())
    }

    /// Same as [`push`](Self::push) with an explicit receive time
    pub fn push_at(&mut self, channel: &K, fragment: &[u8], now: Instant) -> Option<Bytes> {
        if fragment.len() == CHUNK_SIZE {
            let staleness = self.staleness;
            let buffer = self
                .buffers
                .entry(channel.clone())
                .or_insert_with(|| ReassemblyBuffer::new(now));

            if buffer.is_stale(now, staleness) {
                buffer.data.clear();
            }
            buffer.data.extend_from_slice(fragment);
            buffer.last_fragment = now;
            return None;
        }

        // Terminator: deliver whatever is buffered plus this fragment
        let message = match self.buffers.remove(channel) {
            Some(mut buffer) if !buffer.is_stale(now, self.staleness) => {
                buffer.data.extend_from_slice(fragment);
                buffer.data.freeze()
            }
            _ => Bytes::copy_from_slice(fragment),
        };

        Some(message)
    }

    /// Bytes currently buffered for a channel
    pub fn pending_len(&self, channel: &K) -> usize {
        self.buffers.get(channel).map_or(0, |b| b.data.len())
    }

    /// Drop every buffer that has gone stale, returning how many were dropped
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let staleness = self.staleness;
        let before = self.buffers.len();
        self.buffers.retain(|_, buffer| !buffer.is_stale(now, staleness));
        before - self.buffers.len()
    }
}

impl<K: Eq + Hash + Clone> Default for Reassembler<K> {
    fn default() -> Self {
        Self::new()
    }
}
