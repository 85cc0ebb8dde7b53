//! Per-socket state: lifecycle state machine, the splice-and-slide read
//! buffer frames are extracted from, the cursor registry, and counters.

use crate::bson::Document;
use crate::error::{Error, Result};
use crate::protocol::HEADER_LEN;
use bytes::{Buf, BytesMut};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Authenticated,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    /// Sends are rejected once the connection starts closing.
    pub fn can_send(self) -> bool {
        !matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// Counters shared with the server registry; they outlive the socket so
/// stats remain readable after close.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub frames_received: AtomicU64,
    pub replies_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub documents_inserted: AtomicU64,
    pub documents_updated: AtomicU64,
    pub documents_deleted: AtomicU64,
    pub documents_returned: AtomicU64,
    /// `n` of the most recent write, echoed by getLastError.
    pub last_write_n: AtomicI64,
}

impl ConnectionStats {
    pub fn record_write(&self, n: i64) {
        self.last_write_n.store(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub namespace: String,
    pub query: Document,
    /// Read options the cursor was opened with (limit, skip, tailable, …).
    pub options: Document,
    pub position: i64,
    pub closed_at: Option<Instant>,
}

pub struct Connection {
    pub id: u64,
    pub peer_addr: SocketAddr,
    state: ConnectionState,
    buffer: BytesMut,
    next_request_id: i32,
    cursors: HashMap<i64, CursorEntry>,
    pub stats: Arc<ConnectionStats>,
}

impl Connection {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            state: ConnectionState::Connecting,
            buffer: BytesMut::with_capacity(8 * 1024),
            next_request_id: 0,
            cursors: HashMap::new(),
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, next: ConnectionState) {
        if self.state == ConnectionState::Closed {
            return;
        }
        tracing::trace!(conn = self.id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }

    /// Fatal path: error → closing → closed.
    pub fn fail(&mut self) {
        self.set_state(ConnectionState::Error);
        self.set_state(ConnectionState::Closing);
        self.set_state(ConnectionState::Closed);
    }

    /// Reply ids increment per connection, starting at 1.
    pub fn next_request_id(&mut self) -> i32 {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.stats
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Copy of up to `n` buffered bytes, for error replies that need the
    /// offending frame's header.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        self.buffer[..n.min(self.buffer.len())].to_vec()
    }

    /// A frame the peer left incomplete at close: the declared total length
    /// (or the header size, when not even the length field arrived) against
    /// the bytes actually buffered. `None` when the buffer is empty.
    pub fn truncation_error(&self) -> Option<Error> {
        if self.buffer.is_empty() {
            return None;
        }
        let needed = if self.buffer.len() >= 4 {
            let declared = i32::from_le_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]);
            declared.max(HEADER_LEN as i32) as usize
        } else {
            HEADER_LEN
        };
        Some(Error::Truncated {
            needed,
            available: self.buffer.len(),
        })
    }

    /// Splice one complete frame off the front of the buffer, or report that
    /// more bytes are needed. A declared length below the header size or
    /// above `max_len` is unrecoverable.
    pub fn next_frame(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let declared =
            i32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
        if (declared as usize) < HEADER_LEN || declared as usize > max_len {
            return Err(Error::Protocol(format!(
                "invalid message length {declared}"
            )));
        }
        let declared = declared as usize;
        if self.buffer.len() < declared {
            return Ok(None);
        }
        let frame = self.buffer.split_to(declared);
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        Ok(Some(frame.chunk().to_vec()))
    }

    /// Cursor ids are time-derived with per-millisecond jitter.
    pub fn register_cursor(&mut self, entry: CursorEntry) -> i64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let mut id = now_ms * 1000 + rand::thread_rng().gen_range(0..1000);
        while self.cursors.contains_key(&id) {
            id += 1;
        }
        self.cursors.insert(id, entry);
        id
    }

    pub fn cursor(&self, id: i64) -> Option<&CursorEntry> {
        self.cursors.get(&id)
    }

    /// Mark the given cursors closed and drop them; returns how many existed.
    pub fn kill_cursors(&mut self, ids: &[i64]) -> usize {
        let mut killed = 0;
        for id in ids {
            if let Some(mut entry) = self.cursors.remove(id) {
                entry.closed_at = Some(Instant::now());
                killed += 1;
            }
        }
        killed
    }

    pub fn clear_cursors(&mut self) {
        self.cursors.clear();
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Document;
    use crate::protocol::{self, MessageHeader, Request};
    use crate::doc;

    fn test_conn() -> Connection {
        Connection::new(1, "127.0.0.1:1".parse().unwrap())
    }

    #[test]
    fn byte_at_a_time_equals_whole_frame() {
        let frame = protocol::encode_op_msg(&doc! { "ping": 1 }, 0, 9).unwrap();

        let mut whole = test_conn();
        whole.extend(&frame);
        let from_whole = whole.next_frame(48_000_000).unwrap().unwrap();

        let mut dribble = test_conn();
        for b in &frame[..frame.len() - 1] {
            dribble.extend(std::slice::from_ref(b));
            assert!(dribble.next_frame(48_000_000).unwrap().is_none());
        }
        dribble.extend(std::slice::from_ref(frame.last().unwrap()));
        let from_dribble = dribble.next_frame(48_000_000).unwrap().unwrap();

        assert_eq!(from_whole, from_dribble);
        let (header, _) = MessageHeader::parse(&from_dribble).unwrap();
        let parsed = protocol::parse_request(header.op_code, &from_dribble[16..]).unwrap();
        assert!(matches!(parsed, Request::Msg(_)));
    }

    #[test]
    fn two_frames_in_one_read_are_both_extracted() {
        let a = protocol::encode_op_msg(&doc! { "ping": 1 }, 0, 1).unwrap();
        let b = protocol::encode_op_msg(&doc! { "ping": 2 }, 0, 2).unwrap();
        let mut conn = test_conn();
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        conn.extend(&joined);
        assert_eq!(conn.next_frame(48_000_000).unwrap().unwrap(), a);
        assert_eq!(conn.next_frame(48_000_000).unwrap().unwrap(), b);
        assert!(conn.next_frame(48_000_000).unwrap().is_none());
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn oversize_and_undersize_lengths_are_fatal() {
        let mut conn = test_conn();
        conn.extend(&48_000_001i32.to_le_bytes());
        assert!(conn.next_frame(48_000_000).is_err());

        let mut conn = test_conn();
        conn.extend(&8i32.to_le_bytes());
        assert!(conn.next_frame(48_000_000).is_err());
    }

    #[test]
    fn state_machine_send_gate() {
        let mut conn = test_conn();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.set_state(ConnectionState::Connected);
        assert!(conn.state().can_send());
        conn.fail();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.state().can_send());
        // Closed is terminal.
        conn.set_state(ConnectionState::Connected);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_mid_frame_raises_truncated() {
        let mut conn = test_conn();
        assert!(conn.truncation_error().is_none());

        let frame = protocol::encode_op_msg(&doc! { "ping": 1 }, 0, 1).unwrap();
        conn.extend(&frame[..frame.len() - 3]);
        assert!(conn.next_frame(48_000_000).unwrap().is_none());
        match conn.truncation_error() {
            Some(Error::Truncated { needed, available }) => {
                assert_eq!(needed, frame.len());
                assert_eq!(available, frame.len() - 3);
            }
            other => panic!("expected truncated, got {other:?}"),
        }

        // Fewer than four bytes buffered: the header itself is the need.
        let mut conn = test_conn();
        conn.extend(&frame[..2]);
        match conn.truncation_error() {
            Some(Error::Truncated { needed, available }) => {
                assert_eq!(needed, HEADER_LEN);
                assert_eq!(available, 2);
            }
            other => panic!("expected truncated, got {other:?}"),
        }
    }

    #[test]
    fn cursor_registry_kill_and_clear() {
        let mut conn = test_conn();
        let entry = CursorEntry {
            namespace: "d.t".into(),
            query: Document::new(),
            options: doc! { "limit": 10i64 },
            position: 0,
            closed_at: None,
        };
        let a = conn.register_cursor(entry.clone());
        let b = conn.register_cursor(entry);
        assert_ne!(a, b);
        assert_eq!(conn.cursor_count(), 2);
        assert_eq!(conn.kill_cursors(&[a, 12345]), 1);
        assert_eq!(conn.cursor_count(), 1);
        conn.clear_cursors();
        assert!(conn.cursor(b).is_none());
    }
}
