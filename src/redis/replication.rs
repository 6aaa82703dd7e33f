use crossbeam_channel::{unbounded, Sender};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{Read, Result, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::redis::storage::now_ms;

/// GETACK probe sent verbatim to replicas that are behind.
pub const GETACK_FRAME: &[u8] = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";

/// Minimum time between GETACK probes to the same replica, so a busy WAIT
/// loop does not flood followers.
const ACK_WAIT_MS: u64 = 200;

/// Socket abstraction shared by the pool and the connection handlers.
/// `try_clone` hands out an independent handle over the same connection, so
/// removing a pool entry never closes the descriptor a handler still reads.
pub trait TcpStreamTrait: Read + Write + Send + 'static {
    fn peer_addr(&self) -> Result<SocketAddr>;
    fn try_clone(&self) -> Result<Box<dyn TcpStreamTrait>>;
}

impl TcpStreamTrait for std::net::TcpStream {
    fn peer_addr(&self) -> Result<SocketAddr> {
        self.peer_addr()
    }

    fn try_clone(&self) -> Result<Box<dyn TcpStreamTrait>> {
        Ok(Box::new(self.try_clone()?))
    }
}

struct ReplicaConnection {
    uid: String,
    stream: Box<dyn TcpStreamTrait>,
    last_ack_offset: u64,
    awaiting_ack_since_ms: Option<u64>,
}

/// Master-side registry of follower sockets. One lock guards the map; all
/// sends happen under it, which keeps the per-master FIFO order trivially.
pub struct ReplicaPool {
    pool: Mutex<HashMap<String, ReplicaConnection>>,
}

impl Default for ReplicaPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaPool {
    pub fn new() -> Self {
        ReplicaPool {
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, uid: &str, stream: Box<dyn TcpStreamTrait>) {
        info!("adding replica connection {} to pool", uid);
        let mut pool = self.pool.lock().unwrap();
        pool.insert(
            uid.to_string(),
            ReplicaConnection {
                uid: uid.to_string(),
                stream,
                last_ack_offset: 0,
                awaiting_ack_since_ms: None,
            },
        );
    }

    /// Remove and drop the pool's handle for `uid`. Returns whether an
    /// entry existed.
    pub fn remove(&self, uid: &str) -> bool {
        let removed = self.pool.lock().unwrap().remove(uid);
        if removed.is_some() {
            warn!("replica connection {} removed from pool", uid);
        }
        removed.is_some()
    }

    pub fn replica_count(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    /// Send `payload` to every replica. Entries whose socket fails are
    /// dropped from the pool. Returns the number of successful sends.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let mut pool = self.pool.lock().unwrap();
        let mut failed: Vec<String> = Vec::new();
        let mut success = 0;

        for conn in pool.values_mut() {
            match conn.stream.write_all(payload).and_then(|_| conn.stream.flush()) {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!("failed to send to replica {}: {}", conn.uid, e);
                    failed.push(conn.uid.clone());
                }
            }
        }
        for uid in failed {
            pool.remove(&uid);
        }
        success
    }

    /// Probe replicas whose acknowledged offset is behind `min_offset`.
    /// A replica already probed within the last 200 ms is skipped.
    pub fn request_acks(&self, min_offset: u64) {
        let now = now_ms();
        let mut pool = self.pool.lock().unwrap();
        for conn in pool.values_mut() {
            if conn.last_ack_offset >= min_offset {
                continue;
            }
            if let Some(since) = conn.awaiting_ack_since_ms {
                if now.saturating_sub(since) < ACK_WAIT_MS {
                    continue;
                }
            }
            match conn.stream.write_all(GETACK_FRAME) {
                Ok(()) => conn.awaiting_ack_since_ms = Some(now),
                Err(e) => warn!("GETACK failed for {}: {}", conn.uid, e),
            }
        }
    }

    /// Record an acknowledged offset reported by `REPLCONF ACK`.
    pub fn update_ack(&self, uid: &str, offset: u64) {
        let mut pool = self.pool.lock().unwrap();
        match pool.get_mut(uid) {
            Some(conn) => {
                debug!("replica {} acknowledged offset {}", uid, offset);
                conn.last_ack_offset = offset;
                conn.awaiting_ack_since_ms = None;
            }
            None => debug!("ACK from unknown replica {}", uid),
        }
    }

    pub fn acked_count(&self, min_offset: u64) -> usize {
        self.pool
            .lock()
            .unwrap()
            .values()
            .filter(|conn| conn.last_ack_offset >= min_offset)
            .count()
    }

    /// Spawn the writer thread that drains propagation payloads onto the
    /// replica sockets. Command execution pushes into the channel and never
    /// blocks on a follower's socket; the single consumer preserves the
    /// master's apply order.
    pub fn start_propagation_worker(pool: Arc<ReplicaPool>) -> Sender<Vec<u8>> {
        let (tx, rx) = unbounded::<Vec<u8>>();
        thread::spawn(move || {
            while let Ok(payload) = rx.recv() {
                let sent = pool.broadcast(&payload);
                debug!("propagated {} bytes to {} replicas", payload.len(), sent);
            }
        });
        tx
    }
}
