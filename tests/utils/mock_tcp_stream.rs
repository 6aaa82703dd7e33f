use std::io::{Read, Result, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use minnowdb::redis::replication::TcpStreamTrait;

/// In-memory stand-in for a TCP socket. `read_data` is what the fake peer
/// has sent us; `write_data` collects everything the handler wrote back.
/// Clones share the same buffers, mirroring `TcpStream::try_clone`.
#[derive(Clone)]
pub struct MockTcpStream {
    pub read_data: Arc<Mutex<Vec<u8>>>,
    pub write_data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    peer: SocketAddr,
}

#[allow(dead_code)]
impl MockTcpStream {
    pub fn new() -> Self {
        Self::with_peer("127.0.0.1:8080")
    }

    /// Pool entries are keyed by peer address, so tests that register more
    /// than one replica give each mock its own.
    pub fn with_peer(addr: &str) -> Self {
        MockTcpStream {
            read_data: Arc::new(Mutex::new(Vec::new())),
            write_data: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            peer: addr.parse().unwrap(),
        }
    }

    /// Queue bytes for the handler to read, as if the peer had sent them.
    pub fn feed(&self, bytes: &[u8]) {
        self.read_data.lock().unwrap().extend_from_slice(bytes);
    }

    pub fn get_written_data(&self) -> Vec<u8> {
        self.write_data.lock().unwrap().clone()
    }

    pub fn clear_written_data(&self) {
        self.write_data.lock().unwrap().clear();
    }

    /// Poll until `expected` shows up in the written bytes or the timeout
    /// elapses. Returns whether it was seen.
    pub fn wait_for_write(&self, expected: &str, timeout_ms: u64) -> bool {
        self.wait_for_write_bytes(expected.as_bytes(), timeout_ms)
    }

    pub fn wait_for_write_bytes(&self, expected: &[u8], timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let written = self.write_data.lock().unwrap();
                if written
                    .windows(expected.len().max(1))
                    .any(|w| w == expected)
                {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Simulate the peer closing its end: the next empty read reports EOF
    /// and the handler tears down.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Default for MockTcpStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for MockTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut data = self.read_data.lock().unwrap();
        if data.is_empty() {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "no data queued",
            ));
        }
        let n = std::cmp::min(buf.len(), data.len());
        buf[..n].copy_from_slice(&data[..n]);
        data.drain(..n);
        Ok(n)
    }
}

impl Write for MockTcpStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl TcpStreamTrait for MockTcpStream {
    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.peer)
    }

    fn try_clone(&self) -> Result<Box<dyn TcpStreamTrait>> {
        Ok(Box::new(self.clone()))
    }
}
