use log::info;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use thiserror::Error;

use crate::client_handler::ClientHandler;
use crate::redis::commands::RedisCommand;
use crate::redis::core::Redis;
use crate::redis::rdb::RdbManager;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything the handshake leaves behind: the still-open socket, the
/// master's starting offset, its RDB snapshot, and any bytes that arrived
/// past the snapshot and belong to the replication stream.
pub struct HandshakeOutcome {
    pub stream: TcpStream,
    pub master_offset: u64,
    pub snapshot: Vec<u8>,
    pub residual: Vec<u8>,
}

/// Client side of the PING / REPLCONF / PSYNC handshake a follower runs
/// against its master at startup.
pub struct ReplicaHandshake {
    stream: TcpStream,
    listening_port: u16,
    buf: Vec<u8>,
}

impl ReplicaHandshake {
    pub fn connect(host: &str, port: u16, listening_port: u16) -> Result<Self, ReplicationError> {
        let stream = TcpStream::connect((host, port))?;
        Ok(ReplicaHandshake {
            stream,
            listening_port,
            buf: Vec::new(),
        })
    }

    pub fn run(mut self) -> Result<HandshakeOutcome, ReplicationError> {
        self.send_and_expect(&RedisCommand::Ping { msg: None }, b"+PONG\r\n")?;
        self.send_and_expect(
            &RedisCommand::ReplconfListeningPort {
                port: self.listening_port,
            },
            b"+OK\r\n",
        )?;
        self.send_and_expect(
            &RedisCommand::ReplconfCapa {
                capa: "psync2".to_string(),
            },
            b"+OK\r\n",
        )?;

        let psync = RedisCommand::Psync {
            replid: "?".to_string(),
            offset: -1,
        };
        self.stream.write_all(&psync.to_bytes())?;
        let line = self.read_line()?;
        let (_replid, master_offset) = parse_fullresync(&line)?;

        // `$<len>\r\n` then exactly len raw bytes, no trailing CRLF
        let length_line = self.read_line()?;
        if !length_line.starts_with(b"$") {
            return Err(ReplicationError::HandshakeFailed(format!(
                "expected RDB length line, got {:?}",
                String::from_utf8_lossy(&length_line)
            )));
        }
        let length = std::str::from_utf8(&length_line[1..])
            .ok()
            .and_then(|len| len.trim_end().parse::<usize>().ok())
            .ok_or_else(|| {
                ReplicationError::HandshakeFailed("unparseable RDB length".to_string())
            })?;
        let snapshot = self.read_exact_buffered(length)?;

        info!(
            "handshake complete: master offset {}, snapshot {} bytes",
            master_offset,
            snapshot.len()
        );
        Ok(HandshakeOutcome {
            stream: self.stream,
            master_offset,
            snapshot,
            residual: self.buf,
        })
    }

    fn send_and_expect(
        &mut self,
        command: &RedisCommand,
        expected: &[u8],
    ) -> Result<(), ReplicationError> {
        self.stream.write_all(&command.to_bytes())?;
        let line = self.read_line()?;
        if line != expected {
            return Err(ReplicationError::HandshakeFailed(format!(
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&line)
            )));
        }
        Ok(())
    }

    /// Read one CRLF-terminated line (terminator included), buffering any
    /// bytes that arrive after it.
    fn read_line(&mut self) -> Result<Vec<u8>, ReplicationError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let rest = self.buf.split_off(pos + 2);
                let line = std::mem::replace(&mut self.buf, rest);
                return Ok(line);
            }
            self.fill_buf()?;
        }
    }

    fn read_exact_buffered(&mut self, length: usize) -> Result<Vec<u8>, ReplicationError> {
        while self.buf.len() < length {
            self.fill_buf()?;
        }
        let rest = self.buf.split_off(length);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    fn fill_buf(&mut self) -> Result<(), ReplicationError> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(ReplicationError::HandshakeFailed(
                "connection closed unexpectedly".to_string(),
            ));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

fn parse_fullresync(line: &[u8]) -> Result<(String, u64), ReplicationError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ReplicationError::HandshakeFailed("non-utf8 FULLRESYNC line".to_string()))?
        .trim_end();
    let mut parts = text.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("+FULLRESYNC"), Some(replid), Some(offset)) => {
            let offset = offset.parse::<u64>().map_err(|_| {
                ReplicationError::HandshakeFailed(format!("bad FULLRESYNC offset '{}'", offset))
            })?;
            Ok((replid.to_string(), offset))
        }
        _ => Err(ReplicationError::HandshakeFailed(format!(
            "expected FULLRESYNC, got '{}'",
            text
        ))),
    }
}

/// Connect to the configured master, run the handshake, restore the
/// snapshot, and hand the socket to a standard handler marked as the
/// master link. On failure the server keeps running with an empty store.
pub fn init_replica(redis: Arc<Redis>) -> Result<(), ReplicationError> {
    let (host, port) = match redis.config.replicaof.clone() {
        Some(target) => target,
        None => return Ok(()),
    };

    let handshake = ReplicaHandshake::connect(&host, port, redis.config.port)?;
    let outcome = handshake.run()?;

    redis.info.add_to_offset(outcome.master_offset);
    RdbManager::restore_from_snapshot(&outcome.snapshot, &redis.storage);

    let mut handler =
        ClientHandler::new_master_link(outcome.stream, Arc::clone(&redis), outcome.residual);
    handler.start();
    Ok(())
}
