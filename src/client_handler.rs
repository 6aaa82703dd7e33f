use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::redis::commands::RedisCommand;
use crate::redis::core::{ConnectionContext, ExecutionResult, Redis};
use crate::redis::info::ReplicationRole;
use crate::redis::replication::TcpStreamTrait;
use crate::resp::{decode, RespError, RespValue};

const READ_CHUNK: usize = 1024;
const IDLE_POLL: Duration = Duration::from_millis(20);

/// One handler per TCP connection, client link or master-replication link.
/// Owns the read buffer and the transaction queue; everything else is
/// shared process state.
#[derive(Clone)]
pub struct ClientHandler {
    client: Arc<Mutex<Box<dyn TcpStreamTrait>>>,
    redis: Arc<Redis>,
    in_transaction: Arc<Mutex<bool>>,
    queued_commands: Arc<Mutex<VecDeque<RedisCommand>>>,
    ready: Arc<Mutex<bool>>,
    shutdown: Arc<Mutex<bool>>,
    is_master_link: bool,
    uid: String,
    /// Bytes already read past the handshake that belong to this handler.
    residual: Vec<u8>,
}

impl ClientHandler {
    pub fn new<T: TcpStreamTrait>(client: T, redis: Arc<Redis>) -> Self {
        Self::with_link_type(client, redis, false, Vec::new())
    }

    /// Handler for the persistent link to our master, fed any bytes that
    /// were buffered past the end of the handshake.
    pub fn new_master_link<T: TcpStreamTrait>(
        client: T,
        redis: Arc<Redis>,
        residual: Vec<u8>,
    ) -> Self {
        Self::with_link_type(client, redis, true, residual)
    }

    fn with_link_type<T: TcpStreamTrait>(
        client: T,
        redis: Arc<Redis>,
        is_master_link: bool,
        residual: Vec<u8>,
    ) -> Self {
        let uid = client
            .peer_addr()
            .map(|addr| format!("{}:{}", addr.ip(), addr.port()))
            .unwrap_or_else(|_| "unknown:0".to_string());
        ClientHandler {
            client: Arc::new(Mutex::new(Box::new(client) as Box<dyn TcpStreamTrait>)),
            redis,
            in_transaction: Arc::new(Mutex::new(false)),
            queued_commands: Arc::new(Mutex::new(VecDeque::new())),
            ready: Arc::new(Mutex::new(false)),
            shutdown: Arc::new(Mutex::new(false)),
            is_master_link,
            uid,
            residual,
        }
    }

    #[allow(dead_code)]
    pub fn is_ready(&self) -> bool {
        *self.ready.lock().unwrap()
    }

    #[allow(dead_code)]
    pub fn shutdown(&self) {
        *self.shutdown.lock().unwrap() = true;
    }

    pub fn start(&mut self) -> thread::JoinHandle<()> {
        let mut handler = self.clone();
        thread::spawn(move || handler.run())
    }

    fn run(&mut self) {
        debug!("[{}] starting connection handler", self.uid);
        let mut buffer = BytesMut::with_capacity(4 * READ_CHUNK);
        buffer.extend_from_slice(&self.residual);
        let mut read_buf = [0u8; READ_CHUNK];

        'conn: loop {
            *self.ready.lock().unwrap() = true;
            if *self.shutdown.lock().unwrap() {
                break;
            }

            // drain every complete frame currently buffered
            while !buffer.is_empty() {
                match decode(&buffer) {
                    Ok((frame, consumed)) => {
                        buffer.advance(consumed);
                        if !self.handle_frame(frame, consumed) {
                            break 'conn;
                        }
                    }
                    Err(RespError::Incomplete) => break,
                    Err(RespError::Malformed(reason)) => {
                        warn!("[{}] malformed frame: {}", self.uid, reason);
                        let reply = format!("-ERR Protocol error: {}\r\n", reason);
                        if !self.send(reply.as_bytes()) {
                            break 'conn;
                        }
                        // drop the unparseable bytes so the link can resync
                        buffer.clear();
                        break;
                    }
                }
            }

            let read_result = {
                let mut client = self.client.lock().unwrap();
                client.read(&mut read_buf)
            };
            match read_result {
                Ok(0) => {
                    debug!("[{}] peer closed connection", self.uid);
                    break;
                }
                Ok(n) => buffer.extend_from_slice(&read_buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(IDLE_POLL);
                }
                Err(e) => {
                    error!("[{}] read failed: {}", self.uid, e);
                    break;
                }
            }
        }

        self.teardown();
    }

    /// Process one decoded frame. Returns false when the connection should
    /// be torn down.
    fn handle_frame(&mut self, frame: RespValue, consumed: usize) -> bool {
        let alive = match frame {
            RespValue::SimpleError(e) => {
                error!("[{}] peer error: {}", self.uid, String::from_utf8_lossy(&e));
                true
            }
            RespValue::Array(items) => match RedisCommand::from_frames(&items) {
                Ok(command) => self.dispatch(command),
                Err(e) => {
                    warn!("[{}] {}", self.uid, e);
                    if self.is_master_link {
                        true
                    } else {
                        self.send(format!("-{}\r\n", e).as_bytes())
                    }
                }
            },
            other => {
                debug!("[{}] ignoring non-command frame {:?}", self.uid, other);
                true
            }
        };

        // a follower's offset tracks every byte consumed from the master
        if self.is_master_link {
            self.redis.info.add_to_offset(consumed as u64);
        }
        alive
    }

    fn dispatch(&mut self, command: RedisCommand) -> bool {
        if *self.in_transaction.lock().unwrap() && command.is_queueable() {
            self.queued_commands.lock().unwrap().push_back(command);
            return self.send(b"+QUEUED\r\n");
        }

        let ctx = ConnectionContext {
            uid: self.uid.clone(),
            is_master_link: self.is_master_link,
        };
        let result = match &command {
            RedisCommand::Multi => self.exec_multi(),
            RedisCommand::Exec => self.exec_transaction(&ctx),
            RedisCommand::Discard => self.exec_discard(),
            _ => self.redis.execute_command(&command, &ctx),
        };

        // a follower stays silent toward its master, except for the
        // REPLCONF GETACK probes it must answer
        let suppress = self.is_master_link && !matches!(command, RedisCommand::ReplconfGetAck);
        if !suppress {
            for frame in result.into_frames() {
                if !self.send(&frame) {
                    return false;
                }
            }
        }

        if self.redis.info.role() == ReplicationRole::Master && command.is_write() {
            self.redis.propagate(&command);
        }

        if matches!(command, RedisCommand::Psync { .. }) {
            self.register_as_replica();
        }
        true
    }

    fn exec_multi(&self) -> ExecutionResult {
        let mut in_transaction = self.in_transaction.lock().unwrap();
        if *in_transaction {
            ExecutionResult::Frame(b"-ERR MULTI calls can not be nested\r\n".to_vec())
        } else {
            *in_transaction = true;
            ExecutionResult::Frame(b"+OK\r\n".to_vec())
        }
    }

    fn exec_discard(&self) -> ExecutionResult {
        let mut in_transaction = self.in_transaction.lock().unwrap();
        if !*in_transaction {
            ExecutionResult::Frame(b"-ERR DISCARD without MULTI\r\n".to_vec())
        } else {
            *in_transaction = false;
            self.queued_commands.lock().unwrap().clear();
            ExecutionResult::Frame(b"+OK\r\n".to_vec())
        }
    }

    /// Drain the queue in order; the reply is one array whose count is the
    /// number of non-empty replies, with every write propagated as usual.
    fn exec_transaction(&self, ctx: &ConnectionContext) -> ExecutionResult {
        {
            let mut in_transaction = self.in_transaction.lock().unwrap();
            if !*in_transaction {
                return ExecutionResult::Frame(b"-ERR EXEC without MULTI\r\n".to_vec());
            }
            *in_transaction = false;
        }

        let is_master = self.redis.info.role() == ReplicationRole::Master;
        let mut replies: Vec<Vec<u8>> = Vec::new();
        loop {
            let command = match self.queued_commands.lock().unwrap().pop_front() {
                Some(command) => command,
                None => break,
            };
            let result = self.redis.execute_command(&command, ctx);
            replies.extend(result.into_frames());
            if is_master && command.is_write() {
                self.redis.propagate(&command);
            }
        }

        let mut out = format!("*{}\r\n", replies.len()).into_bytes();
        for reply in replies {
            out.extend_from_slice(&reply);
        }
        ExecutionResult::Frame(out)
    }

    /// A PSYNC turns this connection into a replica link: the pool gets its
    /// own handle on the socket and the replica count goes up.
    fn register_as_replica(&self) {
        let cloned = {
            let client = self.client.lock().unwrap();
            client.try_clone()
        };
        match cloned {
            Ok(stream) => {
                self.redis.replication.add(&self.uid, stream);
                self.redis.info.incr_connected_slaves();
                info!("[{}] registered as replica", self.uid);
            }
            Err(e) => error!("[{}] could not register replica: {}", self.uid, e),
        }
    }

    fn send(&self, bytes: &[u8]) -> bool {
        let mut client = self.client.lock().unwrap();
        if let Err(e) = client.write_all(bytes).and_then(|_| client.flush()) {
            error!("[{}] write failed: {}", self.uid, e);
            return false;
        }
        true
    }

    fn teardown(&self) {
        if self.redis.replication.remove(&self.uid) {
            self.redis.info.decr_connected_slaves();
        }
        debug!("[{}] connection handler finished", self.uid);
    }
}
