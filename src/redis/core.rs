use crossbeam_channel::Sender;
use log::{debug, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::redis::commands::RedisCommand;
use crate::redis::config::RedisConfig;
use crate::redis::info::{ReplicationRole, ServerInfo};
use crate::redis::rdb::RdbManager;
use crate::redis::replication::ReplicaPool;
use crate::redis::storage::{now_ms, Storage, StorageError, StoredValue};
use crate::resp::RespValue;

/// How often WAIT re-checks replica acknowledgements.
const WAIT_POLL_MS: u64 = 20;

/// What a command execution produced: one reply frame, several (PSYNC), or
/// nothing at all.
#[derive(Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    Frame(Vec<u8>),
    Frames(Vec<Vec<u8>>),
    Empty,
}

impl ExecutionResult {
    pub fn frame(value: RespValue) -> Self {
        ExecutionResult::Frame(value.encode())
    }

    pub fn into_frames(self) -> Vec<Vec<u8>> {
        match self {
            ExecutionResult::Frame(frame) => vec![frame],
            ExecutionResult::Frames(frames) => frames,
            ExecutionResult::Empty => Vec::new(),
        }
    }
}

/// Per-link execution context: who the peer is and whether the link is the
/// persistent connection to our master.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub uid: String,
    pub is_master_link: bool,
}

impl ConnectionContext {
    pub fn client(uid: impl Into<String>) -> Self {
        ConnectionContext {
            uid: uid.into(),
            is_master_link: false,
        }
    }

    pub fn master_link(uid: impl Into<String>) -> Self {
        ConnectionContext {
            uid: uid.into(),
            is_master_link: true,
        }
    }
}

/// Process-wide server state: configuration, keyspace, replication info and
/// the replica pool. Shared across connection handlers behind an `Arc`;
/// each field carries its own interior locking.
pub struct Redis {
    pub config: RedisConfig,
    pub storage: Storage,
    pub info: ServerInfo,
    pub replication: Arc<ReplicaPool>,
    propagation: Sender<Vec<u8>>,
}

impl Redis {
    pub fn new(config: RedisConfig) -> Self {
        let role = if config.replicaof.is_some() {
            ReplicationRole::Slave
        } else {
            ReplicationRole::Master
        };
        let replication = Arc::new(ReplicaPool::new());
        let propagation = ReplicaPool::start_propagation_worker(Arc::clone(&replication));
        Redis {
            config,
            storage: Storage::new(),
            info: ServerInfo::new(role),
            replication,
            propagation,
        }
    }

    /// Queue a write command's serialized form for broadcast to all
    /// replicas. The offset moves before the payload is handed to the
    /// writer thread, so it is monotonically consistent with what
    /// followers will observe.
    pub fn propagate(&self, command: &RedisCommand) {
        let payload = command.to_bytes();
        self.info.add_to_offset(payload.len() as u64);
        debug!("propagating {} bytes to replicas", payload.len());
        if self.propagation.send(payload).is_err() {
            warn!("propagation worker is gone, dropping payload");
        }
    }

    pub fn execute_command(
        &self,
        command: &RedisCommand,
        conn: &ConnectionContext,
    ) -> ExecutionResult {
        match command {
            RedisCommand::Ping { msg: None } => ExecutionResult::frame(RespValue::simple("PONG")),
            RedisCommand::Ping { msg: Some(msg) } => {
                ExecutionResult::frame(RespValue::bulk(msg.clone()))
            }
            RedisCommand::Echo { msg } => ExecutionResult::frame(RespValue::bulk(msg.clone())),
            RedisCommand::Get { key } => match self.storage.get(key) {
                Ok(value) => ExecutionResult::frame(RespValue::bulk(value.raw)),
                Err(StorageError::KeyNotFound) | Err(StorageError::KeyExpired) => {
                    ExecutionResult::frame(RespValue::NullBulkString)
                }
                Err(e) => {
                    warn!("GET failed: {}", e);
                    ExecutionResult::frame(RespValue::NullBulkString)
                }
            },
            RedisCommand::Set { key, value, expiry } => {
                let expiry_ms = expiry.map(|e| e.to_absolute_ms(now_ms()));
                self.storage.set(key, StoredValue::new(value.clone(), expiry_ms));
                ExecutionResult::frame(RespValue::simple("OK"))
            }
            RedisCommand::Incr { key } => self.exec_incr(key),
            RedisCommand::Keys { pattern } => {
                let keys = self.storage.keys(pattern);
                ExecutionResult::frame(RespValue::Array(
                    keys.into_iter().map(RespValue::BulkString).collect(),
                ))
            }
            RedisCommand::Info { sections } => {
                let body = self.info.render_sections(sections);
                ExecutionResult::frame(RespValue::bulk(body.into_bytes()))
            }
            RedisCommand::ConfigGet { params } => {
                let mut items = Vec::new();
                for param in params {
                    if let Some(value) = self.config.get_parameter(param) {
                        items.push(RespValue::bulk(param.clone().into_bytes()));
                        items.push(RespValue::bulk(value.into_bytes()));
                    }
                }
                ExecutionResult::frame(RespValue::Array(items))
            }
            RedisCommand::Multi | RedisCommand::Exec | RedisCommand::Discard => {
                // transaction control belongs to the connection handler
                ExecutionResult::frame(RespValue::error("ERR command not allowed in this context"))
            }
            RedisCommand::ReplconfListeningPort { port } => {
                debug!("replica {} announced listening port {}", conn.uid, port);
                ExecutionResult::frame(RespValue::simple("OK"))
            }
            RedisCommand::ReplconfCapa { capa } => {
                debug!("replica {} announced capability {}", conn.uid, capa);
                ExecutionResult::frame(RespValue::simple("OK"))
            }
            RedisCommand::ReplconfGetAck => {
                let ack = RedisCommand::ReplconfAck {
                    offset: Some(self.info.offset()),
                };
                ExecutionResult::Frame(ack.to_bytes())
            }
            RedisCommand::ReplconfAck { offset } => {
                match offset {
                    Some(offset) => self.replication.update_ack(&conn.uid, *offset),
                    None => debug!("ignoring malformed ACK from {}", conn.uid),
                }
                ExecutionResult::Empty
            }
            RedisCommand::Psync { .. } => {
                let header = format!("+FULLRESYNC {} {}\r\n", self.info.replid(), self.info.offset());
                let snapshot = RdbManager::empty_snapshot();
                // length-prefixed blob with no trailing CRLF
                let mut blob = format!("${}\r\n", snapshot.len()).into_bytes();
                blob.extend_from_slice(&snapshot);
                ExecutionResult::Frames(vec![header.into_bytes(), blob])
            }
            RedisCommand::Wait {
                numreplicas,
                timeout_ms,
            } => self.exec_wait(*numreplicas, *timeout_ms),
        }
    }

    fn exec_incr(&self, key: &[u8]) -> ExecutionResult {
        let result = self.storage.update(key, |current| {
            let number = std::str::from_utf8(&current.raw)
                .ok()
                .and_then(|raw| raw.parse::<i64>().ok())
                .ok_or(StorageError::NotAnInteger)?;
            let incremented = number.checked_add(1).ok_or(StorageError::NotAnInteger)?;
            Ok(StoredValue::new(
                incremented.to_string().into_bytes(),
                current.expiry_ms,
            ))
        });

        match result {
            Ok(value) => {
                let number = std::str::from_utf8(&value.raw)
                    .expect("incremented value is ascii")
                    .parse::<i64>()
                    .expect("incremented value is an integer");
                ExecutionResult::frame(RespValue::Integer(number))
            }
            Err(StorageError::KeyNotFound) | Err(StorageError::KeyExpired) => {
                self.storage.set(key, StoredValue::new(&b"1"[..], None));
                ExecutionResult::frame(RespValue::Integer(1))
            }
            Err(StorageError::NotAnInteger) => ExecutionResult::frame(RespValue::error(
                "ERR value is not an integer or out of range",
            )),
        }
    }

    /// Block until `numreplicas` followers have acknowledged the current
    /// offset or the timeout elapses, probing laggards with GETACK between
    /// polls. Broadcasting continues on the writer thread meanwhile.
    fn exec_wait(&self, numreplicas: usize, timeout_ms: u64) -> ExecutionResult {
        let master_offset = self.info.offset();
        let start = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);

        loop {
            let acked = self.replication.acked_count(master_offset);
            if acked >= numreplicas || start.elapsed() >= timeout {
                return ExecutionResult::frame(RespValue::Integer(acked as i64));
            }

            let pool = Arc::clone(&self.replication);
            thread::spawn(move || pool.request_acks(master_offset));
            thread::sleep(Duration::from_millis(WAIT_POLL_MS));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::decode;

    fn master() -> Redis {
        Redis::new(RedisConfig::default())
    }

    fn client_ctx() -> ConnectionContext {
        ConnectionContext::client("127.0.0.1:9999")
    }

    fn exec(redis: &Redis, cmd: RedisCommand) -> Vec<u8> {
        match redis.execute_command(&cmd, &client_ctx()) {
            ExecutionResult::Frame(frame) => frame,
            other => panic!("expected single frame, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_and_echo() {
        let redis = master();
        assert_eq!(exec(&redis, RedisCommand::Ping { msg: None }), b"+PONG\r\n");
        assert_eq!(
            exec(
                &redis,
                RedisCommand::Ping {
                    msg: Some(b"hi".to_vec())
                }
            ),
            b"$2\r\nhi\r\n"
        );
        assert_eq!(
            exec(
                &redis,
                RedisCommand::Echo {
                    msg: b"hola".to_vec()
                }
            ),
            b"$4\r\nhola\r\n"
        );
    }

    #[test]
    fn test_set_get_readback() {
        let redis = master();
        let reply = exec(
            &redis,
            RedisCommand::Set {
                key: b"foo".to_vec(),
                value: b"bar".to_vec(),
                expiry: None,
            },
        );
        assert_eq!(reply, b"+OK\r\n");
        assert_eq!(
            exec(&redis, RedisCommand::Get { key: b"foo".to_vec() }),
            b"$3\r\nbar\r\n"
        );
    }

    #[test]
    fn test_get_missing_is_nil() {
        let redis = master();
        assert_eq!(
            exec(&redis, RedisCommand::Get { key: b"nope".to_vec() }),
            b"$-1\r\n"
        );
    }

    #[test]
    fn test_set_with_past_pxat_expires_immediately() {
        let redis = master();
        exec(
            &redis,
            RedisCommand::Set {
                key: b"gone".to_vec(),
                value: b"v".to_vec(),
                expiry: Some(crate::redis::commands::Expiry::Pxat(1)),
            },
        );
        assert_eq!(
            exec(&redis, RedisCommand::Get { key: b"gone".to_vec() }),
            b"$-1\r\n"
        );
    }

    #[test]
    fn test_incr_creates_then_counts() {
        let redis = master();
        assert_eq!(
            exec(&redis, RedisCommand::Incr { key: b"n".to_vec() }),
            b":1\r\n"
        );
        assert_eq!(
            exec(&redis, RedisCommand::Incr { key: b"n".to_vec() }),
            b":2\r\n"
        );
        assert_eq!(
            exec(&redis, RedisCommand::Get { key: b"n".to_vec() }),
            b"$1\r\n2\r\n"
        );
    }

    #[test]
    fn test_incr_non_integer_errors_and_preserves_value() {
        let redis = master();
        exec(
            &redis,
            RedisCommand::Set {
                key: b"k".to_vec(),
                value: b"abc".to_vec(),
                expiry: None,
            },
        );
        assert_eq!(
            exec(&redis, RedisCommand::Incr { key: b"k".to_vec() }),
            b"-ERR value is not an integer or out of range\r\n"
        );
        assert_eq!(
            exec(&redis, RedisCommand::Get { key: b"k".to_vec() }),
            b"$3\r\nabc\r\n"
        );
    }

    #[test]
    fn test_config_get_interleaves_and_omits_unknown() {
        let mut config = RedisConfig::default();
        config.dir = Some("/data".to_string());
        config.dbfilename = Some("dump.rdb".to_string());
        let redis = Redis::new(config);

        let reply = exec(
            &redis,
            RedisCommand::ConfigGet {
                params: vec![
                    "dir".to_string(),
                    "maxmemory".to_string(),
                    "dbfilename".to_string(),
                ],
            },
        );
        let (frame, _) = decode(&reply).unwrap();
        match frame {
            RespValue::Array(items) => {
                assert_eq!(items.len(), 4);
                assert_eq!(items[0], RespValue::bulk(&b"dir"[..]));
                assert_eq!(items[1], RespValue::bulk(&b"/data"[..]));
                assert_eq!(items[2], RespValue::bulk(&b"dbfilename"[..]));
                assert_eq!(items[3], RespValue::bulk(&b"dump.rdb"[..]));
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_info_replies_bulk_replication_section() {
        let redis = master();
        let reply = exec(&redis, RedisCommand::Info { sections: vec![] });
        let (frame, _) = decode(&reply).unwrap();
        let body = match frame {
            RespValue::BulkString(body) => String::from_utf8(body).unwrap(),
            other => panic!("expected bulk string, got {:?}", other),
        };
        assert!(body.starts_with("# Replication\r\n"));
        assert!(body.contains("role:master\r\n"));
        assert!(body.contains("connected_slaves:0\r\n"));
    }

    #[test]
    fn test_psync_produces_fullresync_and_snapshot_blob() {
        let redis = master();
        let frames = match redis.execute_command(
            &RedisCommand::Psync {
                replid: "?".to_string(),
                offset: -1,
            },
            &client_ctx(),
        ) {
            ExecutionResult::Frames(frames) => frames,
            other => panic!("expected two frames, got {:?}", other),
        };
        assert_eq!(frames.len(), 2);

        let header = String::from_utf8(frames[0].clone()).unwrap();
        assert!(header.starts_with("+FULLRESYNC "));
        assert!(header.ends_with(" 0\r\n"));

        let snapshot = RdbManager::empty_snapshot();
        let mut expected = format!("${}\r\n", snapshot.len()).into_bytes();
        expected.extend_from_slice(&snapshot);
        assert_eq!(frames[1], expected);
        // the blob is length-prefixed with no trailing CRLF
        assert!(!frames[1].ends_with(b"\r\n"));
    }

    #[test]
    fn test_replconf_getack_answers_with_current_offset() {
        let redis = master();
        redis.info.add_to_offset(154);
        let reply = exec(&redis, RedisCommand::ReplconfGetAck);
        assert_eq!(reply, b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$3\r\n154\r\n");
    }

    #[test]
    fn test_replconf_ack_is_silent() {
        let redis = master();
        let result = redis.execute_command(
            &RedisCommand::ReplconfAck { offset: Some(10) },
            &client_ctx(),
        );
        assert_eq!(result, ExecutionResult::Empty);
        let result = redis.execute_command(
            &RedisCommand::ReplconfAck { offset: None },
            &client_ctx(),
        );
        assert_eq!(result, ExecutionResult::Empty);
    }

    #[test]
    fn test_transaction_control_commands_are_rejected_here() {
        // MULTI/EXEC/DISCARD belong to the connection handler; a caller
        // that routes them here gets an error frame, not a panic
        let redis = master();
        for cmd in [RedisCommand::Multi, RedisCommand::Exec, RedisCommand::Discard] {
            assert_eq!(
                exec(&redis, cmd),
                b"-ERR command not allowed in this context\r\n"
            );
        }
    }

    #[test]
    fn test_wait_zero_replicas_returns_immediately() {
        let redis = master();
        let reply = exec(
            &redis,
            RedisCommand::Wait {
                numreplicas: 0,
                timeout_ms: 0,
            },
        );
        assert_eq!(reply, b":0\r\n");
    }

    #[test]
    fn test_wait_times_out_with_current_count() {
        let redis = master();
        let start = Instant::now();
        let reply = exec(
            &redis,
            RedisCommand::Wait {
                numreplicas: 3,
                timeout_ms: 60,
            },
        );
        assert_eq!(reply, b":0\r\n");
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_propagate_advances_offset_by_payload_length() {
        let redis = master();
        let cmd = RedisCommand::Set {
            key: b"foo".to_vec(),
            value: b"bar".to_vec(),
            expiry: None,
        };
        let expected = cmd.to_bytes().len() as u64;
        redis.propagate(&cmd);
        assert_eq!(redis.info.offset(), expected);
    }
}
