use std::collections::HashMap;
use thiserror::Error;

use crate::resp::{command_array, RespValue};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR empty command")]
    CommandEmpty,
    #[error("ERR unknown command '{0}'")]
    UnrecognizedCommand(String),
    #[error("ERR missing argument at {pos}: '{name}'")]
    MissingArgument { name: &'static str, pos: usize },
    #[error("ERR missing subcommand for '{0}'")]
    MissingSubcommand(String),
    #[error("ERR {0}")]
    InvalidArgument(String),
}

/// One declared parameter of a command: where it sits, whether it may be
/// absent, its fallback, and whether it swallows all trailing arguments.
struct ArgSpec {
    name: &'static str,
    pos: usize,
    required: bool,
    default: Option<&'static [u8]>,
    capture: bool,
}

/// Declarative positional-argument parser. Each command lists its
/// parameters once; `parse` binds values, applies defaults, and reports the
/// first missing required argument by name and position.
struct ArgParser {
    specs: Vec<ArgSpec>,
}

impl ArgParser {
    fn new() -> Self {
        ArgParser { specs: Vec::new() }
    }

    fn arg(mut self, name: &'static str, pos: usize) -> Self {
        self.specs.push(ArgSpec {
            name,
            pos,
            required: true,
            default: None,
            capture: false,
        });
        self
    }

    fn opt(mut self, name: &'static str, pos: usize) -> Self {
        self.specs.push(ArgSpec {
            name,
            pos,
            required: false,
            default: None,
            capture: false,
        });
        self
    }

    fn capture(mut self, name: &'static str, pos: usize) -> Self {
        self.specs.push(ArgSpec {
            name,
            pos,
            required: false,
            default: None,
            capture: true,
        });
        self
    }

    fn parse(&self, args: &[&[u8]]) -> Result<ParsedArgs, CommandError> {
        let mut values = HashMap::new();
        let mut lists = HashMap::new();

        for spec in &self.specs {
            if args.len() > spec.pos {
                if spec.capture {
                    lists.insert(
                        spec.name,
                        args[spec.pos..].iter().map(|a| a.to_vec()).collect(),
                    );
                } else {
                    values.insert(spec.name, args[spec.pos].to_vec());
                }
            } else if spec.required {
                return Err(CommandError::MissingArgument {
                    name: spec.name,
                    pos: spec.pos,
                });
            } else if let Some(default) = spec.default {
                values.insert(spec.name, default.to_vec());
            }
        }

        Ok(ParsedArgs { values, lists })
    }
}

struct ParsedArgs {
    values: HashMap<&'static str, Vec<u8>>,
    lists: HashMap<&'static str, Vec<Vec<u8>>>,
}

impl ParsedArgs {
    fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    fn take(&mut self, name: &str) -> Vec<u8> {
        self.values.remove(name).unwrap_or_default()
    }

    fn get_str(&self, name: &str) -> Result<String, CommandError> {
        let raw = self.values.get(name).cloned().unwrap_or_default();
        String::from_utf8(raw)
            .map_err(|_| CommandError::InvalidArgument(format!("argument '{}' is not utf-8", name)))
    }

    fn get_u64(&self, name: &str) -> Result<u64, CommandError> {
        self.get_str(name)?.parse::<u64>().map_err(|_| {
            CommandError::InvalidArgument("value is not an integer or out of range".to_string())
        })
    }

    fn list(&mut self, name: &str) -> Vec<Vec<u8>> {
        self.lists.remove(name).unwrap_or_default()
    }
}

/// SET expiry option as received. Relative variants are resolved against
/// the wall clock when the command executes, absolute ones pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Ex(u64),
    Px(u64),
    Exat(u64),
    Pxat(u64),
}

impl Expiry {
    pub fn to_absolute_ms(self, now_ms: u64) -> u64 {
        match self {
            Expiry::Ex(secs) => now_ms + secs * 1000,
            Expiry::Px(ms) => now_ms + ms,
            Expiry::Exat(secs) => secs * 1000,
            Expiry::Pxat(ms) => ms,
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            Expiry::Ex(_) => "EX",
            Expiry::Px(_) => "PX",
            Expiry::Exat(_) => "EXAT",
            Expiry::Pxat(_) => "PXAT",
        }
    }

    fn value(&self) -> u64 {
        match self {
            Expiry::Ex(v) | Expiry::Px(v) | Expiry::Exat(v) | Expiry::Pxat(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisCommand {
    Ping { msg: Option<Vec<u8>> },
    Echo { msg: Vec<u8> },
    Get { key: Vec<u8> },
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        expiry: Option<Expiry>,
    },
    Incr { key: Vec<u8> },
    Keys { pattern: Vec<u8> },
    Info { sections: Vec<String> },
    ConfigGet { params: Vec<String> },
    Multi,
    Exec,
    Discard,
    ReplconfListeningPort { port: u16 },
    ReplconfCapa { capa: String },
    ReplconfGetAck,
    /// ACK with an unparseable offset is kept (offset None) so the
    /// dispatcher can ignore it silently instead of erroring the link.
    ReplconfAck { offset: Option<u64> },
    Psync { replid: String, offset: i64 },
    Wait { numreplicas: usize, timeout_ms: u64 },
}

impl RedisCommand {
    /// Build a command from the elements of a RESP array. The first element
    /// is the case-insensitive command name; CONFIG and REPLCONF route on
    /// their first sub-argument.
    pub fn from_frames(items: &[RespValue]) -> Result<RedisCommand, CommandError> {
        if items.is_empty() {
            return Err(CommandError::CommandEmpty);
        }

        let mut parts: Vec<&[u8]> = Vec::with_capacity(items.len());
        for item in items {
            parts.push(item.as_bytes().ok_or_else(|| {
                CommandError::InvalidArgument("command arguments must be strings".to_string())
            })?);
        }

        let name = String::from_utf8_lossy(parts[0]).to_uppercase();
        let args = &parts[1..];

        match name.as_str() {
            "PING" => {
                let mut parsed = ArgParser::new().opt("message", 0).parse(args)?;
                let msg = if parsed.get("message").is_some() {
                    Some(parsed.take("message"))
                } else {
                    None
                };
                Ok(RedisCommand::Ping { msg })
            }
            "ECHO" => {
                let mut parsed = ArgParser::new().arg("message", 0).parse(args)?;
                Ok(RedisCommand::Echo {
                    msg: parsed.take("message"),
                })
            }
            "GET" => {
                let mut parsed = ArgParser::new().arg("key", 0).parse(args)?;
                Ok(RedisCommand::Get {
                    key: parsed.take("key"),
                })
            }
            "SET" => {
                let mut parsed = ArgParser::new()
                    .arg("key", 0)
                    .arg("value", 1)
                    .opt("expiry", 2)
                    .opt("expiry_value", 3)
                    .parse(args)?;
                let expiry = Self::parse_expiry(&parsed)?;
                Ok(RedisCommand::Set {
                    key: parsed.take("key"),
                    value: parsed.take("value"),
                    expiry,
                })
            }
            "INCR" => {
                let mut parsed = ArgParser::new().arg("key", 0).parse(args)?;
                Ok(RedisCommand::Incr {
                    key: parsed.take("key"),
                })
            }
            "KEYS" => {
                let mut parsed = ArgParser::new().arg("pattern", 0).parse(args)?;
                Ok(RedisCommand::Keys {
                    pattern: parsed.take("pattern"),
                })
            }
            "INFO" => {
                let mut parsed = ArgParser::new().capture("section", 0).parse(args)?;
                let sections = parsed
                    .list("section")
                    .into_iter()
                    .map(|s| String::from_utf8_lossy(&s).to_string())
                    .collect();
                Ok(RedisCommand::Info { sections })
            }
            "CONFIG" => {
                let sub = args
                    .first()
                    .ok_or_else(|| CommandError::MissingSubcommand("config".to_string()))?;
                if !sub.eq_ignore_ascii_case(b"GET") {
                    return Err(CommandError::UnrecognizedCommand(format!(
                        "CONFIG {}",
                        String::from_utf8_lossy(sub)
                    )));
                }
                let mut parsed = ArgParser::new().capture("parameter", 0).parse(&args[1..])?;
                let params: Vec<String> = parsed
                    .list("parameter")
                    .into_iter()
                    .map(|p| String::from_utf8_lossy(&p).to_string())
                    .collect();
                if params.is_empty() {
                    return Err(CommandError::MissingArgument {
                        name: "parameter",
                        pos: 0,
                    });
                }
                Ok(RedisCommand::ConfigGet { params })
            }
            "MULTI" => Ok(RedisCommand::Multi),
            "EXEC" => Ok(RedisCommand::Exec),
            "DISCARD" => Ok(RedisCommand::Discard),
            "REPLCONF" => Self::parse_replconf(args),
            "PSYNC" => {
                let parsed = ArgParser::new()
                    .arg("replicationid", 0)
                    .arg("offset", 1)
                    .parse(args)?;
                let replid = parsed.get_str("replicationid")?;
                let offset = parsed.get_str("offset")?.parse::<i64>().map_err(|_| {
                    CommandError::InvalidArgument("invalid PSYNC offset".to_string())
                })?;
                Ok(RedisCommand::Psync { replid, offset })
            }
            "WAIT" => {
                let parsed = ArgParser::new()
                    .arg("numreplicas", 0)
                    .arg("timeout", 1)
                    .parse(args)?;
                Ok(RedisCommand::Wait {
                    numreplicas: parsed.get_u64("numreplicas")? as usize,
                    timeout_ms: parsed.get_u64("timeout")?,
                })
            }
            other => Err(CommandError::UnrecognizedCommand(other.to_string())),
        }
    }

    fn parse_expiry(parsed: &ParsedArgs) -> Result<Option<Expiry>, CommandError> {
        let (unit, value) = match (parsed.get("expiry"), parsed.get("expiry_value")) {
            (Some(unit), Some(value)) => (unit, value),
            _ => return Ok(None),
        };
        let value = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                CommandError::InvalidArgument("value is not an integer or out of range".to_string())
            })?;

        let unit = String::from_utf8_lossy(unit).to_uppercase();
        Ok(match unit.as_str() {
            "EX" => Some(Expiry::Ex(value)),
            "PX" => Some(Expiry::Px(value)),
            "EXAT" => Some(Expiry::Exat(value)),
            "PXAT" => Some(Expiry::Pxat(value)),
            _ => None,
        })
    }

    fn parse_replconf(args: &[&[u8]]) -> Result<RedisCommand, CommandError> {
        let sub = args
            .first()
            .ok_or_else(|| CommandError::MissingSubcommand("replconf".to_string()))?;
        let sub = String::from_utf8_lossy(sub).to_lowercase();
        match sub.as_str() {
            "listening-port" => {
                let parsed = ArgParser::new().arg("port", 0).parse(&args[1..])?;
                let port = parsed.get_str("port")?.parse::<u16>().map_err(|_| {
                    CommandError::InvalidArgument("invalid listening port".to_string())
                })?;
                Ok(RedisCommand::ReplconfListeningPort { port })
            }
            "capa" => {
                let parsed = ArgParser::new().arg("capability", 0).parse(&args[1..])?;
                Ok(RedisCommand::ReplconfCapa {
                    capa: parsed.get_str("capability")?,
                })
            }
            "getack" => Ok(RedisCommand::ReplconfGetAck),
            "ack" => {
                let parsed = ArgParser::new().arg("offset", 0).parse(&args[1..])?;
                let offset = parsed
                    .get_str("offset")
                    .ok()
                    .and_then(|o| o.parse::<u64>().ok());
                Ok(RedisCommand::ReplconfAck { offset })
            }
            other => Err(CommandError::UnrecognizedCommand(format!(
                "REPLCONF {}",
                other
            ))),
        }
    }

    /// Whether the command mutates the keyspace and must be propagated to
    /// replicas when this server is a master.
    pub fn is_write(&self) -> bool {
        matches!(self, RedisCommand::Set { .. } | RedisCommand::Incr { .. })
    }

    /// Whether the command is queued inside a MULTI transaction rather than
    /// executed immediately.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            RedisCommand::Ping { .. }
                | RedisCommand::Echo { .. }
                | RedisCommand::Get { .. }
                | RedisCommand::Set { .. }
                | RedisCommand::Incr { .. }
                | RedisCommand::Keys { .. }
                | RedisCommand::Info { .. }
                | RedisCommand::ConfigGet { .. }
                | RedisCommand::ReplconfListeningPort { .. }
                | RedisCommand::ReplconfCapa { .. }
                | RedisCommand::ReplconfGetAck
                | RedisCommand::ReplconfAck { .. }
        )
    }

    /// Serialize back to the RESP array a client would send. This is the
    /// propagation payload; its byte length is what advances the
    /// replication offsets.
    pub fn to_resp_array(&self) -> RespValue {
        match self {
            RedisCommand::Ping { msg: None } => command_array([&b"PING"[..]]),
            RedisCommand::Ping { msg: Some(msg) } => {
                command_array([b"PING".to_vec(), msg.clone()])
            }
            RedisCommand::Echo { msg } => command_array([b"ECHO".to_vec(), msg.clone()]),
            RedisCommand::Get { key } => command_array([b"GET".to_vec(), key.clone()]),
            RedisCommand::Set { key, value, expiry } => {
                let mut parts = vec![b"SET".to_vec(), key.clone(), value.clone()];
                if let Some(expiry) = expiry {
                    parts.push(expiry.unit().as_bytes().to_vec());
                    parts.push(expiry.value().to_string().into_bytes());
                }
                command_array(parts)
            }
            RedisCommand::Incr { key } => command_array([b"INCR".to_vec(), key.clone()]),
            RedisCommand::Keys { pattern } => {
                command_array([b"KEYS".to_vec(), pattern.clone()])
            }
            RedisCommand::Info { sections } => {
                let mut parts = vec![b"INFO".to_vec()];
                parts.extend(sections.iter().map(|s| s.clone().into_bytes()));
                command_array(parts)
            }
            RedisCommand::ConfigGet { params } => {
                let mut parts = vec![b"CONFIG".to_vec(), b"GET".to_vec()];
                parts.extend(params.iter().map(|p| p.clone().into_bytes()));
                command_array(parts)
            }
            RedisCommand::Multi => command_array([&b"MULTI"[..]]),
            RedisCommand::Exec => command_array([&b"EXEC"[..]]),
            RedisCommand::Discard => command_array([&b"DISCARD"[..]]),
            RedisCommand::ReplconfListeningPort { port } => command_array([
                b"REPLCONF".to_vec(),
                b"listening-port".to_vec(),
                port.to_string().into_bytes(),
            ]),
            RedisCommand::ReplconfCapa { capa } => command_array([
                b"REPLCONF".to_vec(),
                b"capa".to_vec(),
                capa.clone().into_bytes(),
            ]),
            RedisCommand::ReplconfGetAck => {
                command_array([&b"REPLCONF"[..], &b"GETACK"[..], &b"*"[..]])
            }
            RedisCommand::ReplconfAck { offset } => command_array([
                b"REPLCONF".to_vec(),
                b"ACK".to_vec(),
                offset.unwrap_or(0).to_string().into_bytes(),
            ]),
            RedisCommand::Psync { replid, offset } => command_array([
                b"PSYNC".to_vec(),
                replid.clone().into_bytes(),
                offset.to_string().into_bytes(),
            ]),
            RedisCommand::Wait {
                numreplicas,
                timeout_ms,
            } => command_array([
                b"WAIT".to_vec(),
                numreplicas.to_string().into_bytes(),
                timeout_ms.to_string().into_bytes(),
            ]),
        }
    }

    /// On-wire form of `to_resp_array`.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_resp_array().encode()
    }
}
