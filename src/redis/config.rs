use anyhow::{bail, Context};
use clap::Parser;

/// Command-line flags accepted by the launcher.
#[derive(Parser, Debug)]
#[command(name = "minnowdb", about = "Redis-compatible in-memory key-value server")]
pub struct Cli {
    /// TCP port to listen on
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// Directory containing the RDB file
    #[arg(long)]
    pub dir: Option<String>,

    /// RDB file name
    #[arg(long)]
    pub dbfilename: Option<String>,

    /// Run as a follower of the given master, e.g. "localhost 6379"
    #[arg(long, value_name = "HOST PORT")]
    pub replicaof: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub port: u16,
    pub dir: Option<String>,
    pub dbfilename: Option<String>,
    pub replicaof: Option<(String, u16)>,
}

impl RedisConfig {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let replicaof = match cli.replicaof {
            Some(target) => {
                let mut parts = target.split_whitespace();
                let host = match parts.next() {
                    Some(host) => host.to_string(),
                    None => bail!("--replicaof expects \"HOST PORT\""),
                };
                let port = parts
                    .next()
                    .context("--replicaof expects \"HOST PORT\"")?
                    .parse::<u16>()
                    .context("--replicaof port is not a number")?;
                Some((host, port))
            }
            None => None,
        };

        Ok(RedisConfig {
            addr: "0.0.0.0".to_string(),
            port: cli.port,
            dir: cli.dir,
            dbfilename: cli.dbfilename,
            replicaof,
        })
    }

    /// Value of a CONFIG GET parameter; unrecognized names yield None and
    /// are silently omitted from the reply.
    pub fn get_parameter(&self, name: &str) -> Option<String> {
        match name {
            "dir" => self.dir.clone(),
            "dbfilename" => self.dbfilename.clone(),
            _ => None,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            addr: "0.0.0.0".to_string(),
            port: 6379,
            dir: None,
            dbfilename: None,
            replicaof: None,
        }
    }
}
