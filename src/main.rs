use anyhow::Context;
use clap::Parser;
use log::{error, info};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use minnowdb::client_handler::ClientHandler;
use minnowdb::redis::config::{Cli, RedisConfig};
use minnowdb::redis::rdb::RdbManager;
use minnowdb::redis::replica::init_replica;
use minnowdb::redis::Redis;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = RedisConfig::from_cli(Cli::parse())?;
    let redis = Arc::new(Redis::new(config.clone()));

    if let (Some(dir), Some(dbfilename)) = (&config.dir, &config.dbfilename) {
        RdbManager::restore_from_file(dir, dbfilename, &redis.storage);
    }

    let listen_addr = format!("{}:{}", config.addr, config.port);
    let listener = TcpListener::bind(&listen_addr)
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!("listening on {} as {}", listen_addr, redis.info.role());

    if config.replicaof.is_some() {
        let redis = Arc::clone(&redis);
        thread::spawn(move || {
            if let Err(e) = init_replica(redis) {
                error!("{}; continuing with an empty store", e);
            }
        });
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("accepted new connection");
                let mut handler = ClientHandler::new(stream, Arc::clone(&redis));
                handler.start();
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
    Ok(())
}
