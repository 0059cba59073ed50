//! Length-prefixed echo server, the smallest useful deployment of the
//! framework. Without a config file it listens on 127.0.0.1:8686.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use netserv::{
    setup_tracing, CloseReason, LengthFieldCodec, Listener, Serv, ServConfig, ServResult,
    ServerConfig, Session,
};
use tokio::runtime;
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files
    #[arg(short, long, default_value = "./logs")]
    pub log_dir: String,
}

struct EchoListener;

impl Listener<Bytes> for EchoListener {
    fn on_connect(&self, session: &Arc<Session<Bytes>>) {
        info!(session_id = session.id(), remote = ?session.remote_addr(), "session opened");
    }

    fn on_receive(&self, session: &Arc<Session<Bytes>>, msg: Bytes) {
        let _ = session.send(msg);
    }

    fn on_close(&self, session: &Arc<Session<Bytes>>, reason: CloseReason) {
        info!(session_id = session.id(), %reason, "session closed");
    }
}

fn main() -> ServResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let _log_guard = setup_tracing(&commandline.log_dir);

    let config = match &commandline.conf {
        Some(path) => ServConfig::set_up_config(PathBuf::from(path))?,
        None => ServConfig::default(),
    };

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.reactor_threads.max(1))
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let serv = Serv::new();
        if config.servers.is_empty() {
            serv.register_tcp_server(
                "echo",
                ServerConfig {
                    host: "127.0.0.1".to_string(),
                    port: 8686,
                    ..ServerConfig::default()
                },
                LengthFieldCodec::default(),
                EchoListener,
            )?;
        }
        for (name, server_config) in config.servers {
            serv.register_tcp_server(
                name,
                server_config,
                LengthFieldCodec::default(),
                EchoListener,
            )?;
        }

        serv.startup().await?;
        info!("echo service up, press ctrl-c to stop");

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        serv.shutdown().await;
        Ok(())
    })
}
