use anyhow::Result;
use serde::Deserialize;
use sip::config::TransportConfig;
use sip::tcp::{self, TcpFactory};
use sip::transport::{TransportManager, TransportType};
use sip::udp::UdpFactory;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONF: &str = "/etc/nebula/transport.conf";

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Config {
    log_level: Option<String>,
    tcp_listen: Option<SocketAddr>,
    transport: TransportConfig,
}

fn load_config() -> Result<Config> {
    let path = std::env::args().nth(1);
    let contents = match &path {
        Some(path) => fs::read_to_string(path)?,
        None => match fs::read_to_string(DEFAULT_CONF) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("can't read {DEFAULT_CONF} ({e}), using defaults");
                String::new()
            }
        },
    };
    Ok(toml::from_str(&contents)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    nebula_log::init(config.log_level.as_deref().unwrap_or(""));

    let (sender, receiver) = async_channel::unbounded();
    let manager = TransportManager::new(config.transport.clone(), sender);
    manager.register_factory(Arc::new(UdpFactory::new(config.transport.udp_bind)))?;
    manager.register_factory(Arc::new(TcpFactory::new(
        config.transport.connect_timeout(),
    )))?;

    let udp = manager.acquire_transport(TransportType::Udp, None).await?;
    info!("{} ready", udp.name());
    if let Some(addr) = config.tcp_listen {
        tcp::listen(&manager, addr).await?;
    }

    loop {
        tokio::select! {
            incoming = receiver.recv() => {
                let incoming = match incoming {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        error!("incoming channel closed {e}");
                        break;
                    }
                };
                match incoming.result {
                    Ok(msg) => info!(
                        "{} from {}:{} callid={}",
                        msg.method
                            .as_ref()
                            .map(|m| m.to_string())
                            .or_else(|| msg.code.map(|c| c.to_string()))
                            .unwrap_or_default(),
                        incoming.source.transport,
                        incoming.source.remote,
                        msg.callid.as_deref().unwrap_or(""),
                    ),
                    Err(e) => warn!(
                        "bad frame from {}:{}: {}",
                        incoming.source.transport, incoming.source.remote, e
                    ),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    manager.dump_transports();
    udp.release();
    manager.shutdown().await;
    Ok(())
}
