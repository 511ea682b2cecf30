use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_shutdown::ShutdownManager;
use chrono::Timelike;
use clap::Parser;
use env_logger::Env;
use ipaclinker::config::Config;
use ipaclinker::mapping::{MappingClient, MappingServer};
use ipaclinker::signal::server::SignalServer;
use ipaclinker_core::transport::TransportFactory;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file. Defaults are used when it does not exist.
    #[arg(short, long, default_value = "ipaclinker.json")]
    config: PathBuf,
    /// Log at debug level whatever the config says.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args { config, debug } = Args::parse();
    let config_path = config;
    let config = Config::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let level = if debug || config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
    if !config_path.exists() {
        log::warn!("config {} not found, using defaults", config_path.display());
    }

    let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc2::set_async_handler(async move {
        let _ = tx.send(()).await;
    })
    .await;

    let mut shutdowns: Vec<ShutdownManager<()>> = Vec::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.signal.enable {
        let port = config.signal.port;
        let server = SignalServer::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("signal server cannot listen on port {port}"))?;
        shutdowns.push(server.shutdown_manager());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                log::error!("signal server stopped e={e:?}");
            }
        }));
    }

    let servers = config.server_mappings()?;
    let clients = config.client_mappings()?;
    if !servers.is_empty() || !clients.is_empty() {
        let factory = transport(&config)?;
        for options in servers {
            let name = options.name.clone();
            let mapping = MappingServer::new(options, factory.clone());
            shutdowns.push(mapping.shutdown_manager());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = mapping.run().await {
                    log::error!("[{name}] server mapping stopped: {e}");
                }
            }));
        }
        for options in clients {
            let name = options.name.clone();
            let mapping = MappingClient::new(options, factory.clone());
            shutdowns.push(mapping.shutdown_manager());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = mapping.run().await {
                    log::error!("[{name}] client mapping stopped: {e}");
                }
            }));
        }
    }

    if tasks.is_empty() {
        log::info!("{}", ipaclinker::idle_message(chrono::Local::now().hour()));
        return Ok(());
    }

    let _ = quit.recv().await;
    log::info!("shutting down...");
    for shutdown_manager in shutdowns {
        _ = shutdown_manager.trigger_shutdown(());
    }
    for rs in futures::future::join_all(tasks).await {
        if let Err(e) = rs {
            log::warn!("task e={e:?}");
        }
    }
    Ok(())
}

#[cfg(feature = "webrtc")]
fn transport(config: &Config) -> anyhow::Result<Arc<dyn TransportFactory>> {
    use ipaclinker_core::transport::webrtc::WebRtcFactory;
    Ok(Arc::new(WebRtcFactory::new(config.ice_servers())))
}

#[cfg(not(feature = "webrtc"))]
fn transport(_config: &Config) -> anyhow::Result<Arc<dyn TransportFactory>> {
    anyhow::bail!("port mappings need a build with the `webrtc` feature")
}
