use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lanlink::discovery::DiscoveryServicesListener;
use lanlink::{
    Client, ClientOptions, ClientTls, DataProcessor, Discover, DiscoveryService, NodeConfig, Peer, Publisher, Server,
    ServerOptions, ServerTls, TlsIdentity, TrustStore,
};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "lanlink")]
#[command(about = "Framed LAN connections with heartbeats, TLS bootstrap and discovery")]
struct Args {
    /// Node configuration file (JSON)
    #[arg(short, long, default_value = "lanlink.json")]
    config: PathBuf,

    /// Also write logs to daily rotated files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and print received frames
    Serve {
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Send every received frame back
        #[arg(long)]
        echo: bool,
        /// Advertise the server on the local network
        #[arg(long)]
        publish: bool,
    },
    /// Connect to a server and send stdin lines
    Connect {
        addr: SocketAddr,
        #[arg(long, default_value = "server")]
        remote_id: String,
    },
    /// Print services appearing and disappearing
    Discover {
        #[arg(long)]
        service_type: Option<String>,
    },
    /// Advertise a service until Ctrl-C
    Publish {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        extra: Option<String>,
    },
    /// Generate a self-signed certificate and key (DER)
    GenIdentity {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Write the effective configuration to the config file
    InitConfig,
}

fn init_logging(log_dir: Option<&Path>) -> CliResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanlink=info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "lanlink");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .with(fmt::layer().with_target(false).compact())
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false).compact())
                .init();
            Ok(None)
        }
    }
}

fn load_identity(config: &NodeConfig) -> CliResult<TlsIdentity> {
    let identity = match (&config.tls.cert_file, &config.tls.key_file) {
        (Some(cert), Some(key)) => TlsIdentity::load_or_generate(cert, key, &config.node_id)?,
        _ => TlsIdentity::generate(vec![config.node_id.clone()])?,
    };
    Ok(identity)
}

fn load_trust(config: &NodeConfig) -> CliResult<TrustStore> {
    let trust = match &config.tls.trust_store_file {
        Some(path) => TrustStore::load(path)?,
        None => TrustStore::new(),
    };
    trust.set_auto_add(config.tls.auto_trust);
    Ok(trust)
}

struct Printer {
    echo: bool,
}

impl DataProcessor for Printer {
    fn process_text(&self, peer: &Peer, data: &str) -> bool {
        println!("[{}] {}", peer.remote_id(), data);
        if self.echo {
            let peer = peer.clone();
            let data = data.to_string();
            tokio::spawn(async move {
                if let Err(e) = peer.send_text(&data).await {
                    warn!("Echo to '{}' failed: {}", peer.remote_id(), e);
                }
            });
        }
        true
    }
}

struct ServicePrinter;

impl DiscoveryServicesListener for ServicePrinter {
    fn on_service_discovered(&self, service: &DiscoveryService) {
        println!("+ {} {}", service, service.extra.as_deref().unwrap_or(""));
    }

    fn on_service_lost(&self, service: &DiscoveryService) {
        println!("- {}", service);
    }
}

async fn serve(config: NodeConfig, listen: Option<SocketAddr>, echo: bool, publish: bool) -> CliResult<()> {
    let bind = listen.unwrap_or(config.listen);
    let mut options = ServerOptions::new(config.node_id.clone(), bind)
        .protocol(config.protocol.clone())
        .config(config.peer.clone());
    if config.tls.enabled {
        let mut tls = ServerTls::new(load_identity(&config)?, load_trust(&config)?)
            .require_client_auth(config.tls.require_client_auth)
            .cert_sharing(config.tls.cert_sharing);
        tls.cert_sharing_timeout = config.tls.cert_sharing_timeout;
        options = options.tls(tls);
    }

    let server = Server::new(options, Arc::new(Printer { echo }));
    server.startup().await?;
    let port = server.local_addr().map(|a| a.port()).unwrap_or(bind.port());

    let publisher = if publish {
        let name = config.service_name.clone().unwrap_or_else(|| config.node_id.clone());
        let publisher = Publisher::new(&config.discovery, config.service_type.clone(), name, port, None)?;
        publisher.publish(true).await?;
        Some(publisher)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    if let Some(publisher) = publisher {
        publisher.hide(true).await?;
    }
    server.shutdown().await?;
    Ok(())
}

async fn connect(config: NodeConfig, addr: SocketAddr, remote_id: String) -> CliResult<()> {
    let mut options = ClientOptions::new(config.node_id.clone(), remote_id, addr)
        .protocol(config.protocol.clone())
        .config(config.peer.clone())
        .reconnect(config.reconnect);
    if config.tls.enabled {
        let mut tls = ClientTls::new(Some(load_identity(&config)?), load_trust(&config)?)
            .with_cert_sharing(config.tls.cert_sharing);
        tls.cert_sharing_timeout = config.tls.cert_sharing_timeout;
        options = options.tls(tls);
    }

    let client = Client::connect_new(options, Arc::new(Printer { echo: false })).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = client.closed() => {
                info!("Connection closed: {:?}", client.disconnection_reason());
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => client.send_text(&line).await?,
                None => break,
            },
        }
    }
    if !client.state().is_disconnected() {
        client.disconnect().await?;
    }
    Ok(())
}

async fn discover(config: NodeConfig, service_type: Option<String>) -> CliResult<()> {
    let discover = Discover::new(&config.discovery, service_type.unwrap_or(config.service_type))?;
    discover.add_services_listener(Arc::new(ServicePrinter));
    discover.start().await?;
    tokio::signal::ctrl_c().await?;
    discover.stop().await?;
    Ok(())
}

async fn publish(config: NodeConfig, name: Option<String>, port: Option<u16>, extra: Option<String>) -> CliResult<()> {
    let name = name
        .or_else(|| config.service_name.clone())
        .unwrap_or_else(|| config.node_id.clone());
    let publisher = Publisher::new(
        &config.discovery,
        config.service_type.clone(),
        name,
        port.unwrap_or(config.listen.port()),
        extra,
    )?;
    publisher.publish(true).await?;
    println!(
        "Published '{}' (fully: {}, interfaces: {:?})",
        publisher.service_name(),
        publisher.is_published_fully(),
        publisher.interfaces()
    );
    tokio::signal::ctrl_c().await?;
    publisher.hide(true).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let args = Args::parse();
    let _guard = init_logging(args.log_dir.as_deref())?;
    let config = NodeConfig::load_or_default(&args.config);

    match args.command {
        Command::Serve { listen, echo, publish } => serve(config, listen, echo, publish).await,
        Command::Connect { addr, remote_id } => connect(config, addr, remote_id).await,
        Command::Discover { service_type } => discover(config, service_type).await,
        Command::Publish { name, port, extra } => publish(config, name, port, extra).await,
        Command::GenIdentity { cert, key, name } => {
            let identity = TlsIdentity::generate(vec![name.unwrap_or(config.node_id)])?;
            identity.save(&cert, &key)?;
            println!("Wrote {} and {}", cert.display(), key.display());
            Ok(())
        }
        Command::InitConfig => {
            config.save_to_file(&args.config)?;
            println!("Wrote {}", args.config.display());
            Ok(())
        }
    }
}
