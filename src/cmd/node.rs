use clap::Parser;
use std::net::SocketAddr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use voicemesh::mesh::{config, Mesh, NodeConfig, RosterEvent};

/// Mesh voice chat node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Display name shown to other members (1-18 chars)
    #[arg(short, long)]
    name: Option<String>,

    /// Join an existing call at this address instead of hosting one
    #[arg(short, long)]
    join: Option<SocketAddr>,

    /// Port for the control listener and the audio socket
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish(),
    )?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_tracing() {
        eprintln!("failed to initialize logging: {}", e);
        return;
    }

    let mut node_config = match &args.config {
        Some(path) => match config::load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!("{:#}", e);
                return;
            }
        },
        None => NodeConfig::default(),
    };
    if let Some(name) = args.name {
        node_config.display_name = name;
    }
    if let Some(port) = args.port {
        node_config.listen_port = port;
    }

    let mesh = Mesh::new(&node_config);
    let mut roster = mesh.subscribe();

    let started = match args.join {
        Some(target) => mesh.join(target).await,
        None => mesh.host().await,
    };
    if !started {
        tracing::error!("could not start the call");
        return;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = roster.recv() => match event {
                Some(RosterEvent::PeerJoined { id, addr }) => {
                    tracing::info!("peer {} joined from {}", id, addr);
                }
                Some(RosterEvent::PeerLeft { id, addr }) => {
                    tracing::info!("peer {} at {} left", id, addr);
                }
                Some(RosterEvent::PeerNamed { id, name }) => {
                    tracing::info!("peer {} goes by {}", id, name);
                }
                None => break,
            }
        }
    }

    mesh.disconnect().await;
}
