use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use chaski::{
    CaAttributes, ChaskiCa, ChaskiNode, ChaskiRemote, ChaskiStreamer, NodeConfig, ProxyHandler,
    ProxyRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "chaski")]
#[command(author, version, about = "Chaski-Confluent mesh node", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cli,
}

#[derive(Subcommand, Debug)]
enum Cli {
    /// Run the certificate authority node.
    Ca {
        /// Overrides $CHASKI_CERTIFICATE_AUTHORITY.
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long, default_value = "chaski_ca")]
        dir: PathBuf,
    },
    /// Run the streamer root node (paired on connect).
    Root {
        /// Overrides $CHASKI_STREAMER_ROOT.
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long, default_value = "StreamerRoot")]
        name: String,
    },
    /// Run a remote proxy node exposing the listed module paths.
    Remote {
        /// Overrides $CHASKI_REMOTE_PROXY.
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long, default_value = "ChaskiRemote")]
        name: String,
        /// Module paths allowed for proxy_call.
        modules: Vec<String>,
    },
    /// Ask local nodes in a port range to drop their connections.
    Terminate {
        /// Port range, e.g. 65430-65440.
        range: String,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Cli::Ca { port, dir } => {
            let port = resolve_port(port, "CHASKI_CERTIFICATE_AUTHORITY", 65432);
            let config = NodeConfig::default()
                .with_name("ChaskiCA")
                .with_port(port);
            let ca = ChaskiCa::start(config, dir, CaAttributes::default())
                .await
                .context("CA startup failed")?;
            info!(address = %ca.address(), "certificate authority serving");
            tokio::signal::ctrl_c().await?;
            ca.stop().await;
        }
        Cli::Root { port, name } => {
            let port = resolve_port(port, "CHASKI_STREAMER_ROOT", 65433);
            let config = NodeConfig::default()
                .with_name(name)
                .with_port(port)
                .with_paired(true);
            let root = ChaskiStreamer::start(config)
                .await
                .context("streamer root startup failed")?;
            info!(address = %root.address(), "streamer root serving");
            tokio::signal::ctrl_c().await?;
            root.stop().await;
        }
        Cli::Remote {
            port,
            name,
            modules,
        } => {
            // The CLI provides transport only; marshaling lives in the
            // application embedding the proxy layer.
            let handler: ProxyHandler = Arc::new(|call| {
                Err(format!(
                    "no handler registered for {}.{}",
                    call.module_path, call.attr_path
                ))
            });
            let registry = ProxyRegistry::new(modules, handler);
            let port = resolve_port(port, "CHASKI_REMOTE_PROXY", 65432);
            let config = NodeConfig::default().with_name(name).with_port(port);
            let remote = ChaskiRemote::start(config, registry)
                .await
                .context("remote proxy startup failed")?;
            info!(address = %remote.address(), "remote proxy serving");
            tokio::signal::ctrl_c().await?;
            remote.stop().await;
        }
        Cli::Terminate { range, host } => {
            let (start, end) = range
                .split_once('-')
                .context("range must look like START-END")?;
            let start: u16 = start.parse().context("invalid range start")?;
            let end: u16 = end.parse().context("invalid range end")?;

            let node = ChaskiNode::start(
                NodeConfig::default()
                    .with_name("Terminator")
                    .with_reconnections(Some(0)),
            )
            .await?;
            let mut terminated = 0usize;
            for port in start..=end {
                let target = format!("ChaskiNode@{host}:{port}");
                match node.connect(&target).await {
                    Ok(address) => {
                        if node.terminate_peer(&address).await.is_ok() {
                            terminated += 1;
                            info!(peer = %address, "terminate sent");
                        }
                    }
                    Err(e) => {
                        warn!(target = %target, error = %e, "no node answered");
                    }
                }
            }
            // Let the queued terminate frames reach the wire before closing.
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            info!(terminated, "terminate sweep finished");
            node.stop().await;
        }
    }
    Ok(())
}

/// Flag > environment address > built-in default. The environment variables
/// hold full addresses (`ChaskiCA@127.0.0.1:65432`); only the port is used
/// for binding.
fn resolve_port(flag: Option<u16>, env_var: &str, fallback: u16) -> u16 {
    if let Some(port) = flag {
        return port;
    }
    if let Ok(value) = std::env::var(env_var) {
        if let Ok(address) = value.parse::<chaski::Address>() {
            return address.port;
        }
        warn!(var = env_var, value = %value, "ignoring unparseable address");
    }
    fallback
}
