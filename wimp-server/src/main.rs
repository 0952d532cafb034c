// wimp-node: one process on a WIMP network. Logs LOG, answers PING, exits on EXIT.
// With --echo, sends any other instruction straight back.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wimp_server::{config, Frame, LocalServer, Relation, EXIT, LOG, PING};

const POLL: Duration = Duration::from_millis(100);

/// A peer given on the command line as `name@host:port`.
#[derive(Debug, Clone)]
struct PeerArg {
    name: String,
    host: String,
    port: u16,
}

impl FromStr for PeerArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, addr) = s
            .split_once('@')
            .ok_or_else(|| format!("expected name@host:port, got {s:?}"))?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {s:?}"))?;
        let port = port.parse::<u16>().map_err(|e| format!("bad port in {s:?}: {e}"))?;
        if !wimp_core::protocol::is_valid_name(name) {
            return Err(format!("invalid process name {name:?}"));
        }
        Ok(Self {
            name: name.to_string(),
            host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
            port,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "wimp-node", version)]
#[command(about = "Run one process of a WIMP instruction network")]
struct Args {
    /// This process's name (1 to 32 bytes)
    name: String,

    /// Host to listen on (overrides config)
    #[arg(long)]
    domain: Option<String>,

    /// Port to listen on, 0 = auto-assign (overrides config)
    #[arg(short, long, alias = "process-port")]
    port: Option<u16>,

    /// Parent's port on --domain; declares the parent as a peer
    #[arg(long)]
    master_port: Option<u16>,

    /// Parent's name, used with --master-port
    #[arg(long, default_value = "master")]
    master_name: String,

    /// Peer to connect, as name@host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<PeerArg>,

    /// Relation of the declared peers to this process
    #[arg(long, default_value = "independent")]
    relation: Relation,

    /// Send this text as a LOG instruction to every peer once connected
    #[arg(long)]
    say: Option<String>,

    /// Send every other instruction back to its source unchanged
    #[arg(long)]
    echo: bool,

    /// Config file (default ~/.config/wimp/config.toml, then /etc/wimp/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut cfg = match &args.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    if let Some(domain) = &args.domain {
        cfg.domain = domain.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args, cfg))
}

async fn run(args: Args, cfg: config::Config) -> Result<()> {
    if args.say.is_some() && args.peers.is_empty() {
        bail!("--say needs at least one --peer");
    }
    let mut server = LocalServer::init(&args.name, cfg)
        .await
        .with_context(|| format!("starting {}", args.name))?;
    info!("wimp-node {} on port {}", server.name(), server.port());

    if let Some(port) = args.master_port {
        let domain = server.config().domain.clone();
        server
            .add_process(&args.master_name, &domain, port, Relation::Parent)
            .await
            .with_context(|| format!("adding parent {}", args.master_name))?;
    }
    for peer in &args.peers {
        server
            .add_process(&peer.name, &peer.host, peer.port, args.relation)
            .await
            .with_context(|| format!("adding {}", peer.name))?;
    }

    if let Some(text) = &args.say {
        let mut payload = text.clone().into_bytes();
        payload.push(0);
        for peer in &args.peers {
            if !server.check_process_listening(&peer.name).await {
                warn!("{} is not listening; not sending", peer.name);
                continue;
            }
            server.enqueue_outgoing(&peer.name, LOG, &payload)?;
        }
        report(server.flush().await?);
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let next = tokio::select! {
            r = &mut shutdown => {
                r?;
                info!("shutdown requested");
                break;
            }
            f = server.wait_instruction(POLL) => f,
        };
        let Some(first) = next else { continue };
        let mut batch = vec![first];
        batch.extend(server.lock_queue().drain_all());
        let exit = handle_batch(&mut server, batch, args.echo).await?;
        if server.outgoing_len() > 0 {
            report(server.flush().await?);
        }
        if exit {
            break;
        }
    }
    server.close().await;
    Ok(())
}

/// Act on a drained batch. Returns true once EXIT was seen.
async fn handle_batch(server: &mut LocalServer, batch: Vec<Frame>, echo: bool) -> Result<bool> {
    for frame in batch {
        if frame.dest() != server.name() {
            if let Err(frame) = server.forward(frame).await {
                warn!(
                    "no route from {} to {}; dropping opcode {}",
                    frame.source(),
                    frame.dest(),
                    frame.opcode()
                );
            }
            continue;
        }
        match frame.opcode() {
            EXIT => {
                info!("EXIT from {}", frame.source());
                return Ok(true);
            }
            LOG => match frame.payload_str() {
                Some(text) => info!("[{}] {}", frame.source(), text),
                None => warn!("[{}] LOG payload is not UTF-8", frame.source()),
            },
            PING => {
                debug!("PING from {}", frame.source());
                server.enqueue_outgoing(frame.source(), PING, &[])?;
            }
            other if echo => {
                debug!("echoing opcode {} to {}", other, frame.source());
                server.enqueue_outgoing(frame.source(), other, frame.payload())?;
            }
            other => debug!(
                "ignoring opcode {} from {} ({} bytes)",
                other,
                frame.source(),
                frame.arg_size()
            ),
        }
    }
    Ok(false)
}

fn report(report: wimp_server::FlushReport) {
    for (dest, count) in &report.sent {
        debug!("sent {} instructions to {}", count, dest);
    }
    for (dest, count, err) in &report.failed {
        warn!("{} instructions for {} dropped: {}", count, dest, err);
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
