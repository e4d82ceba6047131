use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::process::ExitCode;
use tracing::{error, info, warn};

use quicloop::config::{self, loader, Command, QuicloopConfig};
use quicloop::netio::{create_client_socket, create_udp_socket};
use quicloop::{telemetry, ClientSession, DefaultEngine, ServerSession};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "fatal error");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = loader::parse_cli()?;

    if cli.print_default_config {
        print!("{}", loader::default_config_toml()?);
        return Ok(());
    }

    let config = config::load_config(&cli)?;
    telemetry::init_logging(config.logging.level, cli.verbose, &config.logging)
        .context("failed to initialize logging")?;

    match cli.command {
        Some(Command::Client(_)) => run_client(&config),
        Some(Command::Server(_)) => run_server(&config),
        None => anyhow::bail!("no command given, expected `client` or `server` (see --help)"),
    }
}

fn run_client(config: &QuicloopConfig) -> Result<()> {
    let peer = resolve(&config.client.url)?;
    let socket = create_client_socket(peer, &config.network)
        .with_context(|| format!("failed to open client socket towards {}", peer))?;

    let session = ClientSession::<DefaultEngine>::new(socket, peer, &config.client_transport(), &config.client)
        .context("failed to start client session")?;
    let report = session.run().context("client session failed")?;

    info!(
        state = %report.state,
        bytes = report.response.len(),
        iterations = report.iterations,
        "done"
    );

    if let Some(e) = report.error {
        anyhow::bail!("connection failed: {}", e);
    }
    if !report.response_complete {
        warn!("connection ended before the response completed");
    }
    Ok(())
}

fn run_server(config: &QuicloopConfig) -> Result<()> {
    let listen: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| quicloop::Error::address(&config.server.listen, e))?;
    let socket = create_udp_socket(listen, &config.network)
        .with_context(|| format!("failed to bind {}", listen))?;

    let mut session = ServerSession::<DefaultEngine>::new(socket, &config.transport, &config.server)
        .context("failed to start server session")?;
    session.run().context("server session failed")
}

fn resolve(url: &str) -> Result<SocketAddr> {
    url.to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", url))?
        .next()
        .with_context(|| format!("no address for {}", url))
}
