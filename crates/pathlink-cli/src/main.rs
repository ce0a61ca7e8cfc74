//! Pathlink CLI
//!
//! Dial, listen and inspect path-aware addresses.

mod config;

use clap::{Parser, Subcommand};
use pathlink_core::{Address, IsdAs, PathResolver, split_host_port};
use pathlink_transport::{Conn, Dialer, Network};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use config::Config;

/// Pathlink - stream sockets over path-aware networks
#[derive(Parser)]
#[command(name = "pathlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify and normalize an address
    Parse {
        /// Address to parse
        address: String,
    },

    /// List known paths to a destination domain or address
    Paths {
        /// `ISD-AS` or a full address
        destination: String,
    },

    /// Run an echo server
    Listen {
        /// Bind address (defaults to network.listen_addr)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Send a message and print the reply
    Dial {
        /// Remote address
        address: String,

        /// Message to send (reads one line from stdin when absent)
        #[arg(short, long)]
        message: Option<String>,

        /// Skip server certificate verification
        #[arg(long)]
        insecure: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Parse { address } => parse_address(&address, &config),
        Commands::Paths { destination } => list_paths(&destination, &config).await,
        Commands::Listen { bind } => {
            let bind = bind.unwrap_or_else(|| config.network.listen_addr.clone());
            run_echo_server(&bind, &config).await
        }
        Commands::Dial {
            address,
            message,
            insecure,
        } => {
            let mut config = config;
            config.tls.insecure_skip_verify |= insecure;
            dial(&address, message, &config).await
        }
    }
}

/// Print how an address is classified
fn parse_address(address: &str, config: &Config) -> anyhow::Result<()> {
    match config.parser().classify(address)? {
        Address::PathAware(addr) => {
            println!("network:   scion");
            println!("canonical: {addr}");
            println!("isd-as:    {}", addr.ia);
            println!("host:      {}", addr.host);
            if let Some(zone) = &addr.zone {
                println!("zone:      {zone}");
            }
            println!("port:      {}", addr.port);
        }
        Address::Conventional { host, port } => {
            println!("network:   tcp");
            println!("host:      {host}");
            println!("port:      {port}");
        }
    }
    let (host, port) = split_host_port(address)?;
    match port {
        Some(port) => println!("split:     {host} / {port}"),
        None => println!("split:     {host} / (default port)"),
    }
    Ok(())
}

/// Print the resolver's paths to a destination
async fn list_paths(destination: &str, config: &Config) -> anyhow::Result<()> {
    let resolver = config.resolver()?;
    let ia = match destination.parse::<IsdAs>() {
        Ok(ia) => ia,
        Err(_) => {
            config
                .parser()
                .resolve(&resolver, destination)
                .await?
                .ia
        }
    };

    let paths = resolver.query_paths(ia).await?;
    if paths.is_empty() {
        println!("no paths from {} to {ia}", resolver.local_ia());
        return Ok(());
    }

    println!("{} path(s) from {} to {ia}:", paths.len(), resolver.local_ia());
    for (i, path) in paths.iter().enumerate() {
        let hop = path
            .next_hop
            .map_or_else(|| "direct".to_string(), |hop| hop.to_string());
        let latency = path
            .metadata
            .latency
            .map_or_else(|| "-".to_string(), |l| format!("{}ms", l.as_millis()));
        println!("  [{i}] {path}  next-hop {hop}  latency {latency}");
    }
    Ok(())
}

fn network(config: &Config) -> anyhow::Result<Network> {
    let resolver: Arc<dyn PathResolver> = Arc::new(config.resolver()?);
    let mut dialer = Dialer::new(resolver, config.client_tls()?)
        .with_parser(config.parser())
        .with_config(config.session_config()?);
    if let Some(name) = &config.tls.server_name {
        dialer = dialer.with_server_name(name.clone());
    }
    Ok(Network::new(dialer, config.credential()?))
}

/// Accept connections and echo every byte back
async fn run_echo_server(bind: &str, config: &Config) -> anyhow::Result<()> {
    // Listening never verifies peers; only the credential matters
    let mut config = config.clone();
    config.tls.insecure_skip_verify = true;
    let listener = network(&config)?.listen(bind).await?;
    println!("listening on {}", listener.local_addr());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let conn = accepted?;
                tokio::spawn(async move {
                    let remote = conn.remote_addr();
                    if let Err(e) = echo(conn).await {
                        tracing::warn!(%remote, "echo failed: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down");
                listener.close().await;
                return Ok(());
            }
        }
    }
}

async fn echo(mut conn: Box<dyn Conn>) -> std::io::Result<()> {
    tracing::info!(remote = %conn.remote_addr(), "connection accepted");
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        conn.write_all(&buf[..n]).await?;
    }
    conn.shutdown().await?;
    conn.close().await
}

/// Send one message and print the echoed reply
async fn dial(address: &str, message: Option<String>, config: &Config) -> anyhow::Result<()> {
    let message = match message {
        Some(message) => message,
        None => {
            let mut line = String::new();
            BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };

    let mut conn = network(config)?.dial(address).await?;
    tracing::info!(local = %conn.local_addr(), remote = %conn.remote_addr(), "connected");

    conn.write_all(message.as_bytes()).await?;
    conn.shutdown().await?;
    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await?;
    conn.close().await?;

    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
