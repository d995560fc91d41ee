//! subway
//!
//! Exposes local services through a public relay. The same binary runs
//! either end:
//! - `subway serve` hosts the relay: public TCP ports and subdomains
//! - `subway start` connects to a relay and forwards its traffic to local services
//!
//! Both ends speak one multiplexed WebSocket session carrying JSON control
//! messages and binary data frames.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

mod client;
mod config;
mod connection;
mod error;
mod http;
mod protocol;
mod registry;
mod server;
mod session;
mod tunnel;

use client::{TunnelClient, TunnelSpec};
use config::Config;
use protocol::Compression;
use server::{provider_for, RelayServer};
use session::SessionOptions;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_DOMAIN: &str = "subwayapp.dev";
const DEFAULT_PUBLIC_SCHEME: &str = "https";
const DEFAULT_SERVER: &str = "wss://localhost:5001/connect";

#[derive(Parser, Debug)]
#[command(name = "subway")]
#[command(author, version, about = "Expose local services through a public relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API token sent to the relay as a bearer token
    #[arg(short = 'k', long, global = true, env = "SUBWAY_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve(ServeArgs),

    /// Connect to a relay and expose local services
    Start(StartArgs),

    /// Save your API token
    Login(LoginArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address the public listener binds to
    #[arg(long, env = "SUBWAY_LISTEN")]
    listen: Option<String>,

    /// Base domain that tunnel subdomains hang off
    #[arg(long, env = "SUBWAY_DOMAIN")]
    domain: Option<String>,

    /// Scheme used in public tunnel URLs
    #[arg(long, env = "SUBWAY_PUBLIC_SCHEME", value_parser = ["http", "https"])]
    public_scheme: Option<String>,

    /// Tokens allowed to open sessions; anyone may connect when empty
    #[arg(long, env = "SUBWAY_ALLOWED_TOKENS", value_delimiter = ',')]
    allowed_tokens: Vec<String>,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Relay WebSocket URL
    #[arg(short, long, env = "SUBWAY_SERVER")]
    server: Option<String>,

    /// Relay port that echoes bytes back: <port>
    #[arg(long, value_parser = TunnelSpec::parse_echo)]
    echo: Vec<TunnelSpec>,

    /// Forward a relay port to a local TCP service: <port>:<host>:<port>
    #[arg(long, value_parser = TunnelSpec::parse_tcp)]
    tcp: Vec<TunnelSpec>,

    /// Forward a subdomain to a local HTTP server: <subdomain>:<host>:<port>
    #[arg(long, value_parser = TunnelSpec::parse_http)]
    http: Vec<TunnelSpec>,

    /// Forward a subdomain to a local HTTPS server: <subdomain>:<host>:<port>
    #[arg(long, value_parser = TunnelSpec::parse_https)]
    https: Vec<TunnelSpec>,

    /// Deflate data frames sent to the relay
    #[arg(long)]
    deflate: bool,
}

#[derive(Parser, Debug)]
struct LoginArgs {
    /// Relay WebSocket URL to remember with the token
    #[arg(short, long, env = "SUBWAY_SERVER")]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::load().unwrap_or_default();

    match cli.command {
        Commands::Serve(args) => run_serve(args, &config).await,
        Commands::Start(args) => run_start(cli.token, args, &config).await,
        Commands::Login(args) => run_login(args),
    }
}

async fn run_serve(args: ServeArgs, config: &Config) -> Result<()> {
    let listen = args
        .listen
        .or(config.server.listen.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let domain = args
        .domain
        .or(config.server.domain.clone())
        .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
    let scheme = args
        .public_scheme
        .or(config.server.public_scheme.clone())
        .unwrap_or_else(|| DEFAULT_PUBLIC_SCHEME.to_string());
    let tokens = if args.allowed_tokens.is_empty() {
        config.server.allowed_tokens.clone()
    } else {
        args.allowed_tokens
    };

    let relay = RelayServer::new(&domain, &scheme, provider_for(&tokens), SessionOptions::default());
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    let shutdown = relay.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    relay.serve(listener).await?;
    Ok(())
}

async fn run_start(cli_token: Option<String>, args: StartArgs, config: &Config) -> Result<()> {
    let server = args
        .server
        .or(config.auth.server.clone())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let server = Url::parse(&server).with_context(|| format!("Invalid server URL: {}", server))?;
    let token = cli_token.or(config.auth.token.clone());

    let tunnels: Vec<TunnelSpec> = args
        .echo
        .into_iter()
        .chain(args.tcp)
        .chain(args.http)
        .chain(args.https)
        .collect();
    if tunnels.is_empty() {
        anyhow::bail!("No tunnels specified. Use --echo, --tcp, --http or --https.");
    }

    let options = SessionOptions {
        compression: if args.deflate {
            Compression::Deflate
        } else {
            Compression::None
        },
        ..SessionOptions::default()
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    TunnelClient::new(server, token, tunnels, options)
        .run(shutdown)
        .await
}

fn run_login(args: LoginArgs) -> Result<()> {
    println!("Paste the API token issued by your relay operator.");
    println!();

    print!("API Token: ");
    use std::io::{self, Write};
    io::stdout().flush()?;

    let mut token = String::new();
    io::stdin().read_line(&mut token)?;
    let token = token.trim().to_string();

    if token.is_empty() {
        anyhow::bail!("No token provided");
    }

    let mut config = Config::load().unwrap_or_default();
    config.auth.token = Some(token);
    if let Some(server) = args.server {
        Url::parse(&server).with_context(|| format!("Invalid server URL: {}", server))?;
        config.auth.server = Some(server);
    }
    config.save()?;

    println!();
    println!(
        "Token saved to {:?}",
        Config::config_path().unwrap_or_default()
    );
    println!("You can now run: subway start --http <subdomain>:localhost:<port>");

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
