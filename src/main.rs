//! `signalhub` — a WebRTC signaling and rendezvous broker.
//!
//! Pairs every connected user with every registered service and drives
//! each pair through offer/answer/ICE exchange until a peer-to-peer data
//! channel opens between them (`SPEC_FULL.md` §1).

mod client;
mod config;
mod error;
mod hub;
mod peer;
mod protocol;
mod server;
mod storage;

use config::{BrokerConfig, ServiceConfig};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "signalhub", version, about = "WebRTC signaling and rendezvous broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Raise the tracing log level to debug.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker: listen for service and user websocket connections.
    Server {
        /// Address to listen on.
        #[arg(long, default_value = ":8080", env = "BROKER_ADDR")]
        addr: String,

        /// Storage driver name (see `storage::resolve`).
        #[arg(long, default_value = "mdbx", env = "BROKER_DRIVER")]
        driver: String,
    },
    /// Run a service endpoint: dial the broker and reconnect on drop.
    Client {
        /// Broker websocket URL to dial.
        #[arg(long, default_value = "ws://localhost:8080", env = "BROKER_SERVER")]
        server: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Server { addr, driver } => run_server(BrokerConfig { addr, driver }).await,
        Command::Client { server } => client::dial::run(ServiceConfig { server }).await,
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "exiting with error");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "signalhub=debug,tower_http=debug"
    } else {
        "signalhub=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Resolves and initializes the storage driver, then serves the broker's
/// websocket listener until the process exits.
async fn run_server(config: BrokerConfig) -> error::Result<()> {
    let driver = storage::resolve(&config.driver)?;
    driver.initialize().await?;

    let addr = normalize_addr(&config.addr);
    let registry = server::Registry::new();
    let app = server::listener::router(registry);

    tracing::info!(addr = %addr, driver = %config.driver, "signalhub broker starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| error::Error::Config(format!("failed to bind {addr}: {err}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|err| error::Error::Transport(err.to_string()))
}

/// `:8080`-style addresses bind every interface; axum/tokio want an
/// explicit host, so an address with no host segment is given one.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_addr_fills_in_wildcard_host() {
        assert_eq!(normalize_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
