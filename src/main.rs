//! simpledb: a minimal text query server and client
//!
//! Commands:
//! - `serve`: accept connections and answer queries from the resolver table
//! - `query`: send queries to a running server and print the responses
//! - `demo`: run a server in-process and query it with the sample queries
//!
//! Configuration via CLI arguments or TOML file.

use simpledb::config::{Command, Config};
use simpledb::{ClientConfig, Connector, Server};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Queries issued by the `demo` command.
const DEMO_QUERIES: [&str; 3] = [
    "SELECT name FROM users WHERE id = 1;",
    "SELECT version();",
    "UPDATE users SET name = 'test';",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.command.clone() {
        Command::Serve(_) => run_server(config).await,
        Command::Query(args) => run_queries(config.client, &args.queries).await,
        Command::Demo(_) => run_demo(config).await,
    }
}

/// Serve until interrupted.
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.server.listen,
        max_connections = config.server.max_connections,
        max_request_size = config.server.max_request_size,
        entries = config.resolver.entries.len(),
        "Starting simpledb server"
    );

    let resolver = Arc::new(config.resolver.build());
    let server = Server::bind(config.server, resolver).await?;
    server.run(shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}

/// Execute each query in order over one scoped connection.
async fn run_queries(client: ClientConfig, queries: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut connector = Connector::new(client);
    let mut session = connector.scope().await;
    if let Some(e) = session.connect_error() {
        return Err(e.to_string().into());
    }

    for query in queries {
        let response = session.execute(query).await?;
        println!("{response}");
    }
    Ok(())
}

/// Start a server in the background and walk through the sample queries.
async fn run_demo(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = Arc::new(config.resolver.build());
    let server = Server::bind(config.server, resolver).await?;
    let addr = server.local_addr();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run(async move {
        let _ = stop_rx.await;
    }));

    let client = ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..config.client
    };
    let mut connector = Connector::new(client);
    {
        let mut session = connector.scope().await;
        if session.is_connected() {
            for query in DEMO_QUERIES {
                match session.execute(query).await {
                    Ok(response) => println!("{query} => {response}"),
                    Err(e) => {
                        error!(query, error = %e, "Demo query failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = stop_tx.send(());
    server_task.await??;
    Ok(())
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
