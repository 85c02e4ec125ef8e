//! Interactive command-line client for the relay server.

use anyhow::Context;
use clap::Parser;
use relay_cli::client::{ClientError, RelayClient, Reply, default_url, rustls_connector};
use serde_json::Map;
use std::{
    io::{Write, stdout},
    path::PathBuf,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const EXIT_WORDS: [&str; 3] = ["exit", "quit", "salir"];

#[derive(Parser, Debug)]
#[command(name = "relay-cli", version, about = "Chat with a model through the relay server")]
struct Args {
    /// Server URL. Defaults to wss://localhost:8080 when the certificate
    /// exists, ws://localhost:8080 otherwise.
    #[arg(long)]
    url: Option<String>,

    /// Shared token presented to the server.
    #[arg(long, env = "MCP_SERVER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// PEM certificate to trust for wss connections.
    #[arg(long, default_value = "certs/cert.pem")]
    cert: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    // Process default for wss URLs without a local certificate.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if args.token.is_none() {
        eprintln!("[warning] MCP_SERVER_TOKEN is not set. The server may refuse the connection.");
    }

    let cert_present = args.cert.is_file();
    let connector = if cert_present {
        Some(rustls_connector(&args.cert)?)
    } else {
        eprintln!("[warning] Certificate {:?} not found. Using an unencrypted connection.", args.cert);
        None
    };
    let url = args.url.unwrap_or_else(|| default_url(cert_present).to_string());

    let mut client = RelayClient::connect(&url, args.token.as_deref(), connector)
        .await
        .with_context(|| format!("Could not reach the relay server at {url}"))?;
    println!("Connected to {url}. Type 'exit' or 'quit' to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nYou: ");
        stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if EXIT_WORDS.contains(&line.trim().to_lowercase().as_str()) {
            break;
        }

        println!("\nModel:");
        let reply = client
            .send_prompt(&line, Map::new(), |fragment| {
                print!("{fragment}");
                let _ = stdout().flush();
            })
            .await;
        match reply {
            Ok(Reply::Completed(_)) => println!(),
            Ok(Reply::Rejected(message)) => println!("\n[server error] {message}"),
            Err(e @ ClientError::ConnectionClosed(_)) => {
                eprintln!("\nLost the connection to the server: {e}");
                return Ok(());
            }
            Err(e) => return Err(e).context("Exchange with the relay server failed"),
        }
    }

    client.close().await?;
    println!("Connection closed.");
    Ok(())
}
