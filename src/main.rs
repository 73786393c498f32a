use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use xmppc::{ConnectionConfig, ConnectionEvent, XmppClient};

fn print_help() {
    println!(
        "\
xmppc v{}

A reference XMPP client endpoint: connects, authenticates, and stays online.

USAGE:
    xmppc [OPTIONS] [<domain> <username> <password>]

ARGUMENTS:
    domain      XMPP service domain (fallback: XMPP_DOMAIN)
    username    account localpart (fallback: XMPP_USER)
    password    account password (fallback: XMPP_PASSWORD)

OPTIONS:
    --config <PATH>    Load a TOML configuration file instead of using
                       positional arguments
    -h, --help         Print this help message and exit
    -V, --version      Print version and exit

ENVIRONMENT VARIABLES:
    RUST_LOG        Log level filter for tracing (e.g. debug, xmppc=debug)
    XMPP_DOMAIN     Service domain when no positional argument is given
    XMPP_USER       Username when no positional argument is given
    XMPP_PASSWORD   Password when no positional argument is given
    XMPP_HOST       Connect to this host instead of resolving DNS SRV
    XMPP_PORT       Connect to this port instead of the default 5222/5223

EXIT STATUS:
    0   clean disconnect
    1   XMPP error (connect, TLS, authentication, stream failure)",
        env!("CARGO_PKG_VERSION"),
    );
}

fn env_fallback(value: Option<String>, var: &str) -> Option<String> {
    value.or_else(|| std::env::var(var).ok())
}

fn build_config() -> Result<ConnectionConfig> {
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("xmppc v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" => {
                config_path = Some(
                    args.next()
                        .ok_or_else(|| anyhow!("--config requires a file path"))?,
                );
            }
            other if other.starts_with('-') => {
                return Err(anyhow!("unknown option '{other}' (try --help)"));
            }
            _ => positional.push(arg),
        }
    }

    if let Some(path) = config_path {
        return ConnectionConfig::load(&path).with_context(|| format!("loading {path}"));
    }

    let mut positional = positional.into_iter();
    let domain = env_fallback(positional.next(), "XMPP_DOMAIN")
        .ok_or_else(|| anyhow!("missing <domain> (or XMPP_DOMAIN); try --help"))?;
    let username = env_fallback(positional.next(), "XMPP_USER")
        .ok_or_else(|| anyhow!("missing <username> (or XMPP_USER); try --help"))?;
    let password = env_fallback(positional.next(), "XMPP_PASSWORD")
        .ok_or_else(|| anyhow!("missing <password> (or XMPP_PASSWORD); try --help"))?;

    let mut builder = ConnectionConfig::builder()
        .service_domain(domain)
        .username(username)
        .password(password);
    if let Ok(host) = std::env::var("XMPP_HOST") {
        builder = builder.host(host);
    }
    if let Ok(port) = std::env::var("XMPP_PORT") {
        builder = builder.port(port.parse().context("XMPP_PORT must be a port number")?);
    }
    builder.build().context("invalid configuration")
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xmppc=info")),
        )
        .init();

    let config = match build_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "connecting to {} as {}",
        config.connection.service_domain, config.auth.username
    );

    let client = Arc::new(XmppClient::new(config));
    client.on_event(|event| match event {
        ConnectionEvent::Connected => info!("transport connected, negotiating"),
        ConnectionEvent::Authenticated { .. } => info!("session active"),
        ConnectionEvent::ConnectionClosed => info!("connection closed"),
        ConnectionEvent::ConnectionClosedOnError { cause } => {
            warn!("connection closed on error: {cause}")
        }
    });

    let mut runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let outcome = tokio::select! {
        joined = &mut runner => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, closing stream");
            client.disconnect();
            match tokio::time::timeout(Duration::from_secs(5), &mut runner).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("close did not finish in time, aborting");
                    runner.abort();
                    return ExitCode::SUCCESS;
                }
            }
        }
    };

    match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("XMPP error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("client task failed: {e}");
            ExitCode::FAILURE
        }
    }
}
