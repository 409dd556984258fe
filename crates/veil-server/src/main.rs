use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veil_auth::{Authenticator, MemoryAuthenticator};
use veil_config::{apply_overrides, load_config, validate_config, CliOverrides, Config};
use veil_server::{forward, Server, ServerError, TlsUnderlay};

#[derive(Parser, Debug)]
#[command(name = "veil-server", version, about = "Trojan tunneling server with anti-probing fallback")]
struct Args {
    /// Config file path (json/yaml/toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    #[command(flatten)]
    overrides: CliOverrides,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args.overrides);
    validate_config(&config)?;

    let level = config.logging.level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let auth = build_authenticator(&config).await?;

    let listen: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|_| ServerError::Config("invalid listen address".into()))?;
    let underlay = Arc::new(TlsUnderlay::bind(listen, &config.tls).await?);
    info!(address = %listen, "listening");

    let server = Server::new(&config, underlay, auth).await?;

    // Graceful shutdown on SIGTERM/SIGINT: closing the server unblocks
    // every consumer loop below.
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        shutdown_server.close();
    });

    tokio::try_join!(
        forward::run_stream_forwarder(server.clone()),
        forward::run_packet_forwarder(server.clone()),
        forward::run_mux_drain(server.clone()),
    )?;

    info!("server stopped");
    Ok(())
}

async fn build_authenticator(config: &Config) -> Result<Arc<dyn Authenticator>, ServerError> {
    if config.auth.mysql.enabled {
        #[cfg(feature = "mysql")]
        {
            let auth = veil_auth::MySqlAuthenticator::connect(veil_auth::MySqlAuthenticatorConfig {
                url: config.auth.mysql.url.clone(),
                flush_interval: std::time::Duration::from_secs(
                    config.auth.mysql.flush_interval_secs,
                ),
                ip_limit: config.auth.ip_limit,
            })
            .await
            .map_err(|err| ServerError::Config(format!("mysql authenticator: {err}")))?;
            info!("mysql authenticator connected");
            return Ok(Arc::new(auth));
        }
        #[cfg(not(feature = "mysql"))]
        return Err(ServerError::Config(
            "auth.mysql.enabled requires the `mysql` build feature".into(),
        ));
    }
    info!(
        user_count = config.auth.passwords.len(),
        ip_limit = config.auth.ip_limit,
        "in-memory authenticator"
    );
    Ok(Arc::new(MemoryAuthenticator::from_passwords(
        &config.auth.passwords,
        config.auth.ip_limit,
    )))
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
