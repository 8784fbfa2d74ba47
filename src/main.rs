//! Mail host server binary.
//!
//! Serves the public and private mail APIs over plain HTTP; TLS
//! termination is the host environment's job (reverse proxy or load
//! balancer). Provisioning stays disabled unless domains are listed.

use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sealmail::crypto;
use sealmail::server::{self, AppState, ServerConfig};
use sealmail::store::Store;

#[derive(Debug, Parser)]
#[command(name = "sealmail-server", version, about = "Federated encrypted mail host")]
struct Args {
    /// Server port
    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// User data directory path
    #[arg(long, default_value = "/var/lib/sealmail")]
    data_dir: String,

    /// Public hostname served in the well-known delegation file
    #[arg(long, default_value = "")]
    hostname: String,

    /// Enable provisioning for the listed comma-separated domains
    #[arg(long, default_value = "")]
    provision: String,

    /// Delete stored messages older than this many days (0 keeps forever)
    #[arg(long, default_value_t = 0)]
    retention_days: u64,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // A host without working OS entropy must not come up at all.
    crypto::assert_prng();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sealmail=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = ServerConfig {
        mail_hostname: args.hostname.clone(),
        ..ServerConfig::default()
    };
    for domain in args.provision.split(',') {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            continue;
        }
        if sealmail::discovery::valid_hostname(&domain) {
            config.provisioning_domains.push(domain);
        } else {
            warn!(domain = %domain, "ignoring invalid provisioning domain");
        }
    }
    if args.retention_days > 0 {
        config.message_retention = Some(std::time::Duration::from_secs(
            args.retention_days * 24 * 3600,
        ));
    }

    let state = AppState::new(Store::new(&args.data_dir), config);

    if let Some(retention) = state.config.message_retention {
        spawn_retention_sweep(state.clone(), retention);
    }

    let app = server::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, data_dir = %args.data_dir, "starting sealmail server");

    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_retention_sweep(state: AppState, retention: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let store = state.store.clone();
            let result =
                tokio::task::spawn_blocking(move || store.sweep_all_expired(retention)).await;
            match result {
                Ok(Ok(removed)) if removed > 0 => {
                    info!(removed, "retention sweep removed expired messages")
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "retention sweep failed"),
                Err(e) => warn!(error = %e, "retention sweep task failed"),
            }
        }
    });
}
