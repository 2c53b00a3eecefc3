use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cachet_server::config::ServerConfig;
use cachet_server::db;
use cachet_server::gateway::{PersistenceGateway, SqliteGateway};
use cachet_server::listener;
use cachet_server::push::apns::{ApnsBundle, ApnsProvider};
use cachet_server::push::gcm::GcmProvider;
use cachet_server::push::transport::{PushTransport, UreqTransport};
use cachet_server::push::PushProvider;
use cachet_server::server_state::ServerState;

/// Command-line arguments for the server daemon.
struct Args {
    config_path: String,
    db_path: String,
    socket_path: String,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut config_path = String::new();
    let mut db_path = String::new();
    let mut socket_path = String::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().unwrap_or_default(),
            "--db" => db_path = args.next().unwrap_or_default(),
            "--socket" => socket_path = args.next().unwrap_or_default(),
            _ => {}
        }
    }

    if config_path.is_empty() {
        config_path = dirs_fallback("cachet-server/config.json");
    }
    if db_path.is_empty() {
        db_path = dirs_fallback("cachet-server/server.db");
    }
    if socket_path.is_empty() {
        socket_path = default_socket_path();
    }

    Args {
        config_path,
        db_path,
        socket_path,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    tracing::info!("cachet-server starting");

    let args = parse_args();

    if let Some(parent) = std::path::Path::new(&args.db_path).parent() {
        std::fs::create_dir_all(parent).expect("failed to create db dir");
    }

    let config = ServerConfig::load(&args.config_path).expect("failed to load config");

    let conn = db::open_server_db(&args.db_path).expect("failed to open server database");
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::new(conn));

    let providers = build_providers(&config);
    let state = ServerState::new(config, gateway, providers);

    // Start the delivery listener
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let listener_state = Arc::clone(&state);
    let socket = args.socket_path.clone();
    let listener_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        listener::start_listener(&socket, listener_state, listener_shutdown_tx).await;
    });

    tracing::info!(socket = %args.socket_path, "cachet-server ready");

    // Wait for shutdown signal
    shutdown_rx.recv().await;

    tracing::info!("cachet-server shutting down");

    // Clean up socket file
    let _ = std::fs::remove_file(&args.socket_path);

    tracing::info!("cachet-server stopped");
}

/// Build the enabled push providers, GCM first (preferred channel).
fn build_providers(config: &ServerConfig) -> Vec<Arc<dyn PushProvider>> {
    let transport: Arc<dyn PushTransport> = Arc::new(UreqTransport::new(Duration::from_millis(
        config.push.provider_timeout_ms,
    )));
    let mut providers: Vec<Arc<dyn PushProvider>> = Vec::new();

    if config.gcm.enabled {
        if config.gcm.api_key.is_empty() {
            tracing::warn!("gcm enabled without an api key — provider disabled");
        } else {
            providers.push(Arc::new(GcmProvider::new(
                config.gcm.api_key.clone(),
                Arc::clone(&transport),
            )));
            tracing::info!("gcm push provider enabled");
        }
    }

    if config.apns.enabled {
        if config.apns.certificates.is_empty() {
            tracing::warn!("apns enabled without certificate bundles — provider disabled");
        } else {
            let bundles = config
                .apns
                .certificates
                .iter()
                .map(|c| ApnsBundle {
                    client_name: c.client_name.clone(),
                    production: c.production,
                    cert_path: c.cert_path.clone(),
                    cert_password: c.cert_password.clone(),
                })
                .collect();
            providers.push(Arc::new(ApnsProvider::new(bundles, Arc::clone(&transport))));
            tracing::info!(
                bundles = config.apns.certificates.len(),
                "apns push provider enabled"
            );
        }
    }

    if providers.is_empty() {
        tracing::info!("no push providers enabled — offline clients rely on reconnect");
    }
    providers
}

fn dirs_fallback(subpath: &str) -> String {
    let base = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{base}/.local/share/{subpath}")
}

fn default_socket_path() -> String {
    let tmp = std::env::temp_dir();
    tmp.join("cachet-server.sock")
        .to_string_lossy()
        .to_string()
}
