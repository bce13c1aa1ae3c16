use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use idlink_core::{ConsolidatedIdentity, IdentifyRequest};
use idlink_storage::ContactStore;
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: String,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "idlink-server")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct AppState {
    store: Mutex<ContactStore>,
}

#[derive(Serialize)]
struct IdentifyResponse {
    contact: ConsolidatedIdentity,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match ContactStore::open(&config.db_path) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "store_open_failed", error = %err, db = %config.db_path);
            return;
        }
    };

    let state = Arc::new(AppState {
        store: Mutex::new(store),
    });
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_failed", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(event = "server_start", addr = %config.addr, db = %config.db_path);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(event = "server_error", error = %err);
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn identify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdentifyRequest>,
) -> Response {
    let fragment = match request.normalize() {
        Ok(fragment) => fragment,
        Err(err) => {
            warn!(event = "identify_rejected", error = %err);
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "email or phoneNumber required",
                }),
            )
                .into_response();
        }
    };

    // The lock is released before any await point; the store's own
    // transaction covers cross-process writers.
    let outcome = match state.store.lock() {
        Ok(mut store) => store.resolve_identity(&fragment),
        Err(_) => {
            error!(event = "store_lock_poisoned");
            return internal_error();
        }
    };

    match outcome {
        Ok(outcome) => {
            info!(
                event = "identity_resolved",
                primary_id = outcome.identity.primary_contact_id,
                created_id = ?outcome.created_id,
                demoted = outcome.demoted_primaries.len()
            );
            (
                StatusCode::OK,
                Json(IdentifyResponse {
                    contact: outcome.identity,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!(event = "identify_storage_error", error = %err);
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "Internal Server Error",
        }),
    )
        .into_response()
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        db_path: resolve_db_path(&args.db),
        debug: args.debug || env_true("IDLINK_DEBUG"),
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("IDLINK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("IDLINK_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:8080".to_string()
}

fn resolve_db_path(db_flag: &str) -> String {
    if !db_flag.trim().is_empty() {
        return db_flag.to_string();
    }
    if let Ok(value) = std::env::var("IDLINK_DB") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "idlink.db".to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
