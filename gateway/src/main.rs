use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;

use relay_core::config::Config;
use relay_core::endpoints::{admin, inference, status};
use relay_core::gateway_util::AppStateData;
use relay_core::observability::{setup_observability, LogFormat};

/// Interval between rate-limit bucket pruning passes.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(version, about = "Admission-controlled failover gateway for LLM providers")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Run with built-in defaults and no providers (smoke testing only).
    #[arg(long, default_value_t = false)]
    default_config: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Config errors are reported before the subscriber exists, so they go
    // straight to stderr.
    let config = match (&args.config_file, args.default_config) {
        (Some(path), false) => match Config::load_from_path(path) {
            Ok(config) => config,
            Err(e) => die(&format!("Failed to load config: {e}")),
        },
        (None, true) => Config::default(),
        (Some(_), true) => die("`--config-file` and `--default-config` are mutually exclusive"),
        (None, false) => die("Provide `--config-file <path>` or `--default-config`"),
    };

    setup_observability(args.log_format, config.gateway.debug);
    if args.default_config {
        tracing::warn!(
            "Running with default config: no providers are configured, all dispatches will fail"
        );
    }

    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let state =
        AppStateData::new(config).expect_pretty("Failed to initialize application state");

    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HOUSEKEEPING_INTERVAL).await;
            limiter.prune_expired();
        }
    });

    let router = Router::new()
        .route("/v1/messages", post(inference::messages_handler))
        .route(
            "/v1/chat/completions",
            post(inference::chat_completions_handler),
        )
        .route(
            "/v1beta/models/{model_and_method}",
            post(inference::generate_content_handler),
        )
        .route(
            "/admin/concurrency/endpoint/{endpoint_id}",
            get(admin::endpoint_concurrency_handler),
        )
        .route(
            "/admin/concurrency/key/{key_id}",
            get(admin::key_concurrency_handler),
        )
        .route(
            "/admin/concurrency",
            delete(admin::reset_concurrency_handler),
        )
        .route("/health", get(status::health_handler))
        .route("/status", get(status::status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .expect_pretty(&format!("Failed to bind to {bind_address}"));
    tracing::info!("Listening on {bind_address}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Server error");
}

// Startup errors can fire before the tracing subscriber exists.
#[expect(clippy::print_stderr)]
fn die(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1)
}

trait ExpectPretty<T> {
    /// Like `expect`, but logs the error without the panic machinery.
    fn expect_pretty(self, message: &str) -> T;
}

impl<T, E: std::fmt::Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, message: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("{message}: {e}");
                std::process::exit(1)
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
