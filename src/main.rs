use clap::Parser;
use pagetrail::config::AppConfig;
use pagetrail::storage;
use pagetrail::tracker::SessionTracker;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;

#[derive(Parser)]
#[command(name = "pagetrail", about = "Self-hosted visitor session and page-view analytics")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagetrail=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        db = %config.database.path.display(),
        "starting pagetrail"
    );

    // Setup SQLite pool
    let pool = storage::sqlite::create_pool(&config.database)?;
    storage::sqlite::init_pool(&pool).await?;
    tracing::info!("database initialized");

    let tracker = SessionTracker::new(pool.clone());

    // Spawn idle session sweep
    let sweep_handle = if config.sessions.sweep_enabled {
        let sweep_tracker = tracker.clone();
        let idle_timeout = config.sessions.idle_timeout_secs;
        let interval = config.sessions.sweep_interval_secs;
        tracing::info!(idle_timeout, interval, "session sweep enabled");
        Some(tokio::spawn(async move {
            storage::sweep::session_sweep_loop(sweep_tracker, idle_timeout, interval).await;
        }))
    } else {
        None
    };

    let app = pagetrail::app::build_router(&config, pool.clone(), tracker)?;

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(handle) = sweep_handle {
        handle.abort();
    }
    pool.close();

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down...");
}
