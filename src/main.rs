use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use file_scan_gateway::config::GatewayConfig;
use file_scan_gateway::infrastructure::{database, scanner, storage};
use file_scan_gateway::services::blacklist::DenylistStore;
use file_scan_gateway::services::finalizer::StorageFinalizer;
use file_scan_gateway::services::pipeline::{Orchestrator, PipelineDeps, PipelineSettings};
use file_scan_gateway::services::progress::ProgressHub;
use file_scan_gateway::services::scan_log::ScanLogService;
use file_scan_gateway::services::session::SessionStore;
use file_scan_gateway::services::worker::BackgroundWorker;
use file_scan_gateway::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run (api, worker, all)
    #[arg(short, long, default_value = "all")]
    mode: String,

    /// Port for the API server
    #[arg(short, long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initial Environment & Logging Setup
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_scan_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !matches!(args.mode.as_str(), "api" | "worker" | "all") {
        anyhow::bail!("Unknown mode '{}', expected api, worker or all", args.mode);
    }

    info!("🚀 Starting File Scan Gateway [Mode: {}]...", args.mode);

    // 2. Setup Common Infrastructure
    let config = GatewayConfig::from_env();
    info!(
        "🛡️  Gateway Config: Max Size={}MB, Virus Scan={}, Scanner={}, Policy={:?}",
        config.max_file_size / 1024 / 1024,
        config.enable_virus_scan,
        config.virus_scanner_type,
        config.failure_policy
    );

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/gateway.db?mode=rwc".to_string());
    if let Some(path) = database_url
        .strip_prefix("sqlite://")
        .and_then(|p| p.split('?').next())
        .and_then(|p| std::path::Path::new(p).parent())
        .filter(|p| !p.as_os_str().is_empty())
    {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
    }
    let db = database::setup_database(&database_url).await?;
    let storage_service = storage::setup_storage(&config).await?;

    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .with_context(|| format!("creating {}", config.temp_dir.display()))?;

    let sessions = Arc::new(SessionStore::new(
        config.session_ttl,
        config.session_retention,
        config.max_file_size,
    ));
    let progress = Arc::new(ProgressHub::new());

    let denylist = Arc::new(DenylistStore::new(config.blocked_extensions.clone()));
    match denylist.refresh(&db).await {
        Ok(n) => info!("🚫 Denylist loaded with {} digests", n),
        Err(e) => warn!("⚠️  Initial denylist load failed, blacklist checks will error: {}", e),
    }

    // 3. Setup Graceful Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    // 4. Initialize Worker Service
    if args.mode == "worker" || args.mode == "all" {
        let worker = BackgroundWorker::new(
            db.clone(),
            storage_service.clone(),
            sessions.clone(),
            progress.clone(),
            denylist.clone(),
            config.denylist_refresh_interval,
            config.scan_log_retention_days,
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(async move {
            worker.run().await;
        }));
        info!("👷 Worker service initialized.");
    }

    // 5. Initialize API Service
    if args.mode == "api" || args.mode == "all" {
        let local_scanner = scanner::setup_local_scanner(&config).await;
        let reputation_scanner = scanner::setup_reputation_scanner(&config)?;
        let scan_log = ScanLogService::new(db.clone());

        let finalizer = StorageFinalizer::new(
            db.clone(),
            storage_service.clone(),
            &config.public_base_url,
            config.file_retention,
        )?;

        let pipeline = Arc::new(Orchestrator::new(
            PipelineDeps {
                db: db.clone(),
                sessions: sessions.clone(),
                progress: progress.clone(),
                denylist: denylist.clone(),
                local_scanner: local_scanner.clone(),
                reputation_scanner,
                finalizer,
                scan_log: scan_log.clone(),
            },
            PipelineSettings::from_config(&config),
        ));

        let state = AppState {
            db: db.clone(),
            storage: storage_service.clone(),
            local_scanner,
            pipeline,
            scan_log,
            config: config.clone(),
        };

        // Configure tracing layer for HTTP requests
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(state).layer(trace_layer);
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
        info!("📖 Swagger UI documentation: http://localhost:{}/swagger-ui", args.port);

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    // 6. Wait for Shutdown Signal, then notify every service
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("🛑 Shutting down gateway services...");
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Service task ended abnormally: {}", e);
        }
    }

    info!("👋 Gateway exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
