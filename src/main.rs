// Instant-print photo booth served over HTTP.

use actix_web::{middleware, web, App, HttpServer};
use std::sync::Arc;
use tracing::{error, info, warn};

mod routes;

use instant_cam::caption::{new_caption_service, CaptionAdapter};
use instant_cam::config::{self, Config};
use instant_cam::errors::AppError;
use instant_cam::export::ExportRenderer;
use instant_cam::gallery::{GalleryStore, SqlitePersistence};
use instant_cam::scheduler::TokioScheduler;
use instant_cam::{new_camera_device, BoothParts, CameraSessionManager, PhotoBooth};

// ============================================================================
// Application State
// ============================================================================

/// Centralized application state container
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub booth: Arc<PhotoBooth>,
    pub db_pool: sqlx::SqlitePool,
}

impl AppState {
    async fn new(config: Config) -> Result<Self, AppError> {
        info!("Initializing application state");

        let persistence = Self::initialize_storage(&config.storage).await?;
        let db_pool = persistence.pool().clone();
        let gallery = GalleryStore::load(Arc::new(persistence)).await;

        let device = new_camera_device(&config.camera);
        let camera = CameraSessionManager::new(
            device,
            config.camera.ideal_size,
            config.camera.default_facing,
        );

        let captions = CaptionAdapter::new(
            new_caption_service(&config.caption),
            config.caption.clone(),
        );
        let exporter = ExportRenderer::new(
            config.export.font_path.as_deref(),
            config.caption.placeholder.clone(),
        );

        let booth = PhotoBooth::new(BoothParts {
            camera,
            gallery,
            captions,
            exporter,
            scheduler: Arc::new(TokioScheduler::new(config.print.frame_interval())),
            print: config.print.clone(),
            export_scale: config.export.scale,
        });

        Ok(Self {
            config,
            booth,
            db_pool,
        })
    }

    async fn initialize_storage(
        storage: &config::StorageConfig,
    ) -> Result<SqlitePersistence, AppError> {
        let persistence = SqlitePersistence::connect(storage).await.map_err(|e| {
            error!("Failed to open gallery storage: {}", e);
            AppError::from(e)
        })?;
        info!("Gallery storage ready ({})", storage.connection_string());
        Ok(persistence)
    }
}

fn load_config() -> Result<Config, AppError> {
    Ok(Config::from_env()?)
}

// ============================================================================
// Camera Initialization
// ============================================================================

/// Opens the default camera. A failure is kept as the inline camera error
/// and disables the shutter; the booth keeps serving its gallery.
async fn initialize_camera(booth: &PhotoBooth) {
    match booth.start_camera().await {
        Ok(status) => info!("Camera ready: {} via {}", status.facing, status.device),
        Err(e) => {
            warn!("Camera unavailable (capture disabled): {}", e);
        }
    }
}

// ============================================================================
// Shutdown Handling
// ============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

async fn cleanup_resources(state: AppState) {
    info!("Beginning resource cleanup");

    state.booth.shutdown().await;

    state.db_pool.close().await;
    info!("Database connections closed");

    info!("Resource cleanup complete");
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // ========================================
    // Phase 1: Basic Initialization
    // ========================================

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting instant camera");

    // ========================================
    // Phase 2: Configuration & State Setup
    // ========================================

    let config = load_config().map_err(|e| {
        error!("{}", e);
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to load configuration: {}", e),
        )
    })?;

    info!("Configuration loaded successfully");
    info!("Server will bind to: {}", config.socket_addr());

    let app_state = AppState::new(config.clone()).await.map_err(|e| {
        error!("Application initialization error: {}", e);
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to initialize application: {}", e),
        )
    })?;

    // ========================================
    // Phase 3: Camera Initialization
    // ========================================

    initialize_camera(&app_state.booth).await;

    // ========================================
    // Phase 4: HTTP Server Setup
    // ========================================

    let socket_addr = app_state.config.socket_addr();
    let booth_for_server = app_state.booth.clone();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(booth_for_server.clone()))
            // Status and events
            .service(routes::booth_status)
            .service(routes::booth_events)
            // Camera and shutter
            .service(routes::preview_stream)
            .service(routes::camera_status)
            .service(routes::switch_facing)
            .service(routes::press_shutter)
            // Gallery
            .service(routes::list_gallery)
            .service(routes::gallery_image)
            .service(routes::export_print)
            .service(routes::delete_print)
            .service(routes::clear_gallery)
    })
    .bind(socket_addr)?
    .shutdown_timeout(5)
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(async move { server.await });

    info!("Instant camera server started on {}", socket_addr);

    // ========================================
    // Phase 5: Run Until Shutdown
    // ========================================

    shutdown_signal().await;

    // ========================================
    // Phase 6: Graceful Shutdown
    // ========================================

    info!("Initiating graceful shutdown...");

    server_handle.stop(true).await;

    cleanup_resources(app_state).await;

    server_task.await.map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Server task error: {}", e),
        )
    })??;

    info!("Graceful shutdown complete");
    Ok(())
}
