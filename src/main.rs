use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::{bail, Context};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

use rib_live::media::build_media_store;
use rib_live::store::Store;
use rib_live::{config, socket, AppState, Config, Services};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    validate_env_vars()?;
    let cfg = Config::from_env();
    info!(boards = ?cfg.boards, read_only = cfg.read_only, debug = cfg.debug, "bootstrapping live thread server");

    let store = open_store(&cfg).await?;
    let media = build_media_store(&cfg).await?;
    let services = Services::build(cfg.clone(), store, media)
        .await
        .context("warming parent cache")?;
    services.spawn_upkeep(Duration::from_secs(10));

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "prometheus recorder not installed");
            None
        }
    };

    let listener = tokio::net::TcpListener::bind(&cfg.socket_addr)
        .await
        .with_context(|| format!("binding socket listener on {}", cfg.socket_addr))?;
    let socket_services = services.clone();
    tokio::spawn(async move {
        if let Err(e) = socket::serve(listener, socket_services).await {
            tracing::error!(error = %e, "socket listener stopped");
        }
    });

    let state = AppState { services, metrics };
    let server = HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allow_any_header()
            .allowed_methods(["GET", "POST", "OPTIONS"])
            .max_age(3600);
        if let Ok(front) = std::env::var("FRONTEND_URL") {
            cors = cors.allowed_origin(&front);
        }

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(config)
    })
    .bind(&cfg.http_addr)
    .with_context(|| format!("binding http on {}", cfg.http_addr))?;

    info!(http = %cfg.http_addr, socket = %cfg.socket_addr, "listening");
    server.run().await?;
    Ok(())
}

#[cfg(feature = "postgres-store")]
async fn open_store(_cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    use rib_live::store::pg::PgStore;
    use sqlx::postgres::PgPoolOptions;

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set for postgres-store")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("connecting to postgres")?;
    let store = PgStore::new(pool);
    store.migrate().await.context("running migrations")?;
    info!("Using Postgres store backend");
    Ok(Arc::new(store))
}

#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    use rib_live::store::inmem::InMemStore;

    let store = match &cfg.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using in-memory store backend with snapshot");
            InMemStore::with_snapshot(dir)
        }
        None => {
            info!("Using in-memory store backend");
            InMemStore::new()
        }
    };
    Ok(Arc::new(store))
}

/// Fails startup when required variables are missing or too weak.
fn validate_env_vars() -> anyhow::Result<()> {
    let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
    if secret.len() < 32 {
        bail!("JWT_SECRET must be at least 32 characters long");
    }
    if std::env::var("RIB_PASSWORD_SALT").map(|s| s.is_empty()).unwrap_or(true) {
        warn!("RIB_PASSWORD_SALT not set; post passwords are hashed unsalted");
    }
    Ok(())
}
