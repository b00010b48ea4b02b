use actix_web::{middleware::Compress, web, App, HttpServer};
use actix_cors::Cors;
use utoipa_swagger_ui::SwaggerUi;

use postboard::openapi::ApiDoc;
use postboard::repo::Repo;
use postboard::routes::{config, AppState};
use postboard::uploads::build_upload_issuer;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // .env is a dev convenience only; production sets variables externally.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping postboard server");

    let repo = build_repo().await?;
    let uploads = build_upload_issuer().await;
    let openapi = ApiDoc::openapi();
    let state = web::Data::new(AppState { repo, uploads });
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(state.clone())
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(&bind_addr)?;

    info!("Listening on http://{bind_addr}");
    server.run().await?;
    Ok(())
}

async fn build_repo() -> anyhow::Result<Arc<dyn Repo>> {
    match std::env::var("DATABASE_URL").ok() {
        #[cfg(feature = "postgres-store")]
        Some(db_url) => connect_postgres(&db_url).await,
        _ => fallback_repo(),
    }
}

#[cfg(feature = "postgres-store")]
async fn connect_postgres(db_url: &str) -> anyhow::Result<Arc<dyn Repo>> {
    use sqlx::postgres::PgPoolOptions;
    let max_connections = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let pool = PgPoolOptions::new().max_connections(max_connections).connect(db_url).await?;
    sqlx::migrate!().run(&pool).await?;
    info!("Using Postgres repository backend ({max_connections} connections)");
    Ok(Arc::new(postboard::repo::pg::PgRepo::new(pool)))
}

#[cfg(feature = "inmem-store")]
fn fallback_repo() -> anyhow::Result<Arc<dyn Repo>> {
    warn!("DATABASE_URL not set; using in-memory repository backend");
    Ok(Arc::new(postboard::repo::inmem::InMemRepo::new()))
}

#[cfg(not(feature = "inmem-store"))]
fn fallback_repo() -> anyhow::Result<Arc<dyn Repo>> {
    Err(anyhow::anyhow!("no repository backend available: set DATABASE_URL"))
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    let mut missing = Vec::new();
    if env::var("JWT_SECRET").map(|s| s.is_empty()).unwrap_or(true) {
        missing.push("JWT_SECRET");
    }
    // without the in-memory fallback the database is mandatory
    if cfg!(all(feature = "postgres-store", not(feature = "inmem-store"))) && env::var("DATABASE_URL").is_err() {
        missing.push("DATABASE_URL");
    }
    if !missing.is_empty() {
        eprintln!("Missing required environment variables: {:?}", missing);
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long for security");
            std::process::exit(1);
        }
    }

    let upload_vars = postboard::uploads::UploadSettings::REQUIRED;
    if upload_vars.iter().any(|v| env::var(v).map(|s| s.is_empty()).unwrap_or(true)) {
        eprintln!("Warning: upload storage not fully configured ({})", upload_vars.join(", "));
        eprintln!("POST /api/v1/uploads will answer 500 until these are set");
    }
}
