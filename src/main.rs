use actix_cors::Cors;
use actix_web::{error, http::StatusCode, middleware, web, App, HttpResponse, HttpServer};
use poi_dedup::config::Settings;
use poi_dedup::core::Classifier;
use poi_dedup::routes::{self, dedup::AppState};
use poi_dedup::services::{
    DedupService, EmbeddingCache, EmbeddingProvider, HttpEmbeddingProvider, PipelineOptions,
    PostgresRepository, RecordRepository, Scope, SimilarityScorer,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use validator::Validate;

/// JSON error response for JSON payload errors
#[derive(Debug, serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for JsonError {}

impl error::ResponseError for JsonError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST))
            .json(self)
    }
}

/// Handle JSON payload errors
pub fn handle_json_payload_error(err: error::JsonPayloadError, req: &actix_web::HttpRequest) -> actix_web::Error {
    tracing::info!("JSON payload error on {}: {}", req.path(), err);
    JsonError {
        error: "invalid_json".to_string(),
        message: format!("Invalid JSON: {}", err),
        status_code: 400,
    }
    .into()
}

/// Handle query payload errors
pub fn handle_query_payload_error(err: error::QueryPayloadError, _req: &actix_web::HttpRequest) -> actix_web::Error {
    JsonError {
        error: "invalid_query".to_string(),
        message: format!("Invalid query: {}", err),
        status_code: 400,
    }
    .into()
}

fn startup_error(context: &str, e: impl std::fmt::Display) -> std::io::Error {
    error!("{}: {}", context, e);
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, e))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenv::dotenv().ok();

    // Load configuration
    let settings = Settings::load().map_err(|e| startup_error("Failed to load configuration", e))?;

    // Initialize logging; LOG_LEVEL / LOG_FORMAT override the config file
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| settings.logging.level.clone());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| settings.logging.format.clone());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .with_target(false)
        .with_level(true);

    if log_format == "pretty" {
        subscriber.pretty().init();
    } else {
        subscriber.init();
    }

    info!("Starting POI dedup service...");

    settings
        .classification
        .validate()
        .map_err(|e| startup_error("Invalid classification thresholds", e))?;

    info!("Configuration loaded successfully");

    // Initialize PostgreSQL repository
    let repository: Arc<dyn RecordRepository> = Arc::new(
        PostgresRepository::from_settings(&settings.database)
            .await
            .map_err(|e| startup_error("Failed to connect to PostgreSQL", e))?,
    );

    info!(
        "PostgreSQL repository initialized (max: {} connections)",
        settings.database.max_connections.unwrap_or(10)
    );

    // Initialize embedding provider (optional - stored embeddings still work without it)
    let provider: Option<Arc<dyn EmbeddingProvider>> = match &settings.embedding.endpoint {
        Some(endpoint) => {
            let provider = HttpEmbeddingProvider::new(
                endpoint.clone(),
                settings.embedding.api_key.clone(),
                settings.embedding.model.clone(),
                Duration::from_secs(settings.embedding.timeout_secs.unwrap_or(30)),
            )
            .map_err(|e| startup_error("Failed to create embedding client", e))?;
            info!("Embedding provider configured at {}", endpoint);
            Some(Arc::new(provider) as Arc<dyn EmbeddingProvider>)
        }
        None => {
            info!("No embedding endpoint configured, using stored embeddings only");
            None
        }
    };

    let cache = EmbeddingCache::new(settings.cache.max_entries, settings.cache.ttl_secs);
    info!(
        "Embedding cache initialized ({} entries, TTL: {}s)",
        settings.cache.max_entries, settings.cache.ttl_secs
    );
    let scorer = Arc::new(SimilarityScorer::new(provider, cache));

    let scopes = settings
        .scopes
        .iter()
        .map(Scope::from_settings)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| startup_error("Invalid scope configuration", e))?;

    info!(
        "Configured scopes: {:?}",
        scopes.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
    );

    let classifier = Classifier::new(settings.classification);
    let options = PipelineOptions::from_settings(&settings.pipeline, &settings.classification);

    info!("Classifier initialized with thresholds: {:?}", settings.classification);

    let service = Arc::new(DedupService::new(
        repository.clone(),
        scorer.clone(),
        classifier,
        scopes,
        options,
    ));

    // Build application state
    let app_state = AppState::new(repository, service);

    // Configure HTTP server
    let host = settings.server.host.clone();
    let port = settings.server.port;
    let workers = settings.server.workers.unwrap_or(4);

    info!("Starting HTTP server on {}:{}", host, port);

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .app_data(web::QueryConfig::default().error_handler(handle_query_payload_error))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes::configure_routes)
    })
    .workers(workers)
    .bind((host, port))?
    .run()
    .await;

    scorer.release();
    info!("Shut down");
    result
}
