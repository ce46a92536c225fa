use crate::models::{
    ClassificationQuery, DuplicateTier, ErrorResponse, HealthResponse, RecordFilter, RunRequest,
    TierBucketsResponse,
};
use crate::services::{
    partition_by_tier, tier_counts, to_geojson, CancelFlag, DedupError, DedupService,
    RecordRepository,
};
use actix_web::{web, HttpResponse, Responder};
use std::sync::Arc;
use validator::Validate;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn RecordRepository>,
    pub service: Arc<DedupService>,
    pub cancel: CancelFlag,
    /// Held for the duration of a run; one run at a time
    pub run_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(repository: Arc<dyn RecordRepository>, service: Arc<DedupService>) -> Self {
        Self {
            repository,
            service,
            cancel: CancelFlag::new(),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Configure all dedup routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/runs", web::post().to(start_run))
        .route("/runs/cancel", web::post().to(cancel_run))
        .route("/classifications", web::get().to(list_classifications))
        .route("/classifications/pairs", web::get().to(list_pair_classifications))
        .route("/classifications/by-tier", web::get().to(classifications_by_tier))
        .route("/classifications/geojson", web::get().to(classifications_geojson));
}

fn error_response(status: actix_web::http::StatusCode, error: &str, message: String) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: error.to_string(),
        message,
        status_code: status.as_u16(),
    })
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let healthy = state.repository.health_check().await.unwrap_or(false);

    let status = if healthy { "healthy" } else { "degraded" };
    let cache = state.service.scorer().cache().stats().await;

    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        embedding_cache_entries: cache.entries,
    })
}

/// Start a classification run
///
/// POST /api/v1/runs
///
/// Request body:
/// ```json
/// { "scopes": ["nyc-radius"] }
/// ```
async fn start_run(state: web::Data<AppState>, req: web::Json<RunRequest>) -> impl Responder {
    use actix_web::http::StatusCode;

    if let Err(errors) = req.validate() {
        tracing::info!("Validation failed for run request: {:?}", errors);
        return error_response(StatusCode::BAD_REQUEST, "Validation failed", errors.to_string());
    }

    let Ok(_guard) = state.run_lock.try_lock() else {
        return error_response(
            StatusCode::CONFLICT,
            "Run in progress",
            "another run is already in progress".to_string(),
        );
    };
    state.cancel.reset();

    match state.service.run(req.scopes.as_deref(), &state.cancel).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(DedupError::UnknownScope(name)) => error_response(
            StatusCode::BAD_REQUEST,
            "Unknown scope",
            format!("no scope named '{}' is configured", name),
        ),
        Err(e) => {
            tracing::error!("Run failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Run failed", e.to_string())
        }
    }
}

/// Request cancellation of the active run; takes effect at the next batch
/// or chunk boundary
async fn cancel_run(state: web::Data<AppState>) -> impl Responder {
    state.cancel.cancel();
    tracing::info!("Cancellation requested");
    HttpResponse::Accepted().json(serde_json::json!({ "cancelled": true }))
}

fn parse_filter(query: &ClassificationQuery) -> Result<RecordFilter, HttpResponse> {
    let tier = match query.tier.as_deref() {
        Some(name) => Some(name.parse::<DuplicateTier>().map_err(|message| {
            error_response(actix_web::http::StatusCode::BAD_REQUEST, "Invalid tier", message)
        })?),
        None => None,
    };
    Ok(RecordFilter {
        city: query.city.clone(),
        require_coordinates: false,
        tier,
    })
}

/// GET /api/v1/classifications?city=&tier=
async fn list_classifications(
    state: web::Data<AppState>,
    query: web::Query<ClassificationQuery>,
) -> impl Responder {
    let filter = match parse_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    match state.repository.fetch_classified(&filter).await {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(e) => {
            tracing::error!("Failed to fetch classifications: {}", e);
            error_response(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch classifications",
                e.to_string(),
            )
        }
    }
}

/// GET /api/v1/classifications/pairs?city=&tier=
///
/// A pair matches the city filter when either of its records does.
async fn list_pair_classifications(
    state: web::Data<AppState>,
    query: web::Query<ClassificationQuery>,
) -> impl Responder {
    let filter = match parse_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    match state.repository.fetch_pair_classifications(&filter).await {
        Ok(pairs) => HttpResponse::Ok().json(pairs),
        Err(e) => {
            tracing::error!("Failed to fetch pair classifications: {}", e);
            error_response(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch pair classifications",
                e.to_string(),
            )
        }
    }
}

/// GET /api/v1/classifications/by-tier?city=
async fn classifications_by_tier(
    state: web::Data<AppState>,
    query: web::Query<ClassificationQuery>,
) -> impl Responder {
    let filter = RecordFilter::for_city(query.city.clone());

    match state.repository.fetch_classified(&filter).await {
        Ok(records) => {
            let total = records.len();
            let buckets = partition_by_tier(records);
            HttpResponse::Ok().json(TierBucketsResponse {
                counts: tier_counts(&buckets),
                buckets,
                total,
            })
        }
        Err(e) => {
            tracing::error!("Failed to fetch classifications: {}", e);
            error_response(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch classifications",
                e.to_string(),
            )
        }
    }
}

/// GET /api/v1/classifications/geojson?city=&tier=
async fn classifications_geojson(
    state: web::Data<AppState>,
    query: web::Query<ClassificationQuery>,
) -> impl Responder {
    let filter = match parse_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    match state.repository.fetch_classified(&filter).await {
        Ok(records) => HttpResponse::Ok()
            .content_type("application/geo+json")
            .json(to_geojson(&records)),
        Err(e) => {
            tracing::error!("Failed to export classifications: {}", e);
            error_response(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to export classifications",
                e.to_string(),
            )
        }
    }
}
