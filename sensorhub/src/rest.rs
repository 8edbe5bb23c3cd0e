use crate::decode::parse_timestamp;
use crate::model::{Reading, StoreHealth};
use crate::query::{QueryError, QueryService};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};

#[derive(Clone)]
struct AppState {
    queries: QueryService,
}

/// Raw query string values. Parsed by hand so that malformed values become a 400 with a
/// readable message instead of the extractor's rejection text.
#[derive(Debug, Default, Deserialize)]
pub struct ReadingsQuery {
    start: Option<String>,
    end: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
}

pub fn create_router(queries: QueryService) -> Router {
    let state = AppState { queries };

    Router::new()
        .route("/api/sensors", get(get_sensors))
        .route("/api/readings", get(get_all_readings))
        .route("/api/readings/latest/:sensor_id", get(get_latest_reading))
        .route("/api/readings/:sensor_id", get(get_readings))
        .route("/api/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_sensors(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.queries.sensors().await?))
}

async fn get_readings(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let start = parse_bound("start", params.start.as_deref(), false)?;
    let end = parse_bound("end", params.end.as_deref(), true)?;
    let page = state.queries.page(
        parse_count("page", params.page.as_deref())?,
        parse_count("page_size", params.page_size.as_deref())?,
    );

    let readings = state
        .queries
        .list(sensor_id.trim(), start, end, page)
        .await?;
    Ok(Json(readings))
}

async fn get_all_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let page = state.queries.page(
        parse_count("page", params.page.as_deref())?,
        parse_count("page_size", params.page_size.as_deref())?,
    );
    Ok(Json(state.queries.list_all(page).await?))
}

async fn get_latest_reading(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> Result<Json<Option<Reading>>, ApiError> {
    Ok(Json(state.queries.latest(sensor_id.trim()).await?))
}

async fn get_health(State(state): State<AppState>) -> Result<Json<StoreHealth>, ApiError> {
    Ok(Json(state.queries.health().await?))
}

/// Time bound from a query value. A bare date as `end` covers the whole day.
fn parse_bound(
    name: &str,
    value: Option<&str>,
    end_of_day: bool,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    if end_of_day {
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            return Ok(date
                .and_hms_nano_opt(23, 59, 59, 999_999_999)
                .map(|naive| naive.and_utc()));
        }
    }

    parse_timestamp(value)
        .or_else(|| {
            // An unencoded `+` in the offset arrives as a space.
            let (head, offset) = value.rsplit_once(' ')?;
            parse_timestamp(&format!("{}+{}", head, offset))
        })
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {} timestamp: {:?}", name, value)))
}

fn parse_count(name: &str, value: Option<&str>) -> Result<Option<u64>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v.parse::<u64>().map(Some).map_err(|_| {
            ApiError::BadRequest(format!("{} must be a non-negative integer, got {:?}", name, v))
        }),
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Timeout(String),
    Storage(String),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidParameter(msg) => ApiError::BadRequest(msg),
            QueryError::Timeout(_) => ApiError::Timeout(err.to_string()),
            QueryError::Storage(e) => ApiError::Storage(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => {
                warn!("Rejected request: {}", msg);
                (StatusCode::BAD_REQUEST, msg)
            }
            ApiError::Timeout(msg) => {
                error!("API timeout: {}", msg);
                (StatusCode::GATEWAY_TIMEOUT, msg)
            }
            ApiError::Storage(msg) => {
                error!("API error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Database query failed: {}", msg),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
