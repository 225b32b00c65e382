//! Read-only JSON query API over stored dealers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dealerscope_core::{Coordinates, DealerRecord, Source};
use dealerscope_storage::{CoordinateResolver, DealerQuery, DealerStore, StoreError};
use dealerscope_sync::{Scheduler, SourceRegistry, SyncConfig, SyncContext};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dealerscope-web";

pub const DEFAULT_RADIUS_KM: f64 = 5.0;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DealerStore>,
    pub resolver: Arc<CoordinateResolver>,
}

impl AppState {
    pub fn new(store: Arc<dyn DealerStore>, resolver: Arc<CoordinateResolver>) -> Self {
        Self { store, resolver }
    }
}

impl From<&SyncContext> for AppState {
    fn from(context: &SyncContext) -> Self {
        Self::new(Arc::clone(&context.store), Arc::clone(&context.resolver))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DealersParams {
    brand: Option<String>,
    city: Option<String>,
    postal_code: Option<String>,
    radius: Option<String>,
    lat: Option<String>,
    lng: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Blank or malformed numbers count as absent.
fn number(value: &Option<String>) -> Option<f64> {
    non_empty(value)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/dealers", get(dealers_handler))
        .route("/api/dealers", get(dealers_handler))
        .route("/sources/status", get(sources_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

/// Serves the API against Postgres; also runs the scheduler when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let context = SyncContext::connect(&config).await?;

    let mut jobs = None;
    if config.scheduler_enabled {
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let scheduler = Arc::new(Scheduler::from_registry(&registry, &context));
        jobs = scheduler.maybe_start(true).await?;
    }

    let served = serve(AppState::from(&context), config.web_port).await;
    if let Some(mut jobs) = jobs {
        jobs.shutdown().await?;
    }
    served
}

async fn index_handler() -> &'static str {
    "DealerScope API is running"
}

async fn dealers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DealersParams>,
) -> Response {
    let source = match non_empty(&params.brand).map(str::parse::<Source>) {
        None => None,
        Some(Ok(source)) => Some(source),
        Some(Err(_)) => return Json(Vec::<DealerRecord>::new()).into_response(),
    };

    if let Some(city) = non_empty(&params.city) {
        let query = DealerQuery {
            source,
            city: Some(city.to_string()),
            with_coordinates_only: false,
        };
        return match state.store.find(&query).await {
            Ok(dealers) => Json(dealers).into_response(),
            Err(err) => store_error(err),
        };
    }

    let center = if let Some(postal_code) = non_empty(&params.postal_code) {
        match state.resolver.resolve(postal_code, None).await {
            Some(center) => Some(center),
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "Invalid postal code" })),
                )
                    .into_response()
            }
        }
    } else {
        match (number(&params.lat), number(&params.lng)) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    };

    let query = DealerQuery {
        source,
        city: None,
        with_coordinates_only: center.is_some(),
    };
    let dealers = match state.store.find(&query).await {
        Ok(dealers) => dealers,
        Err(err) => return store_error(err),
    };
    let dealers: Vec<DealerRecord> = match center {
        Some(center) => {
            let radius = number(&params.radius)
                .filter(|r| *r > 0.0)
                .unwrap_or(DEFAULT_RADIUS_KM);
            dealers
                .into_iter()
                .filter(|d| d.coordinates().is_some_and(|c| c.within_radius(&center, radius)))
                .collect()
        }
        None => dealers,
    };
    Json(dealers).into_response()
}

async fn sources_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.run_states().await {
        Ok(states) => Json(states).into_response(),
        Err(err) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "dealer query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Server error" })),
    )
        .into_response()
}
