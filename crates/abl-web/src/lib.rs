//! Axum HTTP surface: health, cron-triggered reconciliation, and ball listing.

use std::sync::Arc;

use abl_core::{BallFilter, Brand};
use abl_storage::{BallStore, PageToken, StoreError};
use abl_sync::Reconciler;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const DEFAULT_PAGE_SIZE: usize = 25;

#[derive(Clone)]
pub struct AppState {
    pub environment: String,
    pub store: Arc<dyn BallStore>,
    pub reconciler: Arc<Reconciler>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        environment: impl Into<String>,
        store: Arc<dyn BallStore>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            environment: environment.into(),
            store,
            reconciler,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidArgument(message) => Self::bad_request(message),
            other => {
                error!(error = %other, "store failure");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": { "message": self.message } })),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListBallsQuery {
    brand: Option<String>,
    name: Option<String>,
    approved: Option<String>,
    page_size: Option<String>,
    page_token: Option<String>,
}

impl ListBallsQuery {
    fn filter(&self) -> Result<BallFilter, ApiError> {
        let brand = self
            .brand
            .as_deref()
            .map(str::parse::<Brand>)
            .transpose()
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        let approval_date = self
            .approved
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .map_err(|err| ApiError::bad_request(format!("invalid approved date: {err}")))?;
        Ok(BallFilter {
            brand,
            name: self.name.clone(),
            approval_date,
        })
    }

    fn page_size(&self) -> Result<usize, ApiError> {
        match self.page_size.as_deref() {
            None | Some("") => Ok(DEFAULT_PAGE_SIZE),
            Some(raw) => raw
                .parse()
                .map_err(|err| ApiError::bad_request(format!("invalid page_size {raw:?}: {err}"))),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health_handler))
        .route("/v1/cron", get(cron_handler))
        .route("/v1/balls", get(list_balls_handler))
        .with_state(Arc::new(state))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("HTTP server listening on :{port}");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "available",
        "system_info": {
            "environment": state.environment,
            "version": "v1",
        },
    }))
    .into_response()
}

async fn cron_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler.run(&state.cancel).await {
        Ok(report) => {
            if let Some(errors) = report.joined_errors() {
                warn!(run_id = %report.run_id, errors = %errors, "reconciliation finished with failures");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!(error = %err, "error checking for newly approved balls");
            ApiError::internal().into_response()
        }
    }
}

async fn list_balls_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListBallsQuery>,
) -> Result<Response, ApiError> {
    let filter = query.filter()?;
    let page_size = query.page_size()?;
    let token = PageToken::from(query.page_token.clone().unwrap_or_default());

    let result = state.store.list_balls(&filter, page_size, &token).await?;
    Ok(Json(json!({
        "balls": result.balls,
        "next_page_token": result.next_page_token,
        "total_count": result.total_count,
    }))
    .into_response())
}
