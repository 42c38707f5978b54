//! Axum trigger surface: one GET route per category plus a few read-only helpers.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use evf_core::{Category, Opportunity, OpportunityFilter};
use evf_sync::SyncService;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "evf-web";

pub const SYNC_ALL_ROUTE: &str = "/sync-all";
pub const SYNC_ALL_ACK: &str = "All opportunities synced!";

#[derive(Clone)]
pub struct AppState {
    pub sync: SyncService,
}

impl AppState {
    pub fn new(sync: SyncService) -> Self {
        Self { sync }
    }
}

#[derive(Debug, Clone)]
struct RouteRow {
    route: &'static str,
    resource_path: &'static str,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    resources_root: String,
    collection: String,
    routes: Vec<RouteRow>,
}

pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(|| async { "ok" }))
        .route(SYNC_ALL_ROUTE, get(sync_all_handler))
        .route("/opportunities", get(list_handler))
        .route("/opportunities/{id}", get(opportunity_handler));

    for category in Category::ALL {
        router = router.route(
            category.route(),
            get(move |State(state): State<Arc<AppState>>| sync_category(state, category)),
        );
    }

    router.with_state(Arc::new(state))
}

pub async fn serve(port: u16, sync: SyncService) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding 0.0.0.0:{port}"))?;
    info!(port, resources_root = %sync.resources_root().display(), "trigger surface listening");
    axum::serve(listener, app(AppState::new(sync)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving trigger surface")?;
    info!("trigger surface stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
}

/// Loader outcome only reaches the log; the caller always gets the
/// category acknowledgment.
async fn sync_category(state: Arc<AppState>, category: Category) -> &'static str {
    match state.sync.sync(category).await {
        Ok(report) => info!(
            %category,
            written = report.written,
            skipped = report.skipped.len(),
            "sync trigger completed"
        ),
        Err(err) => warn!(%category, kind = err.kind(), error = %err, "sync trigger failed"),
    }
    category.ack_message()
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> &'static str {
    for (category, result) in state.sync.sync_all().await {
        match result {
            Ok(report) => info!(%category, written = report.written, "sync-all category completed"),
            Err(err) => warn!(%category, kind = err.kind(), error = %err, "sync-all category failed"),
        }
    }
    SYNC_ALL_ACK
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub location: Option<String>,
    /// Comma-separated.
    pub domains: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    count: usize,
    data: Vec<Opportunity>,
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = OpportunityFilter::from_query(query.location.as_deref(), query.domains.as_deref());
    match state.sync.store().list().await {
        Ok(all) => {
            let data = filter.apply(all);
            info!(count = data.len(), filtered = !filter.is_empty(), "listed opportunities");
            Json(ListResponse {
                count: data.len(),
                data,
            })
            .into_response()
        }
        Err(err) => server_error(anyhow::Error::new(err).context("listing opportunities")),
    }
}

async fn opportunity_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.sync.store().get(&id).await {
        Ok(Some(opportunity)) => Json(opportunity).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Opportunity not found").into_response(),
        Err(err) => server_error(anyhow::Error::new(err).context(format!("reading opportunity {id}"))),
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(IndexTemplate {
        resources_root: state.sync.resources_root().display().to_string(),
        collection: state.sync.store().collection().to_string(),
        routes: Category::ALL
            .iter()
            .map(|c| RouteRow {
                route: c.route(),
                resource_path: c.resource_path(),
            })
            .collect(),
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err:#}"),
    )
        .into_response()
}
