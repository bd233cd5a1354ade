use axum::{
    extract::Query,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::aggregator::{CounterpartyStats, Stats};
use crate::config::Config;
use crate::ingest::{Ingestor, RunOptions, RunResult};
use crate::models::FetchCursor;

#[derive(Deserialize)]
pub struct RefreshQuery {
    pub full: Option<bool>, // defaults to false
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub top: Option<usize>, // defaults to 5
}

#[derive(Serialize)]
pub struct TopCounterparty {
    pub address: String,
    #[serde(flatten)]
    pub stats: CounterpartyStats,
}

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: Stats,
    pub top_counterparties: Vec<TopCounterparty>,
    pub refreshing: bool,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub refreshing: bool,
}

pub fn router(ingestor: Arc<Ingestor>, defaults: RunOptions) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Wallet ledger API running" }))
        .route("/stats", get({
            let ingestor = Arc::clone(&ingestor);
            move |q: Query<StatsQuery>| {
                let ingestor = Arc::clone(&ingestor);
                async move { Json(stats_response(&ingestor, q.top.unwrap_or(5))) }
            }
        }))
        .route("/cursor", get({
            let ingestor = Arc::clone(&ingestor);
            move || {
                let ingestor = Arc::clone(&ingestor);
                async move { Json::<FetchCursor>(ingestor.cursor()) }
            }
        }))
        .route("/refresh", post({
            let ingestor = Arc::clone(&ingestor);
            move |q: Query<RefreshQuery>| {
                let ingestor = Arc::clone(&ingestor);
                async move {
                    let options = RunOptions {
                        full_rescan: q.full.unwrap_or(false),
                        ..defaults
                    };
                    refresh(&ingestor, options).await
                }
            }
        }))
        .route("/cancel", post({
            let ingestor = Arc::clone(&ingestor);
            move || {
                let ingestor = Arc::clone(&ingestor);
                async move {
                    ingestor.cancel();
                    Json(CancelResponse {
                        refreshing: ingestor.is_refreshing(),
                    })
                }
            }
        }))
        .layer(cors)
}

pub async fn serve(cfg: Config, ingestor: Arc<Ingestor>) -> eyre::Result<()> {
    let app = router(ingestor, RunOptions::from_config(&cfg));

    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn stats_response(ingestor: &Ingestor, top: usize) -> StatsResponse {
    let stats = ingestor.stats();
    let top_counterparties = stats
        .top_counterparties(top)
        .into_iter()
        .map(|(address, s)| TopCounterparty {
            address: address.to_string(),
            stats: s.clone(),
        })
        .collect();

    StatsResponse {
        stats,
        top_counterparties,
        refreshing: ingestor.is_refreshing(),
    }
}

async fn refresh(ingestor: &Ingestor, options: RunOptions) -> (StatusCode, Json<RunResult>) {
    let result = ingestor.run(options).await;
    let status = match result {
        RunResult::AlreadyRunning => StatusCode::CONFLICT,
        RunResult::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, Json(result))
}
