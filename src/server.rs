//! HTTP API of the `serve` mode and the task that writes streamed candles to
//! SQLite.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::candle_store::{CandleStore, aggregate, subscription_name, timeframe_seconds};
use crate::command::{Candlestick, Command};
use crate::config::normalize_pair;
use crate::workers::{PairController, PairRejection};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 5_000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub pairs: PairController,
    pub candles: Arc<CandleStore>,
    /// Timeframe used when a candle query names a pair but no timeframe.
    pub default_timeframe: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/add_pair", post(add_pair))
        .route("/pairs", get(list_pairs).post(create_pair).delete(delete_pair))
        .route("/get_candlestick_data", get(candlestick_data))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError(StatusCode::BAD_REQUEST, message.into())
    }

    fn internal(message: impl Into<String>) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn rejection_status(err: &PairRejection) -> StatusCode {
    if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Debug, Default, Deserialize)]
struct PairBody {
    pair: Option<String>,
}

fn pair_of(body: Option<Json<PairBody>>) -> String {
    body.and_then(|Json(body)| body.pair).unwrap_or_default()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn add_pair(State(state): State<AppState>, body: Option<Json<PairBody>>) -> Response {
    match state.pairs.add(&pair_of(body)).await {
        Ok(pair) => (
            StatusCode::OK,
            Json(json!({ "message": format!("Pair {pair} added successfully") })),
        )
            .into_response(),
        Err(err) => ApiError(rejection_status(&err), err.to_string()).into_response(),
    }
}

async fn list_pairs(State(state): State<AppState>) -> Response {
    match state.pairs.pairs().await {
        Ok(pairs) => Json(json!({ "pairs": pairs })).into_response(),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}

fn status_reply(result: Result<String, PairRejection>, verb: &str) -> Response {
    match result {
        Ok(pair) => (
            StatusCode::OK,
            Json(json!({ "status": "success", "message": format!("Pair {pair} {verb}") })),
        )
            .into_response(),
        Err(err) => (
            rejection_status(&err),
            Json(json!({ "status": "error", "message": err.to_string() })),
        )
            .into_response(),
    }
}

async fn create_pair(State(state): State<AppState>, body: Option<Json<PairBody>>) -> Response {
    status_reply(state.pairs.add(&pair_of(body)).await, "added")
}

async fn delete_pair(State(state): State<AppState>, body: Option<Json<PairBody>>) -> Response {
    status_reply(state.pairs.remove(&pair_of(body)).await, "removed")
}

#[derive(Debug, Deserialize)]
struct CandleQuery {
    subscription_name: Option<String>,
    pair: Option<String>,
    timeframe: Option<String>,
    period: Option<usize>,
    limit: Option<usize>,
}

async fn candlestick_data(
    State(state): State<AppState>,
    Query(query): Query<CandleQuery>,
) -> Result<Json<Vec<Candlestick>>, ApiError> {
    let subscription = query
        .subscription_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let (name, timeframe) = match (subscription, query.pair.as_deref()) {
        (Some(name), _) => {
            let timeframe = name.split_once('_').map(|(tf, _)| tf).unwrap_or(name);
            (name.to_string(), timeframe.to_string())
        }
        (None, Some(raw)) => {
            let pair = normalize_pair(raw)
                .ok_or_else(|| ApiError::bad_request(format!("invalid pair `{raw}`")))?;
            let timeframe = query
                .timeframe
                .clone()
                .unwrap_or_else(|| state.default_timeframe.clone());
            (subscription_name(&timeframe, &pair), timeframe)
        }
        (None, None) => {
            return Err(ApiError::bad_request(
                "subscription_name or pair is required",
            ));
        }
    };
    let bar_seconds = timeframe_seconds(&timeframe)
        .ok_or_else(|| ApiError::bad_request(format!("unknown timeframe `{timeframe}`")))?;
    let period = query.period.unwrap_or(1);
    if period == 0 {
        return Err(ApiError::bad_request("period must be at least 1"));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    // One spare bucket so the oldest returned bucket is complete.
    let raw_limit = limit.saturating_add(1).saturating_mul(period);

    let store = Arc::clone(&state.candles);
    let candles = tokio::task::spawn_blocking(move || store.recent(&name, raw_limit))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;
    let mut merged = aggregate(&candles, bar_seconds, period)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    if merged.len() > limit {
        merged.drain(..merged.len() - limit);
    }
    Ok(Json(merged))
}

/// Buffers candles from the bus and writes them once per second in a single
/// transaction. Open bars are skipped unless `persist_partial`.
pub struct CandleWriter {
    store: Arc<CandleStore>,
    rx: broadcast::Receiver<Command>,
    persist_partial: bool,
    buffer: Vec<Candlestick>,
}

impl CandleWriter {
    pub fn new(
        store: Arc<CandleStore>,
        rx: broadcast::Receiver<Command>,
        persist_partial: bool,
    ) -> Self {
        CandleWriter {
            store,
            rx,
            persist_partial,
            buffer: Vec::new(),
        }
    }

    pub async fn run(mut self, mut exit_rx: broadcast::Receiver<()>) -> AnyResult<()> {
        let mut flush = time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = flush.tick() => self.flush().await,
                message = self.rx.recv() => match message {
                    Ok(Command::Candle(candle)) => {
                        self.accept(candle);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "candle writer fell behind the stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = exit_rx.recv() => match message {
                    Ok(_) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
        self.flush().await;
        Ok(())
    }

    fn accept(&mut self, candle: Candlestick) -> bool {
        if candle.window_close || self.persist_partial {
            self.buffer.push(candle);
            true
        } else {
            false
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.insert_batch(&batch)).await {
            Ok(Ok(rows)) => debug!(rows, "stored candles"),
            Ok(Err(err)) => error!("storing candles failed: {err:#}"),
            Err(err) => error!("candle writer task failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::command::PairCommand;
    use crate::pair_store::PairStore;
    use crate::workers::tests::{mock_gate, pairs_router};

    fn bar(name: &str, ts: i64, close: f64, closed: bool) -> Candlestick {
        Candlestick {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            subscription_name: name.to_string(),
            base_currency_amount: 1.0,
            window_close: closed,
        }
    }

    async fn app() -> (Router, Arc<CandleStore>, mpsc::Receiver<PairCommand>) {
        let rest = mock_gate(pairs_router()).await;
        let (control_tx, control_rx) = mpsc::channel(8);
        let (tx, _) = broadcast::channel(8);
        let pairs = PairController::new(
            rest,
            Arc::new(PairStore::in_memory().unwrap()),
            control_tx,
            tx,
        );
        let candles = Arc::new(CandleStore::in_memory().unwrap());
        let state = AppState {
            pairs,
            candles: Arc::clone(&candles),
            default_timeframe: "1m".into(),
        };
        (router(state), candles, control_rx)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn add_pair_route_replies_like_the_legacy_api() {
        let (app, _, mut control_rx) = app().await;
        let (status, body) = call(&app, json_request("POST", "/add_pair", r#"{"pair":"btc_usdt"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Pair BTC_USDT added successfully");
        assert_eq!(
            control_rx.recv().await,
            Some(PairCommand::Add("BTC_USDT".into()))
        );

        let (status, body) = call(&app, json_request("POST", "/add_pair", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Pair is missing");
    }

    #[tokio::test]
    async fn pairs_routes_report_status() {
        let (app, _, _control_rx) = app().await;
        let (status, body) = call(&app, json_request("POST", "/pairs", r#"{"pair":"ETH_USDT"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");

        let (_, body) = call(&app, get_request("/pairs")).await;
        assert_eq!(body["pairs"], json!(["ETH_USDT"]));

        let (status, body) = call(&app, json_request("POST", "/pairs", r#"{"pair":"LOL_USDT"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let (status, body) = call(&app, json_request("DELETE", "/pairs", r#"{"pair":"ETH_USDT"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Pair ETH_USDT removed");
        let (status, _) = call(&app, json_request("DELETE", "/pairs", r#"{"pair":"ETH_USDT"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn candle_route_aggregates_and_limits() {
        let (app, candles, _control_rx) = app().await;
        let bars: Vec<Candlestick> = (0..10)
            .map(|i| bar("1m_BTC_USDT", 600 + i * 60, 100.0 + i as f64, true))
            .collect();
        candles.insert_batch(&bars).unwrap();

        let (status, body) = call(&app, get_request("/get_candlestick_data?pair=btc_usdt&limit=3")).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["timestamp"], 1020);
        assert_eq!(rows[2]["close"], 109.0);

        let (_, body) = call(
            &app,
            get_request("/get_candlestick_data?subscription_name=1m_BTC_USDT&period=5"),
        )
        .await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["timestamp"], 600);
        assert_eq!(rows[0]["close"], 104.0);
        assert_eq!(rows[1]["window_close"], true);

        let (status, _) = call(&app, get_request("/get_candlestick_data?pair=BTC_USDT&timeframe=5y")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, get_request("/get_candlestick_data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _, _control_rx) = app().await;
        let (status, body) = call(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn writer_skips_open_bars_by_default() {
        let store = Arc::new(CandleStore::in_memory().unwrap());
        let (tx, _) = broadcast::channel(8);
        let mut writer = CandleWriter::new(Arc::clone(&store), tx.subscribe(), false);
        assert!(!writer.accept(bar("1m_BTC_USDT", 60, 1.0, false)));
        assert!(writer.accept(bar("1m_BTC_USDT", 60, 2.0, true)));
        writer.flush().await;
        let rows = store.recent("1m_BTC_USDT", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 2.0);

        let mut partial = CandleWriter::new(Arc::clone(&store), tx.subscribe(), true);
        assert!(partial.accept(bar("1m_BTC_USDT", 120, 3.0, false)));
        partial.flush().await;
        assert_eq!(store.recent("1m_BTC_USDT", 10).unwrap().len(), 2);
    }
}
