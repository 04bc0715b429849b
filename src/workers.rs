//! Background tasks that bridge the REST client and the command bus: balance
//! polling, order execution and tracked-pair changes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command::{
    BalanceSnapshot, CancelResponse, Command, LoadView, OrderRequest, OrderResponse,
    OrderSnapshot, PairCommand, TradeEvent, TradingCommand,
};
use crate::config::normalize_pair;
use crate::error::GateError;
use crate::gate_rest::RestClient;
use crate::journal::OrderJournal;
use crate::pair_store::PairStore;

pub struct BalancePoller {
    rest: RestClient,
    tx: broadcast::Sender<Command>,
    rx: broadcast::Receiver<Command>,
    interval: Duration,
    with_margin: bool,
}

impl BalancePoller {
    pub fn new(
        rest: RestClient,
        tx: broadcast::Sender<Command>,
        interval: Duration,
        with_margin: bool,
    ) -> Self {
        let rx = tx.subscribe();
        BalancePoller {
            rest,
            tx,
            rx,
            interval,
            with_margin,
        }
    }

    /// Polls on the interval and immediately after a `BalancesChanged` push.
    pub async fn run(mut self, mut exit_rx: broadcast::Receiver<()>) -> AnyResult<()> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh(false).await,
                message = self.rx.recv() => match message {
                    Ok(Command::BalancesChanged) => {
                        self.refresh(true).await;
                        ticker.reset();
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = exit_rx.recv() => match message {
                    Ok(_) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
        Ok(())
    }

    async fn refresh(&self, force: bool) {
        match self.snapshot(force).await {
            Ok(snapshot) => {
                let _ = self.tx.send(Command::Balances(snapshot));
            }
            // The last good snapshot stays on screen.
            Err(err) => {
                warn!("balance refresh failed: {err}");
                let _ = self
                    .tx
                    .send(Command::Error(format!("balance refresh failed: {err}")));
            }
        }
    }

    async fn snapshot(&self, force: bool) -> Result<BalanceSnapshot, GateError> {
        let mut rows = self.rest.balances(force).await?;
        if self.with_margin {
            match self.rest.margin_accounts().await {
                Ok(margin) => rows.extend(margin),
                Err(err) => {
                    let _ = self
                        .tx
                        .send(Command::Error(format!("margin balances unavailable: {err}")));
                }
            }
        }
        let total_usdt = match self.rest.total_balance().await {
            Ok(total) => Some(total),
            Err(err) => {
                warn!("total balance unavailable: {err}");
                None
            }
        };
        Ok(BalanceSnapshot {
            rows,
            total_usdt,
            fetched_at_ms: Utc::now().timestamp_millis(),
        })
    }
}

/// Consumes order requests from the UI one at a time.
pub struct OrderExecutor {
    rest: RestClient,
    tx: broadcast::Sender<Command>,
    journal: OrderJournal,
}

impl OrderExecutor {
    pub fn new(rest: RestClient, tx: broadcast::Sender<Command>, journal: OrderJournal) -> Self {
        OrderExecutor { rest, tx, journal }
    }

    pub async fn run(
        self,
        mut orders: mpsc::Receiver<TradingCommand>,
        mut exit_rx: broadcast::Receiver<()>,
    ) -> AnyResult<()> {
        loop {
            tokio::select! {
                command = orders.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                message = exit_rx.recv() => match message {
                    Ok(_) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, command: TradingCommand) {
        match command {
            TradingCommand::Place(request) => {
                let event = self.place(request).await;
                let pair = event.currency_pair().to_string();
                let success = event.success();
                self.record(event);
                if success {
                    self.load(&pair, LoadView::Open).await;
                }
            }
            TradingCommand::Cancel {
                currency_pair,
                order_id,
            } => {
                let event = self.cancel(currency_pair, order_id).await;
                let pair = event.currency_pair().to_string();
                let success = event.success();
                self.record(event);
                if success {
                    self.load(&pair, LoadView::Open).await;
                }
            }
            TradingCommand::Load {
                currency_pair,
                view,
            } => self.load(&currency_pair, view).await,
        }
    }

    async fn place(&self, request: OrderRequest) -> TradeEvent {
        let response = match self.rest.place_order(&request).await {
            Ok(order) => OrderResponse {
                message: format!(
                    "{} {} {} @ {}: order {} {}",
                    request.side.as_gate_side(),
                    request.amount,
                    request.currency_pair,
                    request.price,
                    order.id,
                    order.status
                ),
                order_id: Some(order.id),
                request,
                success: true,
            },
            Err(err) => OrderResponse {
                message: format!(
                    "{} {} failed: {err}",
                    request.side.as_gate_side(),
                    request.currency_pair
                ),
                order_id: None,
                request,
                success: false,
            },
        };
        TradeEvent::Order(response)
    }

    async fn cancel(&self, currency_pair: String, order_id: String) -> TradeEvent {
        let (message, success) = match self.rest.cancel_order(&currency_pair, &order_id).await {
            Ok(order) => (format!("order {order_id} {}", order.status), true),
            Err(err) => {
                let mut message = format!("cancel {order_id} failed: {err}");
                // Usually the order already filled or was cancelled elsewhere.
                if let Ok(order) = self.rest.order_status(&currency_pair, &order_id).await {
                    message.push_str(&format!(", order is {}", order.status));
                }
                (message, false)
            }
        };
        TradeEvent::Cancel(CancelResponse {
            currency_pair,
            order_id,
            message,
            success,
        })
    }

    fn record(&self, event: TradeEvent) {
        if event.success() {
            info!("{}", event.message());
        } else {
            warn!("{}", event.message());
        }
        if let Err(err) = self.journal.append(event.clone()) {
            warn!("order log write failed: {err:#}");
        }
        let _ = self.tx.send(Command::TradeResult(event));
    }

    async fn load(&self, pair: &str, view: LoadView) {
        let pair_owned = pair.to_string();
        let result = match view {
            LoadView::Open => self
                .rest
                .open_orders(pair)
                .await
                .map(|orders| OrderSnapshot::Open {
                    pair: pair_owned,
                    orders,
                }),
            LoadView::Finished => self
                .rest
                .order_history(pair)
                .await
                .map(|orders| OrderSnapshot::Finished {
                    pair: pair_owned,
                    orders,
                }),
            LoadView::Trades => self
                .rest
                .trade_history(pair)
                .await
                .map(|trades| OrderSnapshot::Trades {
                    pair: pair_owned,
                    trades,
                }),
        };
        let command = match result {
            Ok(snapshot) => Command::Orders(snapshot),
            Err(err) => Command::Error(format!("loading orders for {pair} failed: {err}")),
        };
        let _ = self.tx.send(command);
    }
}

#[derive(Debug, Error)]
pub enum PairRejection {
    #[error("Pair is missing")]
    Missing,
    #[error("`{0}` is not a valid pair name")]
    Malformed(String),
    #[error("{0} is already tracked")]
    AlreadyTracked(String),
    #[error("{0} is not tracked")]
    NotTracked(String),
    #[error("{0} is not listed on gate.io")]
    Unlisted(String),
    #[error("could not validate {pair}: {source}")]
    Validation {
        pair: String,
        #[source]
        source: GateError,
    },
    #[error("pair store: {0}")]
    Store(String),
    #[error("the market stream has stopped")]
    StreamClosed,
}

impl PairRejection {
    /// Whether the caller sent something unusable, as opposed to a failure on
    /// this side.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PairRejection::Missing
                | PairRejection::Malformed(_)
                | PairRejection::AlreadyTracked(_)
                | PairRejection::NotTracked(_)
                | PairRejection::Unlisted(_)
        )
    }
}

/// Validates, persists and forwards tracked-pair changes to the socket task.
#[derive(Clone)]
pub struct PairController {
    rest: RestClient,
    store: Arc<PairStore>,
    control: mpsc::Sender<PairCommand>,
    tx: broadcast::Sender<Command>,
}

impl PairController {
    pub fn new(
        rest: RestClient,
        store: Arc<PairStore>,
        control: mpsc::Sender<PairCommand>,
        tx: broadcast::Sender<Command>,
    ) -> Self {
        PairController {
            rest,
            store,
            control,
            tx,
        }
    }

    fn normalize(raw: &str) -> Result<String, PairRejection> {
        if raw.trim().is_empty() {
            return Err(PairRejection::Missing);
        }
        normalize_pair(raw).ok_or_else(|| PairRejection::Malformed(raw.trim().to_string()))
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, PairRejection>
    where
        T: Send + 'static,
        F: FnOnce(&PairStore) -> AnyResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| PairRejection::Store(err.to_string()))?
            .map_err(|err| PairRejection::Store(format!("{err:#}")))
    }

    pub async fn pairs(&self) -> Result<Vec<String>, PairRejection> {
        self.with_store(|store| store.load()).await
    }

    pub async fn add(&self, raw: &str) -> Result<String, PairRejection> {
        let pair = Self::normalize(raw)?;
        let lookup = pair.clone();
        if self.with_store(move |store| store.contains(&lookup)).await? {
            return Err(PairRejection::AlreadyTracked(pair));
        }
        match self.rest.is_valid_pair(&pair).await {
            Ok(true) => {}
            Ok(false) => return Err(PairRejection::Unlisted(pair)),
            Err(source) => return Err(PairRejection::Validation { pair, source }),
        }
        // The store is only written once the socket task can take the command.
        let permit = self
            .control
            .reserve()
            .await
            .map_err(|_| PairRejection::StreamClosed)?;
        let stored = pair.clone();
        if !self.with_store(move |store| store.insert(&stored)).await? {
            return Err(PairRejection::AlreadyTracked(pair));
        }
        permit.send(PairCommand::Add(pair.clone()));
        info!(%pair, "pair added");
        self.seed_ticker(&pair);
        Ok(pair)
    }

    /// Fills the new row from REST so it shows a price before the first push.
    fn seed_ticker(&self, pair: &str) {
        let rest = self.rest.clone();
        let tx = self.tx.clone();
        let pair = pair.to_string();
        tokio::spawn(async move {
            match rest.ticker(&pair).await {
                Ok(update) => {
                    let _ = tx.send(Command::Ticker(update));
                }
                Err(err) => debug!(%pair, "no initial ticker: {err}"),
            }
        });
    }

    pub async fn remove(&self, raw: &str) -> Result<String, PairRejection> {
        let pair = Self::normalize(raw)?;
        let permit = self
            .control
            .reserve()
            .await
            .map_err(|_| PairRejection::StreamClosed)?;
        let stored = pair.clone();
        let existed = self.with_store(move |store| store.remove(&stored)).await?;
        permit.send(PairCommand::Remove(pair.clone()));
        if !existed {
            return Err(PairRejection::NotTracked(pair));
        }
        info!(%pair, "pair removed");
        Ok(pair)
    }

    /// Adds every pair in order and reports each outcome on the bus.
    pub async fn add_all_reporting(&self, pairs: Vec<String>) {
        let mut added = 0usize;
        for raw in &pairs {
            match self.add(raw).await {
                Ok(_) => added += 1,
                Err(PairRejection::AlreadyTracked(_)) => {}
                Err(err) => {
                    let _ = self.tx.send(Command::Error(err.to_string()));
                }
            }
        }
        let _ = self.tx.send(Command::Notify(format!(
            "added {added} of {} imported pairs",
            pairs.len()
        )));
    }

    pub async fn add_reporting(&self, raw: String) {
        let command = match self.add(&raw).await {
            Ok(pair) => Command::Notify(format!("Pair {pair} added")),
            Err(err) => Command::Error(err.to_string()),
        };
        let _ = self.tx.send(command);
    }

    pub async fn remove_reporting(&self, raw: String) {
        let command = match self.remove(&raw).await {
            Ok(pair) => Command::Notify(format!("Pair {pair} removed")),
            Err(err) => Command::Error(err.to_string()),
        };
        let _ = self.tx.send(command);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::Json;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{delete, get};
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::command::{AccountKind, OrderSide};
    use crate::config::Credentials;
    use crate::gate_rest::Signer;

    pub(crate) async fn mock_gate(router: Router) -> RestClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let signer = Signer::new(&Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
        });
        RestClient::with_base_url(reqwest::Client::new(), &format!("http://{addr}"), Some(signer))
    }

    async fn currency_pair(Path(pair): Path<String>) -> impl IntoResponse {
        if pair == "BTC_USDT" || pair == "ETH_USDT" {
            (StatusCode::OK, Json(json!({ "id": pair })))
        } else {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "label": "INVALID_CURRENCY_PAIR", "message": "unknown" })),
            )
        }
    }

    pub(crate) fn pairs_router() -> Router {
        Router::new().route("/api/v4/spot/currency_pairs/:pair", get(currency_pair))
    }

    const RATE_LIMIT_HEADER: &str = "x-gate-ratelimit-requests-remain";

    fn order_json(id: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "currency_pair": "BTC_USDT",
            "side": "buy",
            "price": "30000",
            "amount": "0.01",
            "left": "0.01",
            "status": status,
            "create_time_ms": "1700000000000.123"
        })
    }

    fn scratch_journal() -> (TempDir, OrderJournal) {
        let dir = tempdir().unwrap();
        let journal = OrderJournal::new(dir.path().join("trade_logs.jsonl"), 16);
        (dir, journal)
    }

    #[tokio::test]
    async fn controller_validates_and_forwards_pairs() {
        let rest = mock_gate(pairs_router()).await;
        let store = Arc::new(PairStore::in_memory().unwrap());
        let (control_tx, mut control_rx) = mpsc::channel(8);
        let (tx, _rx) = broadcast::channel(16);
        let controller = PairController::new(rest, Arc::clone(&store), control_tx, tx);

        assert_eq!(controller.add(" btc_usdt ").await.unwrap(), "BTC_USDT");
        assert_eq!(
            control_rx.recv().await,
            Some(PairCommand::Add("BTC_USDT".into()))
        );
        assert!(matches!(
            controller.add("BTC_USDT").await,
            Err(PairRejection::AlreadyTracked(_))
        ));
        assert!(matches!(
            controller.add("NOPE_USDT").await,
            Err(PairRejection::Unlisted(_))
        ));
        assert!(matches!(controller.add("  ").await, Err(PairRejection::Missing)));
        assert!(matches!(
            controller.add("BTC/USDT").await,
            Err(PairRejection::Malformed(_))
        ));
        assert_eq!(controller.pairs().await.unwrap(), vec!["BTC_USDT"]);

        assert_eq!(controller.remove("btc_usdt").await.unwrap(), "BTC_USDT");
        assert_eq!(
            control_rx.recv().await,
            Some(PairCommand::Remove("BTC_USDT".into()))
        );
        assert!(!store.contains("BTC_USDT").unwrap());
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_stream_leaves_store_untouched() {
        let rest = mock_gate(pairs_router()).await;
        let store = Arc::new(PairStore::in_memory().unwrap());
        store.insert("BTC_USDT").unwrap();
        let (control_tx, control_rx) = mpsc::channel(8);
        let (tx, _rx) = broadcast::channel(16);
        let controller = PairController::new(rest, Arc::clone(&store), control_tx, tx);
        drop(control_rx);

        assert!(matches!(
            controller.add("ETH_USDT").await,
            Err(PairRejection::StreamClosed)
        ));
        assert!(!store.contains("ETH_USDT").unwrap());
        assert!(matches!(
            controller.add("ETH_USDT").await,
            Err(PairRejection::StreamClosed)
        ));

        assert!(matches!(
            controller.remove("BTC_USDT").await,
            Err(PairRejection::StreamClosed)
        ));
        assert!(store.contains("BTC_USDT").unwrap());
    }

    #[tokio::test]
    async fn added_pair_is_seeded_from_rest_ticker() {
        let router = pairs_router().route(
            "/api/v4/spot/tickers",
            get(|| async {
                (
                    [(RATE_LIMIT_HEADER, "3")],
                    Json(json!([{
                        "currency_pair": "ETH_USDT",
                        "last": "2000.5",
                        "change_percentage": "-1.25",
                        "base_volume": "1500",
                        "quote_volume": "3000000"
                    }])),
                )
            }),
        );
        let rest = mock_gate(router).await;
        let store = Arc::new(PairStore::in_memory().unwrap());
        let (control_tx, _control_rx) = mpsc::channel(8);
        let (tx, mut rx) = broadcast::channel(16);
        let controller = PairController::new(rest, store, control_tx, tx);

        controller.add("eth_usdt").await.unwrap();
        let update = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Command::Ticker(update)) = rx.recv().await {
                    return update;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(update.currency_pair, "ETH_USDT");
        assert_eq!(update.last, 2000.5);
        assert_eq!(update.change_percentage, -1.25);
        assert_eq!(update.base_volume, 1500.0);
    }

    #[tokio::test]
    async fn import_reports_summary() {
        let rest = mock_gate(pairs_router()).await;
        let store = Arc::new(PairStore::in_memory().unwrap());
        let (control_tx, _control_rx) = mpsc::channel(8);
        let (tx, mut rx) = broadcast::channel(16);
        let controller = PairController::new(rest, store, control_tx, tx);

        controller
            .add_all_reporting(vec!["ETH_USDT".into(), "FAKE_USDT".into()])
            .await;
        let mut saw_error = false;
        loop {
            match rx.recv().await.unwrap() {
                Command::Error(message) => {
                    saw_error = true;
                    assert!(message.contains("FAKE_USDT"));
                }
                Command::Notify(message) => {
                    assert_eq!(message, "added 1 of 2 imported pairs");
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn executor_places_then_reloads_open_orders() {
        let router = Router::new()
            .route(
                "/api/v4/spot/orders",
                get(|| async { Json(json!([order_json("7", "open")])) })
                    .post(|| async { Json(order_json("7", "open")) }),
            )
            .route(
                "/api/v4/spot/orders/:id",
                get(|| async { Json(order_json("7", "closed")) }).delete(|| async {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "label": "ORDER_NOT_FOUND", "message": "gone" })),
                    )
                }),
            );
        let rest = mock_gate(router).await;
        let (tx, mut rx) = broadcast::channel(16);
        let (_dir, journal) = scratch_journal();
        let executor = OrderExecutor::new(rest, tx, journal.clone());

        executor
            .handle(TradingCommand::Place(OrderRequest {
                currency_pair: "BTC_USDT".into(),
                side: OrderSide::Buy,
                price: 30000.0,
                amount: 0.01,
            }))
            .await;
        match rx.recv().await.unwrap() {
            Command::TradeResult(TradeEvent::Order(response)) => {
                assert!(response.success);
                assert_eq!(response.order_id.as_deref(), Some("7"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Command::Orders(OrderSnapshot::Open { pair, orders }) => {
                assert_eq!(pair, "BTC_USDT");
                assert_eq!(orders.len(), 1);
                assert_eq!(orders[0].create_time_ms, Some(1_700_000_000_000));
            }
            other => panic!("unexpected {other:?}"),
        }

        executor
            .handle(TradingCommand::Cancel {
                currency_pair: "BTC_USDT".into(),
                order_id: "7".into(),
            })
            .await;
        match rx.recv().await.unwrap() {
            Command::TradeResult(event) => {
                assert!(!event.success());
                assert!(event.message().contains("ORDER_NOT_FOUND"));
                assert!(event.message().ends_with("order is closed"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(journal.load().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn poller_publishes_snapshot_with_margin_rows() {
        let router = Router::new()
            .route(
                "/api/v4/spot/accounts",
                get(|| async {
                    Json(json!([
                        { "currency": "USDT", "available": "120.5", "locked": "0" },
                        { "currency": "DOGE", "available": "0.1", "locked": "0" }
                    ]))
                }),
            )
            .route(
                "/api/v4/margin/accounts",
                get(|| async {
                    Json(json!([{
                        "currency_pair": "ETH_USDT",
                        "base": { "currency": "ETH", "available": "2", "locked": "0" },
                        "quote": { "currency": "USDT", "available": "10", "locked": "1" }
                    }]))
                }),
            )
            .route(
                "/api/v4/wallet/total_balance",
                get(|| async { Json(json!({ "total": { "amount": "1234.5", "currency": "USDT" } })) }),
            );
        let rest = mock_gate(router).await;
        let (tx, mut rx) = broadcast::channel(16);
        let poller = BalancePoller::new(rest, tx, Duration::from_secs(60), true);
        poller.refresh(false).await;
        match rx.recv().await.unwrap() {
            Command::Balances(snapshot) => {
                assert_eq!(snapshot.total_usdt, Some(1234.5));
                assert_eq!(snapshot.rows.len(), 4);
                assert_eq!(snapshot.rows[0].currency, "USDT");
                assert_eq!(snapshot.rows[3].currency, "ETH_USDT:USDT");
                assert_eq!(snapshot.rows[3].account, AccountKind::Margin);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
