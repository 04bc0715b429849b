//! Signed REST access to the Gate.io v4 spot, wallet and margin endpoints.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha512};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::command::{AccountKind, BalanceRow, OrderInfo, OrderRequest, TickerUpdate, TradeFill};
use crate::config::Credentials;
use crate::error::{GateError, GateResult};

pub const REST_BASE_URL: &str = "https://api.gateio.ws";
const API_PREFIX: &str = "/api/v4";
const BALANCE_CACHE_TTL: Duration = Duration::from_secs(5);
const BALANCE_CACHE_CAPACITY: usize = 10;
const HISTORY_LIMIT: u32 = 100;
const RATE_LIMIT_REMAIN: &str = "X-Gate-RateLimit-Requests-Remain";
const RATE_LIMIT_RESET: &str = "X-Gate-RateLimit-Reset-Timestamp";

pub fn hmac_sha512_hex(secret: &str, payload: &str) -> GateResult<String> {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .map_err(|err| GateError::Auth(format!("invalid api secret: {err}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn hash_body(body: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct Signer {
    api_key: String,
    api_secret: String,
}

impl Signer {
    pub fn new(credentials: &Credentials) -> Self {
        Signer {
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// `METHOD\n/api/v4/path\nquery\nhex(sha512(body))\ntimestamp`
    pub fn sign(
        &self,
        method: &str,
        api_path: &str,
        query: &str,
        body: &str,
        timestamp: &str,
    ) -> GateResult<String> {
        let payload = format!(
            "{method}\n{api_path}\n{query}\n{}\n{timestamp}",
            hash_body(body)
        );
        hmac_sha512_hex(&self.api_secret, &payload)
    }

    /// Signature for an authenticated websocket channel.
    pub fn sign_channel(&self, channel: &str, event: &str, time: i64) -> GateResult<String> {
        hmac_sha512_hex(
            &self.api_secret,
            &format!("channel={channel}&event={event}&time={time}"),
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            wait: Duration::from_secs(2),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error or the
/// attempts run out.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> GateResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GateResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(%label, attempt, error = %err, "request failed, retrying");
                sleep(policy.wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Small time-bounded cache; the oldest entry is evicted once `capacity` is hit.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        TtlCache {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    fn get_at(&mut self, key: &K, now: Instant) -> Option<V> {
        let fresh = match self.entries.get(key) {
            Some((stored, _)) => now.saturating_duration_since(*stored) < self.ttl,
            None => return None,
        };
        if !fresh {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|(_, value)| value.clone())
    }

    fn insert_at(&mut self, key: K, value: V, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (stored, _))| *stored)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (now, value));
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    label: String,
    #[serde(default)]
    message: String,
}

fn status_error(status: StatusCode, body: &str) -> GateError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => GateError::Status {
            status,
            label: parsed.label,
            message: parsed.message,
        },
        Err(_) => GateError::Status {
            status,
            label: String::new(),
            message: body.trim().to_string(),
        },
    }
}

/// Gate encodes most decimals as strings; some timestamps arrive as numbers.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Num(value)) => Some(value),
        Some(Raw::Str(text)) => text.trim().parse::<f64>().ok(),
        None => None,
    })
}

#[derive(Debug, Deserialize)]
pub struct SpotAccount {
    pub currency: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub available: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub locked: Option<f64>,
}

impl SpotAccount {
    pub fn into_row(self) -> BalanceRow {
        let available = self.available.unwrap_or(0.0);
        let locked = self.locked.unwrap_or(0.0);
        BalanceRow {
            currency: self.currency,
            available,
            locked,
            total: available + locked,
            account: AccountKind::Spot,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MarginBalance {
    #[serde(default)]
    pub currency: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub available: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub locked: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct MarginAccount {
    pub currency_pair: String,
    pub base: MarginBalance,
    pub quote: MarginBalance,
}

impl MarginAccount {
    /// One row per side, labelled `PAIR:CURRENCY`.
    pub fn into_rows(self) -> Vec<BalanceRow> {
        let pair = self.currency_pair;
        [self.base, self.quote]
            .into_iter()
            .map(|side| {
                let available = side.available.unwrap_or(0.0);
                let locked = side.locked.unwrap_or(0.0);
                BalanceRow {
                    currency: format!("{pair}:{}", side.currency),
                    available,
                    locked,
                    total: available + locked,
                    account: AccountKind::Margin,
                }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct TotalBalance {
    total: TotalAmount,
}

#[derive(Debug, Deserialize)]
struct TotalAmount {
    #[serde(default, deserialize_with = "lenient_f64")]
    amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ApiOrder {
    pub id: String,
    pub currency_pair: String,
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub left: Option<f64>,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub create_time_ms: Option<f64>,
}

impl ApiOrder {
    pub fn into_info(self) -> OrderInfo {
        OrderInfo {
            id: self.id,
            currency_pair: self.currency_pair,
            side: self.side,
            price: self.price,
            amount: self.amount.unwrap_or(0.0),
            left: self.left,
            status: self.status,
            create_time_ms: self.create_time_ms.map(|ms| ms as i64),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiTrade {
    pub id: String,
    #[serde(default)]
    pub order_id: String,
    pub currency_pair: String,
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fee: Option<f64>,
    #[serde(default)]
    pub fee_currency: Option<String>,
    /// Seconds with a millisecond fraction, e.g. `"1646813231.183"`.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub create_time_ms: Option<f64>,
}

impl ApiTrade {
    pub fn into_fill(self) -> TradeFill {
        TradeFill {
            id: self.id,
            order_id: self.order_id,
            currency_pair: self.currency_pair,
            side: self.side,
            price: self.price.unwrap_or(0.0),
            amount: self.amount.unwrap_or(0.0),
            fee: self.fee,
            fee_currency: self.fee_currency,
            create_time_ms: self.create_time_ms.map(normalize_millis),
        }
    }
}

fn normalize_millis(raw: f64) -> i64 {
    // Values below ~year 2286 in seconds are scaled up.
    if raw < 10_000_000_000.0 {
        (raw * 1000.0).round() as i64
    } else {
        raw as i64
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiTicker {
    pub currency_pair: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub last: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub change_percentage: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub base_volume: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quote_volume: Option<f64>,
}

impl ApiTicker {
    pub fn into_update(self, time: i64) -> TickerUpdate {
        TickerUpdate {
            currency_pair: self.currency_pair,
            last: self.last.unwrap_or(0.0),
            change_percentage: self.change_percentage.unwrap_or(0.0),
            base_volume: self.base_volume.unwrap_or(0.0),
            quote_volume: self.quote_volume.unwrap_or(0.0),
            time,
        }
    }
}

#[derive(Debug, Serialize)]
struct NewOrderBody<'a> {
    text: String,
    currency_pair: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    account: &'a str,
    side: &'a str,
    amount: String,
    price: String,
    time_in_force: &'a str,
}

#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    signer: Option<Signer>,
    retry: RetryPolicy,
    balance_cache: Arc<Mutex<TtlCache<&'static str, Vec<BalanceRow>>>>,
}

impl RestClient {
    pub fn new(credentials: Option<&Credentials>) -> GateResult<Self> {
        Ok(Self::with_base_url(
            build_http_client()?,
            REST_BASE_URL,
            credentials.map(Signer::new),
        ))
    }

    pub fn with_base_url(client: Client, base_url: &str, signer: Option<Signer>) -> Self {
        RestClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            retry: RetryPolicy::default(),
            balance_cache: Arc::new(Mutex::new(TtlCache::new(
                BALANCE_CACHE_TTL,
                BALANCE_CACHE_CAPACITY,
            ))),
        }
    }

    pub fn signer(&self) -> Option<&Signer> {
        self.signer.as_ref()
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &str,
        body: Option<String>,
        signed: bool,
    ) -> GateResult<T> {
        let api_path = format!("{API_PREFIX}{path}");
        let url = if query.is_empty() {
            format!("{}{api_path}", self.base_url)
        } else {
            format!("{}{api_path}?{query}", self.base_url)
        };
        let body = body.unwrap_or_default();
        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header("Accept", "application/json");
        if signed {
            let signer = self
                .signer
                .as_ref()
                .ok_or_else(|| GateError::Auth("API_KEY and API_SECRET are not set".into()))?;
            let timestamp = Utc::now().timestamp().to_string();
            let sign = signer.sign(method.as_str(), &api_path, query, &body, &timestamp)?;
            builder = builder
                .header("KEY", signer.api_key())
                .header("Timestamp", timestamp)
                .header("SIGN", sign);
        }
        if !body.is_empty() {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body);
        }
        debug!(%method, %api_path, "gate rest request");
        let response = builder.send().await?;
        let status = response.status();
        if let Some(remain) = low_rate_limit(response.headers(), signed) {
            let reset = response
                .headers()
                .get(RATE_LIMIT_RESET)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("unknown");
            warn!(%api_path, remain, reset, "close to the gate.io rate limit");
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_retried<T: DeserializeOwned>(
        &self,
        label: &str,
        path: &str,
        query: &str,
        signed: bool,
    ) -> GateResult<T> {
        retry(self.retry, label, || {
            self.request(Method::GET, path, query, None, signed)
        })
        .await
    }

    /// Spot balances, served from a short-lived cache unless `force_refresh`.
    pub async fn balances(&self, force_refresh: bool) -> GateResult<Vec<BalanceRow>> {
        const KEY: &str = "spot";
        if !force_refresh {
            if let Some(rows) = self.cache().get(&KEY) {
                return Ok(rows);
            }
        }
        let accounts: Vec<SpotAccount> = self
            .get_retried("balances", "/spot/accounts", "", true)
            .await?;
        let rows: Vec<BalanceRow> = accounts.into_iter().map(SpotAccount::into_row).collect();
        self.cache().insert(KEY, rows.clone());
        Ok(rows)
    }

    pub fn invalidate_balances(&self) {
        self.cache().invalidate(&"spot");
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, TtlCache<&'static str, Vec<BalanceRow>>> {
        self.balance_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Estimated total of all accounts, in USDT.
    pub async fn total_balance(&self) -> GateResult<f64> {
        let query = serde_urlencoded::to_string([("currency", "USDT")])?;
        let total: TotalBalance = self
            .get_retried("total_balance", "/wallet/total_balance", &query, true)
            .await?;
        Ok(total.total.amount.unwrap_or(0.0))
    }

    pub async fn margin_accounts(&self) -> GateResult<Vec<BalanceRow>> {
        let accounts: Vec<MarginAccount> = self
            .get_retried("margin_accounts", "/margin/accounts", "", true)
            .await?;
        Ok(accounts
            .into_iter()
            .flat_map(MarginAccount::into_rows)
            .collect())
    }

    pub async fn open_orders(&self, currency_pair: &str) -> GateResult<Vec<OrderInfo>> {
        let query = serde_urlencoded::to_string([
            ("currency_pair", currency_pair),
            ("status", "open"),
        ])?;
        let orders: Vec<ApiOrder> = self
            .get_retried("open_orders", "/spot/orders", &query, true)
            .await?;
        Ok(orders.into_iter().map(ApiOrder::into_info).collect())
    }

    pub async fn order_history(&self, currency_pair: &str) -> GateResult<Vec<OrderInfo>> {
        let limit = HISTORY_LIMIT.to_string();
        let query = serde_urlencoded::to_string([
            ("currency_pair", currency_pair),
            ("status", "finished"),
            ("limit", limit.as_str()),
        ])?;
        let orders: Vec<ApiOrder> = self
            .get_retried("order_history", "/spot/orders", &query, true)
            .await?;
        Ok(orders.into_iter().map(ApiOrder::into_info).collect())
    }

    pub async fn order_status(&self, currency_pair: &str, order_id: &str) -> GateResult<OrderInfo> {
        let query = serde_urlencoded::to_string([("currency_pair", currency_pair)])?;
        let path = format!("/spot/orders/{order_id}");
        let order: ApiOrder = self
            .get_retried("order_status", &path, &query, true)
            .await?;
        Ok(order.into_info())
    }

    pub async fn trade_history(&self, currency_pair: &str) -> GateResult<Vec<TradeFill>> {
        let limit = HISTORY_LIMIT.to_string();
        let query = serde_urlencoded::to_string([
            ("currency_pair", currency_pair),
            ("limit", limit.as_str()),
        ])?;
        let trades: Vec<ApiTrade> = self
            .get_retried("trade_history", "/spot/my_trades", &query, true)
            .await?;
        Ok(trades.into_iter().map(ApiTrade::into_fill).collect())
    }

    /// Limit order, good till cancelled. Never retried: a timeout may still
    /// have placed the order.
    pub async fn place_order(&self, request: &OrderRequest) -> GateResult<OrderInfo> {
        validate_order(request)?;
        let body = serde_json::to_string(&new_order_body(request))?;
        let order: ApiOrder = self
            .request(Method::POST, "/spot/orders", "", Some(body), true)
            .await?;
        self.invalidate_balances();
        Ok(order.into_info())
    }

    pub async fn cancel_order(&self, currency_pair: &str, order_id: &str) -> GateResult<OrderInfo> {
        if order_id.trim().is_empty() {
            return Err(GateError::InvalidInput("order id is empty".into()));
        }
        let query = serde_urlencoded::to_string([("currency_pair", currency_pair)])?;
        let path = format!("/spot/orders/{order_id}");
        let order: ApiOrder = retry(self.retry, "cancel_order", || {
            self.request(Method::DELETE, &path, &query, None, true)
        })
        .await?;
        self.invalidate_balances();
        Ok(order.into_info())
    }

    pub async fn ticker(&self, currency_pair: &str) -> GateResult<TickerUpdate> {
        let query = serde_urlencoded::to_string([("currency_pair", currency_pair)])?;
        let tickers: Vec<ApiTicker> = self
            .get_retried("ticker", "/spot/tickers", &query, false)
            .await?;
        let now = Utc::now().timestamp_millis();
        tickers
            .into_iter()
            .next()
            .map(|ticker| ticker.into_update(now))
            .ok_or_else(|| GateError::InvalidInput(format!("no ticker for {currency_pair}")))
    }

    /// Whether the exchange lists `currency_pair`. Unknown pairs answer with a
    /// 4xx, which is reported as `false` rather than an error.
    pub async fn is_valid_pair(&self, currency_pair: &str) -> GateResult<bool> {
        if currency_pair.trim().is_empty() {
            return Ok(false);
        }
        let path = format!("/spot/currency_pairs/{currency_pair}");
        match self
            .get_retried::<serde_json::Value>("is_valid_pair", &path, "", false)
            .await
        {
            Ok(_) => Ok(true),
            Err(GateError::Status { status, .. }) if status.is_client_error() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// The remaining request quota, when it has dropped below a tenth of the
/// per-second budget (10 for private endpoints, 100 for public ones).
fn low_rate_limit(headers: &HeaderMap, signed: bool) -> Option<u32> {
    let remain: u32 = headers
        .get(RATE_LIMIT_REMAIN)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let budget = if signed { 10 } else { 100 };
    (remain.saturating_mul(10) < budget).then_some(remain)
}

fn validate_order(request: &OrderRequest) -> GateResult<()> {
    if request.currency_pair.trim().is_empty() {
        return Err(GateError::InvalidInput("currency pair is empty".into()));
    }
    if !(request.price.is_finite() && request.price > 0.0) {
        return Err(GateError::InvalidInput(format!(
            "price must be positive, got {}",
            request.price
        )));
    }
    if !(request.amount.is_finite() && request.amount > 0.0) {
        return Err(GateError::InvalidInput(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }
    Ok(())
}

fn new_order_body(request: &OrderRequest) -> NewOrderBody<'_> {
    NewOrderBody {
        text: format!("t-{}", Utc::now().timestamp_millis()),
        currency_pair: &request.currency_pair,
        order_type: "limit",
        account: "spot",
        side: request.side.as_gate_side(),
        amount: request.amount.to_string(),
        price: request.price.to_string(),
        time_in_force: "gtc",
    }
}

pub fn build_http_client() -> GateResult<Client> {
    Ok(ClientBuilder::new()
        .connect_timeout(Duration::from_secs(5))
        .read_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(20))
        .build()?)
}
