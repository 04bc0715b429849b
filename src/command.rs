use serde::{Deserialize, Serialize};

/// Messages carried on the application bus between the socket task, the
/// pollers and the UI.
#[derive(Debug, Clone)]
pub enum Command {
    Ticker(TickerUpdate),
    Candle(Candlestick),
    PairTracked(String),
    PairUntracked(String),
    Connection(ConnectionStatus),
    BalancesChanged,
    Balances(BalanceSnapshot),
    Orders(OrderSnapshot),
    TradeResult(TradeEvent),
    Notify(String),
    Error(String),
}

/// Requests to mutate the live subscription set. Only the socket task owns the
/// set; everyone else goes through this channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairCommand {
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connecting { attempt: u32 },
    Connected,
    Disconnected { reason: String, retry_in_ms: u64 },
    GaveUp { attempts: u32 },
}

impl ConnectionStatus {
    pub fn label(&self) -> String {
        match self {
            ConnectionStatus::Connecting { attempt } if *attempt <= 1 => "connecting".to_string(),
            ConnectionStatus::Connecting { attempt } => format!("reconnecting (#{attempt})"),
            ConnectionStatus::Connected => "live".to_string(),
            ConnectionStatus::Disconnected { retry_in_ms, .. } => {
                format!("offline, retry in {:.1}s", *retry_in_ms as f64 / 1000.0)
            }
            ConnectionStatus::GaveUp { attempts } => format!("offline, gave up after {attempts}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub currency_pair: String,
    pub last: f64,
    pub change_percentage: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    /// Exchange timestamp in milliseconds.
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candlestick {
    /// Bar open time in seconds since the epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub subscription_name: String,
    pub base_currency_amount: f64,
    pub window_close: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub currency: String,
    pub available: f64,
    pub locked: f64,
    pub total: f64,
    #[serde(default)]
    pub account: AccountKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccountKind {
    #[default]
    Spot,
    Margin,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceSnapshot {
    pub rows: Vec<BalanceRow>,
    pub total_usdt: Option<f64>,
    pub fetched_at_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_gate_side(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub currency_pair: String,
    pub side: OrderSide,
    pub price: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderInfo {
    pub id: String,
    pub currency_pair: String,
    pub side: String,
    pub price: Option<f64>,
    pub amount: f64,
    pub left: Option<f64>,
    pub status: String,
    pub create_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeFill {
    pub id: String,
    pub order_id: String,
    pub currency_pair: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub fee: Option<f64>,
    pub fee_currency: Option<String>,
    pub create_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdersView {
    Open,
    Finished,
    Trades,
    Log,
}

impl OrdersView {
    pub fn next(self) -> OrdersView {
        match self {
            OrdersView::Open => OrdersView::Finished,
            OrdersView::Finished => OrdersView::Trades,
            OrdersView::Trades => OrdersView::Log,
            OrdersView::Log => OrdersView::Open,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            OrdersView::Open => "Open Orders",
            OrdersView::Finished => "Order History",
            OrdersView::Trades => "My Trades",
            OrdersView::Log => "Order Log",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderSnapshot {
    Open { pair: String, orders: Vec<OrderInfo> },
    Finished { pair: String, orders: Vec<OrderInfo> },
    Trades { pair: String, trades: Vec<TradeFill> },
}

impl OrderSnapshot {
    pub fn pair(&self) -> &str {
        match self {
            OrderSnapshot::Open { pair, .. }
            | OrderSnapshot::Finished { pair, .. }
            | OrderSnapshot::Trades { pair, .. } => pair,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TradingCommand {
    Place(OrderRequest),
    Cancel { currency_pair: String, order_id: String },
    Load { currency_pair: String, view: LoadView },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LoadView {
    Open,
    Finished,
    Trades,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResponse {
    pub request: OrderRequest,
    pub order_id: Option<String>,
    pub message: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelResponse {
    pub currency_pair: String,
    pub order_id: String,
    pub message: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TradeEvent {
    Order(OrderResponse),
    Cancel(CancelResponse),
}

impl TradeEvent {
    pub fn success(&self) -> bool {
        match self {
            TradeEvent::Order(response) => response.success,
            TradeEvent::Cancel(response) => response.success,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TradeEvent::Order(response) => &response.message,
            TradeEvent::Cancel(response) => &response.message,
        }
    }

    pub fn currency_pair(&self) -> &str {
        match self {
            TradeEvent::Order(response) => &response.request.currency_pair,
            TradeEvent::Cancel(response) => &response.currency_pair,
        }
    }
}
