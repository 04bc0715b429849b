use anyhow::anyhow;
use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use reqwest::Client;
use reqwest_websocket::{Message, RequestBuilderExt, WebSocket};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::{Candlestick, Command, ConnectionStatus, PairCommand, TickerUpdate};
use crate::config::normalize_pair;
use crate::gate_rest::{Signer, build_http_client};
use crate::subscription::{
    AddOutcome, ControlEvent, ControlFrame, RemoveOutcome, SubscriptionManager, WsAuth,
};

pub const SPOT_WS_ENDPOINT: &str = "wss://api.gateio.ws/ws/v4/";
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// A session that stays up this long counts as healthy even without data.
const STABLE_SESSION: Duration = Duration::from_secs(30);
const MAX_JITTER_MS: u64 = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// Delay schedule between reconnect attempts. Attempts count from 1.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    backoff: Backoff,
    delay: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration, max_retries: Option<u32>) -> Self {
        ReconnectPolicy {
            backoff: Backoff::Fixed,
            delay,
            max_delay: delay,
            max_retries,
        }
    }

    pub fn linear(delay: Duration, max_delay: Duration, max_retries: Option<u32>) -> Self {
        ReconnectPolicy {
            backoff: Backoff::Linear,
            delay,
            max_delay,
            max_retries,
        }
    }

    pub fn exponential(delay: Duration, max_delay: Duration, max_retries: Option<u32>) -> Self {
        ReconnectPolicy {
            backoff: Backoff::Exponential,
            delay,
            max_delay,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// `delay_for` plus up to one second of random jitter for exponential
    /// backoff, so many clients do not reconnect in lockstep.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if self.backoff != Backoff::Exponential {
            return base;
        }
        let jitter = rand::rng().random_range(0..=MAX_JITTER_MS);
        base + Duration::from_millis(jitter)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max| failures > max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::exponential(Duration::from_secs(1), Duration::from_secs(32), None)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    time: i64,
    #[serde(default)]
    time_ms: Option<i64>,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WsError>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct WsError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    currency_pair: String,
    last: String,
    #[serde(default)]
    change_percentage: String,
    #[serde(default)]
    base_volume: String,
    #[serde(default)]
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    t: String,
    o: String,
    h: String,
    l: String,
    c: String,
    #[serde(default)]
    v: String,
    n: String,
    #[serde(default)]
    a: String,
    #[serde(default)]
    w: bool,
}

/// A decoded server frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Ticker(TickerUpdate),
    Candle(Candlestick),
    BalancesChanged,
    Ack {
        channel: String,
        event: String,
    },
    Error {
        channel: String,
        event: String,
        error: WsError,
    },
    Pong,
    Ignored,
}

fn number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

fn number_or_zero(text: &str) -> f64 {
    if text.trim().is_empty() {
        0.0
    } else {
        number(text).unwrap_or(0.0)
    }
}

pub fn parse_message(text: &str) -> Result<Inbound, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if let Some(error) = envelope.error {
        return Ok(Inbound::Error {
            channel: envelope.channel,
            event: envelope.event,
            error,
        });
    }
    if envelope.channel == "spot.pong" {
        return Ok(Inbound::Pong);
    }
    if envelope.event == "subscribe" || envelope.event == "unsubscribe" {
        return Ok(Inbound::Ack {
            channel: envelope.channel,
            event: envelope.event,
        });
    }
    if envelope.event != "update" {
        return Ok(Inbound::Ignored);
    }
    let Some(result) = envelope.result else {
        return Ok(Inbound::Ignored);
    };
    let time = envelope.time_ms.unwrap_or(envelope.time.saturating_mul(1000));
    match envelope.channel.as_str() {
        "spot.tickers" => {
            let raw: RawTicker = serde_json::from_value(result)?;
            let Some(last) = number(&raw.last) else {
                return Ok(Inbound::Ignored);
            };
            Ok(Inbound::Ticker(TickerUpdate {
                currency_pair: raw.currency_pair,
                last,
                change_percentage: number_or_zero(&raw.change_percentage),
                base_volume: number_or_zero(&raw.base_volume),
                quote_volume: number_or_zero(&raw.quote_volume),
                time,
            }))
        }
        "spot.candlesticks" => {
            let raw: RawCandle = serde_json::from_value(result)?;
            let parsed = (
                raw.t.trim().parse::<i64>().ok(),
                number(&raw.o),
                number(&raw.h),
                number(&raw.l),
                number(&raw.c),
            );
            let (Some(timestamp), Some(open), Some(high), Some(low), Some(close)) = parsed else {
                return Ok(Inbound::Ignored);
            };
            Ok(Inbound::Candle(Candlestick {
                timestamp,
                open,
                high,
                low,
                close,
                volume: number_or_zero(&raw.v),
                subscription_name: raw.n,
                base_currency_amount: number_or_zero(&raw.a),
                window_close: raw.w,
            }))
        }
        "spot.balances" => Ok(Inbound::BalancesChanged),
        _ => Ok(Inbound::Ignored),
    }
}

fn ping_frame() -> String {
    format!(r#"{{"time":{},"channel":"spot.ping"}}"#, Utc::now().timestamp())
}

/// Authenticated `spot.balances` subscription.
pub fn balances_frame(signer: &Signer) -> anyhow::Result<ControlFrame> {
    let mut frame = ControlFrame::new("spot.balances", ControlEvent::Subscribe, None);
    let sign = signer.sign_channel("spot.balances", "subscribe", frame.time)?;
    frame.auth = Some(WsAuth {
        method: "api_key".to_string(),
        key: signer.api_key().to_string(),
        sign,
    });
    Ok(frame)
}

enum SessionEnd {
    Exit,
    /// `stable` is set once the server delivered data or the session outlived
    /// `STABLE_SESSION`; only then is the failure counter reset.
    Dropped { reason: String, stable: bool },
}

impl SessionEnd {
    fn dropped(reason: impl Into<String>) -> Self {
        SessionEnd::Dropped {
            reason: reason.into(),
            stable: false,
        }
    }
}

pub struct GateWsClient {
    client: Client,
    endpoint: String,
    tx: broadcast::Sender<Command>,
    policy: ReconnectPolicy,
    signer: Option<Signer>,
    ping_interval: Duration,
}

impl GateWsClient {
    pub fn new(tx: broadcast::Sender<Command>, policy: ReconnectPolicy) -> anyhow::Result<Self> {
        Ok(GateWsClient {
            client: build_http_client()?,
            endpoint: SPOT_WS_ENDPOINT.to_string(),
            tx,
            policy,
            signer: None,
            ping_interval: PING_INTERVAL,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Also subscribe the authenticated balance channel on every connection.
    pub fn with_balance_updates(mut self, signer: Option<Signer>) -> Self {
        self.signer = signer;
        self
    }

    fn emit(&self, command: Command) {
        let _ = self.tx.send(command);
    }

    fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.emit(Command::Error(message));
    }

    async fn connect(&self) -> anyhow::Result<WebSocket> {
        let response = self.client.get(&self.endpoint).upgrade().send().await?;
        Ok(response.into_websocket().await?)
    }

    /// Keeps the socket subscribed to every pair in `manager` until the exit
    /// signal fires or the retry budget runs out.
    pub async fn run(
        &self,
        mut manager: SubscriptionManager,
        mut control: mpsc::Receiver<PairCommand>,
        mut exit_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut failures: u32 = 0;
        loop {
            self.emit(Command::Connection(ConnectionStatus::Connecting {
                attempt: failures + 1,
            }));
            let end = match self.connect().await {
                Ok(websocket) => {
                    self.session(websocket, &mut manager, &mut control, &mut exit_rx)
                        .await
                }
                Err(err) => SessionEnd::dropped(format!("failed to connect to gate.io: {err}")),
            };
            manager.on_disconnected();
            let reason = match end {
                SessionEnd::Exit => return Ok(()),
                SessionEnd::Dropped { reason, stable } => {
                    if stable {
                        failures = 0;
                    }
                    reason
                }
            };

            failures += 1;
            if self.policy.exhausted(failures) {
                self.emit(Command::Connection(ConnectionStatus::GaveUp {
                    attempts: failures,
                }));
                return Err(anyhow!(
                    "gave up reconnecting after {failures} attempts: {reason}"
                ));
            }
            let delay = self.policy.jittered_delay_for(failures);
            self.emit_error(reason.clone());
            self.emit(Command::Connection(ConnectionStatus::Disconnected {
                reason,
                retry_in_ms: delay.as_millis() as u64,
            }));

            let wake_at = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = time::sleep_until(wake_at) => break,
                    message = exit_rx.recv() => match message {
                        Ok(_) | Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    },
                    command = control.recv() => match command {
                        Some(command) => {
                            self.apply(&mut manager, command);
                        }
                        None => return Ok(()),
                    },
                }
            }
        }
    }

    /// Applies an add/remove to the subscription set and returns the frames
    /// to send; nothing is returned while the socket is down.
    fn apply(&self, manager: &mut SubscriptionManager, command: PairCommand) -> Vec<ControlFrame> {
        match command {
            PairCommand::Add(raw) => {
                let pair = normalize_pair(&raw).unwrap_or_else(|| raw.trim().to_string());
                match manager.add_pair(&raw) {
                    AddOutcome::Subscribe(frames) => {
                        info!(%pair, "subscribing");
                        self.emit(Command::PairTracked(pair));
                        frames
                    }
                    AddOutcome::Queued => {
                        info!(%pair, "queued subscription until reconnect");
                        self.emit(Command::PairTracked(pair));
                        Vec::new()
                    }
                    AddOutcome::AlreadyTracked => Vec::new(),
                    AddOutcome::Invalid => {
                        self.emit_error(format!("invalid pair `{raw}`"));
                        Vec::new()
                    }
                }
            }
            PairCommand::Remove(raw) => {
                let pair = normalize_pair(&raw).unwrap_or_else(|| raw.trim().to_string());
                match manager.remove_pair(&raw) {
                    RemoveOutcome::Unsubscribe(frames) => {
                        info!(%pair, "unsubscribing");
                        self.emit(Command::PairUntracked(pair));
                        frames
                    }
                    RemoveOutcome::Dropped => {
                        self.emit(Command::PairUntracked(pair));
                        Vec::new()
                    }
                    RemoveOutcome::NotTracked => Vec::new(),
                }
            }
        }
    }

    async fn session(
        &self,
        websocket: WebSocket,
        manager: &mut SubscriptionManager,
        control: &mut mpsc::Receiver<PairCommand>,
        exit_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = websocket.split();

        let mut frames = manager.on_connected();
        if let Some(signer) = &self.signer {
            match balances_frame(signer) {
                Ok(frame) => frames.push(frame),
                Err(err) => self.emit_error(format!("cannot sign spot.balances: {err}")),
            }
        }
        for frame in frames {
            if let Err(reason) = send_frame(&mut ws_tx, &frame).await {
                return SessionEnd::dropped(reason);
            }
        }
        info!(pairs = manager.pairs().len(), "gate.io websocket connected");
        self.emit(Command::Connection(ConnectionStatus::Connected));

        let started = Instant::now();
        let mut received = false;
        let dropped = |reason: String, received: bool| SessionEnd::Dropped {
            reason,
            stable: received || started.elapsed() >= STABLE_SESSION,
        };
        let mut ping = time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        loop {
            tokio::select! {
                message = exit_rx.recv() => match message {
                    Ok(_) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = ws_tx.close().await;
                        return SessionEnd::Exit;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                },
                command = control.recv() => {
                    let Some(command) = command else {
                        let _ = ws_tx.close().await;
                        return SessionEnd::Exit;
                    };
                    let frames = self.apply(manager, command);
                    for frame in frames {
                        if let Err(reason) = send_frame(&mut ws_tx, &frame).await {
                            return dropped(reason, received);
                        }
                    }
                }
                _ = ping.tick() => {
                    if let Err(err) = ws_tx.send(Message::Text(ping_frame())).await {
                        return dropped(format!("failed to send ping: {err}"), received);
                    }
                }
                result = ws_rx.next() => match result {
                    Some(Ok(Message::Text(text))) => {
                        received = true;
                        self.dispatch(manager, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = ws_tx.send(Message::Pong(payload)).await {
                            return dropped(format!("failed to reply pong: {err}"), received);
                        }
                    }
                    Some(Ok(Message::Close { code, reason })) => {
                        return dropped(
                            format!("websocket closed by server: code={code}, reason={reason:?}"),
                            received,
                        );
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Err(err)) => {
                        return dropped(format!("websocket read error: {err}"), received);
                    }
                    None => return dropped("websocket stream ended".to_string(), received),
                },
            }
        }
    }

    fn dispatch(&self, manager: &SubscriptionManager, text: &str) {
        match parse_message(text) {
            Ok(Inbound::Ticker(update)) => {
                if manager.accepts(&update) {
                    self.emit(Command::Ticker(update));
                }
            }
            Ok(Inbound::Candle(candle)) => {
                if candle_is_tracked(manager, &candle) {
                    self.emit(Command::Candle(candle));
                }
            }
            Ok(Inbound::BalancesChanged) => self.emit(Command::BalancesChanged),
            Ok(Inbound::Ack { channel, event }) => debug!(%channel, %event, "acknowledged"),
            Ok(Inbound::Error {
                channel,
                event,
                error,
            }) => self.emit_error(format!(
                "{channel} {event} rejected ({}): {}",
                error.code, error.message
            )),
            Ok(Inbound::Pong) | Ok(Inbound::Ignored) => {}
            Err(err) => debug!(error = %err, "unparsed websocket frame"),
        }
    }
}

/// Candle names look like `1m_BTC_USDT`; the pair follows the first `_`.
fn candle_is_tracked(manager: &SubscriptionManager, candle: &Candlestick) -> bool {
    candle
        .subscription_name
        .split_once('_')
        .is_some_and(|(_, pair)| manager.contains(pair))
}

async fn send_frame<S>(ws_tx: &mut S, frame: &ControlFrame) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let payload = frame
        .to_json()
        .map_err(|err| format!("failed to encode {} frame: {err}", frame.channel))?;
    debug!(channel = %frame.channel, "sending control frame");
    ws_tx
        .send(Message::Text(payload))
        .await
        .map_err(|err| format!("failed to send {} request: {err}", frame.channel))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::extract::ws::{Message as ServerMessage, WebSocket as ServerSocket, WebSocketUpgrade};
    use axum::response::Response;
    use axum::routing::get;
    use tokio::time::timeout;

    use super::*;
    use crate::config::Credentials;
    use crate::subscription::PairChannel;

    #[derive(Clone)]
    struct MockSocket {
        frames: mpsc::UnboundedSender<(usize, String)>,
        connections: Arc<AtomicUsize>,
        /// Connections numbered below this are closed after their first frame.
        close_below: usize,
    }

    async fn upgrade(ws: WebSocketUpgrade, State(state): State<MockSocket>) -> Response {
        ws.on_upgrade(move |socket| serve_socket(socket, state))
    }

    async fn serve_socket(mut socket: ServerSocket, state: MockSocket) {
        let index = state.connections.fetch_add(1, Ordering::SeqCst);
        while let Some(Ok(message)) = socket.recv().await {
            if let ServerMessage::Text(text) = message {
                let _ = state.frames.send((index, text));
                if index < state.close_below {
                    return;
                }
            }
        }
    }

    /// Local websocket endpoint that records every text frame per connection.
    async fn mock_ws(close_below: usize) -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let state = MockSocket {
            frames,
            connections: Arc::new(AtomicUsize::new(0)),
            close_below,
        };
        let router = Router::new().route("/ws", get(upgrade)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("ws://{addr}/ws"), frames_rx)
    }

    fn ticker_manager(pairs: &[&str]) -> SubscriptionManager {
        let pairs: Vec<String> = pairs.iter().map(|p| p.to_string()).collect();
        SubscriptionManager::new(vec![PairChannel::Tickers], &pairs)
    }

    #[tokio::test]
    async fn pair_added_offline_is_subscribed_after_reconnect() {
        let (endpoint, mut frames) = mock_ws(1).await;
        let (tx, mut rx) = broadcast::channel(64);
        let (exit_tx, exit_rx) = broadcast::channel(1);
        let (control_tx, control_rx) = mpsc::channel(8);
        let mut client = GateWsClient::new(tx, ReconnectPolicy::fixed(Duration::from_millis(200), None))
            .unwrap()
            .with_endpoint(endpoint);
        client.ping_interval = Duration::from_millis(100);
        let manager = ticker_manager(&["BTC_USDT"]);
        let task = tokio::spawn(async move { client.run(manager, control_rx, exit_rx).await });

        timeout(Duration::from_secs(10), async {
            let (index, first) = frames.recv().await.unwrap();
            assert_eq!(index, 0);
            assert!(first.contains("BTC_USDT"));
            assert!(!first.contains("ETH_USDT"));

            loop {
                if let Command::Connection(ConnectionStatus::Disconnected { .. }) =
                    rx.recv().await.unwrap()
                {
                    break;
                }
            }
            control_tx.send(PairCommand::Add("ETH_USDT".into())).await.unwrap();

            let mut resubscribed = false;
            let mut pinged = false;
            while !(resubscribed && pinged) {
                let (index, text) = frames.recv().await.unwrap();
                assert_eq!(index, 1);
                if text.contains(r#""event":"subscribe""#) && text.contains("ETH_USDT") {
                    resubscribed = true;
                }
                if text.contains("spot.ping") {
                    pinged = true;
                }
            }
        })
        .await
        .expect("no resubscription after reconnect");

        exit_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn sessions_without_data_count_toward_retry_limit() {
        let (endpoint, _frames) = mock_ws(usize::MAX).await;
        let (tx, mut rx) = broadcast::channel(64);
        let (_exit_tx, exit_rx) = broadcast::channel(1);
        let (_control_tx, control_rx) = mpsc::channel(8);
        let client = GateWsClient::new(tx, ReconnectPolicy::fixed(Duration::from_millis(20), Some(2)))
            .unwrap()
            .with_endpoint(endpoint);

        let result = timeout(
            Duration::from_secs(10),
            client.run(ticker_manager(&["BTC_USDT"]), control_rx, exit_rx),
        )
        .await
        .expect("reconnect loop never gave up");
        assert!(result.is_err());

        let mut gave_up = None;
        while let Ok(command) = rx.try_recv() {
            if let Command::Connection(ConnectionStatus::GaveUp { attempts }) = command {
                gave_up = Some(attempts);
            }
        }
        assert_eq!(gave_up, Some(3));
    }

    #[test]
    fn exponential_backoff_doubles_up_to_cap() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_secs(1), Duration::from_secs(32), None);
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32]);
        assert_eq!(policy.delay_for(200), Duration::from_secs(32));
        let jittered = policy.jittered_delay_for(3);
        assert!(jittered >= Duration::from_secs(4));
        assert!(jittered <= Duration::from_secs(5));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear =
            ReconnectPolicy::linear(Duration::from_secs(2), Duration::from_secs(7), Some(3));
        assert_eq!(linear.delay_for(1), Duration::from_secs(2));
        assert_eq!(linear.delay_for(3), Duration::from_secs(6));
        assert_eq!(linear.delay_for(4), Duration::from_secs(7));

        let fixed = ReconnectPolicy::fixed(Duration::from_secs(5), Some(2));
        assert_eq!(fixed.jittered_delay_for(9), Duration::from_secs(5));
        assert!(!fixed.exhausted(2));
        assert!(fixed.exhausted(3));
        assert!(!ReconnectPolicy::default().exhausted(u32::MAX));
    }

    #[test]
    fn parses_ticker_update() {
        let text = r#"{"time":1700000000,"time_ms":1700000000123,"channel":"spot.tickers",
            "event":"update","result":{"currency_pair":"BTC_USDT","last":"37000.5",
            "lowest_ask":"37000.6","highest_bid":"37000.4","change_percentage":"-1.25",
            "base_volume":"1234.5","quote_volume":"45000000.1","high_24h":"38000","low_24h":"36000"}}"#;
        match parse_message(text).unwrap() {
            Inbound::Ticker(update) => {
                assert_eq!(update.currency_pair, "BTC_USDT");
                assert_eq!(update.last, 37000.5);
                assert_eq!(update.change_percentage, -1.25);
                assert_eq!(update.quote_volume, 45000000.1);
                assert_eq!(update.time, 1_700_000_000_123);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_candle_update() {
        let text = r#"{"time":1700000040,"channel":"spot.candlesticks","event":"update",
            "result":{"t":"1700000000","v":"2.5","c":"101","h":"102","l":"99","o":"100",
            "n":"1m_BTC_USDT","a":"0.025","w":true}}"#;
        match parse_message(text).unwrap() {
            Inbound::Candle(candle) => {
                assert_eq!(candle.timestamp, 1_700_000_000);
                assert_eq!(candle.subscription_name, "1m_BTC_USDT");
                assert_eq!(candle.close, 101.0);
                assert!(candle.window_close);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_acks_errors_and_pongs() {
        let ack = r#"{"time":1,"channel":"spot.tickers","event":"subscribe","result":{"status":"success"}}"#;
        assert!(matches!(parse_message(ack).unwrap(), Inbound::Ack { .. }));

        let err = r#"{"time":1,"channel":"spot.balances","event":"subscribe",
            "error":{"code":2,"message":"invalid key"},"result":null}"#;
        match parse_message(err).unwrap() {
            Inbound::Error { error, .. } => {
                assert_eq!(error.code, 2);
                assert_eq!(error.message, "invalid key");
            }
            other => panic!("unexpected {other:?}"),
        }

        let pong = r#"{"time":1,"channel":"spot.pong","event":"","result":null}"#;
        assert_eq!(parse_message(pong).unwrap(), Inbound::Pong);

        let balances = r#"{"time":1,"channel":"spot.balances","event":"update","result":[{"currency":"USDT"}]}"#;
        assert_eq!(parse_message(balances).unwrap(), Inbound::BalancesChanged);

        assert!(parse_message("not json").is_err());
    }

    #[test]
    fn ticker_with_bad_price_is_ignored() {
        let text = r#"{"time":1,"channel":"spot.tickers","event":"update",
            "result":{"currency_pair":"BTC_USDT","last":""}}"#;
        assert_eq!(parse_message(text).unwrap(), Inbound::Ignored);
    }

    #[test]
    fn balances_frame_carries_auth() {
        let signer = Signer::new(&Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
        });
        let frame = balances_frame(&signer).unwrap();
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["channel"], "spot.balances");
        assert_eq!(value["auth"]["method"], "api_key");
        assert_eq!(value["auth"]["KEY"], "key");
        assert_eq!(value["auth"]["SIGN"].as_str().unwrap().len(), 128);
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn candles_follow_tracked_pairs() {
        let mut manager = SubscriptionManager::new(
            vec![PairChannel::Candlesticks {
                interval: "1m".into(),
            }],
            &["BTC_USDT".to_string()],
        );
        let candle = |name: &str| Candlestick {
            timestamp: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
            subscription_name: name.to_string(),
            base_currency_amount: 0.0,
            window_close: true,
        };
        assert!(candle_is_tracked(&manager, &candle("1m_BTC_USDT")));
        assert!(!candle_is_tracked(&manager, &candle("1m_ETH_USDT")));
        manager.remove_pair("BTC_USDT");
        assert!(!candle_is_tracked(&manager, &candle("1m_BTC_USDT")));
    }
}
