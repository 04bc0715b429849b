//! Bookkeeping for the live subscription set.
//!
//! The manager owns the tracked pairs and knows whether the socket is open. It
//! never touches the network: every mutation returns the control frames the
//! caller has to send, so the reconnect loop stays a thin shell around it.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::Serialize;

use crate::command::TickerUpdate;
use crate::config::normalize_pair;

/// A public channel subscribed once per tracked pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairChannel {
    Tickers,
    Candlesticks { interval: String },
    OrderBook { limit: u32, interval: String },
}

impl PairChannel {
    pub fn name(&self) -> &'static str {
        match self {
            PairChannel::Tickers => "spot.tickers",
            PairChannel::Candlesticks { .. } => "spot.candlesticks",
            PairChannel::OrderBook { .. } => "spot.order_book",
        }
    }

    fn payload(&self, pair: &str) -> Vec<String> {
        match self {
            PairChannel::Tickers => vec![pair.to_string()],
            PairChannel::Candlesticks { interval } => vec![interval.clone(), pair.to_string()],
            PairChannel::OrderBook { limit, interval } => {
                vec![pair.to_string(), limit.to_string(), interval.clone()]
            }
        }
    }

    /// Tickers accept many pairs per frame; the other channels take one pair each.
    fn batches(&self) -> bool {
        matches!(self, PairChannel::Tickers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlEvent {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsAuth {
    pub method: String,
    #[serde(rename = "KEY")]
    pub key: String,
    #[serde(rename = "SIGN")]
    pub sign: String,
}

/// Control envelope `{time, channel, event, payload}` sent to the exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlFrame {
    pub time: i64,
    pub channel: String,
    pub event: ControlEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<WsAuth>,
}

impl ControlFrame {
    pub fn new(channel: &str, event: ControlEvent, payload: Option<Vec<String>>) -> Self {
        ControlFrame {
            time: Utc::now().timestamp(),
            channel: channel.to_string(),
            event,
            payload,
            auth: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Invalid,
    AlreadyTracked,
    /// Socket is open; send these frames now.
    Subscribe(Vec<ControlFrame>),
    /// Socket is down; the pair is sent when the next connection opens.
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    NotTracked,
    Unsubscribe(Vec<ControlFrame>),
    /// Socket is down; nothing to send, the pair is simply not resubscribed.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    channels: Vec<PairChannel>,
    pairs: BTreeSet<String>,
    pending: BTreeSet<String>,
    connected: bool,
}

impl SubscriptionManager {
    pub fn new(channels: Vec<PairChannel>, initial: &[String]) -> Self {
        let pairs: BTreeSet<String> = initial.iter().filter_map(|p| normalize_pair(p)).collect();
        let pending = pairs.clone();
        SubscriptionManager {
            channels,
            pairs,
            pending,
            connected: false,
        }
    }

    pub fn pairs(&self) -> Vec<String> {
        self.pairs.iter().cloned().collect()
    }

    pub fn pending_pairs(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    pub fn contains(&self, pair: &str) -> bool {
        self.pairs.contains(pair)
    }

    pub fn add_pair(&mut self, raw: &str) -> AddOutcome {
        let Some(pair) = normalize_pair(raw) else {
            return AddOutcome::Invalid;
        };
        if !self.pairs.insert(pair.clone()) {
            return AddOutcome::AlreadyTracked;
        }
        if self.connected {
            AddOutcome::Subscribe(self.frames_for(ControlEvent::Subscribe, &[pair]))
        } else {
            self.pending.insert(pair);
            AddOutcome::Queued
        }
    }

    pub fn remove_pair(&mut self, raw: &str) -> RemoveOutcome {
        let Some(pair) = normalize_pair(raw) else {
            return RemoveOutcome::NotTracked;
        };
        if !self.pairs.remove(&pair) {
            return RemoveOutcome::NotTracked;
        }
        let was_pending = self.pending.remove(&pair);
        if self.connected && !was_pending {
            RemoveOutcome::Unsubscribe(self.frames_for(ControlEvent::Unsubscribe, &[pair]))
        } else {
            RemoveOutcome::Dropped
        }
    }

    /// A fresh connection starts with no server-side subscriptions, so every
    /// tracked pair is sent again. Clears the pending queue.
    pub fn on_connected(&mut self) -> Vec<ControlFrame> {
        self.connected = true;
        self.pending.clear();
        let pairs = self.pairs();
        if pairs.is_empty() {
            return Vec::new();
        }
        self.frames_for(ControlEvent::Subscribe, &pairs)
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.pending = self.pairs.clone();
    }

    /// Updates for pairs that are no longer tracked are discarded.
    pub fn accepts(&self, update: &TickerUpdate) -> bool {
        self.pairs.contains(&update.currency_pair)
    }

    fn frames_for(&self, event: ControlEvent, pairs: &[String]) -> Vec<ControlFrame> {
        let mut frames = Vec::new();
        for channel in &self.channels {
            if channel.batches() {
                let payload = pairs
                    .iter()
                    .flat_map(|pair| channel.payload(pair))
                    .collect();
                frames.push(ControlFrame::new(channel.name(), event, Some(payload)));
            } else {
                for pair in pairs {
                    frames.push(ControlFrame::new(
                        channel.name(),
                        event,
                        Some(channel.payload(pair)),
                    ));
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tickers(initial: &[&str]) -> SubscriptionManager {
        let initial: Vec<String> = initial.iter().map(|p| p.to_string()).collect();
        SubscriptionManager::new(vec![PairChannel::Tickers], &initial)
    }

    fn update(pair: &str) -> TickerUpdate {
        TickerUpdate {
            currency_pair: pair.to_string(),
            last: 1.0,
            change_percentage: 0.0,
            base_volume: 0.0,
            quote_volume: 0.0,
            time: 0,
        }
    }

    fn payloads(frames: &[ControlFrame]) -> Vec<Vec<String>> {
        frames.iter().filter_map(|f| f.payload.clone()).collect()
    }

    #[test]
    fn pair_added_while_disconnected_is_sent_on_reconnect() {
        let mut manager = tickers(&["BTC_USDT"]);
        manager.on_connected();
        manager.on_disconnected();

        assert_eq!(manager.add_pair("eth_usdt"), AddOutcome::Queued);
        assert!(manager.contains("ETH_USDT"));
        assert!(manager.pending_pairs().contains(&"ETH_USDT".to_string()));

        let frames = manager.on_connected();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, ControlEvent::Subscribe);
        assert_eq!(
            payloads(&frames),
            vec![vec!["BTC_USDT".to_string(), "ETH_USDT".to_string()]]
        );
        assert!(manager.pending_pairs().is_empty());
    }

    #[test]
    fn pair_added_while_connected_is_subscribed_immediately() {
        let mut manager = tickers(&[]);
        assert!(manager.on_connected().is_empty());
        match manager.add_pair("SOL_USDT") {
            AddOutcome::Subscribe(frames) => {
                assert_eq!(payloads(&frames), vec![vec!["SOL_USDT".to_string()]]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(manager.add_pair("sol_usdt"), AddOutcome::AlreadyTracked);
        assert_eq!(manager.add_pair("  "), AddOutcome::Invalid);
    }

    #[test]
    fn removed_pair_stops_accepting_updates() {
        let mut manager = tickers(&["BTC_USDT", "ETH_USDT"]);
        manager.on_connected();
        assert!(manager.accepts(&update("ETH_USDT")));

        match manager.remove_pair("ETH_USDT") {
            RemoveOutcome::Unsubscribe(frames) => {
                assert_eq!(frames[0].event, ControlEvent::Unsubscribe);
                assert_eq!(payloads(&frames), vec![vec!["ETH_USDT".to_string()]]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!manager.accepts(&update("ETH_USDT")));
        assert!(manager.accepts(&update("BTC_USDT")));
        assert_eq!(manager.remove_pair("ETH_USDT"), RemoveOutcome::NotTracked);
    }

    #[test]
    fn order_book_frames_go_out_one_pair_each() {
        let channels = vec![
            PairChannel::Candlesticks {
                interval: "1m".into(),
            },
            PairChannel::OrderBook {
                limit: 20,
                interval: "100ms".into(),
            },
        ];
        let initial = vec!["BTC_USDT".to_string(), "ETH_USDT".to_string()];
        let mut manager = SubscriptionManager::new(channels, &initial);
        let frames = manager.on_connected();
        let books: Vec<&ControlFrame> = frames
            .iter()
            .filter(|f| f.channel == "spot.order_book")
            .collect();
        assert_eq!(books.len(), 2);
        assert_eq!(
            books[0].payload,
            Some(vec!["BTC_USDT".to_string(), "20".to_string(), "100ms".to_string()])
        );
        assert_eq!(frames.len(), 4);
    }

    #[test]
    fn removing_a_queued_pair_sends_nothing() {
        let mut manager = tickers(&[]);
        assert_eq!(manager.add_pair("XRP_USDT"), AddOutcome::Queued);
        assert_eq!(manager.remove_pair("XRP_USDT"), RemoveOutcome::Dropped);
        assert!(manager.on_connected().is_empty());
    }

    #[test]
    fn candlestick_channel_sends_one_frame_per_pair() {
        let initial = vec!["BTC_USDT".to_string(), "ETH_USDT".to_string()];
        let mut manager = SubscriptionManager::new(
            vec![PairChannel::Candlesticks {
                interval: "1m".to_string(),
            }],
            &initial,
        );
        let frames = manager.on_connected();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].channel, "spot.candlesticks");
        assert_eq!(
            frames[0].payload,
            Some(vec!["1m".to_string(), "BTC_USDT".to_string()])
        );
    }

    #[test]
    fn control_frame_serializes_envelope() {
        let frame = ControlFrame::new(
            "spot.tickers",
            ControlEvent::Unsubscribe,
            Some(vec!["BTC_USDT".to_string()]),
        );
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["channel"], "spot.tickers");
        assert_eq!(value["event"], "unsubscribe");
        assert_eq!(value["payload"][0], "BTC_USDT");
        assert!(value.get("auth").is_none());
        assert!(value["time"].as_i64().unwrap() > 0);
    }
}
