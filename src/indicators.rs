//! Moving averages and RSI over stored candles, polled from a running `serve`
//! instance.
//!
//! Every series function returns one entry per input value; entries before the
//! window has filled are `None`.

use anyhow::{Context, Result as AnyResult, anyhow};
use clap::ValueEnum;
use reqwest::Client;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::command::Candlestick;
use crate::config::IndicatorParams;
use crate::gate_rest::build_http_client;

/// Averaging method for RSI gains and losses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Smoothing {
    Sma,
    Ema,
    Wma,
}

impl Smoothing {
    pub fn label(self) -> &'static str {
        match self {
            Smoothing::Sma => "SMA",
            Smoothing::Ema => "EMA",
            Smoothing::Wma => "WMA",
        }
    }

    fn apply(self, series: &[f64], period: usize) -> Vec<Option<f64>> {
        match self {
            Smoothing::Sma => sma(series, period),
            Smoothing::Ema => ema(series, period),
            Smoothing::Wma => wma(series, period),
        }
    }
}

pub fn sma(series: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; series.len()];
    if period == 0 || series.len() < period {
        return out;
    }
    let mut sum: f64 = series[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for idx in period..series.len() {
        sum += series[idx] - series[idx - period];
        out[idx] = Some(sum / period as f64);
    }
    out
}

/// Seeded with the SMA of the first window, then `k = 2 / (period + 1)`.
pub fn ema(series: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; series.len()];
    if period == 0 || series.len() < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut value = series[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(value);
    for idx in period..series.len() {
        value = series[idx] * k + value * (1.0 - k);
        out[idx] = Some(value);
    }
    out
}

/// Linearly weighted, newest value weighted `period`.
pub fn wma(series: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; series.len()];
    if period == 0 || series.len() < period {
        return out;
    }
    let denominator = (period * (period + 1)) as f64 / 2.0;
    for end in (period - 1)..series.len() {
        let window = &series[end + 1 - period..=end];
        let weighted: f64 = window
            .iter()
            .enumerate()
            .map(|(idx, value)| (idx + 1) as f64 * value)
            .sum();
        out[end] = Some(weighted / denominator);
    }
    out
}

/// Applies `f` to the run after the leading `None`s and re-pads the result.
fn on_defined(
    series: &[Option<f64>],
    f: impl Fn(&[f64]) -> Vec<Option<f64>>,
) -> Vec<Option<f64>> {
    let start = series
        .iter()
        .position(Option::is_some)
        .unwrap_or(series.len());
    let dense: Vec<f64> = series[start..].iter().map(|v| v.unwrap_or(0.0)).collect();
    let mut out = vec![None; start];
    out.extend(f(&dense));
    out
}

/// RSI with a choice of averaging for gains and losses and an optional extra
/// EMA pass (`smoothing_length > 1`) over both averages.
pub fn rsi(
    closes: &[f64],
    length: usize,
    smoothing: Smoothing,
    smoothing_length: usize,
) -> Vec<Option<f64>> {
    if length == 0 || closes.len() <= length {
        return vec![None; closes.len()];
    }
    let mut gains = Vec::with_capacity(closes.len());
    let mut losses = Vec::with_capacity(closes.len());
    gains.push(0.0);
    losses.push(0.0);
    for pair in closes.windows(2) {
        let change = pair[1] - pair[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }
    let mut avg_gain = smoothing.apply(&gains, length);
    let mut avg_loss = smoothing.apply(&losses, length);
    if smoothing_length > 1 {
        avg_gain = on_defined(&avg_gain, |dense| ema(dense, smoothing_length));
        avg_loss = on_defined(&avg_loss, |dense| ema(dense, smoothing_length));
    }
    avg_gain
        .iter()
        .zip(avg_loss.iter())
        .enumerate()
        .map(|(idx, (gain, loss))| {
            if idx < length {
                return None;
            }
            let (gain, loss) = ((*gain)?, (*loss)?);
            Some(if loss.abs() <= f64::EPSILON {
                if gain.abs() <= f64::EPSILON { 50.0 } else { 100.0 }
            } else {
                100.0 - 100.0 / (1.0 + gain / loss)
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub timestamp: i64,
    pub close: f64,
    pub sma: Option<f64>,
    pub ema: Option<f64>,
    pub wma: Option<f64>,
    pub rsi: Option<f64>,
}

/// Latest values, or `None` when there are fewer than `length` candles.
pub fn latest_snapshot(
    candles: &[Candlestick],
    length: usize,
    smoothing: Smoothing,
    smoothing_length: usize,
) -> Option<IndicatorSnapshot> {
    if length == 0 || candles.len() < length {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let last = candles.last()?;
    let pick = |series: Vec<Option<f64>>| series.last().copied().flatten();
    Some(IndicatorSnapshot {
        timestamp: last.timestamp,
        close: last.close,
        sma: pick(sma(&closes, length)),
        ema: pick(ema(&closes, length)),
        wma: pick(wma(&closes, length)),
        rsi: pick(rsi(&closes, length, smoothing, smoothing_length)),
    })
}

pub struct IndicatorRunner {
    client: Client,
    params: IndicatorParams,
}

impl IndicatorRunner {
    pub fn new(params: IndicatorParams) -> AnyResult<Self> {
        Ok(IndicatorRunner {
            client: build_http_client()?,
            params,
        })
    }

    fn history_limit(&self) -> usize {
        // Enough warm-up for the EMA passes to settle.
        (self.params.length + self.params.smoothing_length).saturating_mul(10).max(100)
    }

    async fn fetch(&self) -> AnyResult<Vec<Candlestick>> {
        let url = format!(
            "{}/get_candlestick_data",
            self.params.server.trim_end_matches('/')
        );
        let limit = self.history_limit().to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("subscription_name", self.params.subscription.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{url} responded {status}: {body}"));
        }
        let mut candles: Vec<Candlestick> = response
            .json()
            .await
            .with_context(|| format!("decoding candles from {url}"))?;
        candles.sort_by_key(|candle| candle.timestamp);
        Ok(candles)
    }

    async fn report_once(&self) -> AnyResult<()> {
        let candles = self.fetch().await?;
        let params = &self.params;
        match latest_snapshot(&candles, params.length, params.smoothing, params.smoothing_length) {
            Some(snapshot) => info!(
                subscription = %params.subscription,
                timestamp = snapshot.timestamp,
                close = snapshot.close,
                sma = ?snapshot.sma,
                ema = ?snapshot.ema,
                wma = ?snapshot.wma,
                rsi = ?snapshot.rsi,
                smoothing = params.smoothing.label(),
                "indicators"
            ),
            None => warn!(
                subscription = %params.subscription,
                candles = candles.len(),
                required = params.length,
                "not enough candles for indicators yet"
            ),
        }
        Ok(())
    }

    pub async fn run(self, mut exit_rx: broadcast::Receiver<()>) -> AnyResult<()> {
        let mut ticker = time::interval(self.params.interval.as_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.report_once().await {
                        error!("indicator poll failed: {err:#}");
                    }
                }
                message = exit_rx.recv() => match message {
                    Ok(_) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("value should be defined");
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn sma_ema_wma_fill_after_window() {
        let series = [1.0, 2.0, 3.0, 4.0, 5.0];
        let sma3 = sma(&series, 3);
        assert_eq!(sma3[..2], [None, None]);
        approx(sma3[2], 2.0);
        approx(sma3[4], 4.0);

        let ema3 = ema(&series, 3);
        approx(ema3[2], 2.0);
        approx(ema3[3], 3.0);
        approx(ema3[4], 4.0);

        let wma3 = wma(&series, 3);
        approx(wma3[2], (1.0 + 4.0 + 9.0) / 6.0);
        approx(wma3[4], (3.0 + 8.0 + 15.0) / 6.0);

        assert!(sma(&series, 6).iter().all(Option::is_none));
        assert!(ema(&series, 0).iter().all(Option::is_none));
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (1..=30).map(f64::from).collect();
        let values = rsi(&rising, 14, Smoothing::Sma, 1);
        assert!(values[..14].iter().all(Option::is_none));
        approx(values[29], 100.0);

        let flat = vec![10.0; 30];
        approx(rsi(&flat, 14, Smoothing::Ema, 1)[29], 50.0);

        let falling: Vec<f64> = (1..=30).rev().map(f64::from).collect();
        approx(rsi(&falling, 14, Smoothing::Wma, 3)[29], 0.0);
    }

    #[test]
    fn rsi_balanced_moves_sit_at_fifty() {
        let zigzag: Vec<f64> = (0..40)
            .map(|i| if i % 2 == 0 { 10.0 } else { 11.0 })
            .collect();
        let value = rsi(&zigzag, 2, Smoothing::Sma, 1)[39].unwrap();
        assert!((value - 50.0).abs() < 1e-9);
        let smoothed = rsi(&zigzag, 4, Smoothing::Ema, 5)[39].unwrap();
        assert!(smoothed > 40.0 && smoothed < 60.0);
    }

    #[test]
    fn snapshot_requires_enough_candles() {
        let candles: Vec<Candlestick> = (0..20)
            .map(|i| Candlestick {
                timestamp: i * 60,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 100.0 + i as f64,
                volume: 1.0,
                subscription_name: "1m_BTC_USDT".into(),
                base_currency_amount: 1.0,
                window_close: true,
            })
            .collect();
        assert!(latest_snapshot(&candles[..5], 14, Smoothing::Ema, 1).is_none());
        let snapshot = latest_snapshot(&candles, 14, Smoothing::Ema, 1).unwrap();
        assert_eq!(snapshot.timestamp, 19 * 60);
        approx(snapshot.sma, (106..=119).sum::<i32>() as f64 / 14.0);
        approx(snapshot.rsi, 100.0);
    }
}
