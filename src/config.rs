use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result as AnyResult, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::gate_ws::ReconnectPolicy;
use crate::subscription::PairChannel;
use crate::indicators::Smoothing;

pub const DEFAULT_PAIRS: &[&str] = &["BTC_USDT", "ETH_USDT", "SOL_USDT"];
const ORDER_BOOK_INTERVAL: &str = "100ms";

#[derive(Parser, Clone, Debug)]
#[command(name = "gate-dashboard", version, about = "Gate.io spot dashboard")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Option<Mode>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Mode {
    /// Terminal dashboard with live tickers, balances and orders (default)
    Dashboard(DashboardParams),
    /// Candlestick writer plus a small HTTP API for pairs and stored candles
    Serve(ServeParams),
    /// Periodically compute SMA/EMA/WMA/RSI from a running `serve` instance
    Indicators(IndicatorParams),
}

impl Cli {
    pub fn into_mode(self) -> Mode {
        match self.mode {
            Some(mode) => mode,
            None => Mode::Dashboard(DashboardParams::parse_from(["dashboard"])),
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct DashboardParams {
    /// Currency pairs to track; comma separated or pass multiple times
    #[clap(short = 'p', long = "pair", value_delimiter = ',', num_args = 1..)]
    pub pairs: Vec<String>,

    /// Gate.io API key
    #[clap(long = "api-key", env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Gate.io API secret
    #[clap(long = "api-secret", env = "API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,

    /// Older name for the API secret, used when API_SECRET is not set
    #[clap(long = "secret-key", env = "SECRET_KEY", hide_env_values = true, hide = true)]
    pub secret_key: Option<String>,

    /// Hide balances whose available and locked amounts are both below this value
    #[clap(long = "min-balance", default_value_t = 1.0)]
    pub min_balance: f64,

    /// Interval between balance polls (e.g., 30s, 1m)
    #[clap(long = "balance-interval", value_name = "DURATION", default_value = "60s")]
    pub balance_interval: DurationSpec,

    /// Also show margin account balances
    #[clap(long = "with-margin")]
    pub with_margin: bool,

    /// SQLite file holding the tracked pair list
    #[clap(long = "pairs-db", default_value = "pairs.db")]
    pub pairs_db: PathBuf,

    /// Default target of the CSV export
    #[clap(long = "export-path", default_value = "market_data.csv")]
    pub export_path: PathBuf,

    /// Log file; the terminal itself is owned by the UI
    #[clap(long = "log-file", default_value = "logs/gate-dashboard.log")]
    pub log_file: PathBuf,

    #[command(flatten)]
    pub reconnect: ReconnectParams,
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl DashboardParams {
    pub fn credentials(&self) -> AnyResult<Credentials> {
        let api_key = non_empty(self.api_key.as_deref());
        let api_secret =
            non_empty(self.api_secret.as_deref()).or_else(|| non_empty(self.secret_key.as_deref()));
        match (api_key, api_secret) {
            (Some(api_key), Some(api_secret)) => Ok(Credentials {
                api_key,
                api_secret,
            }),
            _ => Err(anyhow!(
                "API_KEY and API_SECRET must be set in the environment (or passed as --api-key/--api-secret)"
            )),
        }
    }

    pub fn balance_interval(&self) -> Duration {
        self.balance_interval.as_duration()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Parser, Clone, Debug)]
pub struct ServeParams {
    /// Address of the HTTP API
    #[clap(long = "listen", default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,

    /// Pairs to record in addition to the ones stored in the pairs database
    #[clap(short = 'p', long = "pair", value_delimiter = ',', num_args = 1..)]
    pub pairs: Vec<String>,

    /// Candlestick interval to subscribe to
    #[clap(long = "interval", default_value = "1m")]
    pub interval: String,

    #[clap(long = "pairs-db", default_value = "pairs.db")]
    pub pairs_db: PathBuf,

    #[clap(long = "candles-db", default_value = "candles.db")]
    pub candles_db: PathBuf,

    /// Persist bars that are still open; they are replaced once the bar closes
    #[clap(long = "persist-partial")]
    pub persist_partial: bool,

    /// Also subscribe to order book snapshots with this many levels
    #[clap(
        long = "order-book-depth",
        value_name = "LEVELS",
        value_parser = clap::value_parser!(u32).range(1..=100)
    )]
    pub order_book_depth: Option<u32>,

    #[command(flatten)]
    pub reconnect: ReconnectParams,
}

impl ServeParams {
    pub fn channels(&self) -> Vec<PairChannel> {
        let mut channels = vec![PairChannel::Candlesticks {
            interval: self.interval.clone(),
        }];
        if let Some(limit) = self.order_book_depth {
            channels.push(PairChannel::OrderBook {
                limit,
                interval: ORDER_BOOK_INTERVAL.to_string(),
            });
        }
        channels
    }
}

#[derive(Parser, Clone, Debug)]
pub struct IndicatorParams {
    /// Base URL of a running `serve` instance
    #[clap(long = "server", default_value = "http://127.0.0.1:5000")]
    pub server: String,

    /// Stored subscription name, e.g. 1m_BTC_USDT
    #[clap(long = "subscription", default_value = "1m_BTC_USDT")]
    pub subscription: String,

    /// Window length for SMA/EMA/WMA and RSI
    #[clap(long = "length", default_value_t = 14)]
    pub length: usize,

    /// Averaging method applied to RSI gains and losses
    #[clap(long = "smoothing", value_enum, default_value = "ema")]
    pub smoothing: Smoothing,

    /// Extra EMA smoothing applied to the averaged gains and losses (1 = none)
    #[clap(long = "smoothing-length", default_value_t = 14)]
    pub smoothing_length: usize,

    #[clap(long = "interval", value_name = "DURATION", default_value = "60s")]
    pub interval: DurationSpec,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReconnectMode {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Args, Clone, Debug)]
pub struct ReconnectParams {
    /// Backoff between reconnect attempts
    #[clap(long = "reconnect", value_enum, default_value = "exponential")]
    pub mode: ReconnectMode,

    /// Base delay of the reconnect backoff
    #[clap(long = "reconnect-delay", value_name = "DURATION", default_value = "1s")]
    pub delay: DurationSpec,

    /// Upper bound of the reconnect backoff
    #[clap(long = "max-reconnect-delay", value_name = "DURATION", default_value = "32s")]
    pub max_delay: DurationSpec,

    /// Give up after this many consecutive failed attempts (unbounded when unset)
    #[clap(long = "max-retries")]
    pub max_retries: Option<u32>,
}

impl ReconnectParams {
    pub fn policy(&self) -> ReconnectPolicy {
        let delay = self.delay.as_duration();
        let max_delay = self.max_delay.as_duration().max(delay);
        match self.mode {
            ReconnectMode::Fixed => ReconnectPolicy::fixed(delay, self.max_retries),
            ReconnectMode::Linear => ReconnectPolicy::linear(delay, max_delay, self.max_retries),
            ReconnectMode::Exponential => {
                ReconnectPolicy::exponential(delay, max_delay, self.max_retries)
            }
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DurationSpec(Duration);

impl DurationSpec {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for DurationSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let duration = parse_duration_spec(s)?;
        Ok(DurationSpec(duration))
    }
}

fn parse_duration_spec(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration spec cannot be empty (examples: 5s, 1m, 1h)".to_string());
    }
    let split_idx = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| "duration spec must end with a unit like s, m, h, or d".to_string())?;
    if split_idx == 0 {
        return Err("duration spec must start with a number (examples: 5s, 1m)".to_string());
    }
    let (value_part, unit_part) = trimmed.split_at(split_idx);
    let value: f64 = value_part.parse().map_err(|_| {
        format!(
            "invalid numeric portion `{}` in duration spec `{}`",
            value_part, trimmed
        )
    })?;
    let unit = unit_part.trim().to_lowercase();
    let seconds_multiplier = match unit.as_str() {
        "ms" => 0.001,
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60.0 * 60.0,
        "d" | "day" | "days" => 60.0 * 60.0 * 24.0,
        other => {
            return Err(format!(
                "unsupported duration unit `{}` (use ms, s, m, h, or d)",
                other
            ));
        }
    };
    let seconds = value * seconds_multiplier;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("duration must be positive: `{}`", trimmed));
    }
    if seconds > Duration::MAX.as_secs_f64() {
        return Err(format!("duration `{}` is too large", trimmed));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Upper-cases and trims a user supplied pair; `btc_usdt ` becomes `BTC_USDT`.
pub fn normalize_pair(raw: &str) -> Option<String> {
    let pair = raw.trim().to_uppercase();
    if pair.is_empty() {
        return None;
    }
    if !pair
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration_spec("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration_spec("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration_spec("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration_spec("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration_spec("").is_err());
        assert!(parse_duration_spec("m").is_err());
        assert!(parse_duration_spec("10").is_err());
        assert!(parse_duration_spec("3w").is_err());
    }

    #[test]
    fn normalizes_pairs() {
        assert_eq!(normalize_pair(" btc_usdt "), Some("BTC_USDT".to_string()));
        assert_eq!(normalize_pair(""), None);
        assert_eq!(normalize_pair("BTC/USDT"), None);
    }

    #[test]
    fn dashboard_is_the_default_mode() {
        let cli = Cli::parse_from(["gate-dashboard"]);
        assert!(matches!(cli.into_mode(), Mode::Dashboard(_)));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let params = DashboardParams::parse_from([
            "dashboard",
            "--api-key",
            "key",
            "--api-secret",
            " ",
        ]);
        assert!(params.credentials().is_err());
    }

    #[test]
    fn secret_key_is_accepted_as_alias() {
        let params = DashboardParams::parse_from([
            "dashboard",
            "--api-key",
            "key",
            "--secret-key",
            "secret",
        ]);
        let creds = params.credentials().unwrap();
        assert_eq!(creds.api_key, "key");
        assert_eq!(creds.api_secret, "secret");
    }

    #[test]
    fn serve_channels_include_optional_order_book() {
        let params = ServeParams::parse_from(["serve", "--interval", "5m"]);
        assert_eq!(
            params.channels(),
            vec![PairChannel::Candlesticks {
                interval: "5m".into()
            }]
        );

        let params = ServeParams::parse_from(["serve", "--order-book-depth", "20"]);
        let channels = params.channels();
        assert_eq!(channels.len(), 2);
        assert_eq!(
            channels[1],
            PairChannel::OrderBook {
                limit: 20,
                interval: "100ms".into()
            }
        );
        assert!(ServeParams::try_parse_from(["serve", "--order-book-depth", "0"]).is_err());
    }

    #[test]
    fn reconnect_params_build_policy() {
        let params = DashboardParams::parse_from([
            "dashboard",
            "--reconnect",
            "fixed",
            "--reconnect-delay",
            "5s",
            "--max-retries",
            "5",
        ]);
        let policy = params.reconnect.policy();
        assert_eq!(policy.max_retries(), Some(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }
}
