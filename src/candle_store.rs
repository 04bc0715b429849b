//! SQLite storage for streamed candlesticks and on-read aggregation into
//! higher timeframes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result as AnyResult, anyhow};
use rusqlite::Connection;

use crate::command::Candlestick;

pub struct CandleStore {
    conn: Mutex<Connection>,
}

impl CandleStore {
    pub fn open(path: &Path) -> AnyResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
        Self::init(conn)
    }

    pub fn in_memory() -> AnyResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AnyResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS candlestick_data (
                subscription_name TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                total_volume REAL NOT NULL,
                base_currency_amount REAL NOT NULL,
                window_close INTEGER NOT NULL,
                PRIMARY KEY (subscription_name, timestamp)
            );
            "#,
        )
        .context("creating candlestick_data table")?;
        Ok(CandleStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes a batch in one transaction. A bar already stored for the same
    /// subscription and open time is overwritten.
    pub fn insert_batch(&self, candles: &[Candlestick]) -> AnyResult<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO candlestick_data (
                    subscription_name, timestamp, open, high, low, close,
                    total_volume, base_currency_amount, window_close
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(subscription_name, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    total_volume = excluded.total_volume,
                    base_currency_amount = excluded.base_currency_amount,
                    window_close = excluded.window_close
                "#,
            )?;
            for candle in candles {
                stmt.execute((
                    &candle.subscription_name,
                    candle.timestamp,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.base_currency_amount,
                    candle.window_close,
                ))?;
            }
        }
        tx.commit()?;
        Ok(candles.len())
    }

    /// The newest `limit` bars of a subscription, oldest first.
    pub fn recent(&self, subscription_name: &str, limit: usize) -> AnyResult<Vec<Candlestick>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, open, high, low, close, total_volume,
                   subscription_name, base_currency_amount, window_close
            FROM candlestick_data
            WHERE subscription_name = ?1
            ORDER BY timestamp DESC
            LIMIT ?2
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt
            .query_map((subscription_name, limit), |row| {
                Ok(Candlestick {
                    timestamp: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    subscription_name: row.get(6)?,
                    base_currency_amount: row.get(7)?,
                    window_close: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }
}

pub fn subscription_name(timeframe: &str, pair: &str) -> String {
    format!("{timeframe}_{pair}")
}

/// Seconds per bar for names like `10s`, `1m`, `4h`, `1d`, `7d`.
pub fn timeframe_seconds(timeframe: &str) -> Option<i64> {
    let timeframe = timeframe.trim();
    let split = timeframe.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = timeframe.split_at(split);
    let value: i64 = value.parse().ok().filter(|v| *v > 0)?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    value.checked_mul(unit_secs)
}

/// Merges bars into buckets of `period` bars aligned to the epoch. A bucket is
/// closed only when its last bar is closed and it holds `period` bars.
pub fn aggregate(candles: &[Candlestick], bar_seconds: i64, period: usize) -> AnyResult<Vec<Candlestick>> {
    if period == 0 {
        return Err(anyhow!("period must be at least 1"));
    }
    if period == 1 {
        return Ok(candles.to_vec());
    }
    let bucket_seconds = bar_seconds
        .checked_mul(period as i64)
        .filter(|s| *s > 0)
        .ok_or_else(|| anyhow!("aggregation bucket overflows"))?;

    let mut merged: Vec<(Candlestick, usize)> = Vec::new();
    for candle in candles {
        let bucket = candle.timestamp - candle.timestamp.rem_euclid(bucket_seconds);
        match merged.last_mut() {
            Some((current, count)) if current.timestamp == bucket => {
                current.high = current.high.max(candle.high);
                current.low = current.low.min(candle.low);
                current.close = candle.close;
                current.volume += candle.volume;
                current.base_currency_amount += candle.base_currency_amount;
                current.window_close = candle.window_close;
                *count += 1;
            }
            _ => {
                let mut first = candle.clone();
                first.timestamp = bucket;
                merged.push((first, 1));
            }
        }
    }
    Ok(merged
        .into_iter()
        .map(|(mut candle, count)| {
            candle.window_close = candle.window_close && count == period;
            candle
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, open: f64, close: f64, closed: bool) -> Candlestick {
        Candlestick {
            timestamp: ts,
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
            volume: 2.0,
            subscription_name: "1m_BTC_USDT".to_string(),
            base_currency_amount: 0.5,
            window_close: closed,
        }
    }

    #[test]
    fn open_bar_is_replaced_by_final_bar() {
        let store = CandleStore::in_memory().unwrap();
        store.insert_batch(&[bar(60, 10.0, 11.0, false)]).unwrap();
        store.insert_batch(&[bar(60, 10.0, 12.0, true)]).unwrap();
        let rows = store.recent("1m_BTC_USDT", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 12.0);
        assert!(rows[0].window_close);
    }

    #[test]
    fn recent_returns_newest_bars_oldest_first() {
        let store = CandleStore::in_memory().unwrap();
        let bars: Vec<Candlestick> = (1..=5).map(|i| bar(i * 60, 1.0, 2.0, true)).collect();
        assert_eq!(store.insert_batch(&bars).unwrap(), 5);
        let rows = store.recent("1m_BTC_USDT", 3).unwrap();
        let stamps: Vec<i64> = rows.iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps, vec![180, 240, 300]);
        assert!(store.recent("1m_ETH_USDT", 3).unwrap().is_empty());
    }

    #[test]
    fn parses_timeframes() {
        assert_eq!(timeframe_seconds("1m"), Some(60));
        assert_eq!(timeframe_seconds("4h"), Some(14_400));
        assert_eq!(timeframe_seconds("7d"), Some(604_800));
        assert_eq!(timeframe_seconds("m"), None);
        assert_eq!(timeframe_seconds("0m"), None);
        assert_eq!(timeframe_seconds("5y"), None);
        assert_eq!(subscription_name("1m", "BTC_USDT"), "1m_BTC_USDT");
    }

    #[test]
    fn aggregates_aligned_buckets() {
        let bars = vec![
            bar(300, 10.0, 11.0, true),
            bar(360, 11.0, 9.0, true),
            bar(420, 9.0, 14.0, true),
            bar(480, 14.0, 13.0, true),
            bar(540, 13.0, 12.0, true),
            bar(600, 12.0, 15.0, false),
        ];
        let merged = aggregate(&bars, 60, 5).unwrap();
        assert_eq!(merged.len(), 2);
        let first = &merged[0];
        assert_eq!(first.timestamp, 300);
        assert_eq!(first.open, 10.0);
        assert_eq!(first.close, 12.0);
        assert_eq!(first.high, 15.0);
        assert_eq!(first.low, 8.0);
        assert_eq!(first.volume, 10.0);
        assert!(first.window_close);
        assert_eq!(merged[1].timestamp, 600);
        assert!(!merged[1].window_close);

        assert!(aggregate(&bars, 60, 0).is_err());
        assert_eq!(aggregate(&bars, 60, 1).unwrap().len(), 6);
    }
}
