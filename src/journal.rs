//! Append-only JSON-lines journals for user-visible errors and order results.
//! Each line is `{"timestamp_ms": .., "record": ..}`; unreadable lines are
//! skipped on load.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, LocalResult, TimeZone};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::TradeEvent;

pub const ERROR_LOG_FILE: &str = "error_logs.jsonl";
pub const ORDER_LOG_FILE: &str = "trade_logs.jsonl";

/// Roughly how many bytes one line takes before a compaction is attempted.
const BYTES_PER_ENTRY: u64 = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry<T> {
    pub timestamp: DateTime<Local>,
    pub record: T,
}

impl<T> JournalEntry<T> {
    pub fn now(record: T) -> Self {
        JournalEntry {
            timestamp: Local::now(),
            record,
        }
    }

    fn from_stored(timestamp_ms: i64, record: T) -> Self {
        let timestamp = match Local.timestamp_millis_opt(timestamp_ms) {
            LocalResult::Single(dt) => dt,
            _ => Local::now(),
        };
        JournalEntry { timestamp, record }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredLine<T> {
    timestamp_ms: i64,
    record: T,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorNote {
    pub message: String,
}

pub type ErrorJournal = Journal<ErrorNote>;
pub type OrderJournal = Journal<TradeEvent>;

#[derive(Clone, Debug)]
pub struct Journal<T> {
    path: PathBuf,
    max_entries: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T> Journal<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Journal {
            path: path.into(),
            max_entries: max_entries.max(1),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// At most `max_entries` entries, oldest first. A missing file is empty.
    pub fn load(&self) -> Result<Vec<JournalEntry<T>>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("opening {}", self.path.display()));
            }
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(stored) = serde_json::from_str::<StoredLine<T>>(&line) {
                entries.push(JournalEntry::from_stored(stored.timestamp_ms, stored.record));
            }
        }
        if entries.len() > self.max_entries {
            entries = entries.split_off(entries.len() - self.max_entries);
        }
        Ok(entries)
    }

    /// Newest first, filtered, capped at `limit`.
    pub fn recent(
        &self,
        limit: usize,
        keep: impl Fn(&T) -> bool,
    ) -> Result<Vec<JournalEntry<T>>> {
        Ok(self
            .load()?
            .into_iter()
            .rev()
            .filter(|entry| keep(&entry.record))
            .take(limit)
            .collect())
    }

    pub fn append(&self, record: T) -> Result<JournalEntry<T>> {
        let entry = JournalEntry::now(record);
        self.write_entries(std::slice::from_ref(&entry), true)?;
        self.compact_if_needed()?;
        Ok(entry)
    }

    fn compact_if_needed(&self) -> Result<()> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if len <= (self.max_entries as u64).saturating_mul(BYTES_PER_ENTRY) {
            return Ok(());
        }
        let entries = self.load()?;
        self.write_entries(&entries, false)
    }

    fn write_entries(&self, entries: &[JournalEntry<T>], append: bool) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        for entry in entries {
            let stored = StoredLine {
                timestamp_ms: entry.timestamp.timestamp_millis(),
                record: entry.record.clone(),
            };
            serde_json::to_writer(&mut file, &stored)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl ErrorJournal {
    pub fn note(&self, message: impl Into<String>) -> Result<()> {
        self.append(ErrorNote {
            message: message.into(),
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::command::{CancelResponse, OrderRequest, OrderResponse, OrderSide};


    fn cancel(pair: &str, ok: bool) -> TradeEvent {
        TradeEvent::Cancel(CancelResponse {
            currency_pair: pair.into(),
            order_id: "1".into(),
            message: if ok { "cancelled".into() } else { "ORDER_NOT_FOUND".into() },
            success: ok,
        })
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let journal = ErrorJournal::new(dir.path().join("none.jsonl"), 10);
        assert!(journal.load().unwrap().is_empty());
    }

    #[test]
    fn appends_and_filters_newest_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ORDER_LOG_FILE);
        let journal = OrderJournal::new(&path, 10);
        journal
            .append(TradeEvent::Order(OrderResponse {
                request: OrderRequest {
                    currency_pair: "BTC_USDT".into(),
                    side: OrderSide::Buy,
                    price: 1.0,
                    amount: 2.0,
                },
                order_id: Some("42".into()),
                message: "placed".into(),
                success: true,
            }))
            .unwrap();
        journal.append(cancel("ETH_USDT", false)).unwrap();
        journal.append(cancel("BTC_USDT", true)).unwrap();

        let btc = journal
            .recent(10, |event| event.currency_pair() == "BTC_USDT")
            .unwrap();
        assert_eq!(btc.len(), 2);
        assert!(matches!(btc[0].record, TradeEvent::Cancel(_)));
        assert!(matches!(btc[1].record, TradeEvent::Order(_)));
    }

    #[test]
    fn compaction_keeps_newest_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join(ERROR_LOG_FILE);
        let journal = ErrorJournal::new(&path, 2);
        for idx in 0..8 {
            journal.note(format!("failure {idx} {}", "x".repeat(200))).unwrap();
        }
        let entries = journal.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].record.message.starts_with("failure 7"));
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.lines().count() <= 3);
    }
}
