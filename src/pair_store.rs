use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result as AnyResult};
use rusqlite::{Connection, OptionalExtension};

/// Tracked pair list shared by the dashboard and the candle server.
pub struct PairStore {
    conn: Mutex<Connection>,
}

impl PairStore {
    pub fn open(path: &Path) -> AnyResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> AnyResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AnyResult<Self> {
        conn.execute_batch("CREATE TABLE IF NOT EXISTS pairs (name TEXT UNIQUE)")
            .context("creating pairs table")?;
        Ok(PairStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pairs in insertion order.
    pub fn load(&self) -> AnyResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM pairs ORDER BY rowid")?;
        let pairs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    /// Returns `false` when the pair was already stored.
    pub fn insert(&self, pair: &str) -> AnyResult<bool> {
        let changed = self
            .conn()
            .execute("INSERT OR IGNORE INTO pairs (name) VALUES (?1)", [pair])
            .with_context(|| format!("storing pair {pair}"))?;
        Ok(changed > 0)
    }

    pub fn remove(&self, pair: &str) -> AnyResult<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM pairs WHERE name = ?1", [pair])
            .with_context(|| format!("deleting pair {pair}"))?;
        Ok(changed > 0)
    }

    pub fn contains(&self, pair: &str) -> AnyResult<bool> {
        let found = self
            .conn()
            .query_row("SELECT 1 FROM pairs WHERE name = ?1", [pair], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_unique_and_ordered() {
        let store = PairStore::in_memory().unwrap();
        assert!(store.insert("ETH_USDT").unwrap());
        assert!(store.insert("BTC_USDT").unwrap());
        assert!(!store.insert("ETH_USDT").unwrap());
        assert_eq!(store.load().unwrap(), vec!["ETH_USDT", "BTC_USDT"]);
        assert!(store.contains("BTC_USDT").unwrap());
    }

    #[test]
    fn remove_reports_missing_pairs() {
        let store = PairStore::in_memory().unwrap();
        store.insert("SOL_USDT").unwrap();
        assert!(store.remove("SOL_USDT").unwrap());
        assert!(!store.remove("SOL_USDT").unwrap());
        assert!(store.load().unwrap().is_empty());
    }
}
