//! Row-keyed table models behind the market and balance panels.
//!
//! Both tables keep their rows sorted by the active column so the UI, the CSV
//! export and the tests all see the same order.

use std::cmp::Ordering;

use chrono::{DateTime, Local};

use crate::command::{BalanceRow, BalanceSnapshot, TickerUpdate};

pub const MARKET_HEADERS: [&str; 5] = ["TIME", "PAIR", "24H %", "PRICE", "VOLUME"];
pub const BALANCE_HEADERS: [&str; 4] = ["CURRENCY", "AVAILABLE", "LOCKED", "TOTAL"];
const TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketColumn {
    Time,
    Pair,
    Change,
    Price,
    Volume,
}

impl MarketColumn {
    pub const ALL: [MarketColumn; 5] = [
        MarketColumn::Time,
        MarketColumn::Pair,
        MarketColumn::Change,
        MarketColumn::Price,
        MarketColumn::Volume,
    ];

    pub fn header(self) -> &'static str {
        MARKET_HEADERS[self.index()]
    }

    fn index(self) -> usize {
        match self {
            MarketColumn::Time => 0,
            MarketColumn::Pair => 1,
            MarketColumn::Change => 2,
            MarketColumn::Price => 3,
            MarketColumn::Volume => 4,
        }
    }

    pub fn next(self) -> MarketColumn {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceColumn {
    Currency,
    Available,
    Locked,
    Total,
}

impl BalanceColumn {
    pub const ALL: [BalanceColumn; 4] = [
        BalanceColumn::Currency,
        BalanceColumn::Available,
        BalanceColumn::Locked,
        BalanceColumn::Total,
    ];

    pub fn header(self) -> &'static str {
        BALANCE_HEADERS[self.index()]
    }

    fn index(self) -> usize {
        match self {
            BalanceColumn::Currency => 0,
            BalanceColumn::Available => 1,
            BalanceColumn::Locked => 2,
            BalanceColumn::Total => 3,
        }
    }

    pub fn next(self) -> BalanceColumn {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortState<C> {
    pub column: C,
    pub descending: bool,
}

impl<C: Copy> SortState<C> {
    pub fn new(column: C) -> Self {
        SortState {
            column,
            descending: false,
        }
    }

    pub fn arrow(&self) -> &'static str {
        if self.descending { "v" } else { "^" }
    }
}

/// Value a cell is sorted by. Text compares as strings, numbers numerically;
/// mixed or non-finite values fall back to their display text.
#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Text(String),
    Number(f64),
}

fn compare_keys(left: &SortKey, right: &SortKey) -> Ordering {
    match (left, right) {
        (SortKey::Number(a), SortKey::Number(b)) => a
            .partial_cmp(b)
            .unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
        (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
        (SortKey::Number(a), SortKey::Text(b)) => a.to_string().cmp(b),
        (SortKey::Text(a), SortKey::Number(b)) => a.cmp(&b.to_string()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Flat,
}

impl Trend {
    pub fn of(change: f64) -> Trend {
        if change > 0.0 {
            Trend::Up
        } else if change < 0.0 {
            Trend::Down
        } else {
            Trend::Flat
        }
    }
}

pub fn format_two(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.2}")
    } else {
        "--".to_string()
    }
}

pub fn format_price(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        "--".to_string()
    }
}

pub fn format_time_ms(timestamp_ms: i64) -> String {
    if timestamp_ms <= 0 {
        return "--".to_string();
    }
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|utc| utc.with_timezone(&Local).format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "--".to_string())
}

#[derive(Clone, Debug, PartialEq)]
pub struct MarketRow {
    pub pair: String,
    pub last: f64,
    pub change_percentage: f64,
    pub volume: f64,
    /// Exchange time of the latest applied update, in milliseconds.
    pub time: i64,
}

impl MarketRow {
    fn placeholder(pair: &str) -> Self {
        MarketRow {
            pair: pair.to_string(),
            last: f64::NAN,
            change_percentage: f64::NAN,
            volume: f64::NAN,
            time: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.time > 0
    }

    pub fn trend(&self) -> Trend {
        if self.has_data() {
            Trend::of(self.change_percentage)
        } else {
            Trend::Flat
        }
    }

    /// Display text in column order.
    pub fn cells(&self) -> [String; 5] {
        if !self.has_data() {
            return [
                "--".to_string(),
                self.pair.clone(),
                "--".to_string(),
                "--".to_string(),
                "--".to_string(),
            ];
        }
        [
            format_time_ms(self.time),
            self.pair.clone(),
            format_two(self.change_percentage),
            format_price(self.last),
            format_two(self.volume),
        ]
    }

    fn sort_key(&self, column: MarketColumn) -> SortKey {
        match column {
            MarketColumn::Pair => SortKey::Text(self.pair.clone()),
            MarketColumn::Time => SortKey::Number(self.time as f64),
            MarketColumn::Change => SortKey::Number(self.change_percentage),
            MarketColumn::Price => SortKey::Number(self.last),
            MarketColumn::Volume => SortKey::Number(self.volume),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Older than what the row already shows.
    Stale,
}

#[derive(Debug, Clone)]
pub struct MarketTable {
    rows: Vec<MarketRow>,
    sort: SortState<MarketColumn>,
}

impl Default for MarketTable {
    fn default() -> Self {
        MarketTable::new()
    }
}

impl MarketTable {
    pub fn new() -> Self {
        MarketTable {
            rows: Vec::new(),
            sort: SortState::new(MarketColumn::Pair),
        }
    }

    pub fn rows(&self) -> &[MarketRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn sort_state(&self) -> SortState<MarketColumn> {
        self.sort
    }

    pub fn pairs(&self) -> Vec<String> {
        self.rows.iter().map(|row| row.pair.clone()).collect()
    }

    pub fn get(&self, pair: &str) -> Option<&MarketRow> {
        self.rows.iter().find(|row| row.pair == pair)
    }

    /// Adds an empty row so a freshly tracked pair is visible before its
    /// first update arrives.
    pub fn track(&mut self, pair: &str) -> bool {
        if self.get(pair).is_some() {
            return false;
        }
        self.rows.push(MarketRow::placeholder(pair));
        self.resort();
        true
    }

    pub fn upsert(&mut self, update: &TickerUpdate) -> Upsert {
        let outcome = match self.rows.iter_mut().find(|row| row.pair == update.currency_pair) {
            Some(row) if row.has_data() && update.time < row.time => return Upsert::Stale,
            Some(row) => {
                row.last = update.last;
                row.change_percentage = update.change_percentage;
                row.volume = update.base_volume;
                row.time = update.time;
                Upsert::Updated
            }
            None => {
                self.rows.push(MarketRow {
                    pair: update.currency_pair.clone(),
                    last: update.last,
                    change_percentage: update.change_percentage,
                    volume: update.base_volume,
                    time: update.time,
                });
                Upsert::Inserted
            }
        };
        self.resort();
        outcome
    }

    pub fn remove(&mut self, pair: &str) -> bool {
        let before = self.rows.len();
        self.rows.retain(|row| row.pair != pair);
        before != self.rows.len()
    }

    pub fn sort_by(&mut self, column: MarketColumn, descending: bool) {
        self.sort = SortState { column, descending };
        self.resort();
    }

    pub fn cycle_sort_column(&mut self) {
        let next = self.sort.column.next();
        self.sort_by(next, self.sort.descending);
    }

    pub fn toggle_sort_order(&mut self) {
        self.sort_by(self.sort.column, !self.sort.descending);
    }

    fn resort(&mut self) {
        let SortState { column, descending } = self.sort;
        self.rows.sort_by(|a, b| {
            let ordering = compare_keys(&a.sort_key(column), &b.sort_key(column))
                .then_with(|| a.pair.cmp(&b.pair));
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct BalanceTable {
    rows: Vec<BalanceRow>,
    threshold: f64,
    sort: SortState<BalanceColumn>,
    total_usdt: Option<f64>,
    fetched_at_ms: Option<i64>,
    hidden: usize,
}

/// Rows where both `available` and `locked` are under the threshold are hidden.
pub fn above_threshold(row: &BalanceRow, threshold: f64) -> bool {
    row.available >= threshold || row.locked >= threshold
}

impl BalanceTable {
    pub fn new(threshold: f64) -> Self {
        BalanceTable {
            rows: Vec::new(),
            threshold,
            sort: SortState::new(BalanceColumn::Currency),
            total_usdt: None,
            fetched_at_ms: None,
            hidden: 0,
        }
    }

    /// Replaces the table wholesale with a fresh poll result.
    pub fn replace(&mut self, snapshot: BalanceSnapshot) {
        let total = snapshot.rows.len();
        self.rows = snapshot
            .rows
            .into_iter()
            .filter(|row| above_threshold(row, self.threshold))
            .collect();
        self.hidden = total - self.rows.len();
        self.total_usdt = snapshot.total_usdt;
        self.fetched_at_ms = Some(snapshot.fetched_at_ms);
        self.resort();
    }

    pub fn rows(&self) -> &[BalanceRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn total_usdt(&self) -> Option<f64> {
        self.total_usdt
    }

    pub fn fetched_at_ms(&self) -> Option<i64> {
        self.fetched_at_ms
    }

    pub fn loaded(&self) -> bool {
        self.fetched_at_ms.is_some()
    }

    pub fn sort_state(&self) -> SortState<BalanceColumn> {
        self.sort
    }

    pub fn cells(row: &BalanceRow) -> [String; 4] {
        [
            row.currency.clone(),
            format_two(row.available),
            format_two(row.locked),
            format_two(row.total),
        ]
    }

    pub fn sort_by(&mut self, column: BalanceColumn, descending: bool) {
        self.sort = SortState { column, descending };
        self.resort();
    }

    pub fn cycle_sort_column(&mut self) {
        let next = self.sort.column.next();
        self.sort_by(next, self.sort.descending);
    }

    pub fn toggle_sort_order(&mut self) {
        self.sort_by(self.sort.column, !self.sort.descending);
    }

    fn resort(&mut self) {
        let SortState { column, descending } = self.sort;
        let key = |row: &BalanceRow| match column {
            BalanceColumn::Currency => SortKey::Text(row.currency.clone()),
            BalanceColumn::Available => SortKey::Number(row.available),
            BalanceColumn::Locked => SortKey::Number(row.locked),
            BalanceColumn::Total => SortKey::Number(row.total),
        };
        self.rows.sort_by(|a, b| {
            let ordering = compare_keys(&key(a), &key(b)).then_with(|| a.currency.cmp(&b.currency));
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
}
