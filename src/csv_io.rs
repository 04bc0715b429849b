use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result as AnyResult};

use crate::config::normalize_pair;
use crate::tables::{MARKET_HEADERS, MarketTable};

/// Writes the market table in its current sort order.
pub fn write_market_csv<W: Write>(table: &MarketTable, writer: W) -> AnyResult<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(MARKET_HEADERS)?;
    for row in table.rows() {
        csv.write_record(row.cells())?;
    }
    csv.flush()?;
    Ok(table.len())
}

pub fn export_market_csv(table: &MarketTable, path: &Path) -> AnyResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_market_csv(table, file).with_context(|| format!("writing {}", path.display()))
}

/// Reads pair names from the `PAIR` column, or from the first column when the
/// file has no such header. Invalid names are skipped, duplicates collapsed.
pub fn read_pairs_csv<R: Read>(reader: R) -> AnyResult<Vec<String>> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut records = csv.records();
    let Some(first) = records.next().transpose()? else {
        return Ok(Vec::new());
    };
    let header_column = first
        .iter()
        .position(|field| field.eq_ignore_ascii_case("pair"));
    let column = header_column.unwrap_or(0);

    let mut seen = BTreeSet::new();
    let mut pairs = Vec::new();
    let mut push = |raw: Option<&str>| {
        if let Some(pair) = raw.and_then(normalize_pair) {
            if seen.insert(pair.clone()) {
                pairs.push(pair);
            }
        }
    };
    if header_column.is_none() {
        push(first.get(column));
    }
    for record in records {
        let record = record?;
        push(record.get(column));
    }
    Ok(pairs)
}

pub fn import_pairs_csv(path: &Path) -> AnyResult<Vec<String>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_pairs_csv(file).with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TickerUpdate;

    #[test]
    fn export_writes_header_and_rows() {
        let mut table = MarketTable::new();
        table.upsert(&TickerUpdate {
            currency_pair: "BTC_USDT".into(),
            last: 30000.5,
            change_percentage: 1.234,
            base_volume: 12.0,
            quote_volume: 0.0,
            time: 1_700_000_000_000,
        });
        let mut buffer = Vec::new();
        assert_eq!(write_market_csv(&table, &mut buffer).unwrap(), 1);
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("TIME,PAIR,24H %,PRICE,VOLUME"));
        let row = lines.next().unwrap();
        assert!(row.ends_with(",BTC_USDT,1.23,30000.5,12.00"));
    }

    #[test]
    fn import_reads_pair_column() {
        let data = "TIME,PAIR,24H %\n01-01-2024 00:00:00,btc_usdt,1\n,ETH_USDT,2\nx,BTC_USDT,3\n,bad/pair,4\n";
        let pairs = read_pairs_csv(data.as_bytes()).unwrap();
        assert_eq!(pairs, vec!["BTC_USDT", "ETH_USDT"]);
    }

    #[test]
    fn import_without_header_uses_first_column() {
        let data = "sol_usdt\nxrp_usdt, ignored\n\n";
        let pairs = read_pairs_csv(data.as_bytes()).unwrap();
        assert_eq!(pairs, vec!["SOL_USDT", "XRP_USDT"]);
        assert!(read_pairs_csv("".as_bytes()).unwrap().is_empty());
    }
}
