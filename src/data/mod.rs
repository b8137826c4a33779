//! Closed-trade record sources.
//!
//! The governor only ever asks a source for "the last N records" plus the
//! total number of records seen so far. Two sources are provided: an
//! in-memory log for tests and replays, and a tail reader over the research
//! CSV the trading engines append to.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::logging::{log, obj, v_str, Domain, Level, ProfileScope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub pnl: f64,
    /// 1-based position in the source's append order.
    pub sequence_index: u64,
}

/// The most recent records plus the total count the source has seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeWindow {
    pub records: Vec<TradeRecord>,
    pub total: u64,
}

impl TradeWindow {
    pub fn empty() -> Self {
        Self::default()
    }
}

pub trait TradeSource: Send {
    fn name(&self) -> &str;

    /// Return at most `n` of the newest records, oldest first.
    fn latest(&mut self, n: usize) -> Result<TradeWindow>;
}

// =============================================================================
// In-memory source
// =============================================================================

/// Append-only in-memory trade log. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTradeSource {
    records: Arc<Mutex<Vec<TradeRecord>>>,
}

impl MemoryTradeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, symbol: &str, pnl: f64) {
        if let Ok(mut records) = self.records.lock() {
            let sequence_index = records.len() as u64 + 1;
            records.push(TradeRecord { symbol: symbol.to_string(), pnl, sequence_index });
        }
    }

    pub fn extend(&self, symbol: &str, pnls: &[f64]) {
        for pnl in pnls {
            self.push(symbol, *pnl);
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TradeSource for MemoryTradeSource {
    fn name(&self) -> &str {
        "memory"
    }

    fn latest(&mut self, n: usize) -> Result<TradeWindow> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow!("memory trade log poisoned"))?;
        let start = records.len().saturating_sub(n);
        Ok(TradeWindow {
            records: records[start..].to_vec(),
            total: records.len() as u64,
        })
    }
}

// =============================================================================
// CSV tail source
// =============================================================================

pub const SYMBOL_COLUMN: &str = "symbol";
pub const PNL_COLUMNS: [&str; 2] = ["total_pnl", "pnl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    symbol: usize,
    pnl: usize,
    width: usize,
}

fn parse_header(line: &str) -> Result<Columns> {
    let names: Vec<String> = line.split(',').map(clean_field).collect();
    let symbol = names
        .iter()
        .position(|n| n == SYMBOL_COLUMN)
        .ok_or_else(|| anyhow!("header missing `{}` column: {}", SYMBOL_COLUMN, line))?;
    let pnl = PNL_COLUMNS
        .iter()
        .find_map(|want| names.iter().position(|n| n == want))
        .ok_or_else(|| anyhow!("header missing `total_pnl` column: {}", line))?;
    Ok(Columns { symbol, pnl, width: names.len() })
}

fn clean_field(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}

fn parse_row(line: &str, cols: Columns) -> Result<(String, f64)> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < cols.width {
        bail!("expected {} columns, got {}", cols.width, parts.len());
    }
    let symbol = clean_field(parts[cols.symbol]);
    if symbol.is_empty() {
        bail!("empty symbol");
    }
    let pnl: f64 = clean_field(parts[cols.pnl])
        .parse()
        .with_context(|| format!("bad pnl {:?}", parts[cols.pnl]))?;
    if !pnl.is_finite() {
        bail!("non-finite pnl {}", pnl);
    }
    Ok((symbol, pnl))
}

/// Incremental reader over an append-only CSV of closed trades.
///
/// Only bytes appended since the previous read are parsed. The newest
/// `capacity` records are kept in memory. If the file shrinks it is assumed
/// to have been rotated and is re-read from the start.
#[derive(Debug)]
pub struct CsvTradeSource {
    path: PathBuf,
    label: String,
    capacity: usize,
    offset: u64,
    columns: Option<Columns>,
    /// Bytes after the last newline; decoded once the line is complete.
    partial: Vec<u8>,
    recent: VecDeque<TradeRecord>,
    total: u64,
    bad_rows: u64,
}

impl CsvTradeSource {
    pub fn new(path: impl AsRef<Path>, capacity: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            label: format!("csv:{}", path.display()),
            path,
            capacity: capacity.max(1),
            offset: 0,
            columns: None,
            partial: Vec::new(),
            recent: VecDeque::with_capacity(capacity.max(1)),
            total: 0,
            bad_rows: 0,
        }
    }

    pub fn bad_rows(&self) -> u64 {
        self.bad_rows
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.columns = None;
        self.partial.clear();
        self.recent.clear();
        self.total = 0;
        self.bad_rows = 0;
    }

    fn refresh(&mut self) -> Result<()> {
        let len = std::fs::metadata(&self.path)
            .with_context(|| format!("stat {}", self.path.display()))?
            .len();
        if len < self.offset {
            log(
                Level::Info,
                Domain::Source,
                "csv_rotated",
                obj(&[("path", v_str(&self.path.to_string_lossy()))]),
            );
            self.reset();
        }
        if len == self.offset {
            return Ok(());
        }

        let _scope = ProfileScope::new("csv_refresh");
        let mut file = File::open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(self.offset))?;
        let before = self.partial.len();
        file.read_to_end(&mut self.partial)?;
        self.offset += (self.partial.len() - before) as u64;

        // The trailing fragment stays buffered until its newline arrives, so a
        // multibyte character split across reads is decoded whole.
        let complete = match self.partial.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(()),
        };
        let pending: Vec<u8> = self.partial.drain(..complete).collect();
        for raw in pending.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            if let Err(err) = self.ingest_line(line.trim_end_matches('\r')) {
                self.reset();
                return Err(err);
            }
        }
        Ok(())
    }

    fn ingest_line(&mut self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let cols = match self.columns {
            Some(cols) => cols,
            None => {
                self.columns = Some(
                    parse_header(line)
                        .with_context(|| format!("bad header in {}", self.path.display()))?,
                );
                return Ok(());
            }
        };
        match parse_row(line, cols) {
            Ok((symbol, pnl)) => {
                self.total += 1;
                if self.recent.len() >= self.capacity {
                    self.recent.pop_front();
                }
                self.recent.push_back(TradeRecord { symbol, pnl, sequence_index: self.total });
            }
            Err(err) => {
                self.bad_rows += 1;
                log(
                    Level::Debug,
                    Domain::Source,
                    "csv_row_skipped",
                    obj(&[("error", v_str(&err.to_string())), ("line", v_str(line))]),
                );
            }
        }
        Ok(())
    }
}

impl TradeSource for CsvTradeSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn latest(&mut self, n: usize) -> Result<TradeWindow> {
        self.refresh()?;
        let take = n.min(self.recent.len());
        let start = self.recent.len() - take;
        Ok(TradeWindow {
            records: self.recent.iter().skip(start).cloned().collect(),
            total: self.total,
        })
    }
}
