//! Per-engine performance signal over the evaluation window.
//!
//! Pure functions of the window: the same records always produce the same
//! stats.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::TradeRecord;

/// Below this many samples confidence is reported as zero.
pub const MIN_CONFIDENCE_SAMPLES: usize = 5;
/// Substituted for a zero standard deviation.
pub const STDDEV_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalParams {
    pub cost: f64,
    pub min_edge: f64,
    pub min_confidence: f64,
}

impl From<&crate::state::Config> for SignalParams {
    fn from(cfg: &crate::state::Config) -> Self {
        Self { cost: cfg.cost, min_edge: cfg.min_edge, min_confidence: cfg.min_confidence }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineWindowStats {
    pub symbol: String,
    /// Mean realized PnL per trade.
    pub edge: f64,
    /// |mean / population stddev|, 0.0 below the sample floor.
    pub confidence: f64,
    /// Edge net of the fixed cost.
    pub survival: f64,
    pub is_failing: bool,
    pub samples: usize,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (denominator N).
pub fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mu = mean(values);
    let var = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

pub fn confidence(pnls: &[f64]) -> f64 {
    if pnls.len() < MIN_CONFIDENCE_SAMPLES {
        return 0.0;
    }
    let mut sigma = population_stddev(pnls);
    if sigma == 0.0 {
        sigma = STDDEV_EPSILON;
    }
    (mean(pnls) / sigma).abs()
}

/// Group the window's PnL values by symbol, preserving window order within
/// each bucket. Symbols iterate in sorted order.
pub fn bucket_by_symbol(records: &[TradeRecord]) -> BTreeMap<String, Vec<f64>> {
    let mut buckets: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for r in records {
        buckets.entry(r.symbol.clone()).or_default().push(r.pnl);
    }
    buckets
}

/// Stats for one symbol's bucket. `None` when the bucket is empty: the
/// symbol is skipped for the tick.
pub fn compute_stats(symbol: &str, pnls: &[f64], params: &SignalParams) -> Option<EngineWindowStats> {
    if pnls.is_empty() {
        return None;
    }
    let edge = mean(pnls);
    let confidence = confidence(pnls);
    let survival = edge - params.cost;
    let is_failing = survival < params.min_edge || confidence < params.min_confidence;
    Some(EngineWindowStats {
        symbol: symbol.to_string(),
        edge,
        confidence,
        survival,
        is_failing,
        samples: pnls.len(),
    })
}

/// Stats for `symbol` drawn from a full window of mixed records.
pub fn stats_for_symbol(records: &[TradeRecord], symbol: &str, params: &SignalParams) -> Option<EngineWindowStats> {
    let pnls: Vec<f64> = records.iter().filter(|r| r.symbol == symbol).map(|r| r.pnl).collect();
    compute_stats(symbol, &pnls, params)
}
