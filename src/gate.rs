//! Hysteresis gate: debounced enable/disable decisions per engine.
//!
//! Failing and passing windows are counted consecutively. A decision fires
//! once a counter reaches its threshold, and only if at least
//! `cooldown_trades` trades have been recorded since the previous action on
//! the same engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::signals::EngineWindowStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Admission {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateConfig {
    pub disable_threshold: u32,
    pub enable_threshold: u32,
    pub cooldown_trades: u64,
    pub min_weight: f64,
    pub max_weight: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            disable_threshold: 3,
            enable_threshold: 5,
            cooldown_trades: 100,
            min_weight: 0.05,
            max_weight: 0.5,
        }
    }
}

impl From<&crate::state::Config> for GateConfig {
    fn from(cfg: &crate::state::Config) -> Self {
        Self {
            disable_threshold: cfg.disable_threshold,
            enable_threshold: cfg.enable_threshold,
            cooldown_trades: cfg.cooldown_trades,
            min_weight: cfg.min_weight,
            max_weight: cfg.max_weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineControlState {
    pub fail_count: u32,
    pub pass_count: u32,
    /// Total trade count at the last action. Never decreases.
    pub last_action_index: u64,
    pub admission: Admission,
}

impl Default for EngineControlState {
    fn default() -> Self {
        Self { fail_count: 0, pass_count: 0, last_action_index: 0, admission: Admission::Enabled }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Disable { symbol: String, survival: f64, confidence: f64 },
    Enable { symbol: String, weight: f64 },
}

impl Decision {
    pub fn symbol(&self) -> &str {
        match self {
            Decision::Disable { symbol, .. } | Decision::Enable { symbol, .. } => symbol,
        }
    }

    /// Command-log line, without any mode tag.
    pub fn command(&self) -> String {
        match self {
            Decision::Disable { symbol, survival, confidence } => format!(
                "DISABLE_ENGINE {} reason=survival:{:.2}_conf:{:.2}",
                symbol, survival, confidence
            ),
            Decision::Enable { symbol, weight } => {
                format!("ENABLE_ENGINE {} weight={}", symbol, format_weight(*weight))
            }
        }
    }
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    /// Streak counters after this window was counted, before any action
    /// reset them.
    pub fail_count: u32,
    pub pass_count: u32,
    pub trades_since_action: u64,
    pub can_act: bool,
    pub decisions: Vec<Decision>,
    pub state: EngineControlState,
}

pub fn round_to(v: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (v * scale).round() / scale
}

/// Weight rounded to 3 places; whole numbers keep one decimal (`1.0`).
pub fn format_weight(weight: f64) -> String {
    let w = round_to(weight, 3);
    if w.fract() == 0.0 {
        format!("{:.1}", w)
    } else {
        format!("{}", w)
    }
}

pub fn enable_weight(confidence: f64, min_weight: f64, max_weight: f64) -> f64 {
    (confidence / 2.0).max(min_weight).min(max_weight)
}

#[derive(Debug, Clone, Default)]
pub struct HysteresisGate {
    cfg: GateConfig,
    engines: HashMap<String, EngineControlState>,
}

impl HysteresisGate {
    pub fn new(cfg: GateConfig) -> Self {
        Self { cfg, engines: HashMap::new() }
    }

    pub fn config(&self) -> &GateConfig {
        &self.cfg
    }

    pub fn state(&self, symbol: &str) -> Option<&EngineControlState> {
        self.engines.get(symbol)
    }

    pub fn admission(&self, symbol: &str) -> Admission {
        self.engines.get(symbol).map(|s| s.admission).unwrap_or(Admission::Enabled)
    }

    /// Run one window's result for an engine through the state machine.
    /// `total_trades` is the source's total record count this tick.
    pub fn evaluate(&mut self, stats: &EngineWindowStats, total_trades: u64) -> GateOutcome {
        let cfg = self.cfg;
        let st = self.engines.entry(stats.symbol.clone()).or_default();

        if stats.is_failing {
            st.fail_count += 1;
            st.pass_count = 0;
        } else {
            st.pass_count += 1;
            st.fail_count = 0;
        }

        let (fail_count, pass_count) = (st.fail_count, st.pass_count);
        let trades_since_action = total_trades.saturating_sub(st.last_action_index);
        let can_act = trades_since_action >= cfg.cooldown_trades;
        let mut decisions = Vec::new();

        if can_act {
            if st.fail_count >= cfg.disable_threshold {
                decisions.push(Decision::Disable {
                    symbol: stats.symbol.clone(),
                    survival: stats.survival,
                    confidence: stats.confidence,
                });
                st.fail_count = 0;
                st.last_action_index = st.last_action_index.max(total_trades);
                st.admission = Admission::Disabled;
            }
            if st.pass_count >= cfg.enable_threshold {
                decisions.push(Decision::Enable {
                    symbol: stats.symbol.clone(),
                    weight: enable_weight(stats.confidence, cfg.min_weight, cfg.max_weight),
                });
                st.pass_count = 0;
                st.last_action_index = st.last_action_index.max(total_trades);
                st.admission = Admission::Enabled;
            }
        }

        GateOutcome { fail_count, pass_count, trades_since_action, can_act, decisions, state: st.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(symbol: &str, failing: bool, confidence: f64) -> EngineWindowStats {
        EngineWindowStats {
            symbol: symbol.to_string(),
            edge: if failing { -2.0 } else { 3.0 },
            confidence,
            survival: if failing { -3.0 } else { 2.0 },
            is_failing: failing,
            samples: 20,
        }
    }

    fn gate(cooldown: u64) -> HysteresisGate {
        HysteresisGate::new(GateConfig { cooldown_trades: cooldown, ..GateConfig::default() })
    }

    #[test]
    fn test_disable_after_three_consecutive_failures() {
        let mut g = gate(0);
        let s = stats("BTC", true, 0.1);
        assert!(g.evaluate(&s, 20).decisions.is_empty());
        assert!(g.evaluate(&s, 20).decisions.is_empty());
        let out = g.evaluate(&s, 20);
        assert_eq!(out.decisions.len(), 1);
        assert!(matches!(out.decisions[0], Decision::Disable { .. }));
        assert_eq!(out.fail_count, 3);
        assert_eq!(out.state.fail_count, 0);
        assert_eq!(out.state.last_action_index, 20);
        assert_eq!(g.admission("BTC"), Admission::Disabled);
    }

    #[test]
    fn test_single_pass_resets_fail_streak() {
        let mut g = gate(0);
        g.evaluate(&stats("BTC", true, 0.1), 20);
        g.evaluate(&stats("BTC", true, 0.1), 20);
        let out = g.evaluate(&stats("BTC", false, 1.0), 20);
        assert!(out.decisions.is_empty());
        assert_eq!(out.state.fail_count, 0);
        assert_eq!(out.state.pass_count, 1);
        let out = g.evaluate(&stats("BTC", true, 0.1), 20);
        assert!(out.decisions.is_empty());
        assert_eq!(out.state.fail_count, 1);
    }

    #[test]
    fn test_counters_are_mutually_exclusive() {
        let mut g = gate(1_000);
        for (i, failing) in [true, false, false, true, true, false].iter().enumerate() {
            let out = g.evaluate(&stats("BTC", *failing, 1.0), i as u64);
            assert!(out.state.fail_count == 0 || out.state.pass_count == 0);
            assert!(out.state.fail_count + out.state.pass_count > 0);
        }
    }

    #[test]
    fn test_cooldown_blocks_actions_but_counters_advance() {
        let mut g = gate(100);
        let s = stats("BTC", true, 0.1);
        for _ in 0..5 {
            let out = g.evaluate(&s, 50);
            assert!(!out.can_act);
            assert!(out.decisions.is_empty());
        }
        assert_eq!(g.state("BTC").unwrap().fail_count, 5);

        // Cooldown satisfied: the accumulated streak fires immediately.
        let out = g.evaluate(&s, 100);
        assert!(out.can_act);
        assert_eq!(out.decisions.len(), 1);
        assert_eq!(out.state.fail_count, 0);

        // Next action needs another 100 trades.
        for _ in 0..3 {
            assert!(g.evaluate(&s, 150).decisions.is_empty());
        }
        assert_eq!(g.evaluate(&s, 199).trades_since_action, 99);
        assert_eq!(g.evaluate(&s, 200).decisions.len(), 1);
    }

    #[test]
    fn test_enable_after_five_passes_with_clamped_weight() {
        let mut g = HysteresisGate::new(GateConfig {
            cooldown_trades: 0,
            min_weight: 0.05,
            max_weight: 0.5,
            ..GateConfig::default()
        });
        let s = stats("ETH", false, 100.0);
        for _ in 0..4 {
            assert!(g.evaluate(&s, 30).decisions.is_empty());
        }
        let out = g.evaluate(&s, 30);
        assert_eq!(out.decisions, vec![Decision::Enable { symbol: "ETH".into(), weight: 0.5 }]);
        assert_eq!(out.pass_count, 5);
        assert_eq!(out.state.pass_count, 0);
        assert_eq!(out.state.admission, Admission::Enabled);
    }

    #[test]
    fn test_enable_weight_floor() {
        assert_eq!(enable_weight(0.02, 0.05, 0.5), 0.05);
        assert_eq!(enable_weight(0.6, 0.05, 0.5), 0.3);
    }

    #[test]
    fn test_engines_are_independent() {
        let mut g = gate(0);
        for _ in 0..3 {
            g.evaluate(&stats("BTC", true, 0.1), 10);
            g.evaluate(&stats("ETH", false, 1.0), 10);
        }
        assert_eq!(g.admission("BTC"), Admission::Disabled);
        assert_eq!(g.admission("ETH"), Admission::Enabled);
        assert_eq!(g.state("ETH").unwrap().pass_count, 3);
    }

    #[test]
    fn test_command_formatting() {
        let d = Decision::Disable { symbol: "BTC".into(), survival: -3.0, confidence: 2_000_000_000.0 };
        assert_eq!(d.command(), "DISABLE_ENGINE BTC reason=survival:-3.00_conf:2000000000.00");
        let e = Decision::Enable { symbol: "ETH".into(), weight: 0.123456 };
        assert_eq!(e.command(), "ENABLE_ENGINE ETH weight=0.123");
        let e = Decision::Enable { symbol: "ETH".into(), weight: 0.5 };
        assert_eq!(e.command(), "ENABLE_ENGINE ETH weight=0.5");
        let e = Decision::Enable { symbol: "ETH".into(), weight: 1.0 };
        assert_eq!(e.command(), "ENABLE_ENGINE ETH weight=1.0");
        let e = Decision::Enable { symbol: "ETH".into(), weight: 1.9999 };
        assert_eq!(e.command(), "ENABLE_ENGINE ETH weight=2.0");
    }
}
