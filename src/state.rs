use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::logging::{log, obj, v_str, Domain, Level};

/// Global gate deciding what a decision turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Log only.
    Observe,
    /// Append to the command log, tagged as advisory.
    Advise,
    /// Append to the command log for the downstream executor.
    Act,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Observe => "OBSERVE",
            Mode::Advise => "ADVISE",
            Mode::Act => "ACT",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Mode::Observe => 0,
            Mode::Advise => 1,
            Mode::Act => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Mode::Advise,
            2 => Mode::Act,
            _ => Mode::Observe,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeParseError(pub String);

impl fmt::Display for ModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid mode {:?} (expected OBSERVE, ADVISE or ACT)", self.0)
    }
}

impl std::error::Error for ModeParseError {}

impl FromStr for Mode {
    type Err = ModeParseError;

    /// Exact, case-sensitive match on the three mode names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OBSERVE" => Ok(Mode::Observe),
            "ADVISE" => Ok(Mode::Advise),
            "ACT" => Ok(Mode::Act),
            other => Err(ModeParseError(other.to_string())),
        }
    }
}

/// Shared, atomically swapped mode. Writers are last-writer-wins; the
/// control loop reads it once per tick.
#[derive(Debug, Clone)]
pub struct ModeCell {
    inner: Arc<AtomicU8>,
}

impl ModeCell {
    pub fn new(mode: Mode) -> Self {
        Self { inner: Arc::new(AtomicU8::new(mode.to_u8())) }
    }

    pub fn get(&self) -> Mode {
        Mode::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, mode: Mode) {
        self.inner.store(mode.to_u8(), Ordering::Release);
    }

    /// Parse and apply. An invalid value leaves the current mode untouched.
    pub fn set_str(&self, raw: &str) -> Result<Mode, ModeParseError> {
        let mode = raw.parse::<Mode>()?;
        self.set(mode);
        Ok(mode)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of most recent trades evaluated each tick.
    pub window: usize,
    pub min_edge: f64,
    /// Fixed per-trade transaction cost subtracted from edge.
    pub cost: f64,
    pub min_confidence: f64,
    pub disable_threshold: u32,
    pub enable_threshold: u32,
    pub cooldown_trades: u64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub tick_ms: u64,
    pub mode: Mode,
    pub trades_csv: String,
    pub command_file: String,
    pub bind_addr: String,
    pub http_port: u16,
    pub ws_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: 50,
            min_edge: 0.5,
            cost: 1.0,
            min_confidence: 0.3,
            disable_threshold: 3,
            enable_threshold: 5,
            cooldown_trades: 100,
            min_weight: 0.05,
            max_weight: 0.5,
            tick_ms: 2000,
            mode: Mode::Observe,
            trades_csv: "./research/trades.csv".to_string(),
            command_file: "./engine_commands.txt".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            http_port: 8790,
            ws_port: 8791,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let mode = match lookup("GOV_MODE") {
            Some(raw) => raw.trim().parse::<Mode>().unwrap_or_else(|err| {
                log(
                    Level::Warn,
                    Domain::System,
                    "config_mode_invalid",
                    obj(&[("error", v_str(&err.to_string())), ("fallback", v_str("OBSERVE"))]),
                );
                Mode::Observe
            }),
            None => d.mode,
        };
        Self {
            window: parsed(&lookup, "GOV_WINDOW", d.window),
            min_edge: parsed(&lookup, "GOV_MIN_EDGE_BPS", d.min_edge),
            cost: parsed(&lookup, "GOV_COST_BPS", d.cost),
            min_confidence: parsed(&lookup, "GOV_MIN_CONFIDENCE", d.min_confidence),
            disable_threshold: parsed(&lookup, "GOV_DISABLE_WINDOWS", d.disable_threshold),
            enable_threshold: parsed(&lookup, "GOV_ENABLE_WINDOWS", d.enable_threshold),
            cooldown_trades: parsed(&lookup, "GOV_COOLDOWN_TRADES", d.cooldown_trades),
            min_weight: parsed(&lookup, "GOV_MIN_WEIGHT", d.min_weight),
            max_weight: parsed(&lookup, "GOV_MAX_WEIGHT", d.max_weight),
            tick_ms: parsed(&lookup, "GOV_TICK_MS", d.tick_ms),
            mode,
            trades_csv: lookup("GOV_TRADES_CSV").unwrap_or(d.trades_csv),
            command_file: lookup("GOV_COMMAND_FILE").unwrap_or(d.command_file),
            bind_addr: lookup("GOV_BIND").unwrap_or(d.bind_addr),
            http_port: parsed(&lookup, "GOV_HTTP_PORT", d.http_port),
            ws_port: parsed(&lookup, "GOV_WS_PORT", d.ws_port),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            bail!("window must be > 0");
        }
        if self.disable_threshold == 0 || self.enable_threshold == 0 {
            bail!(
                "consecutive-window thresholds must be > 0 (disable={}, enable={})",
                self.disable_threshold,
                self.enable_threshold
            );
        }
        if !(self.min_weight <= self.max_weight) {
            bail!("min_weight {} exceeds max_weight {}", self.min_weight, self.max_weight);
        }
        if self.tick_ms == 0 {
            bail!("tick_ms must be > 0");
        }
        for (name, v) in [
            ("min_edge", self.min_edge),
            ("cost", self.cost),
            ("min_confidence", self.min_confidence),
        ] {
            if !v.is_finite() {
                bail!("{} must be finite, got {}", name, v);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_mode_parse_is_exact() {
        assert_eq!("ACT".parse::<Mode>().unwrap(), Mode::Act);
        assert_eq!("ADVISE".parse::<Mode>().unwrap(), Mode::Advise);
        assert!("act".parse::<Mode>().is_err());
        assert!("PAUSE".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_cell_rejects_invalid_without_mutation() {
        let cell = ModeCell::new(Mode::Advise);
        assert!(cell.set_str("YOLO").is_err());
        assert_eq!(cell.get(), Mode::Advise);
        assert_eq!(cell.set_str("ACT").unwrap(), Mode::Act);
        assert_eq!(cell.get(), Mode::Act);
    }

    #[test]
    fn test_mode_cell_clones_share_value() {
        let cell = ModeCell::new(Mode::Observe);
        let other = cell.clone();
        other.set(Mode::Act);
        assert_eq!(cell.get(), Mode::Act);
    }

    #[test]
    fn test_config_defaults_match_documented_values() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.disable_threshold, 3);
        assert_eq!(cfg.enable_threshold, 5);
        assert_eq!(cfg.cooldown_trades, 100);
        assert_eq!(cfg.tick_ms, 2000);
        assert_eq!(cfg.mode, Mode::Observe);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_reads_overrides_and_ignores_garbage() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("GOV_WINDOW", "20"),
            ("GOV_COST_BPS", "0.25"),
            ("GOV_COOLDOWN_TRADES", "not-a-number"),
            ("GOV_MODE", "ACT"),
        ]));
        assert_eq!(cfg.window, 20);
        assert_eq!(cfg.cost, 0.25);
        assert_eq!(cfg.cooldown_trades, 100);
        assert_eq!(cfg.mode, Mode::Act);
    }

    #[test]
    fn test_config_invalid_mode_falls_back_to_observe() {
        let cfg = Config::from_lookup(lookup_from(&[("GOV_MODE", "LIVE")]));
        assert_eq!(cfg.mode, Mode::Observe);
    }

    #[test]
    fn test_validate_rejects_inverted_weights() {
        let cfg = Config { min_weight: 0.6, max_weight: 0.5, ..Config::default() };
        assert!(cfg.validate().is_err());
        let cfg = Config { window: 0, ..Config::default() };
        assert!(cfg.validate().is_err());
    }
}
