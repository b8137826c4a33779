//! The governor's control loop.
//!
//! One tick: read the window, score every engine in it, run the hysteresis
//! gate, publish a new snapshot and fan it out, then dispose of decisions
//! according to the mode. The loop is the only writer of gate state and
//! snapshots; ticks run back to back and never overlap.

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::api::GovernorHandle;
use crate::broadcast::{BroadcastHub, BroadcastReport};
use crate::command::{CommandEmitter, Emitted};
use crate::data::{TradeSource, TradeWindow};
use crate::gate::{GateConfig, GateOutcome, HysteresisGate};
use crate::logging::{log, log_signal, log_source_error, log_tick_summary, obj, v_str, Domain, Level, ProfileScope};
use crate::signals::{bucket_by_symbol, compute_stats, EngineWindowStats, SignalParams};
use crate::snapshot::{EngineEntry, GovernorSnapshot, SnapshotStore};
use crate::state::{Config, Mode, ModeCell};

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolError {
    pub symbol: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub mode: Mode,
    pub total_trades: u64,
    pub evaluated: Vec<String>,
    pub emitted: Vec<Emitted>,
    pub errors: Vec<SymbolError>,
    pub broadcast: BroadcastReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Not enough history; nothing was mutated or broadcast.
    Skipped { total_trades: u64, required: usize },
    Completed(TickReport),
}

pub struct ControlLoop {
    window: usize,
    period: Duration,
    signal: SignalParams,
    gate: HysteresisGate,
    emitter: CommandEmitter,
    source: Box<dyn TradeSource>,
    mode: ModeCell,
    snapshots: SnapshotStore,
    hub: BroadcastHub,
    tick: u64,
}

impl ControlLoop {
    pub fn new(cfg: &Config, source: Box<dyn TradeSource>, emitter: CommandEmitter) -> Self {
        Self {
            window: cfg.window,
            period: Duration::from_millis(cfg.tick_ms),
            signal: SignalParams::from(cfg),
            gate: HysteresisGate::new(GateConfig::from(cfg)),
            emitter,
            source,
            mode: ModeCell::new(cfg.mode),
            snapshots: SnapshotStore::new(GovernorSnapshot::empty(cfg.mode)),
            hub: BroadcastHub::new(),
            tick: 0,
        }
    }

    /// Read-only handle for the query and streaming surfaces.
    pub fn handle(&self) -> GovernorHandle {
        GovernorHandle::new(self.mode.clone(), self.snapshots.clone(), self.hub.clone())
    }

    pub fn gate(&self) -> &HysteresisGate {
        &self.gate
    }

    fn pull_window(&mut self) -> TradeWindow {
        match self.source.latest(self.window) {
            Ok(window) => window,
            Err(err) => {
                log_source_error(self.source.name(), &err);
                TradeWindow::empty()
            }
        }
    }

    fn evaluate_symbol(
        &mut self,
        symbol: &str,
        pnls: &[f64],
        total_trades: u64,
    ) -> Result<Option<(EngineWindowStats, GateOutcome)>> {
        let stats = match compute_stats(symbol, pnls, &self.signal) {
            Some(stats) => stats,
            None => return Ok(None),
        };
        if !stats.edge.is_finite() || !stats.confidence.is_finite() {
            bail!("non-finite signal (edge={}, confidence={})", stats.edge, stats.confidence);
        }
        log_signal(symbol, stats.edge, stats.confidence, stats.survival, stats.samples, stats.is_failing);
        let outcome = self.gate.evaluate(&stats, total_trades);
        Ok(Some((stats, outcome)))
    }

    /// Run one evaluation pass.
    pub fn tick(&mut self) -> TickOutcome {
        let _scope = ProfileScope::with_context("tick", &[("tick", json!(self.tick + 1))]);
        let window = self.pull_window();
        if window.total < self.window as u64 {
            log(
                Level::Debug,
                Domain::System,
                "tick_skipped",
                obj(&[
                    ("total_trades", json!(window.total)),
                    ("required", json!(self.window)),
                ]),
            );
            return TickOutcome::Skipped { total_trades: window.total, required: self.window };
        }

        // Read once: a mode change mid-tick applies from the next tick.
        let mode = self.mode.get();
        self.tick += 1;

        let prior = self.snapshots.load();
        let mut engines = prior.engines.clone();
        let mut evaluated = Vec::new();
        let mut emitted = Vec::new();
        let mut errors = Vec::new();
        let mut decisions = Vec::new();

        for (symbol, pnls) in bucket_by_symbol(&window.records) {
            let (stats, outcome) = match self.evaluate_symbol(&symbol, &pnls, window.total) {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(err) => {
                    log(
                        Level::Error,
                        Domain::Signal,
                        "evaluation_failed",
                        obj(&[("symbol", v_str(&symbol)), ("error", v_str(&format!("{:#}", err)))]),
                    );
                    errors.push(SymbolError { symbol, error: format!("{:#}", err) });
                    continue;
                }
            };
            engines.insert(symbol.clone(), EngineEntry::new(&stats, &outcome, mode));
            decisions.extend(outcome.decisions);
            evaluated.push(symbol);
        }

        let snapshot = self.snapshots.publish(GovernorSnapshot {
            mode,
            tick: self.tick,
            total_trades: window.total,
            engines,
        });
        let broadcast = self.hub.broadcast(Arc::clone(&snapshot));

        // Subscribers already hold this tick's snapshot; a slow command log
        // only delays the next tick.
        for decision in &decisions {
            match self.emitter.emit(decision, mode) {
                Ok(out) => emitted.push(out),
                Err(err) => {
                    log(
                        Level::Error,
                        Domain::Command,
                        "emit_failed",
                        obj(&[
                            ("symbol", v_str(decision.symbol())),
                            ("mode", v_str(mode.as_str())),
                            ("error", v_str(&format!("{:#}", err))),
                        ]),
                    );
                    errors.push(SymbolError { symbol: decision.symbol().to_string(), error: format!("{:#}", err) });
                }
            }
        }

        log_tick_summary(self.tick, mode.as_str(), window.total, evaluated.len(), emitted.len(), errors.len());
        TickOutcome::Completed(TickReport {
            tick: self.tick,
            mode,
            total_trades: window.total,
            evaluated,
            emitted,
            errors,
            broadcast,
        })
    }

    /// Tick every period until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        log(
            Level::Info,
            Domain::System,
            "loop_started",
            obj(&[
                ("mode", v_str(self.mode.get().as_str())),
                ("period_ms", json!(self.period.as_millis() as u64)),
                ("window", json!(self.window)),
                ("source", v_str(self.source.name())),
            ]),
        );
        let mut gov = self;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    // Source reads and command appends are blocking file I/O.
                    // Awaiting the task keeps ticks from overlapping.
                    gov = match tokio::task::spawn_blocking(move || {
                        gov.tick();
                        gov
                    })
                    .await
                    {
                        Ok(gov) => gov,
                        Err(err) => {
                            log(
                                Level::Error,
                                Domain::System,
                                "tick_task_failed",
                                obj(&[("error", v_str(&err.to_string()))]),
                            );
                            return;
                        }
                    };
                }
            }
        }
        log(Level::Info, Domain::System, "loop_stopped", obj(&[("ticks", json!(gov.tick))]));
    }
}
