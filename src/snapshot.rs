use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::gate::{round_to, Admission, GateOutcome};
use crate::signals::EngineWindowStats;
use crate::state::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineStatus {
    Pass,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEntry {
    pub edge: f64,
    pub confidence: f64,
    pub survival: f64,
    pub fail_count: u32,
    pub pass_count: u32,
    pub trades_since_action: u64,
    pub can_act: bool,
    pub mode: Mode,
    pub status: EngineStatus,
    pub admission: Admission,
}

impl EngineEntry {
    pub fn new(stats: &EngineWindowStats, outcome: &GateOutcome, mode: Mode) -> Self {
        Self {
            edge: round_to(stats.edge, 4),
            confidence: round_to(stats.confidence, 4),
            survival: round_to(stats.survival, 4),
            fail_count: outcome.fail_count,
            pass_count: outcome.pass_count,
            trades_since_action: outcome.trades_since_action,
            can_act: outcome.can_act,
            mode,
            status: if stats.is_failing { EngineStatus::Warn } else { EngineStatus::Pass },
            admission: outcome.state.admission,
        }
    }
}

/// Full governor state as seen by readers. Never mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorSnapshot {
    pub mode: Mode,
    pub tick: u64,
    pub total_trades: u64,
    pub engines: BTreeMap<String, EngineEntry>,
}

impl GovernorSnapshot {
    pub fn empty(mode: Mode) -> Self {
        Self { mode, tick: 0, total_trades: 0, engines: BTreeMap::new() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Holds the latest published snapshot. Publication swaps the whole `Arc`,
/// so a reader holds either the previous snapshot or the new one.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current: Arc<RwLock<Arc<GovernorSnapshot>>>,
}

impl SnapshotStore {
    pub fn new(initial: GovernorSnapshot) -> Self {
        Self { current: Arc::new(RwLock::new(Arc::new(initial))) }
    }

    pub fn load(&self) -> Arc<GovernorSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn publish(&self, snapshot: GovernorSnapshot) -> Arc<GovernorSnapshot> {
        let next = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::clone(&next),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&next),
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::EngineControlState;

    fn entry(fail_count: u32) -> EngineEntry {
        let stats = EngineWindowStats {
            symbol: "BTC".into(),
            edge: -2.000049,
            confidence: 0.123456,
            survival: -3.000049,
            is_failing: true,
            samples: 10,
        };
        let outcome = GateOutcome {
            fail_count,
            pass_count: 0,
            trades_since_action: 20,
            can_act: true,
            decisions: vec![],
            state: EngineControlState::default(),
        };
        EngineEntry::new(&stats, &outcome, Mode::Observe)
    }

    #[test]
    fn test_entry_rounds_and_flags_warn() {
        let e = entry(2);
        assert_eq!(e.edge, -2.0);
        assert_eq!(e.confidence, 0.1235);
        assert_eq!(e.status, EngineStatus::Warn);
        assert_eq!(e.fail_count, 2);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snap = GovernorSnapshot::empty(Mode::Advise);
        snap.engines.insert("BTC".into(), entry(1));
        let v: serde_json::Value = serde_json::from_str(&snap.to_json()).unwrap();
        assert_eq!(v["mode"], "ADVISE");
        assert_eq!(v["engines"]["BTC"]["status"], "WARN");
        assert_eq!(v["engines"]["BTC"]["admission"], "ENABLED");
        assert_eq!(v["engines"]["BTC"]["fail_count"], 1);
    }

    #[test]
    fn test_store_swaps_whole_snapshot() {
        let store = SnapshotStore::new(GovernorSnapshot::empty(Mode::Observe));
        let before = store.load();
        let mut next = GovernorSnapshot::empty(Mode::Act);
        next.tick = 1;
        store.publish(next);
        assert_eq!(before.tick, 0);
        assert_eq!(store.load().tick, 1);
        assert_eq!(store.load(), store.load());
    }
}
