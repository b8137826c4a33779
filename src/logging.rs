//! Structured logging for the governor.
//!
//! Every record is one JSON line with a run id, a monotonic sequence number,
//! a level, a domain and a free-form `data` object. Records go to stdout and,
//! unless `LOG_TO_FILE=0`, to `LOG_DIR/<run_id>/{events,trace}.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Source,    // Trade-record reads
    Signal,    // Edge / confidence / survival
    Gate,      // Hysteresis counters and decisions
    Command,   // Command-log emission
    Broadcast, // Subscriber fan-out
    Api,       // Query and streaming surfaces
    System,    // Startup, shutdown, config
    Profile,   // Tick timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Source => "source",
            Domain::Signal => "signal",
            Domain::Gate => "gate",
            Domain::Command => "command",
            Domain::Broadcast => "broadcast",
            Domain::Api => "api",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn file_logging_enabled() -> bool {
    !matches!(
        std::env::var("LOG_TO_FILE").as_deref(),
        Ok("0") | Ok("false") | Ok("no")
    )
}

fn open_log(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("gov-{}-{}", ts_epoch_ms(), process::id()));
        if !file_logging_enabled() {
            return RunContext { run_id, events: None, trace: None };
        }

        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/governor".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, events: None, trace: None };
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_log(run_dir.join("events.jsonl")),
            trace: open_log(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["symbol", "mode", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

/// Log a gate decision before it is handed to the command sink.
pub fn log_decision(symbol: &str, mode: &str, command: &str) {
    log(
        Level::Info,
        Domain::Gate,
        "decision",
        obj(&[
            ("symbol", v_str(symbol)),
            ("mode", v_str(mode)),
            ("command", v_str(command)),
        ]),
    );
}

pub fn log_signal(symbol: &str, edge: f64, confidence: f64, survival: f64, samples: usize, failing: bool) {
    log(
        Level::Debug,
        Domain::Signal,
        "window_stats",
        obj(&[
            ("symbol", v_str(symbol)),
            ("edge", v_num(edge)),
            ("confidence", v_num(confidence)),
            ("survival", v_num(survival)),
            ("samples", json!(samples)),
            ("failing", json!(failing)),
        ]),
    );
}

pub fn log_source_error(source: &str, err: &anyhow::Error) {
    log(
        Level::Warn,
        Domain::Source,
        "source_unavailable",
        obj(&[
            ("source", v_str(source)),
            ("error", v_str(&format!("{:#}", err))),
            ("msg", v_str("treating as zero records for this tick")),
        ]),
    );
}

/// Per-tick summary
pub fn log_tick_summary(tick: u64, mode: &str, total_trades: u64, engines: usize, decisions: usize, errors: usize) {
    log(
        Level::Info,
        Domain::System,
        "tick",
        obj(&[
            ("mode", v_str(mode)),
            ("tick", json!(tick)),
            ("total_trades", json!(total_trades)),
            ("engines", json!(engines)),
            ("decisions", json!(decisions)),
            ("errors", json!(errors)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits the elapsed time of a scope on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self { label, context: Map::new(), started: Instant::now() }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self { label, context: obj(fields), started: Instant::now() }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_profile_scope_without_context() {
        let scope = ProfileScope::new("csv_refresh");
        assert_eq!(scope.label, "csv_refresh");
        assert!(scope.context.is_empty());
        drop(scope);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_fields_promotes_symbol() {
        let (top, data) = split_fields(obj(&[
            ("symbol", v_str("BTCUSDT")),
            ("edge", v_num(1.5)),
        ]));
        assert_eq!(top.get("symbol").unwrap(), "BTCUSDT");
        assert!(data.contains_key("edge"));
        assert!(!data.contains_key("symbol"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
