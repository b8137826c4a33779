use anyhow::{Context, Result};
use serde_json::json;
use tokio::net::TcpListener;

use alpha_governor::api::serve_http;
use alpha_governor::command::CommandEmitter;
use alpha_governor::control::ControlLoop;
use alpha_governor::data::CsvTradeSource;
use alpha_governor::logging::{log, obj, v_num, v_str, Domain, Level};
use alpha_governor::state::Config;
use alpha_governor::stream::serve_ws;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate().context("invalid governor config")?;

    log(
        Level::Info,
        Domain::System,
        "starting",
        obj(&[
            ("msg", v_str(&format!("Alpha Governor starting in {} mode", cfg.mode))),
            ("mode", v_str(cfg.mode.as_str())),
            ("window", json!(cfg.window)),
            ("min_edge", v_num(cfg.min_edge)),
            ("cost", v_num(cfg.cost)),
            ("min_confidence", v_num(cfg.min_confidence)),
            ("disable_windows", json!(cfg.disable_threshold)),
            ("enable_windows", json!(cfg.enable_threshold)),
            ("cooldown_trades", json!(cfg.cooldown_trades)),
            ("trades_csv", v_str(&cfg.trades_csv)),
            ("command_file", v_str(&cfg.command_file)),
        ]),
    );

    let source = CsvTradeSource::new(&cfg.trades_csv, cfg.window);
    let emitter = CommandEmitter::to_file(&cfg.command_file);
    let governor = ControlLoop::new(&cfg, Box::new(source), emitter);
    let handle = governor.handle();

    let http_addr = format!("{}:{}", cfg.bind_addr, cfg.http_port);
    let http = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("bind http {}", http_addr))?;
    let ws_addr = format!("{}:{}", cfg.bind_addr, cfg.ws_port);
    let ws = TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("bind ws {}", ws_addr))?;

    log(
        Level::Info,
        Domain::Api,
        "listening",
        obj(&[("http", v_str(&http_addr)), ("ws", v_str(&ws_addr))]),
    );

    let http_task = tokio::spawn(serve_http(http, handle.clone()));
    let ws_task = tokio::spawn(serve_ws(ws, handle));

    governor
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    http_task.abort();
    ws_task.abort();
    Ok(())
}
