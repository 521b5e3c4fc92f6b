//! Demo binary: a room of race nodes on an in-process fabric.
//!
//! Usage:
//!   cargo run -p netrace_node --bin node -- [--nodes 2] [--mode shared|authoritative]
//!       [--pattern line|circle|grid] [--tick-hz 60] [--ticks 0] [--room GameRoom]
//!       [--config node.json]
//!
//! The first node starts the session; the others join it. Node 1 drives a
//! scripted lap, the rest idle. `--ticks 0` runs until `quit`.
//!
//! Console commands (applied to node 1):
//!   status                 - Network stats
//!   cars                   - Spawned vehicles
//!   veh_max_torque <value> - Tune the controller (also veh_max_steer, ...)
//!   leave <n>              - Disconnect node n
//!   quit                   - Exit

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use netrace_node::{
    input::{NeutralInput, ScriptedInput},
    node::load_config,
    RaceNode,
};
use netrace_shared::{
    config::{EngineConfig, SessionMode, SpawnPattern},
    fabric::LoopbackHub,
    input::InputSource,
    physics::KinematicPhysics,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    nodes: usize,
    ticks: u32,
    config: Option<PathBuf>,
    mode: Option<SessionMode>,
    pattern: Option<SpawnPattern>,
    tick_hz: Option<u32>,
    room: Option<String>,
}

fn parse_args() -> Args {
    let mut out = Args {
        nodes: 2,
        ticks: 0,
        config: None,
        mode: None,
        pattern: None,
        tick_hz: None,
        room: None,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).map(String::as_str);
        match (args[i].as_str(), value) {
            ("--nodes", Some(v)) => out.nodes = v.parse().unwrap_or(2),
            ("--ticks", Some(v)) => out.ticks = v.parse().unwrap_or(0),
            ("--config", Some(v)) => out.config = Some(PathBuf::from(v)),
            ("--tick-hz", Some(v)) => out.tick_hz = v.parse().ok(),
            ("--room", Some(v)) => out.room = Some(v.to_string()),
            ("--mode", Some(v)) => {
                out.mode = match v {
                    "authoritative" => Some(SessionMode::Authoritative),
                    "shared" => Some(SessionMode::SharedAuthority),
                    _ => None,
                }
            }
            ("--pattern", Some(v)) => {
                out.pattern = match v {
                    "line" => Some(SpawnPattern::Line),
                    "circle" => Some(SpawnPattern::Circle),
                    "grid" => Some(SpawnPattern::Grid),
                    _ => None,
                }
            }
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    out
}

fn build_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(mode) = args.mode {
        cfg.session.mode = mode;
    }
    if let Some(pattern) = args.pattern {
        cfg.spawn.pattern = pattern;
    }
    if let Some(hz) = args.tick_hz {
        cfg.session.tick_hz = hz;
    }
    if let Some(room) = &args.room {
        cfg.session.room = room.clone();
    }
    cfg.session.max_participants = cfg.session.max_participants.max(args.nodes);
    cfg.validate().context("config")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let cfg = build_config(&args)?;
    info!(
        nodes = args.nodes,
        mode = ?cfg.session.mode,
        pattern = ?cfg.spawn.pattern,
        tick_hz = cfg.session.tick_hz,
        room = %cfg.session.room,
        "Starting race"
    );

    let hub = LoopbackHub::new(cfg.session.max_records);
    let mut nodes: Vec<Option<RaceNode>> = Vec::with_capacity(args.nodes);
    for n in 0..args.nodes.max(1) {
        let source: Box<dyn InputSource> = if n == 0 {
            Box::new(ScriptedInput::demo_lap(cfg.session.tick_hz))
        } else {
            Box::new(NeutralInput)
        };
        let mut node = RaceNode::new(
            cfg.clone(),
            Arc::new(hub.endpoint()),
            Box::new(KinematicPhysics::default()),
            source,
        )
        .context("create node")?;
        if n == 0 {
            node.start_as_authority(cfg.session.max_participants)
                .await
                .context("start session")?;
        } else {
            node.join().await.with_context(|| format!("node {} join", n + 1))?;
        }
        nodes.push(Some(node));
    }

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Race ready. Type 'status', 'cars', 'leave <n>' or 'quit'.");
    println!();

    let tick_interval = std::time::Duration::from_secs_f32(1.0 / cfg.session.tick_hz as f32);
    let dt = cfg.tick_dt();
    let mut next_tick = tokio::time::Instant::now();
    let mut ticks_run = 0u32;

    'run: loop {
        while let Ok(line) = console_rx.try_recv() {
            if let Some(n) = line.strip_prefix("leave ").and_then(|n| n.trim().parse::<usize>().ok()) {
                match nodes.get_mut(n.wrapping_sub(1)).and_then(Option::take) {
                    Some(mut node) => {
                        node.shutdown();
                        println!("Node {} left", n);
                    }
                    None => println!("No node {}", n),
                }
                continue;
            }
            let Some(first) = nodes.iter_mut().flatten().next() else {
                break 'run;
            };
            match first.exec_console(&line) {
                Ok(out) => out.iter().for_each(|l| println!("{l}")),
                Err(e) => println!("{e:#}"),
            }
            if first.quit_requested() {
                break 'run;
            }
        }

        hub.advance_tick();
        for node in nodes.iter_mut().flatten() {
            node.begin_tick();
        }
        for node in nodes.iter_mut().flatten() {
            node.simulate_tick(dt);
        }

        ticks_run += 1;
        if args.ticks > 0 && ticks_run >= args.ticks {
            break;
        }
        if nodes.iter().all(Option::is_none) {
            warn!("All nodes left");
            break;
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    if let Some(first) = nodes.iter_mut().flatten().next() {
        for line in first.exec_console("cars")? {
            println!("{line}");
        }
    }
    for node in nodes.iter_mut().flatten() {
        node.shutdown();
    }
    info!(ticks = ticks_run, "Race finished");
    Ok(())
}
