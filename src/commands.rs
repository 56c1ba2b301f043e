use crate::cli::{Commands, IdsetOp};
use crate::config::FleetConfig;
use crate::error::FleetResult;
use crate::eventlog::{Event, EventLog, FileEventLog, MemoryEventLog};
use crate::groups::GroupHub;
use crate::idset::IdSet;
use crate::resource::{ResourceContext, ResourceModule};
use crate::rpc::{Request, Response, ResponseReceiver};
use crate::types::{TrackedGroup, TOPIC_FORCE_DOWN, TOPIC_WAITUP};

use anyhow::Context;
use colored::*;
use serde::Deserialize;
use serde_json::json;
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use tokio::task::LocalSet;
use tracing::debug;

/// Sender name used for requests issued by a replay
pub const REPLAY_SENDER: &str = "replay";

pub fn execute_command(command: Commands, config: &FleetConfig) -> anyhow::Result<()> {
    match command {
        Commands::Replay { script, json } => execute_replay(&script, json, config),
        Commands::Idset { op, a, b } => execute_idset(op, &a, b.as_deref()),
    }
}

/// One line of a replay script
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReplayStep {
    /// `{"group": "online", "members": "0-3"}`: publish a group snapshot
    Group { group: TrackedGroup, members: String },
    /// `{"force_down": "2"}`: send monitor.force-down
    ForceDown { force_down: String },
    /// `{"waitup": 4}`: send monitor.waitup
    Waitup { waitup: i64 },
    /// `{"disconnect": "replay"}`: drop a sender's outstanding requests
    Disconnect { disconnect: String },
}

/// Parse a JSON-lines script. Blank lines and `#` comments are skipped.
pub fn parse_script(text: &str) -> anyhow::Result<Vec<ReplayStep>> {
    let mut steps = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step = serde_json::from_str(line)
            .with_context(|| format!("line {}: not a replay step: {}", n + 1, line))?;
        steps.push(step);
    }
    Ok(steps)
}

/// Outcome of a request sent during a replay
#[derive(Debug)]
pub struct RequestOutcome {
    /// Human readable description of the request
    pub label: String,
    /// `None` while still unanswered
    pub response: Option<Response>,
}

/// Final state after a replay
#[derive(Debug)]
pub struct ReplayReport {
    pub up: Option<IdSet>,
    pub down: Option<IdSet>,
    pub torpid: Option<IdSet>,
    pub lost: Option<IdSet>,
    pub requests: Vec<RequestOutcome>,
    pub events: Vec<Event>,
}

/// Let spawned watcher tasks catch up with published updates
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Load a resource module for `config` and drive `steps` through it.
///
/// Must run inside a [`LocalSet`].
pub async fn run_replay(config: &FleetConfig, steps: &[ReplayStep]) -> FleetResult<ReplayReport> {
    let groups = Rc::new(GroupHub::new());
    let memlog = Rc::new(RefCell::new(MemoryEventLog::new()));
    let reslog: Rc<RefCell<dyn EventLog>> = match &config.eventlog {
        Some(path) => Rc::new(RefCell::new(FileEventLog::open(path)?)),
        None => memlog.clone(),
    };
    let ctx = ResourceContext::from_attrs(Rc::new(config.attributes()), reslog, groups.clone())?;
    let module = ResourceModule::load(ctx, config.inventory_size, &config.monitor)?;
    let monitor = module.monitor();
    settle().await;

    let mut pending: Vec<(String, ResponseReceiver)> = Vec::new();
    for step in steps {
        debug!(?step, "replay step");
        match step {
            ReplayStep::Group { group, members } => {
                let members = IdSet::decode(members)?;
                let name = monitor.borrow().group_name(*group);
                groups.update(name, members);
            }
            ReplayStep::ForceDown { force_down } => {
                let (req, rx) =
                    Request::new(TOPIC_FORCE_DOWN, REPLAY_SENDER, json!({ "ranks": force_down }));
                module.handle(&req);
                pending.push((format!("force-down {}", force_down), rx));
            }
            ReplayStep::Waitup { waitup } => {
                let (req, rx) = Request::new(TOPIC_WAITUP, REPLAY_SENDER, json!({ "up": waitup }));
                module.handle(&req);
                pending.push((format!("waitup {}", waitup), rx));
            }
            ReplayStep::Disconnect { disconnect } => {
                let dropped = module.disconnect(disconnect)?;
                debug!(sender = %disconnect, dropped, "replay disconnect");
            }
        }
        settle().await;
    }

    let requests = pending
        .into_iter()
        .map(|(label, mut rx)| RequestOutcome {
            label,
            response: rx.try_recv().ok(),
        })
        .collect();
    let report = {
        let monitor = monitor.borrow();
        ReplayReport {
            up: monitor.up().cloned(),
            down: monitor.down(),
            torpid: monitor.torpid().cloned(),
            lost: monitor.lost().cloned(),
            requests,
            events: Vec::new(),
        }
    };
    module.unload()?;

    let events = match &config.eventlog {
        Some(path) => FileEventLog::read_events(path)?,
        None => memlog.borrow().events().to_vec(),
    };
    Ok(ReplayReport { events, ..report })
}

fn execute_replay(script: &Path, json: bool, config: &FleetConfig) -> anyhow::Result<()> {
    let text = fs::read_to_string(script)
        .with_context(|| format!("reading {}", script.display()))?;
    let steps = parse_script(&text)?;
    println!("{} {} ({} steps)", "Replaying:".bright_green(), script.display(), steps.len());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    let report = local.block_on(&runtime, run_replay(config, &steps))?;
    print_report(&report, json)?;
    Ok(())
}

fn print_set(label: &str, set: &Option<IdSet>) {
    let value = match set {
        Some(set) if set.is_empty() => "(empty)".dimmed().to_string(),
        Some(set) => set.encode().bright_cyan().to_string(),
        None => "(not tracked on this rank)".dimmed().to_string(),
    };
    println!("  {:<7} {}", format!("{}:", label), value);
}

fn print_report(report: &ReplayReport, json: bool) -> anyhow::Result<()> {
    println!("{}", "Membership:".bright_green());
    print_set("up", &report.up);
    print_set("down", &report.down);
    print_set("torpid", &report.torpid);
    print_set("lost", &report.lost);

    if !report.requests.is_empty() {
        println!("{}", "Requests:".bright_green());
        for outcome in &report.requests {
            let status = match &outcome.response {
                Some(Ok(_)) => "ok".bright_green().to_string(),
                Some(Err(e)) => e.to_string().bright_red().to_string(),
                None => "pending".bright_yellow().to_string(),
            };
            println!("  {}: {}", outcome.label, status);
        }
    }

    println!("{}", "Events:".bright_green());
    for event in &report.events {
        if json {
            println!("{}", serde_json::to_string(event)?);
            continue;
        }
        let context = event
            .context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
            .collect::<Vec<_>>()
            .join(" ");
        println!("  {:.6} {} {}", event.timestamp, event.name.bright_cyan(), context);
    }
    Ok(())
}

fn execute_idset(op: IdsetOp, a: &str, b: Option<&str>) -> anyhow::Result<()> {
    println!("{}", evaluate_idset(op, a, b)?);
    Ok(())
}

/// Evaluate an idset operation and return the printed result
pub fn evaluate_idset(op: IdsetOp, a: &str, b: Option<&str>) -> anyhow::Result<String> {
    let a = IdSet::decode(a)?;
    let operand = || -> anyhow::Result<IdSet> {
        let b = b.with_context(|| format!("idset {} needs two operands", op))?;
        Ok(IdSet::decode(b)?)
    };
    let result = match op {
        IdsetOp::Normalize => a.encode(),
        IdsetOp::Count => a.count().to_string(),
        IdsetOp::Diff => a.difference(&operand()?).encode(),
        IdsetOp::Union => {
            let mut union = a;
            union.add(&operand()?);
            union.encode()
        }
    };
    Ok(result)
}
