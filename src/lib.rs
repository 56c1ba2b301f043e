//! # fleetmon: fleet membership monitor
//!
//! Tracks which ranks of a fleet are up, down, torpid and lost, records
//! each change in an append-only event log, and answers requests that
//! wait for a given number of ranks to come up.
//!
//! The building blocks are:
//! - [`waitqueue`]: reference-counted, run-once deferred completions
//! - [`monitor`]: set reconciliation over full group snapshots
//! - [`resource`]: the module that wires the monitor to groups and RPCs
//!
//! Everything runs on a single-threaded reactor; shared state lives in
//! `Rc`/`RefCell` and tasks are spawned on a [`tokio::task::LocalSet`].

#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod idset;
pub mod config;
pub mod eventlog;
pub mod groups;
pub mod rpc;
pub mod waitqueue;
pub mod monitor;
pub mod resource;
/// Command-line interface and argument parsing
pub mod cli;
/// Command execution and replay driver
pub mod commands;

// Re-export main types
pub use types::{Rank, TrackedGroup};
pub use error::{FleetError, FleetResult};
pub use idset::{IdSet, IdSetError};
pub use config::{AttrStore, Attributes, FleetConfig, MonitorConfig};
pub use eventlog::{Durability, Event, EventLog, FileEventLog, MemoryEventLog};
pub use groups::{GroupHub, GroupSubscription};
pub use rpc::{HandlerTable, MessageHandler, Request, Response, RpcError};
pub use waitqueue::{Continuation, Wait, WaitQueue};
pub use monitor::Monitor;
pub use resource::{ResourceContext, ResourceModule};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
