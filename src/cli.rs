use clap::{Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::PathBuf;

/// fleetmon - fleet membership monitor
#[derive(Parser)]
#[command(name = "fleetmon")]
#[command(author = "fleetmon Team")]
#[command(version = "0.1.0")]
#[command(about = "Track which ranks of a fleet are up, down, torpid or lost")]
#[command(long_about = "
fleetmon tracks rank membership for a fleet of execution targets and
records every change in an append-only event log.

Usage examples:
  fleetmon replay steps.jsonl            # Replay group updates and RPCs
  fleetmon --config fleet.toml replay s  # Replay with a configured instance
  fleetmon idset diff 0-7 2,4            # Set difference of two idsets
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a leader monitor over a JSON-lines script of steps
    Replay {
        /// Script file, one step per line
        #[arg(value_name = "FILE")]
        script: PathBuf,

        /// Print the event log as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Evaluate an idset expression
    Idset {
        /// Operation
        #[arg(value_enum)]
        op: IdsetOp,

        /// First operand
        a: String,

        /// Second operand (diff, union)
        b: Option<String>,
    },
}

/// idset operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum IdsetOp {
    /// Re-encode in canonical form
    Normalize,
    /// Number of members
    Count,
    /// Members of a not in b
    Diff,
    /// Members of a or b
    Union,
}

impl fmt::Display for IdsetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdsetOp::Normalize => "normalize",
            IdsetOp::Count => "count",
            IdsetOp::Diff => "diff",
            IdsetOp::Union => "union",
        };
        f.write_str(name)
    }
}
