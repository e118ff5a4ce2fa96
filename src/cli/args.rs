//! CLI argument definitions.

use crate::cli::validators::{parse_confidence, parse_duration, parse_workers};
use crate::registry::{DetectionId, IdentityId};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Re-identify individual animals across camera-trap detections.
#[derive(Debug, Parser)]
#[command(name = "wildreid")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// How results are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputMode {
    /// Tables and summaries for people.
    #[default]
    Human,
    /// One JSON envelope per line.
    Json,
}

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Configuration file (default: platform config directory).
    #[arg(long, global = true, env = "WILDREID_CONFIG")]
    pub config: Option<PathBuf>,

    /// Registry directory (overrides config).
    #[arg(long, global = true, env = "WILDREID_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Output mode.
    #[arg(long, global = true, value_enum, default_value_t = OutputMode::Human)]
    pub output_mode: OutputMode,

    /// Only log warnings and errors; no progress bar.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase verbosity (-v: debug, -vv: trace+ORT info, -vvv: trace+ORT debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest upstream detection files and match them.
    Ingest {
        /// Detection files (.jsonl) or directories containing them.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Processing options.
        #[command(flatten)]
        run: RunArgs,
    },
    /// Re-run matching for detections already in the registry.
    Rematch {
        /// Which detections to re-match.
        #[command(flatten)]
        target: RematchTarget,

        /// Processing options.
        #[command(flatten)]
        run: RunArgs,
    },
    /// Query and correct identities.
    Identity {
        /// Identity action to perform.
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Query and correct detections.
    Detection {
        /// Detection action to perform.
        #[command(subcommand)]
        action: DetectionAction,
    },
    /// List detections that need a human decision.
    Review {
        /// Write the queue as CSV to stdout.
        #[arg(long)]
        csv: bool,
    },
    /// Query the seasonal archive.
    Season {
        /// Season action to perform.
        #[command(subcommand)]
        action: SeasonAction,
    },
    /// List data-integrity incidents.
    Incidents {
        /// Include resolved incidents.
        #[arg(long)]
        all: bool,
    },
    /// Export registry contents as CSV.
    Export {
        /// What to export.
        #[command(subcommand)]
        action: ExportAction,
    },
    /// Manage configuration.
    Config {
        /// Configuration action to perform.
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Registry maintenance.
    Registry {
        /// Registry action to perform.
        #[command(subcommand)]
        action: RegistryAction,
    },
}

/// Options for commands that run the matching pipeline.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Concurrent workers (overrides config).
    #[arg(short = 'j', long, value_parser = parse_workers, env = "WILDREID_WORKERS")]
    pub workers: Option<usize>,

    /// Match threshold (0.0-1.0, overrides config).
    #[arg(short, long, value_parser = parse_confidence, env = "WILDREID_THRESHOLD")]
    pub threshold: Option<f32>,

    /// Disable the progress bar.
    #[arg(long)]
    pub no_progress: bool,
}

/// Detections selected for re-matching.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct RematchTarget {
    /// Every non-duplicate detection.
    #[arg(long)]
    pub all: bool,

    /// Unresolved detections and detections left pending by failures.
    #[arg(long)]
    pub unresolved: bool,

    /// Specific detections (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<DetectionId>,
}

/// Identity subcommand actions.
#[derive(Debug, Subcommand)]
pub enum IdentityAction {
    /// List identities.
    List {
        /// Only identities of this species.
        #[arg(long)]
        species: Option<String>,
    },
    /// Show the profile of one identity.
    Show {
        /// Identity id (`ind-00001` or `1`).
        id: IdentityId,
    },
    /// Name an identity; omit the name to clear it.
    Rename {
        /// Identity id.
        id: IdentityId,
        /// New name.
        name: Option<String>,
    },
    /// Merge one identity into another.
    Merge {
        /// Identity that disappears.
        source: IdentityId,
        /// Identity that survives.
        #[arg(long = "into")]
        target: IdentityId,
    },
    /// Return a repaired, quarantined identity to matching.
    Release {
        /// Identity id.
        id: IdentityId,
    },
}

/// Detection subcommand actions.
#[derive(Debug, Subcommand)]
pub enum DetectionAction {
    /// Show one detection with its assignment and candidate scores.
    Show {
        /// Detection id.
        id: DetectionId,
    },
    /// Mark an assignment incorrect and return the detection to pending.
    Reject {
        /// Detection id.
        id: DetectionId,
        /// Never assign this detection to the same identity again.
        #[arg(long)]
        negative: bool,
    },
    /// Assign a detection to an identity by hand.
    Assign {
        /// Detection id.
        id: DetectionId,
        /// Identity id.
        identity: IdentityId,
    },
}

/// Season subcommand actions.
#[derive(Debug, Subcommand)]
pub enum SeasonAction {
    /// Seasonal record of an identity for one season tag.
    Show {
        /// Identity id.
        id: IdentityId,
        /// Season tag, e.g. `2024-late`.
        tag: String,
    },
    /// Every seasonal record of an identity.
    List {
        /// Identity id.
        id: IdentityId,
    },
}

/// Export subcommand actions.
#[derive(Debug, Subcommand)]
pub enum ExportAction {
    /// One row per identity.
    Identities {
        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only identities of this species.
        #[arg(long)]
        species: Option<String>,
    },
    /// One row per detection with its assignment.
    Detections {
        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Config subcommand actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Create default configuration file.
    Init,
    /// Display current configuration.
    Show,
    /// Print configuration file path.
    Path,
}

/// Registry subcommand actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum RegistryAction {
    /// Show registry location and record counts.
    Info,
    /// Write a fresh snapshot and truncate the journal.
    Compact,
    /// Remove a lock left behind by a crashed process.
    Unlock {
        /// Remove the lock whatever its age.
        #[arg(long)]
        force: bool,
        /// Only remove locks older than this (e.g. 30m, 1h).
        #[arg(long, value_parser = parse_duration, default_value = "1h")]
        older_than: Duration,
    },
}
