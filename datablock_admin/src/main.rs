//! # DataBlock Admin
//!
//! Out-of-band diagnostics and crash recovery for DataBlock segments. Holds no
//! protocol locks of its own and is safe to run next to live producers and
//! consumers.
//!
//! # Usage
//!
//! ```bash
//! # Snapshot every slot
//! datablock-admin diagnose sensor_ring
//!
//! # Release a write lock left by a crashed producer
//! datablock-admin recover sensor_ring --slot 3 --action zombie-writer
//!
//! # Reset every slot, even ones in use
//! datablock-admin recover sensor_ring --all --force
//!
//! # Check and repair checksums, JSON logs
//! datablock-admin --json validate sensor_ring --repair
//! ```
//!
//! Exit status is 0 when the segment ends in the desired state (SUCCESS or
//! NOT_STUCK) and 1 otherwise.

#![deny(warnings)]

mod commands;

use clap::{Parser, Subcommand};
use commands::{AdminError, Context, Outcome, RecoverAction, SlotSelection};
use datablock_common::prelude::{AdminConfig, ConfigLoader, resolve_shm_dir};
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// DataBlock Admin - diagnose and repair shared memory slot rings
#[derive(Parser, Debug)]
#[command(name = "datablock-admin")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Diagnose and repair DataBlock shared memory segments")]
#[command(long_about = None)]
struct Args {
    /// Path to admin configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding segment backing files
    #[arg(long, value_name = "DIR")]
    shm_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs and reports in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot slot control blocks and flag stuck writers
    Diagnose {
        /// Segment name
        shm_name: String,
        /// Only this slot
        #[arg(long)]
        slot: Option<usize>,
    },

    /// Release or reset stuck slots
    Recover {
        /// Segment name
        shm_name: String,
        /// Slot to recover
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        slot: Option<usize>,
        /// Recover every slot
        #[arg(long)]
        all: bool,
        /// Recovery action
        #[arg(long, value_enum, default_value_t = RecoverAction::Reset)]
        action: RecoverAction,
        /// Act even if a live process could be affected
        #[arg(long)]
        force: bool,
    },

    /// Remove heartbeat entries of dead consumers
    Cleanup {
        /// Segment name
        shm_name: String,
    },

    /// Check header and checksums
    Validate {
        /// Segment name
        shm_name: String,
        /// Recompute mismatching checksums
        #[arg(long)]
        repair: bool,
    },

    /// Print the metrics block
    Metrics {
        /// Segment name
        shm_name: String,
        /// Zero the counters after printing
        #[arg(long)]
        reset: bool,
    },
}

fn main() {
    let args = Args::parse();
    let code = match run(&args) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!("{}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(args: &Args) -> Result<Outcome, AdminError> {
    let config = match &args.config {
        Some(path) => {
            let config = AdminConfig::load(path);
            // Logging comes up before config errors are reported
            setup_tracing(args, config.as_ref().ok());
            let config = config?;
            config.validate()?;
            config
        }
        None => {
            let config = AdminConfig::default();
            setup_tracing(args, Some(&config));
            config
        }
    };

    let shm_dir = resolve_shm_dir(args.shm_dir.as_deref().or(config.admin.shm_dir.as_deref()));
    debug!(shm_dir = %shm_dir.display(), "resolved segment directory");

    let ctx = Context {
        shm_dir: &shm_dir,
        settings: &config.admin,
        json: args.json,
    };

    match &args.command {
        Command::Diagnose { shm_name, slot } => ctx.diagnose(shm_name, *slot),
        Command::Recover {
            shm_name,
            slot,
            all: _,
            action,
            force,
        } => {
            let slots = slot.map_or(SlotSelection::All, SlotSelection::One);
            ctx.recover(shm_name, slots, *action, *force)
        }
        Command::Cleanup { shm_name } => ctx.cleanup(shm_name),
        Command::Validate { shm_name, repair } => ctx.validate(shm_name, *repair),
        Command::Metrics { shm_name, reset } => ctx.metrics(shm_name, *reset),
    }
}

fn setup_tracing(args: &Args, config: Option<&AdminConfig>) {
    let level = if args.verbose {
        "debug"
    } else {
        config.map_or("info", |c| c.shared.log_level.as_directive())
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = if args.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
