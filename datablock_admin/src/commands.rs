//! Subcommand implementations

use datablock_common::prelude::{AdminSettings, ConfigError};
use datablock_shared_memory::{
    DataBlockError, DataBlockRecovery, RecoveryResult, SlotDiagnostic, get_metrics, reset_metrics,
};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that end the tool before an outcome is reached
#[derive(Debug, Error)]
pub enum AdminError {
    /// Configuration file rejected
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Segment could not be opened or inspected
    #[error("{0}")]
    DataBlock(#[from] DataBlockError),

    /// `--force` given while `allow_force` is off
    #[error("--force is disabled by admin.allow_force = false")]
    ForceDisallowed,

    /// Output encoding failed
    #[error("json output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Recovery action selected with `--action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RecoverAction {
    /// Return the slot to FREE, dropping lock and readers
    Reset,
    /// Clear a write lock held by a dead process
    ZombieWriter,
    /// Zero the reader count
    ZombieReaders,
}

/// Which slots a command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSelection {
    /// A single ring position
    One(usize),
    /// Every slot in the ring
    All,
}

/// What a command achieved, mapped to the exit status by `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Report printed
    Reported,
    /// Recovery outcome
    Recovery(RecoveryResult),
}

impl Outcome {
    /// Process exit status: 0 for reports and SUCCESS or NOT_STUCK, 1 otherwise.
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Reported => 0,
            Outcome::Recovery(result) if result.is_ok() => 0,
            Outcome::Recovery(_) => 1,
        }
    }
}

/// Shared context for every subcommand
pub struct Context<'a> {
    pub shm_dir: &'a Path,
    pub settings: &'a AdminSettings,
    pub json: bool,
}

#[derive(Serialize)]
struct SlotReport<'a> {
    #[serde(flatten)]
    diagnostic: &'a SlotDiagnostic,
    state: &'static str,
    long_held: bool,
}

#[derive(Serialize)]
struct RecoveryReport<'a> {
    segment: &'a str,
    result: &'static str,
}

impl Context<'_> {
    fn open(&self, name: &str) -> Result<DataBlockRecovery, AdminError> {
        Ok(DataBlockRecovery::open_in(self.shm_dir, name)?)
    }

    fn is_long_held(&self, diag: &SlotDiagnostic) -> bool {
        diag.is_locked() && !diag.is_stuck && diag.stuck_duration_ms > self.settings.long_held_warn_ms
    }

    pub fn diagnose(&self, name: &str, slot: Option<usize>) -> Result<Outcome, AdminError> {
        let recovery = self.open(name)?;
        let diagnostics = match slot {
            Some(index) => vec![recovery.diagnose_slot(index)?],
            None => recovery.diagnose_all_slots(),
        };

        let reports: Vec<_> = diagnostics
            .iter()
            .map(|diagnostic| SlotReport {
                diagnostic,
                state: diagnostic.state_name(),
                long_held: self.is_long_held(diagnostic),
            })
            .collect();

        for report in reports.iter().filter(|r| r.long_held) {
            warn!(
                slot = report.diagnostic.slot_index,
                write_lock = report.diagnostic.write_lock,
                held_ms = report.diagnostic.stuck_duration_ms,
                "live writer has held the slot unusually long"
            );
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        } else {
            println!(
                "{:>6} {:<10} {:>10} {:>8} {:>12} {:>10}  FLAGS",
                "SLOT", "STATE", "LOCK", "READERS", "GENERATION", "HELD_MS"
            );
            for report in &reports {
                let d = report.diagnostic;
                let mut flags = Vec::new();
                if d.is_stuck {
                    flags.push("STUCK");
                }
                if report.long_held {
                    flags.push("LONG_HELD");
                }
                if d.writer_waiting != 0 {
                    flags.push("WAITING");
                }
                println!(
                    "{:>6} {:<10} {:>10} {:>8} {:>12} {:>10}  {}",
                    d.slot_index,
                    report.state,
                    d.write_lock,
                    d.reader_count,
                    d.write_generation,
                    d.stuck_duration_ms,
                    flags.join(",")
                );
            }
            let stuck = reports.iter().filter(|r| r.diagnostic.is_stuck).count();
            println!("{} slots, {stuck} stuck", reports.len());
        }
        Ok(Outcome::Reported)
    }

    pub fn recover(
        &self,
        name: &str,
        slots: SlotSelection,
        action: RecoverAction,
        force: bool,
    ) -> Result<Outcome, AdminError> {
        if force && !self.settings.allow_force {
            return Err(AdminError::ForceDisallowed);
        }
        let recovery = self.open(name)?;
        info!(segment = name, ?slots, ?action, force, "recovery requested");

        let result = match (slots, action) {
            (SlotSelection::All, RecoverAction::Reset) => recovery.force_reset_all_slots(force),
            (SlotSelection::One(index), action) => apply(&recovery, index, action, force),
            (SlotSelection::All, action) => combine(
                (0..recovery.segment().capacity())
                    .map(|index| apply(&recovery, index, action, force))
                    .collect::<Vec<_>>(),
            ),
        };
        self.report(name, result)
    }

    pub fn cleanup(&self, name: &str) -> Result<Outcome, AdminError> {
        let result = self.open(name)?.cleanup_dead_consumers();
        self.report(name, result)
    }

    pub fn validate(&self, name: &str, repair: bool) -> Result<Outcome, AdminError> {
        let result = self.open(name)?.validate_integrity(repair);
        self.report(name, result)
    }

    pub fn metrics(&self, name: &str, reset: bool) -> Result<Outcome, AdminError> {
        let recovery = self.open(name)?;
        let header = recovery.segment().header();
        let snapshot = get_metrics(header);

        if self.json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else if let serde_json::Value::Object(fields) = serde_json::to_value(snapshot)? {
            for (field, value) in fields {
                println!("{field:<28} {value}");
            }
        }

        if reset {
            reset_metrics(header);
            info!(segment = name, "metrics reset");
        }
        Ok(Outcome::Reported)
    }

    fn report(&self, name: &str, result: RecoveryResult) -> Result<Outcome, AdminError> {
        if self.json {
            let report = RecoveryReport {
                segment: name,
                result: result.name(),
            };
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{name}: {}", result.name());
        }
        Ok(Outcome::Recovery(result))
    }
}

fn apply(recovery: &DataBlockRecovery, index: usize, action: RecoverAction, force: bool) -> RecoveryResult {
    match action {
        RecoverAction::Reset => recovery.force_reset_slot(index, force),
        RecoverAction::ZombieWriter => recovery.release_zombie_writer(index),
        RecoverAction::ZombieReaders => recovery.release_zombie_readers(index, force),
    }
}

/// Fold per-slot outcomes: the first failure wins, then any success.
fn combine(results: impl IntoIterator<Item = RecoveryResult>) -> RecoveryResult {
    let mut combined = RecoveryResult::NotStuck;
    for result in results {
        if combined.is_ok() && result != RecoveryResult::NotStuck {
            combined = result;
        }
    }
    combined
}
