//! Beam-map runs.
//!
//! [`run_map`] is the entry point: validate, open the bench, home, optionally measure the zero
//! offset and level the source, scan the grid writing one row per point, then return home.
//! [`record_zero_offsets`] and [`go_home`] are the two standalone bench operations.

pub mod controller;
pub mod events;

pub use controller::{go_home, record_zero_offsets, run_map, MapController};
pub use events::{EventBus, ScanEvent};

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::config::MapKind;
use crate::measurement::ZeroOffset;
use crate::metadata::PowerLevelTable;

/// Run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Init,
    Opening,
    Homing,
    Offset,
    Leveling,
    Scanning,
    Returning,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Init => "init",
            RunPhase::Opening => "opening",
            RunPhase::Homing => "homing",
            RunPhase::Offset => "offset",
            RunPhase::Leveling => "leveling",
            RunPhase::Scanning => "scanning",
            RunPhase::Returning => "returning",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Where a run writes and how its header identifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub output_path: PathBuf,
    /// Written as `# Beammap Timestamp:`.
    pub timestamp: String,
    /// Written as `# Configfile:`.
    pub config_file: String,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub kind: MapKind,
    pub output_path: PathBuf,
    pub rows_written: usize,
    pub points_planned: usize,
    pub frequencies_ghz: Vec<f64>,
    pub offset: Option<ZeroOffset>,
    pub power_table: Option<PowerLevelTable>,
}
