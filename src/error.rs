//! Custom error types for beam-pattern runs.
//!
//! This module defines the primary error type, `BeammapError`. Using the `thiserror` crate,
//! it gives every failure a run can hit a single typed home:
//!
//! - **`ConfigLoad`**: Wraps errors from `figment` while reading the TOML file or the
//!   `BEAMMAP_` environment overrides.
//! - **`Configuration`**: Semantic problems with a parsed configuration (scan bounds, an empty
//!   frequency list, a map kind whose devices are not enabled). Always raised before any
//!   device I/O.
//! - **`DeviceUnavailable`**: An adapter could not be opened or initialized. Fatal, and raised
//!   before scanning starts.
//! - **`Measurement`**: A device command or sample failed once the run was underway. Rows
//!   already written to the output file stay valid.
//! - **`Io`** / **`Output`**: Failures writing the data file.
//!
//! Unparsable meter samples never show up here: the reading aggregator recovers them locally
//! (see [`crate::measurement::aggregate::SampleParseError`]).

use crate::hardware::Device;
use crate::map::RunPhase;
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, BeammapError>;

#[derive(Error, Debug)]
pub enum BeammapError {
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Device '{device}' unavailable: {reason}")]
    DeviceUnavailable { device: Device, reason: String },

    #[error("Measurement failed {site}: {reason}")]
    Measurement { site: MeasurementSite, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output file error: {0}")]
    Output(#[from] csv::Error),
}

impl From<figment::Error> for BeammapError {
    fn from(err: figment::Error) -> Self {
        BeammapError::ConfigLoad(Box::new(err))
    }
}

impl BeammapError {
    pub(crate) fn device(device: Device, err: &anyhow::Error) -> Self {
        BeammapError::DeviceUnavailable {
            device,
            reason: format!("{:#}", err),
        }
    }

    pub(crate) fn measurement(site: MeasurementSite, err: &anyhow::Error) -> Self {
        BeammapError::Measurement {
            site,
            reason: format!("{:#}", err),
        }
    }

    /// Returns the fault location for `Measurement` errors.
    pub fn site(&self) -> Option<&MeasurementSite> {
        match self {
            BeammapError::Measurement { site, .. } => Some(site),
            _ => None,
        }
    }
}

/// Where in the run a measurement error happened.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSite {
    /// Phase the controller was in.
    pub phase: RunPhase,
    /// Index into the scan grid, when the fault happened while scanning.
    pub point_index: Option<usize>,
    /// Azimuth of that grid point in degrees.
    pub azimuth: Option<f64>,
    /// Elevation of that grid point in degrees, for raster grids.
    pub elevation: Option<f64>,
    /// Frequency being measured, in GHz.
    pub frequency_ghz: Option<f64>,
}

impl MeasurementSite {
    pub(crate) fn phase(phase: RunPhase) -> Self {
        Self {
            phase,
            point_index: None,
            azimuth: None,
            elevation: None,
            frequency_ghz: None,
        }
    }

    pub(crate) fn with_frequency(mut self, frequency_ghz: f64) -> Self {
        self.frequency_ghz = Some(frequency_ghz);
        self
    }
}

impl fmt::Display for MeasurementSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "during {}", self.phase)?;
        if let Some(index) = self.point_index {
            write!(f, " at position index {}", index)?;
        }
        if let Some(az) = self.azimuth {
            write!(f, " (az {:.3} deg", az)?;
            if let Some(el) = self.elevation {
                write!(f, ", el {:.3} deg", el)?;
            }
            write!(f, ")")?;
        }
        if let Some(freq) = self.frequency_ghz {
            write!(f, " at {} GHz", freq)?;
        }
        Ok(())
    }
}
