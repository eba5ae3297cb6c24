//! Position and frequency plans, built once at run start.

use crate::error::{AppResult, BeammapError};

/// Relative tolerance (in units of `step`) for deciding a point already sits on `stop`.
const STOP_SNAP: f64 = 1e-9;

/// Largest number of positions accepted for one axis.
pub const MAX_POINTS_PER_AXIS: usize = 1_000_000;

/// Ordered stage positions in degrees.
///
/// Generated from `{start, stop, step}`: `start, start + step, ...` with the final point
/// clamped to `stop` when the step does not divide the span evenly. Positions are strictly
/// monotonic in the sign of `step`, never repeat, and never pass `stop`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    positions: Vec<f64>,
}

impl ScanPlan {
    pub fn new(start: f64, stop: f64, step: f64) -> AppResult<Self> {
        if !start.is_finite() || !stop.is_finite() {
            return Err(BeammapError::Configuration(format!(
                "Scan bounds must be finite (start {}, stop {})",
                start, stop
            )));
        }
        if !step.is_finite() || step == 0.0 {
            return Err(BeammapError::Configuration(format!(
                "Scan step must be non-zero, got {}",
                step
            )));
        }
        let span = stop - start;
        if span != 0.0 && span.signum() != step.signum() {
            return Err(BeammapError::Configuration(format!(
                "Scan step {} never reaches stop {} from start {}",
                step, stop, start
            )));
        }

        let steps = (span / step + STOP_SNAP).floor();
        if !steps.is_finite() || steps >= MAX_POINTS_PER_AXIS as f64 {
            return Err(BeammapError::Configuration(format!(
                "Scan step {} from {} to {} exceeds {} points per axis",
                step, start, stop, MAX_POINTS_PER_AXIS
            )));
        }

        // Index-based so rounding never accumulates across a long cut.
        let whole_steps = steps as usize;
        let mut positions: Vec<f64> = (0..=whole_steps)
            .map(|i| start + i as f64 * step)
            .collect();

        let tolerance = step.abs() * STOP_SNAP;
        if let Some(last) = positions.last_mut() {
            if (*last - stop).abs() <= tolerance || (*last - stop).signum() == step.signum() {
                *last = stop;
            }
        }
        if positions.last().copied() != Some(stop) {
            positions.push(stop);
        }

        Ok(Self { positions })
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

}

/// One output row's worth of stage position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPoint {
    /// Row index in scan order.
    pub index: usize,
    pub azimuth: f64,
    pub elevation: Option<f64>,
}

/// The azimuth plan, optionally rastered over an elevation plan (elevation outer).
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGrid {
    azimuth: ScanPlan,
    elevation: Option<ScanPlan>,
}

impl ScanGrid {
    pub fn new(azimuth: ScanPlan, elevation: Option<ScanPlan>) -> Self {
        Self { azimuth, elevation }
    }

    pub fn azimuth(&self) -> &ScanPlan {
        &self.azimuth
    }

    pub fn is_raster(&self) -> bool {
        self.elevation.is_some()
    }

    pub fn len(&self) -> usize {
        self.azimuth.len() * self.elevation.as_ref().map_or(1, ScanPlan::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid points in scan order.
    pub fn points(&self) -> Vec<ScanPoint> {
        let rows: Vec<Option<f64>> = match &self.elevation {
            Some(plan) => plan.positions().iter().copied().map(Some).collect(),
            None => vec![None],
        };
        rows.into_iter()
            .flat_map(|elevation| {
                self.azimuth
                    .positions()
                    .iter()
                    .map(move |&azimuth| (azimuth, elevation))
            })
            .enumerate()
            .map(|(index, (azimuth, elevation))| ScanPoint {
                index,
                azimuth,
                elevation,
            })
            .collect()
    }
}

/// Non-empty frequency list, held in GHz and converted to Hz at the source boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyList {
    ghz: Vec<f64>,
}

impl FrequencyList {
    pub fn from_ghz(values: &[f64]) -> AppResult<Self> {
        if values.is_empty() {
            return Err(BeammapError::Configuration(
                "Frequency list is empty".to_string(),
            ));
        }
        if let Some(bad) = values.iter().find(|f| !f.is_finite() || **f <= 0.0) {
            return Err(BeammapError::Configuration(format!(
                "Frequency {} GHz is not a positive number",
                bad
            )));
        }
        Ok(Self {
            ghz: values.to_vec(),
        })
    }

    pub fn ghz(&self) -> &[f64] {
        &self.ghz
    }

    pub fn hz(&self) -> Vec<f64> {
        self.ghz.iter().map(|f| f * 1e9).collect()
    }

    pub fn len(&self) -> usize {
        self.ghz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghz.is_empty()
    }
}
