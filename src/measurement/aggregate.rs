//! Reading aggregation.
//!
//! A reading is N raw samples reduced to one value pair:
//!
//! - scalar meters: parse each sample, then (mean, population standard deviation)
//! - vector meters: convert each (magnitude, phase) sample to a phasor and average the phasors
//!
//! A sample that never arrives (bus fault) is an error. A sample that arrives but is not a
//! number is recovered here according to [`SampleParsePolicy`] and logged.

use anyhow::Result;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hardware::capabilities::{
    PhasorSample, RawSample, ScalarMeterAdapter, VectorMeterAdapter,
};

/// What to do with a sample that does not parse as a number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleParsePolicy {
    /// Count the sample as 0.0 and keep N slots.
    #[default]
    SubstituteZero,
    /// Drop the sample and aggregate over the rest.
    Discard,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("unparsable meter sample {text:?}")]
pub struct SampleParseError {
    pub text: String,
}

/// Parse one raw sample. Non-finite values count as unparsable.
pub fn parse_sample(raw: &RawSample) -> Result<f64, SampleParseError> {
    let value = match raw {
        RawSample::Value(v) => Some(*v),
        RawSample::Text(text) => text.trim().parse::<f64>().ok(),
    };
    match value {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(SampleParseError {
            text: match raw {
                RawSample::Value(v) => v.to_string(),
                RawSample::Text(text) => text.clone(),
            },
        }),
    }
}

/// Mean and population standard deviation of one scalar reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScalarReading {
    pub mean: f64,
    pub std: f64,
}

pub fn reduce_scalar(samples: &[RawSample], policy: SampleParsePolicy) -> ScalarReading {
    let mut values = Vec::with_capacity(samples.len());
    for raw in samples {
        match parse_sample(raw) {
            Ok(v) => values.push(v),
            Err(err) => {
                tracing::warn!(error = %err, ?policy, "Recovered bad meter sample");
                if policy == SampleParsePolicy::SubstituteZero {
                    values.push(0.0);
                }
            }
        }
    }
    if values.is_empty() {
        return ScalarReading::default();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    ScalarReading {
        mean,
        std: variance.sqrt(),
    }
}

/// Magnitude and phase (degrees) of the averaged phasor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VectorReading {
    pub magnitude: f64,
    pub phase_deg: f64,
}

pub fn reduce_phasors(samples: &[PhasorSample]) -> VectorReading {
    if samples.is_empty() {
        return VectorReading::default();
    }
    let sum: Complex64 = samples
        .iter()
        .map(|s| Complex64::from_polar(s.magnitude, s.phase_deg.to_radians()))
        .sum();
    let mean = sum / samples.len() as f64;
    VectorReading {
        magnitude: mean.norm(),
        phase_deg: mean.arg().to_degrees(),
    }
}

/// Takes N samples from a scalar meter per reading.
#[derive(Debug, Clone, Copy)]
pub struct ScalarAggregator {
    pub nrdgs: usize,
    pub policy: SampleParsePolicy,
}

impl ScalarAggregator {
    pub fn new(nrdgs: usize, policy: SampleParsePolicy) -> Self {
        Self { nrdgs, policy }
    }

    pub async fn read(&self, meter: &mut dyn ScalarMeterAdapter) -> Result<ScalarReading> {
        let mut samples = Vec::with_capacity(self.nrdgs);
        for _ in 0..self.nrdgs {
            samples.push(meter.sample_one().await?);
        }
        Ok(reduce_scalar(&samples, self.policy))
    }
}

/// Takes N phasor samples from a vector meter per reading.
#[derive(Debug, Clone, Copy)]
pub struct VectorAggregator {
    pub nrdgs: usize,
}

impl VectorAggregator {
    pub fn new(nrdgs: usize) -> Self {
        Self { nrdgs }
    }

    pub async fn read(&self, meter: &mut dyn VectorMeterAdapter) -> Result<VectorReading> {
        let mut samples = Vec::with_capacity(self.nrdgs);
        for _ in 0..self.nrdgs {
            samples.push(meter.sample_one().await?);
        }
        Ok(reduce_phasors(&samples))
    }
}

/// Detector reading with the source off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZeroOffset {
    pub value: f64,
    pub std: f64,
}

impl ZeroOffset {
    pub fn from_reading(reading: ScalarReading) -> Self {
        Self {
            value: reading.mean,
            std: reading.std,
        }
    }

    /// Remove the offset in quadrature. Readings below the offset record as 0.0.
    pub fn apply(&self, reading: f64) -> f64 {
        (reading * reading - self.value * self.value).max(0.0).sqrt()
    }
}
