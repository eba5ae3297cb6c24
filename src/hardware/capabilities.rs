//! Capability traits, one per instrument role.
//!
//! The map controller only ever talks to these traits. Each physical instrument implements the
//! role(s) it can fill on its own; there is no shared bus-session base. Bus addressing (GPIB
//! primary address, Prologix `++addr`, serial port) stays inside the implementation and is
//! re-asserted per transaction where the bus is shared.
//!
//! All methods take `&mut self`: a run owns its adapters exclusively for its whole lifetime.

use anyhow::Result;
use async_trait::async_trait;
use num_complex::Complex64;
use std::fmt;

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Azimuth,
    Elevation,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Azimuth => f.write_str("azimuth"),
            Axis::Elevation => f.write_str("elevation"),
        }
    }
}

/// Rotary positioning stage.
///
/// `move_to` is fire-and-forget: it returns once the command is accepted, not when motion
/// ends. Callers infer completion from distance and velocity.
#[async_trait]
pub trait MotionAdapter: Send {
    async fn reset(&mut self) -> Result<()>;
    async fn home(&mut self, axis: Axis) -> Result<()>;
    async fn move_to(&mut self, axis: Axis, target_deg: f64, velocity_deg_s: f64) -> Result<()>;
    /// Last commanded position, tracked by the adapter.
    fn position(&self, axis: Axis) -> f64;
}

/// CW signal source.
#[async_trait]
pub trait SourceAdapter: Send {
    /// Program the frequency multiplier between the synthesizer and the output.
    async fn set_multiplier(&mut self, mult: f64) -> Result<()>;
    async fn set_frequency(&mut self, hz: f64) -> Result<()>;
    async fn set_power_level(&mut self, dbm: f64) -> Result<()>;
    async fn power_level(&mut self) -> Result<f64>;
    async fn output_on(&mut self) -> Result<()>;
    async fn output_off(&mut self) -> Result<()>;
}

/// Scalar meter setup applied once when the meter is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterOptions {
    pub nplc: f64,
    pub range: f64,
    pub nrdgs: usize,
    pub resolution: f64,
}

/// One raw reading as the meter returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSample {
    /// Text straight off the bus, not yet parsed.
    Text(String),
    /// Already numeric.
    Value(f64),
}

impl From<f64> for RawSample {
    fn from(value: f64) -> Self {
        RawSample::Value(value)
    }
}

impl From<String> for RawSample {
    fn from(text: String) -> Self {
        RawSample::Text(text)
    }
}

impl From<&str> for RawSample {
    fn from(text: &str) -> Self {
        RawSample::Text(text.to_string())
    }
}

/// Multimeter-style detector readout.
#[async_trait]
pub trait ScalarMeterAdapter: Send {
    async fn configure(&mut self, options: &MeterOptions) -> Result<()>;
    /// Trigger and read one sample.
    async fn sample_one(&mut self) -> Result<RawSample>;
}

/// One vector voltmeter transmission sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasorSample {
    pub magnitude: f64,
    pub phase_deg: f64,
}

/// Vector voltmeter (ratio and phase).
#[async_trait]
pub trait VectorMeterAdapter: Send {
    async fn sample_one(&mut self) -> Result<PhasorSample>;
}

/// Self-sourcing swept analyzer returning one complex value per frequency.
#[async_trait]
pub trait NetworkAnalyzerAdapter: Send {
    async fn configure_sweep(&mut self, frequencies_hz: &[f64], parameter: &str) -> Result<()>;
    async fn sweep(&mut self) -> Result<Vec<Complex64>>;
}

/// Digital output line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalLevel {
    Low,
    High,
}

/// Multiplexer control lines.
#[async_trait]
pub trait DigitalOutputAdapter: Send {
    fn channel_count(&self) -> u8;
    async fn set_channel(&mut self, index: u8, level: DigitalLevel) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_display_names() {
        assert_eq!(Axis::Azimuth.to_string(), "azimuth");
        assert_eq!(Axis::Elevation.to_string(), "elevation");
    }

    #[test]
    fn raw_sample_conversions() {
        assert_eq!(RawSample::from(1.5), RawSample::Value(1.5));
        assert_eq!(RawSample::from("+1.2E0"), RawSample::Text("+1.2E0".into()));
    }
}
