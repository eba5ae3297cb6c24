//! Simulated bench.
//!
//! One [`SimulatedBench`] stands in for the whole test range: a rotary stage, a synthesizer,
//! the detector meters, a vector voltmeter, a network analyzer and the multiplexer lines all
//! share a single [`BenchState`], so the detector sees whatever the stage and source were last
//! told to do. Motion is instantaneous; callers do their own settle waits.
//!
//! The bench also keeps a journal of accepted commands and can inject faults:
//!
//! - fail the Nth `move_to`
//! - fail the Nth meter sample
//! - refuse to open a device
//! - replay scripted raw samples ahead of the response model

use anyhow::{bail, Result};
use async_trait::async_trait;
use num_complex::Complex64;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{Settings, SimulatorConfig};
use crate::hardware::capabilities::{
    Axis, DigitalLevel, DigitalOutputAdapter, MeterOptions, MotionAdapter,
    NetworkAnalyzerAdapter, PhasorSample, RawSample, ScalarMeterAdapter, SourceAdapter,
    VectorMeterAdapter,
};
use crate::hardware::provider::DeviceProvider;
use crate::hardware::Device;

/// Physical state seen by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchState {
    pub azimuth: f64,
    pub elevation: f64,
    pub frequency_hz: f64,
    pub power_dbm: f64,
    pub output_on: bool,
    /// Multiplexer channel currently pulled low.
    pub channel: Option<u8>,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            azimuth: 0.0,
            elevation: 0.0,
            frequency_hz: 0.0,
            power_dbm: 0.0,
            output_on: true,
            channel: None,
        }
    }
}

/// A command the bench accepted, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchCommand {
    Reset,
    Home(Axis),
    Move {
        axis: Axis,
        target_deg: f64,
        velocity_deg_s: f64,
    },
    Multiplier(f64),
    Frequency(f64),
    Power(f64),
    OutputOn,
    OutputOff,
    ConfigureMeter(Device),
    ConfigureSweep(Vec<f64>),
    Channel(u8, DigitalLevel),
}

#[derive(Debug, Clone, Default)]
struct Faults {
    fail_move: Option<usize>,
    fail_sample: Option<usize>,
    unavailable: Vec<Device>,
    scripted: Vec<RawSample>,
}

#[derive(Default)]
struct Shared {
    state: BenchState,
    journal: Vec<BenchCommand>,
    moves: usize,
    samples: usize,
}

type ResponseFn = dyn Fn(&BenchState) -> PhasorSample + Send + Sync;

/// Simulated test range. Clones share state, so a test can keep one handle for inspection
/// while the run owns the adapters.
#[derive(Clone)]
pub struct SimulatedBench {
    shared: Arc<RwLock<Shared>>,
    response: Arc<ResponseFn>,
    faults: Faults,
    noise: f64,
    channels: u8,
}

impl SimulatedBench {
    /// Bench with the default Gaussian beam model.
    pub fn new() -> Self {
        Self::from_config(&SimulatorConfig::default())
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        let model = config.clone();
        Self {
            shared: Arc::new(RwLock::new(Shared::default())),
            response: Arc::new(move |state: &BenchState| gaussian_beam(&model, state)),
            faults: Faults::default(),
            noise: config.noise.abs(),
            channels: 8,
        }
    }

    /// Replace the detector model with a magnitude-only response (phase 0).
    pub fn with_response<F>(mut self, response: F) -> Self
    where
        F: Fn(&BenchState) -> f64 + Send + Sync + 'static,
    {
        self.response = Arc::new(move |state: &BenchState| PhasorSample {
            magnitude: response(state),
            phase_deg: 0.0,
        });
        self
    }

    pub fn with_phasor_response<F>(mut self, response: F) -> Self
    where
        F: Fn(&BenchState) -> PhasorSample + Send + Sync + 'static,
    {
        self.response = Arc::new(response);
        self
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    /// Fail the `n`th `move_to` (1-based) with a communication error.
    pub fn fail_move_on(mut self, n: usize) -> Self {
        self.faults.fail_move = Some(n);
        self
    }

    /// Fail the `n`th meter sample (1-based, counted across all meters).
    pub fn fail_sample_on(mut self, n: usize) -> Self {
        self.faults.fail_sample = Some(n);
        self
    }

    pub fn unavailable(mut self, device: Device) -> Self {
        self.faults.unavailable.push(device);
        self
    }

    /// Return these raw samples, in order, before falling back to the response model.
    pub fn script_samples<I, S>(mut self, samples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RawSample>,
    {
        self.faults.scripted = samples.into_iter().map(Into::into).collect();
        self
    }

    pub async fn state(&self) -> BenchState {
        self.shared.read().await.state.clone()
    }

    pub async fn journal(&self) -> Vec<BenchCommand> {
        self.shared.read().await.journal.clone()
    }

    pub async fn move_count(&self) -> usize {
        self.shared.read().await.moves
    }

    pub async fn sample_count(&self) -> usize {
        self.shared.read().await.samples
    }

    async fn record(&self, command: BenchCommand) {
        self.shared.write().await.journal.push(command);
    }

    fn check_open(&self, device: Device) -> Result<()> {
        if self.faults.unavailable.contains(&device) {
            bail!("no response from {} at open", device);
        }
        Ok(())
    }

    /// Count a sample, apply any injected fault, and return a scripted sample if one is queued.
    async fn next_sample(&self) -> Result<Option<RawSample>> {
        let mut shared = self.shared.write().await;
        shared.samples += 1;
        let n = shared.samples;
        if self.faults.fail_sample == Some(n) {
            bail!("simulated read timeout on sample {}", n);
        }
        Ok(self.faults.scripted.get(n - 1).cloned())
    }

    async fn measure(&self, state: Option<BenchState>) -> PhasorSample {
        let state = match state {
            Some(state) => state,
            None => self.state().await,
        };
        let mut sample = (self.response)(&state);
        if self.noise > 0.0 {
            sample.magnitude += rand::thread_rng().gen_range(-self.noise..=self.noise);
        }
        sample
    }
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new()
    }
}

/// Gaussian main lobe scaled by source power, with a linear phase ramp across the aperture.
fn gaussian_beam(model: &SimulatorConfig, state: &BenchState) -> PhasorSample {
    if !state.output_on {
        return PhasorSample {
            magnitude: model.floor_voltage,
            phase_deg: 0.0,
        };
    }
    let gain = 10f64.powf((state.power_dbm - model.reference_power_dbm) / 20.0);
    let r2 = state.azimuth.powi(2) + state.elevation.powi(2);
    let sigma = model.beam_sigma_deg.max(f64::EPSILON);
    let beam = (-r2 / (2.0 * sigma * sigma)).exp();
    let channel = state.channel.map_or(1.0, |ch| 1.0 / (1.0 + 0.25 * f64::from(ch)));
    let phase = (4.0 * state.azimuth + 2.0 * state.elevation + 180.0).rem_euclid(360.0) - 180.0;
    PhasorSample {
        magnitude: model.floor_voltage + model.peak_voltage * gain * beam * channel,
        phase_deg: phase,
    }
}

#[async_trait]
impl DeviceProvider for SimulatedBench {
    async fn open_motion(&mut self, _settings: &Settings) -> Result<Box<dyn MotionAdapter>> {
        self.check_open(Device::Stage)?;
        Ok(Box::new(MockStage::new(self.clone())))
    }

    async fn open_source(&mut self, _settings: &Settings) -> Result<Box<dyn SourceAdapter>> {
        self.check_open(Device::Synthesizer)?;
        Ok(Box::new(MockSource {
            bench: self.clone(),
        }))
    }

    async fn open_scalar_meter(
        &mut self,
        device: Device,
        _settings: &Settings,
    ) -> Result<Box<dyn ScalarMeterAdapter>> {
        self.check_open(device)?;
        Ok(Box::new(MockScalarMeter {
            bench: self.clone(),
            device,
            options: None,
        }))
    }

    async fn open_vector_meter(
        &mut self,
        _settings: &Settings,
    ) -> Result<Box<dyn VectorMeterAdapter>> {
        self.check_open(Device::VectorVoltmeter)?;
        Ok(Box::new(MockVectorMeter {
            bench: self.clone(),
        }))
    }

    async fn open_network_analyzer(
        &mut self,
        _settings: &Settings,
    ) -> Result<Box<dyn NetworkAnalyzerAdapter>> {
        self.check_open(Device::NetworkAnalyzer)?;
        Ok(Box::new(MockNetworkAnalyzer {
            bench: self.clone(),
            frequencies_hz: Vec::new(),
        }))
    }

    async fn open_digital_output(
        &mut self,
        _settings: &Settings,
    ) -> Result<Box<dyn DigitalOutputAdapter>> {
        self.check_open(Device::DigitalOutput)?;
        Ok(Box::new(MockDigitalOutput {
            bench: self.clone(),
        }))
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Two-axis stage tracking its own commanded positions.
pub struct MockStage {
    bench: SimulatedBench,
    azimuth: f64,
    elevation: f64,
}

impl MockStage {
    pub fn new(bench: SimulatedBench) -> Self {
        Self {
            bench,
            azimuth: 0.0,
            elevation: 0.0,
        }
    }

    fn set_axis(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::Azimuth => self.azimuth = value,
            Axis::Elevation => self.elevation = value,
        }
    }
}

#[async_trait]
impl MotionAdapter for MockStage {
    async fn reset(&mut self) -> Result<()> {
        self.bench.record(BenchCommand::Reset).await;
        Ok(())
    }

    async fn home(&mut self, axis: Axis) -> Result<()> {
        self.set_axis(axis, 0.0);
        let mut shared = self.bench.shared.write().await;
        match axis {
            Axis::Azimuth => shared.state.azimuth = 0.0,
            Axis::Elevation => shared.state.elevation = 0.0,
        }
        shared.journal.push(BenchCommand::Home(axis));
        Ok(())
    }

    async fn move_to(&mut self, axis: Axis, target_deg: f64, velocity_deg_s: f64) -> Result<()> {
        let mut shared = self.bench.shared.write().await;
        shared.moves += 1;
        let n = shared.moves;
        if self.bench.faults.fail_move == Some(n) {
            bail!("simulated bus timeout on move {} ({} to {:.3})", n, axis, target_deg);
        }
        match axis {
            Axis::Azimuth => shared.state.azimuth = target_deg,
            Axis::Elevation => shared.state.elevation = target_deg,
        }
        shared.journal.push(BenchCommand::Move {
            axis,
            target_deg,
            velocity_deg_s,
        });
        drop(shared);
        self.set_axis(axis, target_deg);
        Ok(())
    }

    fn position(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Azimuth => self.azimuth,
            Axis::Elevation => self.elevation,
        }
    }
}

// =============================================================================
// Source
// =============================================================================

pub struct MockSource {
    bench: SimulatedBench,
}

#[async_trait]
impl SourceAdapter for MockSource {
    async fn set_multiplier(&mut self, mult: f64) -> Result<()> {
        if mult <= 0.0 {
            bail!("invalid multiplier {}", mult);
        }
        self.bench.record(BenchCommand::Multiplier(mult)).await;
        Ok(())
    }

    async fn set_frequency(&mut self, hz: f64) -> Result<()> {
        let mut shared = self.bench.shared.write().await;
        shared.state.frequency_hz = hz;
        shared.journal.push(BenchCommand::Frequency(hz));
        Ok(())
    }

    async fn set_power_level(&mut self, dbm: f64) -> Result<()> {
        let mut shared = self.bench.shared.write().await;
        shared.state.power_dbm = dbm;
        shared.journal.push(BenchCommand::Power(dbm));
        Ok(())
    }

    async fn power_level(&mut self) -> Result<f64> {
        Ok(self.bench.shared.read().await.state.power_dbm)
    }

    async fn output_on(&mut self) -> Result<()> {
        let mut shared = self.bench.shared.write().await;
        shared.state.output_on = true;
        shared.journal.push(BenchCommand::OutputOn);
        Ok(())
    }

    async fn output_off(&mut self) -> Result<()> {
        let mut shared = self.bench.shared.write().await;
        shared.state.output_on = false;
        shared.journal.push(BenchCommand::OutputOff);
        Ok(())
    }
}

// =============================================================================
// Meters
// =============================================================================

/// Multimeter or Fluke. The multimeter answers in bus text, the Fluke with parsed values.
pub struct MockScalarMeter {
    bench: SimulatedBench,
    device: Device,
    options: Option<MeterOptions>,
}

#[async_trait]
impl ScalarMeterAdapter for MockScalarMeter {
    async fn configure(&mut self, options: &MeterOptions) -> Result<()> {
        self.options = Some(options.clone());
        self.bench
            .record(BenchCommand::ConfigureMeter(self.device))
            .await;
        Ok(())
    }

    async fn sample_one(&mut self) -> Result<RawSample> {
        if let Some(scripted) = self.bench.next_sample().await? {
            return Ok(scripted);
        }
        let volts = self.bench.measure(None).await.magnitude;
        Ok(match self.device {
            Device::Fluke => RawSample::Value(volts),
            _ => RawSample::Text(format!("{:E}", volts)),
        })
    }
}

pub struct MockVectorMeter {
    bench: SimulatedBench,
}

#[async_trait]
impl VectorMeterAdapter for MockVectorMeter {
    async fn sample_one(&mut self) -> Result<PhasorSample> {
        self.bench.next_sample().await?;
        Ok(self.bench.measure(None).await)
    }
}

/// Self-sourcing analyzer: each sweep point sees the stage where it is, at that point's frequency.
pub struct MockNetworkAnalyzer {
    bench: SimulatedBench,
    frequencies_hz: Vec<f64>,
}

#[async_trait]
impl NetworkAnalyzerAdapter for MockNetworkAnalyzer {
    async fn configure_sweep(&mut self, frequencies_hz: &[f64], parameter: &str) -> Result<()> {
        if frequencies_hz.is_empty() {
            bail!("empty {} sweep", parameter);
        }
        self.frequencies_hz = frequencies_hz.to_vec();
        self.bench
            .record(BenchCommand::ConfigureSweep(frequencies_hz.to_vec()))
            .await;
        Ok(())
    }

    async fn sweep(&mut self) -> Result<Vec<Complex64>> {
        self.bench.next_sample().await?;
        let base = self.bench.state().await;
        let mut points = Vec::with_capacity(self.frequencies_hz.len());
        for &hz in &self.frequencies_hz {
            let state = BenchState {
                frequency_hz: hz,
                output_on: true,
                ..base.clone()
            };
            let sample = self.bench.measure(Some(state)).await;
            points.push(Complex64::from_polar(
                sample.magnitude,
                sample.phase_deg.to_radians(),
            ));
        }
        Ok(points)
    }
}

// =============================================================================
// Digital output
// =============================================================================

pub struct MockDigitalOutput {
    bench: SimulatedBench,
}

#[async_trait]
impl DigitalOutputAdapter for MockDigitalOutput {
    fn channel_count(&self) -> u8 {
        self.bench.channels
    }

    async fn set_channel(&mut self, index: u8, level: DigitalLevel) -> Result<()> {
        if index >= self.bench.channels {
            bail!(
                "channel {} out of range (0..{})",
                index,
                self.bench.channels
            );
        }
        let mut shared = self.bench.shared.write().await;
        match level {
            DigitalLevel::Low => shared.state.channel = Some(index),
            DigitalLevel::High => {
                if shared.state.channel == Some(index) {
                    shared.state.channel = None;
                }
            }
        }
        shared.journal.push(BenchCommand::Channel(index, level));
        Ok(())
    }
}
