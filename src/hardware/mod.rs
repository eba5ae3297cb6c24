//! Bench hardware: capability traits, the provider seam that opens them, and a simulated bench.

pub mod capabilities;
pub mod mock;
pub mod provider;

pub use capabilities::{
    Axis, DigitalLevel, DigitalOutputAdapter, MeterOptions, MotionAdapter,
    NetworkAnalyzerAdapter, PhasorSample, RawSample, ScalarMeterAdapter, SourceAdapter,
    VectorMeterAdapter,
};
pub use mock::SimulatedBench;
pub use provider::{DeviceProvider, DeviceSet};

use serde::Serialize;
use std::fmt;

/// Instrument roles a run can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Stage,
    Synthesizer,
    Multimeter,
    Fluke,
    VectorVoltmeter,
    NetworkAnalyzer,
    DigitalOutput,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Device::Stage => "Unidex 11 motion stage",
            Device::Synthesizer => "HP83620A synthesizer",
            Device::Multimeter => "HP3478A multimeter",
            Device::Fluke => "Fluke 287 multimeter",
            Device::VectorVoltmeter => "HP8508A vector voltmeter",
            Device::NetworkAnalyzer => "HP8510C network analyzer",
            Device::DigitalOutput => "LabJack T7 digital output",
        };
        f.write_str(name)
    }
}
