//! Core library for the beammap application.
//!
//! Drives a rotary stage, a signal source and a detector through an antenna beam-pattern
//! measurement and writes a self-describing data file. Instruments are reached only through
//! the capability traits in [`hardware::capabilities`], opened by a
//! [`hardware::DeviceProvider`]; the bundled [`hardware::SimulatedBench`] implements every role.
//!
//! The usual entry point is [`map::run_map`].

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod map;
pub mod measurement;
pub mod metadata;
pub mod scan;

pub use config::Settings;
pub use error::{AppResult, BeammapError};
pub use map::{go_home, record_zero_offsets, run_map, RunRequest, RunSummary};
