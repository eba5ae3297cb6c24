//! Scan geometry: stage position plans and the frequency list.

pub mod plan;

pub use plan::{FrequencyList, ScanGrid, ScanPlan, ScanPoint};
