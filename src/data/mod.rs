//! Output data files.

pub mod storage;

pub use storage::{format_g, DataRow, OutputWriter};
