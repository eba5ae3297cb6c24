//! Beam-map output file.
//!
//! A `#`-prefixed header followed by delimited data rows written with the `csv` crate. Rows are
//! flushed one at a time so a run that dies mid-scan leaves every completed row on disk.

use crate::config::Delimiter;
use crate::error::AppResult;
use csv::{QuoteStyle, WriterBuilder};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One grid point's worth of output.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    /// Leading columns, formatted `%.3f` (azimuth, elevation or frequency).
    pub keys: Vec<f64>,
    /// Measured values, formatted `%.6g`.
    pub values: Vec<f64>,
}

impl DataRow {
    pub fn new(keys: Vec<f64>) -> Self {
        Self {
            keys,
            values: Vec::new(),
        }
    }

    pub fn push_pair(&mut self, first: f64, second: f64) {
        self.values.push(first);
        self.values.push(second);
    }

    fn fields(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| format!("{:.3}", k))
            .chain(self.values.iter().map(|v| format_g(*v, 6)))
            .collect()
    }
}

pub struct OutputWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl OutputWriter {
    /// Create the file and write the header. Parent directories are created as needed.
    pub fn create<P: AsRef<Path>>(
        path: P,
        header: &[String],
        delimiter: Delimiter,
    ) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(&path)?;
        for line in header.iter().flat_map(|entry| header_physical_lines(entry)) {
            file.write_all(b"# ")
                .and_then(|_| file.write_all(line.as_bytes()))
                .and_then(|_| file.write_all(b"\n"))?;
        }
        file.flush()?;

        let writer = WriterBuilder::new()
            .delimiter(delimiter.as_byte())
            .has_headers(false)
            .flexible(true)
            .quote_style(QuoteStyle::Never)
            .from_writer(file);

        tracing::info!(path = %path.display(), "Output file created");
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn write_row(&mut self, row: &DataRow) -> AppResult<()> {
        self.writer.write_record(row.fields())?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }

    /// Flush and close, returning the path written.
    pub fn finish(mut self) -> AppResult<PathBuf> {
        self.writer.flush()?;
        tracing::info!(path = %self.path.display(), rows = self.rows, "Output file closed");
        Ok(self.path)
    }
}

/// Split a header entry on embedded line breaks so every physical line gets its own `#`.
fn header_physical_lines(entry: &str) -> Vec<&str> {
    let lines: Vec<&str> = entry
        .split(|c| c == '\n' || c == '\r')
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        vec![""]
    } else {
        lines
    }
}

/// C-style `%.<precision>g` formatting.
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= precision as i32 {
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            if exponent < 0 { '-' } else { '+' },
            exponent.abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}
