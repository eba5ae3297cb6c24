//! Run metadata and the self-describing output header.
//!
//! A `RunMetadata` captures everything needed to interpret a data file later: when and with
//! which configuration it was taken, which instruments were enabled, the scan parameters, the
//! meter settings, the zero offset, and the leveled power table. It is assembled with
//! [`RunMetadataBuilder`] at the start of the `Scanning` phase and rendered as `#` header lines.

use serde::Serialize;

use crate::config::{
    AzimuthConfig, Delimiter, DevicesConfig, ElevationConfig, FlukeConfig, MapKind, MultiConfig,
    Settings,
};
use crate::data::format_g;
use crate::measurement::ZeroOffset;

/// Leveled power per frequency, in frequency-list order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerLevelTable {
    entries: Vec<PowerLevelEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerLevelEntry {
    pub frequency_ghz: f64,
    pub power_dbm: f64,
}

impl PowerLevelTable {
    pub fn push(&mut self, frequency_ghz: f64, power_dbm: f64) {
        self.entries.push(PowerLevelEntry {
            frequency_ghz,
            power_dbm,
        });
    }

    pub fn entries(&self) -> &[PowerLevelEntry] {
        &self.entries
    }

    /// Power for the `index`th frequency.
    pub fn power_at(&self, index: usize) -> Option<f64> {
        self.entries.get(index).map(|e| e.power_dbm)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything written into a data file header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub timestamp: String,
    pub config_file: String,
    pub comment: String,
    pub kind: MapKind,
    pub devices: DevicesConfig,
    pub azimuth: AzimuthConfig,
    pub elevation: Option<ElevationConfig>,
    pub multi: MultiConfig,
    pub fluke: FlukeConfig,
    pub vector_meas: String,
    pub vector_average: usize,
    pub vna_meas: String,
    pub digital_channels: u8,
    pub synth_mult: f64,
    pub frequencies_ghz: Vec<f64>,
    pub offset: Option<ZeroOffset>,
    pub power_table: Option<PowerLevelTable>,
    pub software_version: String,
}

impl RunMetadata {
    /// Column names of a map data row.
    pub fn map_columns(&self) -> Vec<String> {
        let mut columns = vec!["Az".to_string()];
        if self.elevation.is_some() {
            columns.push("El".to_string());
        }
        for f in &self.frequencies_ghz {
            match self.kind {
                MapKind::Scalar => {
                    columns.push(format!("f{:.1}GHz", f));
                    columns.push(format!("f{:.1}GHz std", f));
                }
                MapKind::Vector => {
                    columns.push(format!("f{:.1}GHz ratio", f));
                    columns.push(format!("f{:.1}GHz phase", f));
                }
                MapKind::Digital => {
                    for ch in 0..self.digital_channels {
                        columns.push(format!("f{:.1}GHz ch{} ratio", f, ch));
                        columns.push(format!("f{:.1}GHz ch{} phase", f, ch));
                    }
                }
                MapKind::Phase => {
                    columns.push(format!("f{:.1}GHz re", f));
                    columns.push(format!("f{:.1}GHz im", f));
                }
            }
        }
        columns
    }

    /// Column names of a zero-offset record.
    pub fn zero_offset_columns(&self) -> Vec<String> {
        ["Freq (GHz)", "ratio", "phase"]
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    /// Header lines without the leading `# `.
    pub fn header_lines(&self, columns: &[String], delimiter: Delimiter) -> Vec<String> {
        let d = &self.devices;
        let mut lines = vec![
            format!("Beammap Timestamp: {}", self.timestamp),
            format!("Configfile: {}", self.config_file),
            format!("Comment: {}", self.comment),
            format!(
                "Map kind: {}; beammap version: {}",
                self.kind, self.software_version
            ),
            format!(
                "use_unidex: {}; use_synth: {}; use_multi: {}; use_fluke: {}; use_vv: {}; \
                 use_vna: {}; use_labjack: {}",
                d.use_unidex,
                d.use_synth,
                d.use_multi,
                d.use_fluke,
                d.use_vv,
                d.use_vna,
                d.use_labjack
            ),
            format!(
                "Map Azimuth Params: xmin: {:.2} deg; xmax: {:.2} deg; xinc: {:.2} deg",
                self.azimuth.xmin, self.azimuth.xmax, self.azimuth.xinc
            ),
            format!(
                "Map Velocity: {:.2} deg/s; Slew speed: {:.2} deg/s",
                self.azimuth.xmap_vel, self.azimuth.xslew_vel
            ),
        ];

        if let Some(el) = &self.elevation {
            lines.push(format!(
                "Map Elevation Params: ymin: {:.2} deg; ymax: {:.2} deg; yinc: {:.2} deg",
                el.ymin, el.ymax, el.yinc
            ));
            lines.push(format!(
                "Elevation Velocity: {:.2} deg/s; Slew speed: {:.2} deg/s",
                el.ymap_vel, el.yslew_vel
            ));
        }

        match self.kind {
            MapKind::Scalar => {
                if d.use_multi {
                    lines.push(format!(
                        "Multimeter settings: NPLC: {}; nrdgs: {}; range: {}; res: {}",
                        self.multi.nplc,
                        self.multi.nrdgs,
                        self.multi.range,
                        format_g(self.multi.resolution, 5)
                    ));
                }
                if d.use_fluke {
                    lines.push(format!(
                        "Fluke device: {}; nrdgs: {}",
                        self.fluke.device, self.fluke.nrdgs
                    ));
                }
                let (value, std) = self.offset.map_or((0.0, 0.0), |o| (o.value, o.std));
                lines.push(format!(
                    "Voltage offset: {} +/- {}",
                    format_g(value, 5),
                    format_g(std, 5)
                ));
            }
            MapKind::Vector | MapKind::Digital => {
                lines.push(format!(
                    "Vector voltmeter: meas: {}; average: {}",
                    self.vector_meas, self.vector_average
                ));
                if self.kind == MapKind::Digital {
                    lines.push(format!("Digital channels: {}", self.digital_channels));
                }
            }
            MapKind::Phase => {
                lines.push(format!("Network analyzer measure: {}", self.vna_meas));
            }
        }

        if self.kind != MapKind::Phase {
            lines.push(format!("Synthesizer Multiplier: {:.1}", self.synth_mult));
        }
        lines.push(format!("Frequencies (GHz): {:?}", self.frequencies_ghz));

        if let Some(table) = &self.power_table {
            let entries: Vec<String> = table
                .entries()
                .iter()
                .map(|e| format!("f:{} GHz P:{} dBm", e.frequency_ghz, e.power_dbm))
                .collect();
            lines.push(format!(
                "Adjusted boresight power levels: {}",
                entries.join(" ")
            ));
        }

        lines.push("Data columns:".to_string());
        lines.push(columns.join(&delimiter.as_char().to_string()));
        lines
    }
}

/// Builder for [`RunMetadata`], seeded from the run's settings.
pub struct RunMetadataBuilder {
    inner: RunMetadata,
}

impl RunMetadataBuilder {
    pub fn new(settings: &Settings) -> Self {
        let frequencies_ghz = match settings.general.kind {
            MapKind::Phase => settings.vna.freq.clone(),
            _ => settings.synth.freq.clone(),
        };
        Self {
            inner: RunMetadata {
                timestamp: String::new(),
                config_file: String::new(),
                comment: settings.general.comment.clone(),
                kind: settings.general.kind,
                devices: settings.devices.clone(),
                azimuth: settings.azimuth.clone(),
                elevation: settings
                    .elevation
                    .enabled
                    .then(|| settings.elevation.clone()),
                multi: settings.multi.clone(),
                fluke: settings.fluke.clone(),
                vector_meas: settings.vector_voltmeter.meas.clone(),
                vector_average: settings.vector_voltmeter.avg_value,
                vna_meas: settings.vna.meas.clone(),
                digital_channels: settings.labjack.channels,
                synth_mult: settings.synth.mult,
                frequencies_ghz,
                offset: None,
                power_table: None,
                software_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn timestamp(mut self, timestamp: &str) -> Self {
        self.inner.timestamp = timestamp.to_string();
        self
    }

    pub fn config_file(mut self, config_file: &str) -> Self {
        self.inner.config_file = config_file.to_string();
        self
    }

    pub fn offset(mut self, offset: Option<ZeroOffset>) -> Self {
        self.inner.offset = offset;
        self
    }

    pub fn power_table(mut self, table: Option<PowerLevelTable>) -> Self {
        self.inner.power_table = table;
        self
    }

    pub fn build(self) -> RunMetadata {
        self.inner
    }
}
