//! Configuration system using Figment
//!
//! Every run is described by one strongly-typed [`Settings`] value, one struct per section.
//! Settings are loaded from:
//! 1. built-in defaults (the values the bench has historically used)
//! 2. a TOML file
//! 3. environment variables prefixed with `BEAMMAP_` (nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! BEAMMAP_GENERAL__COMMENT="Horn B, 74 GHz cut"
//! BEAMMAP_AZIMUTH__XINC=0.5
//! BEAMMAP_LEVELING__ENABLED=true
//! ```
//!
//! # Example
//!
//! ```toml
//! [general]
//! comment = "BeamMap at 74 GHz"
//! kind = "scalar"
//!
//! [azimuth]
//! xmin = -10.0
//! xmax = 10.0
//! xinc = 0.5
//!
//! [synth]
//! freq = [74.0, 75.0]
//!
//! [timing]
//! home_settle = "10s"
//! ```

use crate::error::{AppResult, BeammapError};
use crate::measurement::aggregate::SampleParsePolicy;
use crate::scan::{FrequencyList, ScanGrid, ScanPlan};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Mechanical travel limit of the rotary stage, in degrees either side of home.
pub const STAGE_LIMIT_DEG: f64 = 180.0;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "BEAMMAP_";

/// Top-level run configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralConfig,
    pub devices: DevicesConfig,
    pub azimuth: AzimuthConfig,
    pub elevation: ElevationConfig,
    pub synth: SynthConfig,
    pub multi: MultiConfig,
    pub fluke: FlukeConfig,
    pub vector_voltmeter: VectorVoltmeterConfig,
    pub vna: VnaConfig,
    pub labjack: DigitalOutputConfig,
    pub offset: OffsetConfig,
    pub leveling: LevelingConfig,
    pub output: OutputConfig,
    pub timing: TimingConfig,
    pub simulator: SimulatorConfig,
}

/// Which map controller variant a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    /// Synthesizer + multimeter or Fluke, (mean, std) per frequency.
    #[default]
    Scalar,
    /// Synthesizer + vector voltmeter, (ratio, phase) per frequency.
    Vector,
    /// Vector map walked over every digital-output channel at each frequency.
    Digital,
    /// Network analyzer sweep, (real, imag) per frequency.
    Phase,
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MapKind::Scalar => "scalar",
            MapKind::Vector => "vector",
            MapKind::Digital => "digital",
            MapKind::Phase => "phase",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Free text copied into the output header.
    pub comment: String,
    pub kind: MapKind,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            comment: "BeamMap at 74 GHz".to_string(),
            kind: MapKind::Scalar,
        }
    }
}

/// Which instruments are present on the bench.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub use_unidex: bool,
    pub use_synth: bool,
    pub use_multi: bool,
    pub use_fluke: bool,
    pub use_vv: bool,
    pub use_vna: bool,
    pub use_labjack: bool,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            use_unidex: true,
            use_synth: true,
            use_multi: true,
            use_fluke: false,
            use_vv: false,
            use_vna: false,
            use_labjack: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzimuthConfig {
    /// Map start position in degrees
    pub xmin: f64,
    /// Map end position in degrees
    pub xmax: f64,
    /// Map step in degrees
    pub xinc: f64,
    /// Map velocity in degrees/second
    pub xmap_vel: f64,
    /// Slew velocity in degrees/second
    pub xslew_vel: f64,
}

impl Default for AzimuthConfig {
    fn default() -> Self {
        Self {
            xmin: -90.0,
            xmax: 90.0,
            xinc: 1.0,
            xmap_vel: 2.0,
            xslew_vel: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationConfig {
    /// Raster the azimuth cut over an elevation plan.
    pub enabled: bool,
    pub ymin: f64,
    pub ymax: f64,
    pub yinc: f64,
    pub ymap_vel: f64,
    pub yslew_vel: f64,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ymin: -90.0,
            ymax: 90.0,
            yinc: 1.0,
            ymap_vel: 2.0,
            yslew_vel: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Frequencies in GHz.
    pub freq: Vec<f64>,
    /// Frequency multiplier programmed into the synthesizer.
    pub mult: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            freq: vec![70.0, 71.0, 72.0, 73.0, 74.0, 75.0],
            mult: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiConfig {
    /// Number of power-line cycles integrated per reading
    pub nplc: f64,
    /// Number of readings to average
    pub nrdgs: usize,
    pub range: f64,
    pub resolution: f64,
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            nplc: 10.0,
            nrdgs: 2,
            range: 10.0,
            resolution: 0.001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlukeConfig {
    pub device: String,
    pub nrdgs: usize,
}

impl Default for FlukeConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            nrdgs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorVoltmeterConfig {
    pub meas: String,
    /// Phasor samples averaged per reading.
    pub avg_value: usize,
}

impl Default for VectorVoltmeterConfig {
    fn default() -> Self {
        Self {
            meas: "TRAN".to_string(),
            avg_value: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VnaConfig {
    /// Frequencies in GHz.
    pub freq: Vec<f64>,
    /// Measured parameter, e.g. "S21".
    pub meas: String,
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self {
            freq: vec![11.7, 12.0, 12.2],
            meas: "S21".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOutputConfig {
    /// Number of multiplexed channels walked per frequency.
    pub channels: u8,
}

impl Default for DigitalOutputConfig {
    fn default() -> Self {
        Self { channels: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetConfig {
    /// Measure the meter zero-point with the source off before mapping.
    pub enabled: bool,
    /// Readings for the offset; defaults to the map's reading count.
    pub nrdgs: Option<usize>,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nrdgs: None,
        }
    }
}

/// Boresight power leveling band and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelingConfig {
    pub enabled: bool,
    pub vmin: f64,
    pub vmax: f64,
    pub ceiling_dbm: f64,
    pub floor_dbm: f64,
    pub coarse_step_db: f64,
    pub fine_step_db: f64,
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            vmin: 6.0,
            vmax: 7.0,
            ceiling_dbm: 13.0,
            floor_dbm: -5.0,
            coarse_step_db: 1.0,
            fine_step_db: 0.5,
        }
    }
}

/// Data column separator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Comma,
    Tab,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Comma => b',',
            Delimiter::Tab => b'\t',
        }
    }

    pub fn as_char(self) -> char {
        self.as_byte() as char
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub delimiter: Delimiter,
    pub parse_policy: SampleParsePolicy,
}

/// Fixed open-loop waits. None of these are polled completions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde")]
    pub reset_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub meter_configure_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub home_settle: Duration,
    /// Added to distance/velocity for every move.
    #[serde(with = "humantime_serde")]
    pub settle_guard: Duration,
    #[serde(with = "humantime_serde")]
    pub frequency_settle: Duration,
    #[serde(with = "humantime_serde")]
    pub power_settle: Duration,
    #[serde(with = "humantime_serde")]
    pub vector_frequency_settle: Duration,
    #[serde(with = "humantime_serde")]
    pub digital_pacing: Duration,
    #[serde(with = "humantime_serde")]
    pub leveling_frequency_settle: Duration,
    #[serde(with = "humantime_serde")]
    pub leveling_power_query_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub leveling_step_settle: Duration,
    #[serde(with = "humantime_serde")]
    pub offset_source_off_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub offset_source_on_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub return_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reset_wait: Duration::from_secs(2),
            meter_configure_wait: Duration::from_millis(500),
            home_settle: Duration::from_secs(10),
            settle_guard: Duration::from_secs(1),
            frequency_settle: Duration::from_millis(100),
            power_settle: Duration::from_millis(200),
            vector_frequency_settle: Duration::from_millis(50),
            digital_pacing: Duration::from_millis(50),
            leveling_frequency_settle: Duration::from_millis(300),
            leveling_power_query_wait: Duration::from_secs(2),
            leveling_step_settle: Duration::from_millis(200),
            offset_source_off_wait: Duration::from_secs(3),
            offset_source_on_wait: Duration::from_millis(300),
            return_delay: Duration::from_secs(10),
        }
    }
}

/// Response model for the simulated bench used by the bundled binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Detector voltage at boresight with the source at `reference_power_dbm`.
    pub peak_voltage: f64,
    /// Gaussian beam 1-sigma width in degrees.
    pub beam_sigma_deg: f64,
    /// Detector voltage with the source off.
    pub floor_voltage: f64,
    pub reference_power_dbm: f64,
    /// Peak amplitude (volts) of uniform noise added to every sample.
    pub noise: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            peak_voltage: 6.5,
            beam_sigma_deg: 8.0,
            floor_voltage: 0.05,
            reference_power_dbm: 0.0,
            noise: 0.0,
        }
    }
}

impl Settings {
    /// Load settings from `path`, layered over the defaults and under `BEAMMAP_` overrides.
    ///
    /// A missing file is not an error: the defaults (plus environment) are used.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Serialize the defaults to `path` so operators have a file to edit.
    pub fn write_default<P: AsRef<Path>>(path: P) -> AppResult<()> {
        let text = toml::to_string_pretty(&Settings::default())
            .map_err(|e| BeammapError::Configuration(format!("cannot render defaults: {e}")))?;
        std::fs::write(path.as_ref(), text)?;
        tracing::info!(path = %path.as_ref().display(), "Wrote default configuration");
        Ok(())
    }

    /// Raw samples (or phasor samples) per reading for the configured map kind.
    pub fn nrdgs(&self) -> usize {
        match self.general.kind {
            MapKind::Scalar => {
                if self.devices.use_multi {
                    self.multi.nrdgs
                } else {
                    self.fluke.nrdgs
                }
            }
            MapKind::Vector | MapKind::Digital => self.vector_voltmeter.avg_value,
            MapKind::Phase => 1,
        }
    }

    /// Frequency list for the configured map kind.
    pub fn frequencies(&self) -> AppResult<FrequencyList> {
        match self.general.kind {
            MapKind::Phase => FrequencyList::from_ghz(&self.vna.freq),
            _ => FrequencyList::from_ghz(&self.synth.freq),
        }
    }

    /// Azimuth plan, optionally rastered against the elevation plan.
    pub fn scan_grid(&self) -> AppResult<ScanGrid> {
        let azimuth = ScanPlan::new(self.azimuth.xmin, self.azimuth.xmax, self.azimuth.xinc)?;
        let elevation = if self.elevation.enabled {
            Some(ScanPlan::new(
                self.elevation.ymin,
                self.elevation.ymax,
                self.elevation.yinc,
            )?)
        } else {
            None
        };
        Ok(ScanGrid::new(azimuth, elevation))
    }

    /// Whether the zero-offset step applies to this run.
    pub fn measures_offset(&self) -> bool {
        self.general.kind == MapKind::Scalar && self.offset.enabled
    }

    /// Whether boresight power leveling applies to this run.
    pub fn levels_power(&self) -> bool {
        self.general.kind == MapKind::Scalar && self.leveling.enabled
    }

    /// Validate everything a run needs before touching hardware.
    ///
    /// Checks:
    /// - Scan bounds lie inside the stage travel and the step walks toward the stop
    /// - Velocities are positive
    /// - The frequency list is non-empty
    /// - At least one reading per point
    /// - The leveling band and power limits are ordered
    /// - The devices the map kind needs are enabled
    pub fn validate(&self) -> AppResult<()> {
        check_travel("xmin", self.azimuth.xmin)?;
        check_travel("xmax", self.azimuth.xmax)?;
        check_velocity("xmap_vel", self.azimuth.xmap_vel)?;
        check_velocity("xslew_vel", self.azimuth.xslew_vel)?;
        if self.elevation.enabled {
            check_travel("ymin", self.elevation.ymin)?;
            check_travel("ymax", self.elevation.ymax)?;
            check_velocity("ymap_vel", self.elevation.ymap_vel)?;
            check_velocity("yslew_vel", self.elevation.yslew_vel)?;
        }
        self.scan_grid()?;
        self.frequencies()?;

        if self.nrdgs() == 0 {
            return Err(BeammapError::Configuration(format!(
                "{} map needs at least one reading per point",
                self.general.kind
            )));
        }
        if self.offset.nrdgs == Some(0) {
            return Err(BeammapError::Configuration(
                "offset.nrdgs must be at least 1".to_string(),
            ));
        }

        if self.levels_power() {
            let lv = &self.leveling;
            if lv.vmin >= lv.vmax {
                return Err(BeammapError::Configuration(format!(
                    "Leveling band is empty: vmin {} >= vmax {}",
                    lv.vmin, lv.vmax
                )));
            }
            if lv.floor_dbm >= lv.ceiling_dbm {
                return Err(BeammapError::Configuration(format!(
                    "Leveling floor {} dBm is not below ceiling {} dBm",
                    lv.floor_dbm, lv.ceiling_dbm
                )));
            }
            if lv.coarse_step_db <= 0.0 || lv.fine_step_db <= 0.0 {
                return Err(BeammapError::Configuration(
                    "Leveling step sizes must be positive".to_string(),
                ));
            }
        }

        if self.general.kind == MapKind::Digital && self.labjack.channels == 0 {
            return Err(BeammapError::Configuration(
                "digital map needs at least one output channel".to_string(),
            ));
        }

        self.validate_devices()
    }

    fn validate_devices(&self) -> AppResult<()> {
        let d = &self.devices;
        let kind = self.general.kind;
        let mut missing = Vec::new();
        if !d.use_unidex {
            missing.push("use_unidex");
        }
        match kind {
            MapKind::Scalar => {
                if !d.use_synth {
                    missing.push("use_synth");
                }
                if !d.use_multi && !d.use_fluke {
                    missing.push("use_multi or use_fluke");
                }
            }
            MapKind::Vector | MapKind::Digital => {
                if !d.use_synth {
                    missing.push("use_synth");
                }
                if !d.use_vv {
                    missing.push("use_vv");
                }
                if kind == MapKind::Digital && !d.use_labjack {
                    missing.push("use_labjack");
                }
            }
            MapKind::Phase => {
                if !d.use_vna {
                    missing.push("use_vna");
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BeammapError::Configuration(format!(
                "{} map requires devices: {}",
                kind,
                missing.join(", ")
            )))
        }
    }
}

fn check_travel(name: &str, value: f64) -> AppResult<()> {
    if !value.is_finite() || value.abs() > STAGE_LIMIT_DEG {
        return Err(BeammapError::Configuration(format!(
            "{} is set to {}, outside the +/-{} degree stage travel",
            name, value, STAGE_LIMIT_DEG
        )));
    }
    Ok(())
}

fn check_velocity(name: &str, value: f64) -> AppResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(BeammapError::Configuration(format!(
            "{} must be a positive velocity, got {}",
            name, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn loads_toml_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "beammap.toml",
                r#"
                [general]
                comment = "Horn B"
                kind = "vector"

                [devices]
                use_vv = true
                use_multi = false

                [azimuth]
                xmin = -10.0
                xmax = 10.0
                xinc = 5.0

                [timing]
                home_settle = "3s"
                "#,
            )?;
            jail.set_env("BEAMMAP_AZIMUTH__XINC", "2.5");

            let settings = Settings::load_from("beammap.toml").expect("settings load");
            assert_eq!(settings.general.comment, "Horn B");
            assert_eq!(settings.general.kind, MapKind::Vector);
            assert_eq!(settings.azimuth.xinc, 2.5);
            assert_eq!(settings.timing.home_settle, Duration::from_secs(3));
            // untouched sections keep their defaults
            assert_eq!(settings.multi, MultiConfig::default());
            Ok(())
        });
    }

    #[test]
    fn missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("nope.toml").expect("settings load");
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn write_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beammap.toml");
        Settings::write_default(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[azimuth]"));
        assert!(text.contains("home_settle = \"10s\""));
    }

    #[test]
    fn rejects_bounds_outside_travel() {
        let mut settings = Settings::default();
        settings.azimuth.xmin = -190.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("xmin"));
    }

    #[test]
    fn rejects_empty_frequency_list() {
        let mut settings = Settings::default();
        settings.synth.freq.clear();
        assert!(matches!(
            settings.validate(),
            Err(BeammapError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_kind_without_devices() {
        let mut settings = Settings::default();
        settings.general.kind = MapKind::Digital;
        settings.devices.use_vv = true;
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("use_labjack"), "{err}");
    }

    #[test]
    fn nrdgs_follows_meter_choice() {
        let mut settings = Settings::default();
        settings.multi.nrdgs = 4;
        settings.fluke.nrdgs = 7;
        assert_eq!(settings.nrdgs(), 4);
        settings.devices.use_multi = false;
        settings.devices.use_fluke = true;
        assert_eq!(settings.nrdgs(), 7);
        settings.general.kind = MapKind::Vector;
        assert_eq!(settings.nrdgs(), 3);
    }

    #[test]
    fn offset_and_leveling_only_for_scalar_maps() {
        let mut settings = Settings::default();
        settings.leveling.enabled = true;
        assert!(settings.measures_offset());
        assert!(settings.levels_power());
        settings.general.kind = MapKind::Vector;
        assert!(!settings.measures_offset());
        assert!(!settings.levels_power());
    }
}
