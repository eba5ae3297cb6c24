//! Map controller: the run state machine.
//!
//! ```text
//! Init -> Opening -> Homing -> [Offset] -> [Leveling] -> Scanning -> Returning -> Done
//!                                                                      any fault -> Failed
//! ```
//!
//! Everything is sequential. Every adapter call is awaited before the next one is issued and
//! the only suspension points are fixed open-loop waits. Motion completion is never polled:
//! after each move the controller sleeps `|target - current| / velocity + guard`.
//!
//! A fault after the devices are open abandons the row in progress, keeps every completed row
//! on disk, tries once to send the stage home, and returns a `Measurement` error naming where
//! it happened. Nothing is retried.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::Instrument;

use crate::config::{MapKind, Settings};
use crate::data::{DataRow, OutputWriter};
use crate::error::{AppResult, BeammapError, MeasurementSite};
use crate::hardware::capabilities::{
    Axis, DigitalLevel, MotionAdapter, ScalarMeterAdapter,
};
use crate::hardware::provider::required;
use crate::hardware::{Device, DeviceProvider, DeviceSet};
use crate::map::events::{EventBus, ScanEvent};
use crate::map::{RunPhase, RunRequest, RunSummary};
use crate::measurement::{
    PowerLeveler, ScalarAggregator, VectorAggregator, ZeroOffset,
};
use crate::metadata::{PowerLevelTable, RunMetadataBuilder};
use crate::scan::{FrequencyList, ScanGrid, ScanPoint};

/// Run a beam map with a private event bus.
pub async fn run_map(
    settings: &Settings,
    provider: &mut dyn DeviceProvider,
    request: RunRequest,
) -> AppResult<RunSummary> {
    MapController::new(settings).run(provider, request).await
}

/// Open-loop settle time for a move.
pub fn settle_time(current: f64, target: f64, velocity: f64, guard: Duration) -> Duration {
    Duration::from_secs_f64((target - current).abs() / velocity) + guard
}

/// Drives one map run through its phases and publishes progress on an [`EventBus`].
pub struct MapController<'a> {
    settings: &'a Settings,
    events: EventBus,
    phase: RunPhase,
}

impl<'a> MapController<'a> {
    /// Controller with a private event bus.
    pub fn new(settings: &'a Settings) -> Self {
        Self::with_events(settings, EventBus::default())
    }

    /// Controller publishing on a caller-supplied bus.
    pub fn with_events(settings: &'a Settings, events: EventBus) -> Self {
        Self {
            settings,
            events,
            phase: RunPhase::Init,
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Run the map to completion or to the first fault.
    pub async fn run(
        mut self,
        provider: &mut dyn DeviceProvider,
        request: RunRequest,
    ) -> AppResult<RunSummary> {
        let span = tracing::info_span!(
            "beammap_run",
            timestamp = %request.timestamp,
            kind = %self.settings.general.kind
        );
        async move {
            let result = self.execute(provider, &request).await;
            self.conclude(&result);
            result
        }
        .instrument(span)
        .await
    }

    fn enter(&mut self, phase: RunPhase) {
        self.phase = phase;
        tracing::info!(%phase, "Run phase");
        self.events.emit(ScanEvent::PhaseChanged { phase });
    }

    fn conclude(&mut self, result: &AppResult<RunSummary>) {
        match result {
            Ok(summary) => {
                self.enter(RunPhase::Done);
                self.events.emit(ScanEvent::Finished {
                    rows: summary.rows_written,
                });
                tracing::info!(
                    rows = summary.rows_written,
                    path = %summary.output_path.display(),
                    "Map completed"
                );
            }
            Err(err) => {
                let failed_in = self.phase;
                self.enter(RunPhase::Failed);
                self.events.emit(ScanEvent::Failed {
                    phase: failed_in,
                    message: err.to_string(),
                });
                tracing::error!(phase = %failed_in, error = %err, "Map failed");
            }
        }
    }

    async fn execute(
        &mut self,
        provider: &mut dyn DeviceProvider,
        request: &RunRequest,
    ) -> AppResult<RunSummary> {
        let settings = self.settings;
        settings.validate()?;
        let grid = settings.scan_grid()?;
        let frequencies = settings.frequencies()?;
        tracing::info!(
            points = grid.len(),
            frequencies = frequencies.len(),
            raster = grid.is_raster(),
            "Scan planned"
        );

        self.enter(RunPhase::Opening);
        let mut devices = DeviceSet::open(provider, settings).await?;

        match self.acquire(&mut devices, &grid, &frequencies, request).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                return_home_best_effort(&mut devices, grid.is_raster()).await;
                Err(err)
            }
        }
    }

    async fn acquire(
        &mut self,
        devices: &mut DeviceSet,
        grid: &ScanGrid,
        frequencies: &FrequencyList,
        request: &RunRequest,
    ) -> AppResult<RunSummary> {
        let settings = self.settings;

        self.enter(RunPhase::Homing);
        home_axes(devices, grid.is_raster(), RunPhase::Homing).await?;
        sleep(settings.timing.home_settle).await;

        let offset = if settings.measures_offset() {
            self.enter(RunPhase::Offset);
            Some(self.measure_offset(devices).await?)
        } else {
            None
        };

        let power_table = if settings.levels_power() {
            self.enter(RunPhase::Leveling);
            Some(self.level_power(devices, frequencies).await?)
        } else {
            None
        };

        self.enter(RunPhase::Scanning);
        let metadata = RunMetadataBuilder::new(settings)
            .timestamp(&request.timestamp)
            .config_file(&request.config_file)
            .offset(offset)
            .power_table(power_table.clone())
            .build();
        let delimiter = settings.output.delimiter;
        let header = metadata.header_lines(&metadata.map_columns(), delimiter);
        let mut output = OutputWriter::create(&request.output_path, &header, delimiter)?;

        let cut_len = grid.azimuth().len();
        for point in grid.points() {
            let measured = self
                .measure_point(
                    devices,
                    &point,
                    cut_len,
                    frequencies,
                    offset,
                    power_table.as_ref(),
                )
                .await;
            let row = match measured {
                Ok(row) => row,
                Err(err) => {
                    tracing::warn!(
                        index = point.index,
                        rows = output.rows_written(),
                        "Abandoning row in progress"
                    );
                    if let Err(close_err) = output.finish() {
                        tracing::warn!(error = %close_err, "Could not close output file");
                    }
                    return Err(err);
                }
            };
            output.write_row(&row)?;
            self.events.emit(ScanEvent::RowWritten {
                index: point.index,
                azimuth: point.azimuth,
                elevation: point.elevation,
            });
        }

        self.enter(RunPhase::Returning);
        sleep(settings.timing.return_delay).await;
        home_axes(devices, grid.is_raster(), RunPhase::Returning).await?;

        let rows_written = output.rows_written();
        let output_path = output.finish()?;
        Ok(RunSummary {
            kind: settings.general.kind,
            output_path,
            rows_written,
            points_planned: grid.len(),
            frequencies_ghz: frequencies.ghz().to_vec(),
            offset,
            power_table,
        })
    }

    async fn measure_offset(&self, devices: &mut DeviceSet) -> AppResult<ZeroOffset> {
        let settings = self.settings;
        let site = MeasurementSite::phase(RunPhase::Offset);
        let DeviceSet {
            source,
            multimeter,
            fluke,
            ..
        } = devices;
        let source = required(source, Device::Synthesizer)?;
        let meter = scalar_meter(multimeter, fluke)?;

        source.output_off().await.map_err(fault(&site))?;
        tracing::info!("Source off for zero offset");
        sleep(settings.timing.offset_source_off_wait).await;

        let nrdgs = settings.offset.nrdgs.unwrap_or_else(|| settings.nrdgs());
        let reading = ScalarAggregator::new(nrdgs, settings.output.parse_policy)
            .read(meter)
            .await
            .map_err(fault(&site))?;

        source.output_on().await.map_err(fault(&site))?;
        tracing::info!("Source back on");
        sleep(settings.timing.offset_source_on_wait).await;

        let offset = ZeroOffset::from_reading(reading);
        tracing::info!(offset = offset.value, std = offset.std, "Measured meter zero offset");
        self.events.emit(ScanEvent::OffsetMeasured {
            value: offset.value,
            std: offset.std,
        });
        Ok(offset)
    }

    async fn level_power(
        &self,
        devices: &mut DeviceSet,
        frequencies: &FrequencyList,
    ) -> AppResult<PowerLevelTable> {
        let settings = self.settings;
        let timing = &settings.timing;
        let DeviceSet {
            source,
            multimeter,
            fluke,
            ..
        } = devices;
        let source = required(source, Device::Synthesizer)?;
        let meter = scalar_meter(multimeter, fluke)?;

        let aggregator = ScalarAggregator::new(settings.nrdgs(), settings.output.parse_policy);
        let leveler = PowerLeveler::new(&settings.leveling, timing, aggregator);
        let mut table = PowerLevelTable::default();

        for (&ghz, hz) in frequencies.ghz().iter().zip(frequencies.hz()) {
            let site = MeasurementSite::phase(RunPhase::Leveling).with_frequency(ghz);
            source.set_frequency(hz).await.map_err(fault(&site))?;
            sleep(timing.leveling_frequency_settle).await;
            let current = source.power_level().await.map_err(fault(&site))?;
            sleep(timing.leveling_power_query_wait).await;
            let volts = aggregator.read(meter).await.map_err(fault(&site))?.mean;
            tracing::info!(frequency_ghz = ghz, power_dbm = current, volts, "Boresight reading");

            let power = leveler
                .level(source, meter, current, volts)
                .await
                .map_err(fault(&site))?;
            tracing::info!(frequency_ghz = ghz, power_dbm = power, "Power level needed");
            self.events.emit(ScanEvent::PowerLeveled {
                frequency_ghz: ghz,
                power_dbm: power,
            });
            table.push(ghz, power);
        }
        Ok(table)
    }

    async fn measure_point(
        &self,
        devices: &mut DeviceSet,
        point: &ScanPoint,
        cut_len: usize,
        frequencies: &FrequencyList,
        offset: Option<ZeroOffset>,
        power_table: Option<&PowerLevelTable>,
    ) -> AppResult<DataRow> {
        let settings = self.settings;
        let site = point_site(point);
        let guard = settings.timing.settle_guard;
        // First point of every azimuth cut is reached at slew speed.
        let cut_start = point.index % cut_len == 0;

        let motion = required(&mut devices.motion, Device::Stage)?;
        if let (Some(elevation), true) = (point.elevation, cut_start) {
            let velocity = if point.index == 0 {
                settings.elevation.yslew_vel
            } else {
                settings.elevation.ymap_vel
            };
            move_and_settle(motion, Axis::Elevation, elevation, velocity, guard)
                .await
                .map_err(fault(&site))?;
        }
        let velocity = if cut_start {
            settings.azimuth.xslew_vel
        } else {
            settings.azimuth.xmap_vel
        };
        move_and_settle(motion, Axis::Azimuth, point.azimuth, velocity, guard)
            .await
            .map_err(fault(&site))?;

        let mut keys = vec![point.azimuth];
        keys.extend(point.elevation);
        let mut row = DataRow::new(keys);

        match settings.general.kind {
            MapKind::Scalar => {
                self.scalar_readings(devices, point, &site, frequencies, offset, power_table, &mut row)
                    .await?
            }
            MapKind::Vector => {
                self.vector_readings(devices, point, &site, frequencies, &mut row)
                    .await?
            }
            MapKind::Digital => {
                self.digital_readings(devices, point, &site, frequencies, &mut row)
                    .await?
            }
            MapKind::Phase => {
                self.phase_readings(devices, point, &site, frequencies, &mut row)
                    .await?
            }
        }
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    async fn scalar_readings(
        &self,
        devices: &mut DeviceSet,
        point: &ScanPoint,
        site: &MeasurementSite,
        frequencies: &FrequencyList,
        offset: Option<ZeroOffset>,
        power_table: Option<&PowerLevelTable>,
        row: &mut DataRow,
    ) -> AppResult<()> {
        let settings = self.settings;
        let timing = &settings.timing;
        let DeviceSet {
            source,
            multimeter,
            fluke,
            ..
        } = devices;
        let source = required(source, Device::Synthesizer)?;
        let meter = scalar_meter(multimeter, fluke)?;
        let aggregator = ScalarAggregator::new(settings.nrdgs(), settings.output.parse_policy);

        for (i, (&ghz, hz)) in frequencies.ghz().iter().zip(frequencies.hz()).enumerate() {
            let site = site.clone().with_frequency(ghz);
            source.set_frequency(hz).await.map_err(fault(&site))?;
            sleep(timing.frequency_settle).await;
            if let Some(power) = power_table.and_then(|t| t.power_at(i)) {
                source.set_power_level(power).await.map_err(fault(&site))?;
                tracing::debug!(frequency_ghz = ghz, power_dbm = power, "Applied leveled power");
            }
            sleep(timing.power_settle).await;

            let reading = aggregator.read(meter).await.map_err(fault(&site))?;
            let value = offset.map_or(reading.mean, |o| o.apply(reading.mean));
            tracing::info!(
                az = point.azimuth,
                el = ?point.elevation,
                frequency_ghz = ghz,
                volts = value,
                std = reading.std,
                "Reading"
            );
            self.emit_reading(point, ghz, None, value, reading.std);
            row.push_pair(value, reading.std);
        }
        Ok(())
    }

    async fn vector_readings(
        &self,
        devices: &mut DeviceSet,
        point: &ScanPoint,
        site: &MeasurementSite,
        frequencies: &FrequencyList,
        row: &mut DataRow,
    ) -> AppResult<()> {
        let settings = self.settings;
        let DeviceSet {
            source,
            vector_meter,
            ..
        } = devices;
        let source = required(source, Device::Synthesizer)?;
        let meter = required(vector_meter, Device::VectorVoltmeter)?;
        let aggregator = VectorAggregator::new(settings.nrdgs());

        for (&ghz, hz) in frequencies.ghz().iter().zip(frequencies.hz()) {
            let site = site.clone().with_frequency(ghz);
            source.set_frequency(hz).await.map_err(fault(&site))?;
            sleep(settings.timing.vector_frequency_settle).await;
            let reading = aggregator.read(meter).await.map_err(fault(&site))?;
            tracing::info!(
                az = point.azimuth,
                frequency_ghz = ghz,
                ratio = reading.magnitude,
                phase = reading.phase_deg,
                "Reading"
            );
            self.emit_reading(point, ghz, None, reading.magnitude, reading.phase_deg);
            row.push_pair(reading.magnitude, reading.phase_deg);
        }
        Ok(())
    }

    async fn digital_readings(
        &self,
        devices: &mut DeviceSet,
        point: &ScanPoint,
        site: &MeasurementSite,
        frequencies: &FrequencyList,
        row: &mut DataRow,
    ) -> AppResult<()> {
        let settings = self.settings;
        let pacing = settings.timing.digital_pacing;
        let channels = settings.labjack.channels;
        let DeviceSet {
            source,
            vector_meter,
            digital,
            ..
        } = devices;
        let source = required(source, Device::Synthesizer)?;
        let meter = required(vector_meter, Device::VectorVoltmeter)?;
        let lines = required(digital, Device::DigitalOutput)?;
        let aggregator = VectorAggregator::new(settings.nrdgs());

        for (&ghz, hz) in frequencies.ghz().iter().zip(frequencies.hz()) {
            let site = site.clone().with_frequency(ghz);
            source.set_frequency(hz).await.map_err(fault(&site))?;
            for channel in 0..channels {
                for other in (0..channels).filter(|c| *c != channel) {
                    lines
                        .set_channel(other, DigitalLevel::High)
                        .await
                        .map_err(fault(&site))?;
                    sleep(pacing).await;
                }
                lines
                    .set_channel(channel, DigitalLevel::Low)
                    .await
                    .map_err(fault(&site))?;
                sleep(pacing).await;

                let reading = aggregator.read(meter).await.map_err(fault(&site))?;
                tracing::info!(
                    az = point.azimuth,
                    frequency_ghz = ghz,
                    channel,
                    ratio = reading.magnitude,
                    phase = reading.phase_deg,
                    "Reading"
                );
                self.emit_reading(point, ghz, Some(channel), reading.magnitude, reading.phase_deg);
                row.push_pair(reading.magnitude, reading.phase_deg);
            }
        }
        Ok(())
    }

    async fn phase_readings(
        &self,
        devices: &mut DeviceSet,
        point: &ScanPoint,
        site: &MeasurementSite,
        frequencies: &FrequencyList,
        row: &mut DataRow,
    ) -> AppResult<()> {
        let analyzer = required(&mut devices.analyzer, Device::NetworkAnalyzer)?;
        let sweep = analyzer.sweep().await.map_err(fault(site))?;
        if sweep.len() != frequencies.len() {
            return Err(BeammapError::Measurement {
                site: site.clone(),
                reason: format!(
                    "analyzer returned {} points for {} frequencies",
                    sweep.len(),
                    frequencies.len()
                ),
            });
        }
        for (&ghz, value) in frequencies.ghz().iter().zip(sweep) {
            tracing::info!(
                az = point.azimuth,
                frequency_ghz = ghz,
                re = value.re,
                im = value.im,
                "Reading"
            );
            self.emit_reading(point, ghz, None, value.re, value.im);
            row.push_pair(value.re, value.im);
        }
        Ok(())
    }

    fn emit_reading(
        &self,
        point: &ScanPoint,
        frequency_ghz: f64,
        channel: Option<u8>,
        first: f64,
        second: f64,
    ) {
        self.events.emit(ScanEvent::Reading {
            index: point.index,
            azimuth: point.azimuth,
            elevation: point.elevation,
            frequency_ghz,
            channel,
            first,
            second,
        });
    }
}

/// Write a zero-offset record: one `frequency, ratio, phase` row per synthesizer frequency,
/// taken with the vector voltmeter and without moving the stage.
pub async fn record_zero_offsets(
    settings: &Settings,
    provider: &mut dyn DeviceProvider,
    request: RunRequest,
) -> AppResult<RunSummary> {
    let span = tracing::info_span!("beammap_offsets", timestamp = %request.timestamp);
    async move {
        let flags = &settings.devices;
        if !flags.use_synth || !flags.use_vv {
            return Err(BeammapError::Configuration(
                "zero-offset record requires devices: use_synth, use_vv".to_string(),
            ));
        }
        if settings.vector_voltmeter.avg_value == 0 {
            return Err(BeammapError::Configuration(
                "vector_voltmeter.avg_value must be at least 1".to_string(),
            ));
        }
        let frequencies = FrequencyList::from_ghz(&settings.synth.freq)?;
        let mut devices = DeviceSet::open(provider, settings).await?;

        let mut record_settings = settings.clone();
        record_settings.general.kind = MapKind::Vector;
        let metadata = RunMetadataBuilder::new(&record_settings)
            .timestamp(&request.timestamp)
            .config_file(&request.config_file)
            .build();
        let delimiter = settings.output.delimiter;
        let header = metadata.header_lines(&metadata.zero_offset_columns(), delimiter);
        let mut output = OutputWriter::create(&request.output_path, &header, delimiter)?;

        let DeviceSet {
            source,
            vector_meter,
            ..
        } = &mut devices;
        let source = required(source, Device::Synthesizer)?;
        let meter = required(vector_meter, Device::VectorVoltmeter)?;
        let aggregator = VectorAggregator::new(settings.vector_voltmeter.avg_value);

        for (&ghz, hz) in frequencies.ghz().iter().zip(frequencies.hz()) {
            let site = MeasurementSite::phase(RunPhase::Offset).with_frequency(ghz);
            source.set_frequency(hz).await.map_err(fault(&site))?;
            sleep(settings.timing.vector_frequency_settle).await;
            let reading = aggregator.read(meter).await.map_err(fault(&site))?;
            tracing::info!(
                frequency_ghz = ghz,
                ratio = reading.magnitude,
                phase = reading.phase_deg,
                "Zero offset"
            );
            let mut row = DataRow::new(vec![ghz]);
            row.push_pair(reading.magnitude, reading.phase_deg);
            output.write_row(&row)?;
        }

        let rows_written = output.rows_written();
        let output_path = output.finish()?;
        tracing::info!(rows = rows_written, "Offset measurement completed");
        Ok(RunSummary {
            kind: MapKind::Vector,
            output_path,
            rows_written,
            points_planned: frequencies.len(),
            frequencies_ghz: frequencies.ghz().to_vec(),
            offset: None,
            power_table: None,
        })
    }
    .instrument(span)
    .await
}

/// Open the stage, reset it, and send it home.
pub async fn go_home(settings: &Settings, provider: &mut dyn DeviceProvider) -> AppResult<()> {
    let mut stage = provider
        .open_motion(settings)
        .await
        .map_err(|e| BeammapError::device(Device::Stage, &e))?;
    stage
        .reset()
        .await
        .map_err(|e| BeammapError::device(Device::Stage, &e))?;
    sleep(settings.timing.reset_wait).await;

    let site = MeasurementSite::phase(RunPhase::Homing);
    stage.home(Axis::Azimuth).await.map_err(fault(&site))?;
    if settings.elevation.enabled {
        stage.home(Axis::Elevation).await.map_err(fault(&site))?;
    }
    sleep(settings.timing.home_settle).await;
    tracing::info!("Stage homed");
    Ok(())
}

fn fault(site: &MeasurementSite) -> impl Fn(anyhow::Error) -> BeammapError + '_ {
    move |err| BeammapError::measurement(site.clone(), &err)
}

fn point_site(point: &ScanPoint) -> MeasurementSite {
    MeasurementSite {
        phase: RunPhase::Scanning,
        point_index: Some(point.index),
        azimuth: Some(point.azimuth),
        elevation: point.elevation,
        frequency_ghz: None,
    }
}

/// Multimeter when present, else the Fluke.
fn scalar_meter<'d>(
    multimeter: &'d mut Option<Box<dyn ScalarMeterAdapter>>,
    fluke: &'d mut Option<Box<dyn ScalarMeterAdapter>>,
) -> AppResult<&'d mut (dyn ScalarMeterAdapter + 'static)> {
    match multimeter {
        Some(meter) => Ok(meter.as_mut()),
        None => required(fluke, Device::Fluke),
    }
}

async fn move_and_settle(
    motion: &mut dyn MotionAdapter,
    axis: Axis,
    target: f64,
    velocity: f64,
    guard: Duration,
) -> anyhow::Result<()> {
    let wait = settle_time(motion.position(axis), target, velocity, guard);
    motion.move_to(axis, target, velocity).await?;
    tracing::debug!(%axis, target, velocity, wait_s = wait.as_secs_f64(), "Waiting for stage");
    sleep(wait).await;
    Ok(())
}

async fn home_axes(devices: &mut DeviceSet, raster: bool, phase: RunPhase) -> AppResult<()> {
    let motion = required(&mut devices.motion, Device::Stage)?;
    let site = MeasurementSite::phase(phase);
    motion.home(Axis::Azimuth).await.map_err(fault(&site))?;
    if raster {
        motion.home(Axis::Elevation).await.map_err(fault(&site))?;
    }
    Ok(())
}

async fn return_home_best_effort(devices: &mut DeviceSet, raster: bool) {
    let Some(motion) = devices.motion.as_deref_mut() else {
        return;
    };
    let axes: &[Axis] = if raster {
        &[Axis::Azimuth, Axis::Elevation]
    } else {
        &[Axis::Azimuth]
    };
    for &axis in axes {
        match motion.home(axis).await {
            Ok(()) => tracing::info!(%axis, "Returned home after fault"),
            Err(err) => tracing::warn!(%axis, error = %err, "Best-effort return home failed"),
        }
    }
}
