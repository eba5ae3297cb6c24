//! Device provider seam.
//!
//! A [`DeviceProvider`] turns the configuration into opened adapters. The bundled binary uses
//! the simulated bench; a lab build supplies a provider backed by real bus sessions. Opening is
//! the only place a provider is consulted: once a [`DeviceSet`] exists the run owns every
//! adapter in it and drops them when it ends.

use crate::config::Settings;
use crate::error::{AppResult, BeammapError};
use crate::hardware::capabilities::{
    DigitalOutputAdapter, MeterOptions, MotionAdapter, NetworkAnalyzerAdapter,
    ScalarMeterAdapter, SourceAdapter, VectorMeterAdapter,
};
use crate::hardware::Device;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::sleep;

/// Opens one adapter per instrument role.
///
/// Every method defaults to refusing the role, so a provider only implements what its bench
/// actually has.
#[async_trait]
pub trait DeviceProvider: Send {
    async fn open_motion(&mut self, _settings: &Settings) -> Result<Box<dyn MotionAdapter>> {
        Err(unsupported(Device::Stage))
    }

    async fn open_source(&mut self, _settings: &Settings) -> Result<Box<dyn SourceAdapter>> {
        Err(unsupported(Device::Synthesizer))
    }

    /// Open a scalar meter. `device` is [`Device::Multimeter`] or [`Device::Fluke`].
    async fn open_scalar_meter(
        &mut self,
        device: Device,
        _settings: &Settings,
    ) -> Result<Box<dyn ScalarMeterAdapter>> {
        Err(unsupported(device))
    }

    async fn open_vector_meter(
        &mut self,
        _settings: &Settings,
    ) -> Result<Box<dyn VectorMeterAdapter>> {
        Err(unsupported(Device::VectorVoltmeter))
    }

    async fn open_network_analyzer(
        &mut self,
        _settings: &Settings,
    ) -> Result<Box<dyn NetworkAnalyzerAdapter>> {
        Err(unsupported(Device::NetworkAnalyzer))
    }

    async fn open_digital_output(
        &mut self,
        _settings: &Settings,
    ) -> Result<Box<dyn DigitalOutputAdapter>> {
        Err(unsupported(Device::DigitalOutput))
    }
}

fn unsupported(device: Device) -> anyhow::Error {
    anyhow!("{} is not provided by this bench", device)
}

/// The adapters opened for one run. A slot is `None` when its `use_*` flag is off.
#[derive(Default)]
pub struct DeviceSet {
    pub motion: Option<Box<dyn MotionAdapter>>,
    pub source: Option<Box<dyn SourceAdapter>>,
    pub multimeter: Option<Box<dyn ScalarMeterAdapter>>,
    pub fluke: Option<Box<dyn ScalarMeterAdapter>>,
    pub vector_meter: Option<Box<dyn VectorMeterAdapter>>,
    pub analyzer: Option<Box<dyn NetworkAnalyzerAdapter>>,
    pub digital: Option<Box<dyn DigitalOutputAdapter>>,
}

impl DeviceSet {
    /// Open and initialize every enabled device.
    ///
    /// The stage is reset, the multimeter configured and the analyzer sweep programmed here.
    /// Any failure is fatal and reported as [`BeammapError::DeviceUnavailable`].
    pub async fn open(provider: &mut dyn DeviceProvider, settings: &Settings) -> AppResult<Self> {
        let flags = &settings.devices;
        let timing = &settings.timing;
        let mut set = DeviceSet::default();

        if flags.use_unidex {
            let mut stage = provider
                .open_motion(settings)
                .await
                .map_err(|e| BeammapError::device(Device::Stage, &e))?;
            stage
                .reset()
                .await
                .map_err(|e| BeammapError::device(Device::Stage, &e))?;
            sleep(timing.reset_wait).await;
            tracing::info!(device = %Device::Stage, "Opened");
            set.motion = Some(stage);
        }

        if flags.use_synth {
            let mut source = provider
                .open_source(settings)
                .await
                .map_err(|e| BeammapError::device(Device::Synthesizer, &e))?;
            source
                .set_multiplier(settings.synth.mult)
                .await
                .map_err(|e| BeammapError::device(Device::Synthesizer, &e))?;
            tracing::info!(device = %Device::Synthesizer, mult = settings.synth.mult, "Opened");
            set.source = Some(source);
        }

        if flags.use_multi {
            let mut meter = provider
                .open_scalar_meter(Device::Multimeter, settings)
                .await
                .map_err(|e| BeammapError::device(Device::Multimeter, &e))?;
            let options = MeterOptions {
                nplc: settings.multi.nplc,
                range: settings.multi.range,
                nrdgs: settings.multi.nrdgs,
                resolution: settings.multi.resolution,
            };
            meter
                .configure(&options)
                .await
                .map_err(|e| BeammapError::device(Device::Multimeter, &e))?;
            sleep(timing.meter_configure_wait).await;
            tracing::info!(device = %Device::Multimeter, nplc = options.nplc, "Opened");
            set.multimeter = Some(meter);
        }

        if flags.use_fluke {
            let meter = provider
                .open_scalar_meter(Device::Fluke, settings)
                .await
                .map_err(|e| BeammapError::device(Device::Fluke, &e))?;
            tracing::info!(device = %Device::Fluke, port = %settings.fluke.device, "Opened");
            set.fluke = Some(meter);
        }

        if flags.use_vv {
            let meter = provider
                .open_vector_meter(settings)
                .await
                .map_err(|e| BeammapError::device(Device::VectorVoltmeter, &e))?;
            tracing::info!(device = %Device::VectorVoltmeter, "Opened");
            set.vector_meter = Some(meter);
        }

        if flags.use_vna {
            let mut analyzer = provider
                .open_network_analyzer(settings)
                .await
                .map_err(|e| BeammapError::device(Device::NetworkAnalyzer, &e))?;
            let hz: Vec<f64> = settings.vna.freq.iter().map(|f| f * 1e9).collect();
            analyzer
                .configure_sweep(&hz, &settings.vna.meas)
                .await
                .map_err(|e| BeammapError::device(Device::NetworkAnalyzer, &e))?;
            tracing::info!(device = %Device::NetworkAnalyzer, points = hz.len(), "Opened");
            set.analyzer = Some(analyzer);
        }

        if flags.use_labjack {
            let digital = provider
                .open_digital_output(settings)
                .await
                .map_err(|e| BeammapError::device(Device::DigitalOutput, &e))?;
            if digital.channel_count() < settings.labjack.channels {
                return Err(BeammapError::DeviceUnavailable {
                    device: Device::DigitalOutput,
                    reason: format!(
                        "has {} channels, {} configured",
                        digital.channel_count(),
                        settings.labjack.channels
                    ),
                });
            }
            tracing::info!(device = %Device::DigitalOutput, "Opened");
            set.digital = Some(digital);
        }

        Ok(set)
    }
}

/// Borrow an opened adapter, or report the role as unavailable.
pub(crate) fn required<T: ?Sized>(
    slot: &mut Option<Box<T>>,
    device: Device,
) -> AppResult<&mut T> {
    slot.as_deref_mut()
        .ok_or_else(|| BeammapError::DeviceUnavailable {
            device,
            reason: "not opened for this run".to_string(),
        })
}
