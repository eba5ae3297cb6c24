//! Boresight power leveling.
//!
//! Steps the source power in coarse increments until the detector reading crosses into the
//! target band, then applies one fine correction if it overshot. The search never commands a
//! level outside `[floor, ceiling]`; hitting a limit returns the limit itself.

use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{LevelingConfig, TimingConfig};
use crate::hardware::capabilities::{ScalarMeterAdapter, SourceAdapter};
use crate::measurement::aggregate::ScalarAggregator;

#[derive(Debug, Clone)]
pub struct PowerLeveler {
    pub vmin: f64,
    pub vmax: f64,
    pub ceiling_dbm: f64,
    pub floor_dbm: f64,
    pub coarse_step_db: f64,
    pub fine_step_db: f64,
    /// Wait after every power change before reading.
    pub settle: Duration,
    pub aggregator: ScalarAggregator,
}

impl PowerLeveler {
    pub fn new(config: &LevelingConfig, timing: &TimingConfig, aggregator: ScalarAggregator) -> Self {
        Self {
            vmin: config.vmin,
            vmax: config.vmax,
            ceiling_dbm: config.ceiling_dbm,
            floor_dbm: config.floor_dbm,
            coarse_step_db: config.coarse_step_db,
            fine_step_db: config.fine_step_db,
            settle: timing.leveling_step_settle,
            aggregator,
        }
    }

    /// Inclusive band check used to decide whether to search at all.
    pub fn in_band(&self, volts: f64) -> bool {
        volts >= self.vmin && volts <= self.vmax
    }

    /// Find a power level that puts the detector reading inside the band.
    ///
    /// `start_dbm` is the source's current level and `volts` the reading taken at it.
    pub async fn level(
        &self,
        source: &mut dyn SourceAdapter,
        meter: &mut dyn ScalarMeterAdapter,
        start_dbm: f64,
        volts: f64,
    ) -> Result<f64> {
        if self.in_band(volts) {
            return Ok(start_dbm);
        }
        if volts < self.vmin {
            self.raise(source, meter, start_dbm).await
        } else {
            self.lower(source, meter, start_dbm).await
        }
    }

    async fn raise(
        &self,
        source: &mut dyn SourceAdapter,
        meter: &mut dyn ScalarMeterAdapter,
        start_dbm: f64,
    ) -> Result<f64> {
        let mut power = start_dbm;
        loop {
            power += self.coarse_step_db;
            if power > self.ceiling_dbm {
                tracing::warn!(
                    ceiling_dbm = self.ceiling_dbm,
                    vmin = self.vmin,
                    "Power ceiling reached before detector entered band"
                );
                return Ok(self.ceiling_dbm);
            }
            let volts = self.set_and_read(source, meter, power).await?;
            tracing::debug!(power_dbm = power, volts, "Raising power");
            if volts > self.vmin {
                if volts < self.vmax {
                    return Ok(power);
                }
                power -= self.fine_step_db;
                let corrected = self.set_and_read(source, meter, power).await?;
                tracing::info!(power_dbm = power, volts = corrected, "Overshot band, backed off");
                return Ok(power);
            }
        }
    }

    async fn lower(
        &self,
        source: &mut dyn SourceAdapter,
        meter: &mut dyn ScalarMeterAdapter,
        start_dbm: f64,
    ) -> Result<f64> {
        let mut power = start_dbm;
        loop {
            power -= self.coarse_step_db;
            if power < self.floor_dbm {
                tracing::warn!(
                    floor_dbm = self.floor_dbm,
                    vmax = self.vmax,
                    "Power floor reached before detector entered band"
                );
                return Ok(self.floor_dbm);
            }
            let volts = self.set_and_read(source, meter, power).await?;
            tracing::debug!(power_dbm = power, volts, "Lowering power");
            if volts < self.vmax {
                if volts > self.vmin {
                    return Ok(power);
                }
                power += self.fine_step_db;
                let corrected = self.set_and_read(source, meter, power).await?;
                tracing::info!(power_dbm = power, volts = corrected, "Undershot band, backed off");
                return Ok(power);
            }
        }
    }

    async fn set_and_read(
        &self,
        source: &mut dyn SourceAdapter,
        meter: &mut dyn ScalarMeterAdapter,
        power: f64,
    ) -> Result<f64> {
        source.set_power_level(power).await?;
        sleep(self.settle).await;
        Ok(self.aggregator.read(meter).await?.mean)
    }
}
