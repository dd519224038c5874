use crate::config::AggregationConfig;
use crate::energy::ElectricalProfile;
use crate::error::{AppError, Result};
use crate::interval::{bucket_end, BucketWidth};
use crate::reading::Sample;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Validated aggregation parameters. Building one is the only place an
/// invalid voltage, power factor or bucket width is rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorSettings {
    pub profile: ElectricalProfile,
    pub width: BucketWidth,
}

impl AggregatorSettings {
    pub fn new(voltage: f64, power_factor: f64, width: BucketWidth) -> Result<Self> {
        if !voltage.is_finite() || voltage <= 0.0 {
            return Err(AppError::Config(format!(
                "voltage must be a positive number, got {}",
                voltage
            )));
        }
        if !power_factor.is_finite() || power_factor <= 0.0 || power_factor > 1.0 {
            return Err(AppError::Config(format!(
                "power factor must be in (0, 1], got {}",
                power_factor
            )));
        }
        Ok(Self {
            profile: ElectricalProfile {
                voltage,
                power_factor,
            },
            width,
        })
    }
}

impl TryFrom<&AggregationConfig> for AggregatorSettings {
    type Error = AppError;

    fn try_from(cfg: &AggregationConfig) -> Result<Self> {
        let width = BucketWidth::try_from(cfg.bucket_width_minutes)?;
        Self::new(cfg.voltage, cfg.power_factor, width)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub device_name: String,
    pub bucket_end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedRecord {
    pub device_name: String,
    pub bucket_end: DateTime<Utc>,
    pub energy_kwh: f64,
    pub sample_count: usize,
}

/// Accumulates one batch. The map lives only as long as the aggregator and
/// [`Aggregator::finish`] consumes it, so nothing carries over between batches.
#[derive(Debug)]
pub struct Aggregator {
    settings: AggregatorSettings,
    buckets: BTreeMap<BucketKey, ConsolidatedRecord>,
}

impl Aggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            buckets: BTreeMap::new(),
        }
    }

    /// Energy one sample contributes: every channel's current over one full
    /// bucket width.
    pub fn sample_energy(&self, sample: &Sample) -> f64 {
        let hours = self.settings.width.hours();
        sample
            .channels
            .iter()
            .map(|c| self.settings.profile.energy_kwh(c.value, hours))
            .sum()
    }

    pub fn add(&mut self, sample: &Sample) {
        let energy = self.sample_energy(sample);
        let key = BucketKey {
            device_name: sample.device_name.clone(),
            bucket_end: bucket_end(sample.ts, self.settings.width),
        };
        let record = self
            .buckets
            .entry(key)
            .or_insert_with_key(|k| ConsolidatedRecord {
                device_name: k.device_name.clone(),
                bucket_end: k.bucket_end,
                energy_kwh: 0.0,
                sample_count: 0,
            });
        record.energy_kwh += energy;
        record.sample_count += 1;
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// One record per distinct (device, bucket end), ordered by device then time.
    pub fn finish(self) -> Vec<ConsolidatedRecord> {
        self.buckets.into_values().collect()
    }
}

pub fn aggregate(settings: AggregatorSettings, samples: &[Sample]) -> Vec<ConsolidatedRecord> {
    let mut aggregator = Aggregator::new(settings);
    for sample in samples {
        aggregator.add(sample);
    }
    aggregator.finish()
}
