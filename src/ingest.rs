use crate::aggregate::{Aggregator, AggregatorSettings};
use crate::archive::ArchivedReading;
use crate::config::Pipeline;
use crate::error::Result;
use crate::reading::{decode_batch, Normalizer};
use crate::store::EnergyStore;
use crate::upsert::to_upserts;
use serde_json::Value;
use tracing::{debug, info};

/// Outcome of running one batch through one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub pipeline: String,
    pub received: usize,
    pub dropped: usize,
    pub records: usize,
}

struct Route {
    pipeline: Pipeline,
    settings: AggregatorSettings,
}

pub struct Ingestor<S> {
    store: S,
    routes: Vec<Route>,
}

impl<S: EnergyStore> Ingestor<S> {
    /// Fails if any pipeline carries settings the aggregator cannot use.
    pub fn new(store: S, pipelines: Vec<Pipeline>) -> Result<Self> {
        let routes = pipelines
            .into_iter()
            .map(|pipeline| {
                pipeline.validate()?;
                let settings = pipeline.aggregation.settings()?;
                Ok(Route { pipeline, settings })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { store, routes })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs the payload through every pipeline whose filter matches `topic`.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<Vec<BatchReport>> {
        let matching: Vec<&Route> = self
            .routes
            .iter()
            .filter(|r| topic_matches(&r.pipeline.topic, topic))
            .collect();
        if matching.is_empty() {
            debug!(topic = %topic, "no pipeline matches topic");
            return Ok(Vec::new());
        }

        let records = decode_batch(payload)?;
        let mut reports = Vec::with_capacity(matching.len());
        for route in matching {
            reports.push(self.process(route, &records).await?);
        }
        Ok(reports)
    }

    /// Normalize, aggregate and persist one batch. Each call gets a fresh
    /// aggregator; nothing is shared between batches.
    async fn process(&self, route: &Route, records: &[Value]) -> Result<BatchReport> {
        let p = &route.pipeline;
        let mut normalizer = Normalizer::new(&p.reading);
        let mut aggregator = Aggregator::new(route.settings);
        let mut archived = Vec::new();

        for raw in records {
            let Some(sample) = normalizer.normalize(raw) else {
                continue;
            };
            aggregator.add(&sample);
            if p.raw_table.is_some() {
                archived.push(ArchivedReading::from_sample(&sample, raw, &p.reading.tags));
            }
        }

        let consolidated = aggregator.finish();
        let ops = to_upserts(&consolidated);

        if let Some(raw_table) = &p.raw_table {
            self.store.archive_readings(raw_table, &archived).await?;
        }
        self.store.upsert_energy(&p.table, &ops).await?;

        let report = BatchReport {
            pipeline: p.name.clone(),
            received: records.len(),
            dropped: normalizer.dropped(),
            records: ops.len(),
        };
        info!(
            pipeline = %report.pipeline,
            width = %route.settings.width,
            received = report.received,
            dropped = report.dropped,
            records = report.records,
            "batch aggregated"
        );
        Ok(report)
    }
}

/// MQTT topic filter match with `+` (one level) and `#` (rest) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for f in filter.split('/') {
        if f == "#" {
            return true;
        }
        match levels.next() {
            Some(t) if f == "+" || f == t => continue,
            _ => return false,
        }
    }
    levels.next().is_none()
}
