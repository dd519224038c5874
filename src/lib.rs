pub mod aggregate;
pub mod archive;
pub mod config;
pub mod db;
pub mod energy;
pub mod error;
pub mod ingest;
pub mod interval;
pub mod mqtt;
pub mod reading;
pub mod store;
pub mod upsert;

pub use aggregate::{aggregate, Aggregator, AggregatorSettings, BucketKey, ConsolidatedRecord};
pub use config::Config;
pub use error::{AppError, MalformedSample, Result};
pub use ingest::{BatchReport, Ingestor};
pub use interval::{bucket_end, BucketWidth};
pub use reading::{normalize_batch, NormalizedBatch, Sample};
pub use store::{EnergyStore, MemoryStore};
pub use upsert::{to_upserts, UpsertOperation};
