use crate::archive::ArchivedReading;
use crate::error::Result;
use crate::store::EnergyStore;
use crate::upsert::UpsertOperation;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::collections::BTreeSet;
use tracing::debug;

pub type DbPool = Pool<Postgres>;

/// Postgres allows at most 65535 bind parameters per statement.
const MAX_BINDS: usize = 60_000;

pub async fn connect(url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

enum SqlValue {
    Ts(DateTime<Utc>),
    Naive(NaiveDateTime),
    Text(Option<String>),
    F64(f64),
}

fn bind_all<'q>(
    sql: &'q str,
    binds: Vec<SqlValue>,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    let mut q = sqlx::query(sql);
    for b in binds {
        q = match b {
            SqlValue::Ts(v) => q.bind(v),
            SqlValue::Naive(v) => q.bind(v),
            SqlValue::Text(v) => q.bind(v),
            SqlValue::F64(v) => q.bind(v),
        };
    }
    q
}

/// Placeholder tuples `($1, $2), ($3, $4), ...` for `rows` rows of `width` values.
fn placeholders(rows: usize, width: usize) -> String {
    (0..rows)
        .map(|r| {
            let tuple: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({})", tuple.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn upsert_energy_sql(table: &str, rows: usize) -> String {
    format!(
        "INSERT INTO {} (device_name, ts, energy_consumed) VALUES {} \
         ON CONFLICT (device_name, ts) DO UPDATE SET energy_consumed = EXCLUDED.energy_consumed",
        table,
        placeholders(rows, 3)
    )
}

/// Columns of an archive insert: fixed columns, a value and unit column per
/// channel, then every tag column seen in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveColumns {
    pub channels: usize,
    pub tags: Vec<String>,
}

impl ArchiveColumns {
    pub fn for_rows(rows: &[ArchivedReading]) -> Self {
        let channels = rows.iter().map(|r| r.channels.len()).max().unwrap_or(0);
        let tags: BTreeSet<&str> = rows
            .iter()
            .flat_map(|r| r.tags.keys().map(String::as_str))
            .collect();
        Self {
            channels,
            tags: tags.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut columns: Vec<String> = vec!["ts".into(), "device_name".into()];
        for i in 1..=self.channels {
            columns.push(format!("channel{}", i));
            columns.push(format!("channel{}_unit", i));
        }
        columns.extend(self.tags.iter().cloned());
        columns
    }

    pub fn width(&self) -> usize {
        2 + self.channels * 2 + self.tags.len()
    }
}

pub struct PgEnergyStore {
    pool: DbPool,
}

impl PgEnergyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl EnergyStore for PgEnergyStore {
    /// All chunks of one batch commit together or not at all.
    async fn upsert_energy(&self, table: &str, ops: &[UpsertOperation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in ops.chunks(MAX_BINDS / 3) {
            let sql = upsert_energy_sql(table, chunk.len());
            let binds = chunk
                .iter()
                .flat_map(|op| {
                    [
                        SqlValue::Text(Some(op.device_name.clone())),
                        SqlValue::Naive(op.timestamp),
                        SqlValue::F64(op.energy_consumed),
                    ]
                })
                .collect();
            bind_all(&sql, binds).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(table = %table, count = ops.len(), "energy rows upserted");
        Ok(())
    }

    async fn archive_readings(&self, table: &str, rows: &[ArchivedReading]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = ArchiveColumns::for_rows(rows);
        let width = columns.width();

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks((MAX_BINDS / width).max(1)) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table,
                columns.names().join(", "),
                placeholders(chunk.len(), width)
            );
            let mut binds = Vec::with_capacity(chunk.len() * width);
            for r in chunk {
                binds.push(SqlValue::Ts(r.ts));
                binds.push(SqlValue::Text(Some(r.device_name.clone())));
                for i in 0..columns.channels {
                    match r.channels.get(i) {
                        Some(c) => {
                            binds.push(SqlValue::F64(c.value));
                            binds.push(SqlValue::Text(c.unit.clone()));
                        }
                        None => {
                            binds.push(SqlValue::F64(0.0));
                            binds.push(SqlValue::Text(None));
                        }
                    }
                }
                for col in &columns.tags {
                    binds.push(SqlValue::Text(r.tags.get(col).cloned()));
                }
            }
            bind_all(&sql, binds).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(table = %table, count = rows.len(), "raw readings archived");
        Ok(())
    }
}
