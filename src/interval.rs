//! Maps sample timestamps onto the end boundary of their bucket.
//!
//! The mapping only looks at the timestamp it is given, never at the wall
//! clock, so the same reading always lands in the same bucket.

use crate::error::AppError;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BucketWidth {
    HalfHour,
    Hour,
}

impl BucketWidth {
    pub fn minutes(self) -> u32 {
        match self {
            BucketWidth::HalfHour => 30,
            BucketWidth::Hour => 60,
        }
    }

    /// Width as a fraction of an hour; this is the duration every sample is
    /// assumed to cover when its current is turned into energy.
    pub fn hours(self) -> f64 {
        f64::from(self.minutes()) / 60.0
    }
}

impl TryFrom<u32> for BucketWidth {
    type Error = AppError;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        match minutes {
            30 => Ok(BucketWidth::HalfHour),
            60 => Ok(BucketWidth::Hour),
            other => Err(AppError::Config(format!(
                "unsupported bucket width: {} minutes (expected 30 or 60)",
                other
            ))),
        }
    }
}

impl From<BucketWidth> for u32 {
    fn from(width: BucketWidth) -> Self {
        width.minutes()
    }
}

impl fmt::Display for BucketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

/// Returns the end of the bucket `ts` falls into, truncated to whole seconds.
///
/// Half-hour: minutes 0..29 end at :30, minutes 30..59 end at the next :00.
/// Hour: anything past the top of the hour ends at the next :00; a timestamp
/// already on the hour (ignoring sub-second digits) is its own bucket end.
pub fn bucket_end(ts: DateTime<Utc>, width: BucketWidth) -> DateTime<Utc> {
    let hour_start = ts
        - ChronoDuration::minutes(i64::from(ts.minute()))
        - ChronoDuration::seconds(i64::from(ts.second()))
        - ChronoDuration::nanoseconds(i64::from(ts.nanosecond()));

    match width {
        BucketWidth::HalfHour => {
            if ts.minute() < 30 {
                hour_start + ChronoDuration::minutes(30)
            } else {
                hour_start + ChronoDuration::hours(1)
            }
        }
        BucketWidth::Hour => {
            if ts.minute() > 0 || ts.second() > 0 {
                hour_start + ChronoDuration::hours(1)
            } else {
                hour_start
            }
        }
    }
}
