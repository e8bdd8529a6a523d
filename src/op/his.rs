//! Historical time-series ranges and series decoding.

use chrono::{DateTime, FixedOffset, NaiveDate};

use crate::core::{Error, ProtocolError};
use crate::grid::{Grid, Scalar};

/// Time range of a history read, canonicalized to the wire form the
/// server expects.
#[derive(Debug, Clone, PartialEq)]
pub enum HisRange {
    Today,
    Yesterday,
    /// All samples on one date.
    Date(NaiveDate),
    /// Samples from the first date up to (exclusive) the second.
    DateSpan(NaiveDate, NaiveDate),
    /// Samples since a point in time.
    Since(DateTime<FixedOffset>),
    /// Samples between two points in time.
    TimeSpan(DateTime<FixedOffset>, DateTime<FixedOffset>),
    /// A pre-formatted range string, passed through untouched.
    Raw(String),
}

impl HisRange {
    pub fn to_wire(&self) -> String {
        match self {
            HisRange::Today => "today".to_string(),
            HisRange::Yesterday => "yesterday".to_string(),
            HisRange::Date(date) => Scalar::Date(*date).to_zinc(),
            HisRange::DateSpan(from, to) => {
                format!("{},{}", Scalar::Date(*from).to_zinc(), Scalar::Date(*to).to_zinc())
            }
            HisRange::Since(since) => Scalar::DateTime(*since).to_zinc(),
            HisRange::TimeSpan(from, to) => format!(
                "{},{}",
                Scalar::DateTime(*from).to_zinc(),
                Scalar::DateTime(*to).to_zinc()
            ),
            HisRange::Raw(range) => range.clone(),
        }
    }
}

/// Decode a hisRead grid into its `(ts, val)` rows, in server order.
pub(crate) fn series_from_grid(
    grid: &Grid,
) -> Result<Vec<(DateTime<FixedOffset>, Scalar)>, Error> {
    let mut series = Vec::with_capacity(grid.len());
    for (index, row) in grid.rows().enumerate() {
        let ts = match row.get("ts") {
            Some(Scalar::DateTime(ts)) => *ts,
            other => {
                return Err(ProtocolError::Malformed {
                    message: format!("history row {index} has no timestamp (ts={other:?})"),
                }
                .into());
            }
        };
        let val = row.get("val").cloned().unwrap_or(Scalar::Null);
        series.push((ts, val));
    }
    Ok(series)
}
