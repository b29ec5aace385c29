//! Filter predicates.
//!
//! A [`FilterPredicate`] is a conjunction of optional constraints. Every
//! engine (in-memory collection, local store, remote service) evaluates
//! records through [`FilterPredicate::matches`], so filter semantics cannot
//! drift between storage modes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::record::{Dimension, Record};

/// Inclusive time range in epoch milliseconds. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl TimeRange {
    pub fn new(start_ms: Option<i64>, end_ms: Option<i64>) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        self.start_ms.is_none_or(|start| timestamp_ms >= start)
            && self.end_ms.is_none_or(|end| timestamp_ms <= end)
    }
}

/// A conjunction of optional filter constraints.
///
/// Absent or empty constraints always pass. Records whose gateway is a
/// placeholder (`N/A`, `NA`, empty) never pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPredicate {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub dimensions: BTreeMap<Dimension, BTreeSet<String>>,
}

impl FilterPredicate {
    /// A predicate with no explicit constraints.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to an inclusive time range.
    pub fn with_time_range(mut self, start_ms: Option<i64>, end_ms: Option<i64>) -> Self {
        self.time_range = Some(TimeRange::new(start_ms, end_ms));
        self
    }

    /// Restrict a dimension to a set of values.
    pub fn with_values<I, S>(mut self, dimension: Dimension, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dimensions
            .entry(dimension)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Reject predicates that can never be satisfied by construction.
    pub fn validate(&self) -> Result<()> {
        if let Some(TimeRange {
            start_ms: Some(start),
            end_ms: Some(end),
        }) = self.time_range
        {
            if start > end {
                return Err(EngineError::validation(format!(
                    "Time range start {start} is after end {end}"
                )));
            }
        }
        Ok(())
    }

    /// Evaluate the predicate against one record.
    pub fn matches(&self, record: &Record) -> bool {
        if record.has_placeholder_gateway() {
            return false;
        }
        if let Some(range) = &self.time_range {
            if !range.contains(record.timestamp_ms) {
                return false;
            }
        }
        self.dimensions
            .iter()
            .all(|(dimension, allowed)| {
                allowed.is_empty() || allowed.contains(record.dimension(*dimension))
            })
    }
}

/// What a raw store scan keeps.
///
/// [`ScanFilter::All`] yields every stored record in storage order,
/// placeholder gateways included. Analytics go through
/// [`ScanFilter::Predicate`], which applies the placeholder exclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    All,
    Predicate(FilterPredicate),
}

impl ScanFilter {
    pub fn accepts(&self, record: &Record) -> bool {
        match self {
            ScanFilter::All => true,
            ScanFilter::Predicate(predicate) => predicate.matches(record),
        }
    }
}

impl From<FilterPredicate> for ScanFilter {
    fn from(predicate: FilterPredicate) -> Self {
        ScanFilter::Predicate(predicate)
    }
}

impl From<&FilterPredicate> for ScanFilter {
    fn from(predicate: &FilterPredicate) -> Self {
        ScanFilter::Predicate(predicate.clone())
    }
}
