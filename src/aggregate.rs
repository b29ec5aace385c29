//! Streaming aggregation.
//!
//! [`Accumulator`] folds records one at a time into global counters and a
//! per-date map. Every engine reduces through it, in storage order, so the
//! local store and the in-memory collection produce identical results for
//! the same predicate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Counters for one calendar date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    /// `YYYY-MM-DD`
    pub date: String,
    pub total_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub user_dropped_count: u64,
    pub success_gmv: f64,
}

/// Aggregate of every record that matched one predicate.
///
/// Rates are percentages of `total_count` and are 0 for an empty result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub total_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub user_dropped_count: u64,
    pub success_gmv: f64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub user_dropped_rate: f64,
    /// Sorted by date, ascending.
    pub daily: Vec<DailyBucket>,
}

impl AggregateResult {
    /// Bucket for one date, if any record fell on it.
    pub fn day(&self, date: &str) -> Option<&DailyBucket> {
        self.daily
            .binary_search_by(|bucket| bucket.date.as_str().cmp(date))
            .ok()
            .map(|idx| &self.daily[idx])
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total: u64,
    success: u64,
    failed: u64,
    user_dropped: u64,
    success_gmv: f64,
}

impl Counters {
    fn add(&mut self, record: &Record) {
        self.total += 1;
        if record.is_success {
            self.success += 1;
            self.success_gmv += record.amount;
        }
        if record.is_failed {
            self.failed += 1;
        }
        if record.is_user_dropped {
            self.user_dropped += 1;
        }
    }
}

/// Single-pass aggregate builder.
#[derive(Debug, Default)]
pub struct Accumulator {
    global: Counters,
    by_date: BTreeMap<String, Counters>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record that already passed the predicate.
    pub fn push(&mut self, record: &Record) {
        self.global.add(record);
        match self.by_date.get_mut(&record.date) {
            Some(bucket) => bucket.add(record),
            None => {
                let mut bucket = Counters::default();
                bucket.add(record);
                self.by_date.insert(record.date.clone(), bucket);
            }
        }
    }

    pub fn extend<'a>(&mut self, records: impl IntoIterator<Item = &'a Record>) {
        for record in records {
            self.push(record);
        }
    }

    /// Records folded so far.
    pub fn count(&self) -> u64 {
        self.global.total
    }

    /// Derive rates and emit the date-sorted result.
    pub fn finish(self) -> AggregateResult {
        let Counters {
            total,
            success,
            failed,
            user_dropped,
            success_gmv,
        } = self.global;
        let rate = |n: u64| {
            if total == 0 {
                0.0
            } else {
                n as f64 / total as f64 * 100.0
            }
        };

        AggregateResult {
            total_count: total,
            success_count: success,
            failed_count: failed,
            user_dropped_count: user_dropped,
            success_gmv,
            success_rate: rate(success),
            failure_rate: rate(failed),
            user_dropped_rate: rate(user_dropped),
            daily: self
                .by_date
                .into_iter()
                .map(|(date, c)| DailyBucket {
                    date,
                    total_count: c.total,
                    success_count: c.success,
                    failed_count: c.failed,
                    user_dropped_count: c.user_dropped,
                    success_gmv: c.success_gmv,
                })
                .collect(),
        }
    }
}
