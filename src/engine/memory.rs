//! In-memory engine for datasets small enough to hold as a plain collection.

use std::collections::BTreeSet;

use crate::aggregate::{Accumulator, AggregateResult};
use crate::predicate::FilterPredicate;
use crate::progress::CancellationToken;
use crate::record::{Dimension, Record};

/// A fully materialized dataset.
///
/// Evaluates predicates through [`FilterPredicate::matches`] and reduces
/// through [`Accumulator`], the same path the local store takes, yielding to
/// the runtime every `yield_every` records.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    records: Vec<Record>,
    yield_every: usize,
}

impl MemoryEngine {
    pub fn new(records: Vec<Record>, yield_every: usize) -> Self {
        Self {
            records,
            yield_every: yield_every.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Visit matching records in order until `visit` returns `false`.
    ///
    /// Returns `false` if cancelled before the walk finished.
    async fn walk<F>(&self, predicate: &FilterPredicate, cancel: &CancellationToken, mut visit: F) -> bool
    where
        F: FnMut(&Record) -> bool,
    {
        for (i, chunk) in self.records.chunks(self.yield_every).enumerate() {
            if i > 0 {
                tokio::task::yield_now().await;
            }
            if cancel.is_cancelled() {
                return false;
            }
            for record in chunk.iter().filter(|r| predicate.matches(r)) {
                if !visit(record) {
                    return true;
                }
            }
        }
        !cancel.is_cancelled()
    }

    /// Up to `max_rows` matching records, `None` if cancelled.
    pub async fn sample(
        &self,
        max_rows: usize,
        predicate: &FilterPredicate,
        cancel: &CancellationToken,
    ) -> Option<Vec<Record>> {
        let mut rows = Vec::with_capacity(max_rows.min(self.records.len()));
        if max_rows == 0 {
            return Some(rows);
        }
        let finished = self
            .walk(predicate, cancel, |record| {
                rows.push(record.clone());
                rows.len() < max_rows
            })
            .await;
        finished.then_some(rows)
    }

    /// Aggregate of every matching record, `None` if cancelled.
    pub async fn aggregate(
        &self,
        predicate: &FilterPredicate,
        cancel: &CancellationToken,
    ) -> Option<AggregateResult> {
        let mut acc = Accumulator::new();
        let finished = self
            .walk(predicate, cancel, |record| {
                acc.push(record);
                true
            })
            .await;
        finished.then(|| acc.finish())
    }

    /// Sorted, trimmed, non-empty values of one dimension.
    pub fn distinct_values(&self, dimension: Dimension) -> BTreeSet<String> {
        self.records
            .iter()
            .map(|r| r.dimension(dimension).trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }
}
