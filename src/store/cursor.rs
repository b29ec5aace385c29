//! Pull-based scan cursor over the segments of one generation.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use futures::stream::{self, Stream};

use super::{segment, LocalStore};
use crate::error::Result;
use crate::predicate::ScanFilter;
use crate::progress::CancellationToken;
use crate::record::Record;

/// Forward-only cursor yielding batches of matching records in storage order.
///
/// Batches never overlap and hold at most `batch_size` records. Each record is
/// checked against the filter before it is buffered. Cancellation ends the
/// scan normally: the records already buffered are delivered and the next call
/// returns `None`.
pub struct ScanCursor<'a> {
    store: &'a LocalStore,
    generation: u64,
    segments: VecDeque<PathBuf>,
    current: std::vec::IntoIter<Record>,
    filter: ScanFilter,
    batch_size: usize,
    cancel: CancellationToken,
    delivered: u64,
    done: bool,
}

impl<'a> ScanCursor<'a> {
    pub(super) fn new(
        store: &'a LocalStore,
        generation: u64,
        segments: Vec<PathBuf>,
        filter: ScanFilter,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            generation,
            segments: segments.into(),
            current: Vec::new().into_iter(),
            filter,
            batch_size: batch_size.max(1),
            cancel,
            delivered: 0,
            done: false,
        }
    }

    /// Generation this cursor reads.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Batches delivered so far.
    pub fn batches_delivered(&self) -> u64 {
        self.delivered
    }

    /// Advance to the next batch. `None` once the scan is exhausted or cancelled.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        if self.done {
            return Ok(None);
        }
        if self.delivered > 0 {
            tokio::task::yield_now().await;
        }

        let mut buffer = Vec::with_capacity(self.batch_size.min(4096));
        loop {
            if self.cancel.is_cancelled() {
                self.done = true;
                break;
            }
            match self.current.next() {
                Some(record) => {
                    self.store.counters.rows_scanned.fetch_add(1, Ordering::Relaxed);
                    if self.filter.accepts(&record) {
                        buffer.push(record);
                        if buffer.len() >= self.batch_size {
                            self.delivered += 1;
                            return Ok(Some(buffer));
                        }
                    }
                }
                None => {
                    let Some(path) = self.segments.pop_front() else {
                        self.done = true;
                        break;
                    };
                    if let Err(e) = self.load_segment(path).await {
                        self.done = true;
                        return Err(e);
                    }
                }
            }
        }

        if buffer.is_empty() {
            Ok(None)
        } else {
            self.delivered += 1;
            Ok(Some(buffer))
        }
    }

    async fn load_segment(&mut self, path: PathBuf) -> Result<()> {
        self.store.ensure_generation(self.generation)?;
        let records = tokio::task::spawn_blocking(move || segment::read_segment(&path)).await??;
        self.store.counters.segments_read.fetch_add(1, Ordering::Relaxed);
        self.current = records.into_iter();
        Ok(())
    }

    /// Adapt the cursor into a `Stream` of batches.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Record>>> + 'a {
        stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next_batch().await?.map(|batch| (batch, cursor)))
        })
    }
}
