//! Chunk splitting of record selections.
//!
//! `split_batch` groups a lazy selection into job chunks bounded by the job
//! size without breaking pre-grouped units apart. `split_job` cuts one job's
//! keys into per-transaction sub-batches.

use policybatch_core::{RecordKey, RecordUnit};

/// Lazy adaptor produced by [`split_batch`].
#[derive(Debug)]
pub struct SplitBatch<I> {
    units: I,
    max_size: usize,
    group: Vec<RecordKey>,
    pending: Option<Vec<RecordKey>>,
}

/// Partition `units` into chunks of at most `max_size` keys.
///
/// A unit that would overflow the current chunk either closes it (when the
/// unit is not larger than what was accumulated) or is emitted on its own
/// right after it (when it is larger). Oversized units are never cut.
/// `max_size == 0` disables the bound: everything lands in one chunk.
///
/// Every key appears in exactly one chunk and chunks are emitted in input
/// order.
pub fn split_batch<I>(units: I, max_size: usize) -> SplitBatch<I::IntoIter>
where
    I: IntoIterator<Item = RecordUnit>,
{
    SplitBatch {
        units: units.into_iter(),
        max_size,
        group: Vec::new(),
        pending: None,
    }
}

impl<I> Iterator for SplitBatch<I>
where
    I: Iterator<Item = RecordUnit>,
{
    type Item = Vec<RecordKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }

        for unit in self.units.by_ref() {
            let keys = unit.into_keys();
            if self.max_size == 0 || self.group.len() + keys.len() <= self.max_size {
                self.group.extend(keys);
                continue;
            }

            if keys.len() > self.group.len() {
                if self.group.is_empty() {
                    return Some(keys);
                }
                self.pending = Some(keys);
                return Some(std::mem::take(&mut self.group));
            }

            return Some(std::mem::replace(&mut self.group, keys));
        }

        if self.group.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.group))
        }
    }
}

/// Cut `ids` into consecutive sub-batches of `size` keys.
///
/// Yields nothing for an empty slice, and the whole slice at once when
/// `size` is 0 or not smaller than the slice.
pub fn split_job<T>(ids: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    let step = if size == 0 || size >= ids.len() {
        ids.len().max(1)
    } else {
        size
    };
    ids.chunks(step)
}
