//! Step 2 — sort & reverse-map.
//!
//! Each of the 256 line-point buckets is read back (with one-bucket
//! look-ahead), radix-sorted by line point with the key riding along,
//! handed to the park-encoder seam, and turned into reverse-map records
//! `(sorted position << 32) | original index` scattered to the original-y
//! reverse-map buckets.
//!
//! The two reads of a bucket signal independent fence tags so the sort can
//! start the moment both arrays are in; the tag scheme is
//! `bucket * FENCE_COUNT + {LP_LOADED, KEY_LOADED}`.

use rayon::prelude::*;

use crate::fence::Fence;
use crate::ioqueue::{IoQueue, PendingBuf, SeekOrigin};
use crate::layout::{FileId, PlotContext, TableId};
use crate::linepoint::LP_BUCKET_COUNT;
use crate::phase3::{Buffers, Phase3Error, TableState};
use crate::radix::radix_sort_pairs;
use crate::scatter::{RegionWriter, bucket_totals, carve_regions, split_ranges};

pub(crate) const FENCE_COUNT: u64 = 2;
const LP_LOADED: u64 = 1;
const KEY_LOADED: u64 = 2;

/// Downstream consumer of each sorted line-point bucket. The production
/// park encoder is an external collaborator; [`NullSink`] stands in until
/// it is attached.
pub trait LinePointSink {
    /// Receive one sorted bucket. `global_offset` is the number of entries
    /// emitted before this bucket, across the whole table.
    fn put(
        &mut self,
        line_points: &[u64],
        keys: &[u32],
        global_offset: u64,
    ) -> Result<(), Phase3Error>;
}

/// Discards the sorted buckets.
pub struct NullSink;

impl LinePointSink for NullSink {
    fn put(&mut self, _: &[u64], _: &[u32], _: u64) -> Result<(), Phase3Error> {
        Ok(())
    }
}

/// Issue the two reads of a line-point bucket. Look-ahead loads pass
/// `blocking = false` and defer when the pool is dry.
fn load_bucket(
    queue: &mut IoQueue,
    fence: &Fence,
    lengths: &[u32],
    r: TableId,
    bucket: usize,
    blocking: bool,
) -> Option<(PendingBuf, PendingBuf)> {
    let len = lengths[bucket] as usize;
    let (lp_buf, key_buf) = if blocking {
        (
            queue.get_buffer_blocking(len * 8),
            queue.get_buffer_blocking(len * 4),
        )
    } else {
        let lp = queue.try_get_buffer(len * 8)?;
        match queue.try_get_buffer(len * 4) {
            Some(key) => (lp, key),
            None => {
                queue.release_buffer(lp);
                return None;
            }
        }
    };

    let fence_base = bucket as u64 * FENCE_COUNT;
    let lp = queue.read_file(FileId::LinePoint(r), bucket as u32, lp_buf, len * 8);
    queue.signal_fence(fence, fence_base + LP_LOADED);
    let key = queue.read_file(FileId::LinePointKey(r), bucket as u32, key_buf, len * 4);
    queue.signal_fence(fence, fence_base + KEY_LOADED);
    queue.commit();

    Some((lp, key))
}

pub(crate) fn run<S: LinePointSink>(
    ctx: &PlotContext,
    queue: &mut IoQueue,
    fence: &Fence,
    bufs: &mut Buffers,
    state: &mut TableState,
    r: TableId,
    sink: &mut S,
) -> Result<(), Phase3Error> {
    fence.reset(0);
    queue.seek_bucket(FileId::LinePoint(r), SeekOrigin::Begin);
    queue.seek_bucket(FileId::LinePointKey(r), SeekOrigin::Begin);
    queue.commit();

    let mut pending: Vec<Option<(PendingBuf, PendingBuf)>> =
        (0..LP_BUCKET_COUNT).map(|_| None).collect();
    pending[0] = load_bucket(queue, fence, &state.lp_bucket_counts, r, 0, true);

    let mut global_offset = 0u64;

    for bucket in 0..LP_BUCKET_COUNT {
        // Force-load if the look-ahead was deferred, then (and only then)
        // try the next bucket: fence tags must be signaled in bucket order.
        let loaded = match pending[bucket].take() {
            Some(p) => p,
            None => load_bucket(queue, fence, &state.lp_bucket_counts, r, bucket, true)
                .expect("blocking load"),
        };
        if bucket + 1 < LP_BUCKET_COUNT {
            pending[bucket + 1] =
                load_bucket(queue, fence, &state.lp_bucket_counts, r, bucket + 1, false);
        }

        let len = state.lp_bucket_counts[bucket] as usize;
        fence.wait(bucket as u64 * FENCE_COUNT + KEY_LOADED);
        queue.check_error()?;

        let (lp_pending, key_pending) = loaded;
        let mut lp_buf = lp_pending.wait();
        let mut key_buf = key_pending.wait();

        if global_offset + len as u64 > u32::MAX as u64 + 1 {
            return Err(Phase3Error::Inconsistency(format!(
                "table {} sorted positions overflow 32 bits",
                r.number()
            )));
        }
        // The carved staging covers the expected bucket load; a skewed
        // bucket falls back to a pool loan for its sort scratch.
        let fits_staging = len <= bufs.lp_staging.as_slice::<u64>().len()
            && len <= bufs.pruned_keys.as_slice::<u32>().len();
        let mut loaned = if fits_staging {
            None
        } else {
            Some((
                queue.get_buffer_blocking(len * 8),
                queue.get_buffer_blocking(len * 4),
            ))
        };
        {
            let (scratch_lp, scratch_key): (&mut [u64], &mut [u32]) = match &mut loaned {
                Some((lp, key)) => (lp.as_slice_mut::<u64>(), key.as_slice_mut::<u32>()),
                None => (
                    bufs.lp_staging.as_slice_mut::<u64>(),
                    bufs.pruned_keys.as_slice_mut::<u32>(),
                ),
            };
            radix_sort_pairs(
                &mut lp_buf.as_slice_mut::<u64>()[..len],
                &mut key_buf.as_slice_mut::<u32>()[..len],
                &mut scratch_lp[..len],
                &mut scratch_key[..len],
            );
        }
        if let Some((lp, key)) = loaned {
            queue.release_buffer(lp);
            queue.release_buffer(key);
        }

        let sorted_lps = &lp_buf.as_slice::<u64>()[..len];
        let sorted_keys = &key_buf.as_slice::<u32>()[..len];

        // Hand the sorted bucket to the park-encoder seam.
        sink.put(sorted_lps, sorted_keys, global_offset)?;

        write_reverse_map(ctx, queue, state, r, sorted_keys, global_offset)?;

        queue.release_buffer(lp_buf);
        queue.release_buffer(key_buf);
        global_offset += len as u64;
    }

    Ok(())
}

/// Pack `(sorted position, original index)` records and scatter them to the
/// reverse-map buckets keyed by the original index's high bits.
fn write_reverse_map(
    ctx: &PlotContext,
    queue: &mut IoQueue,
    state: &mut TableState,
    r: TableId,
    keys: &[u32],
    global_offset: u64,
) -> Result<(), Phase3Error> {
    let num_buckets = ctx.num_buckets();
    let shift = ctx.map_bucket_shift();
    let len = keys.len();

    let workers = rayon::current_num_threads().max(1);
    let ranges = split_ranges(len, workers);

    let counts: Vec<Vec<u32>> = ranges
        .par_iter()
        .map(|rg| {
            let mut c = vec![0u32; num_buckets];
            for &key in &keys[rg.clone()] {
                let b = (key >> shift) as usize;
                let slot = c.get_mut(b).ok_or_else(|| {
                    Phase3Error::Inconsistency(format!(
                        "table {} key {key} routes to reverse-map bucket {b} of {num_buckets}",
                        r.number()
                    ))
                })?;
                *slot += 1;
            }
            Ok(c)
        })
        .collect::<Result<Vec<_>, Phase3Error>>()?;

    let totals = bucket_totals(&counts, num_buckets);
    for (acc, &t) in state.lmap_bucket_counts.iter_mut().zip(&totals) {
        *acc += t;
    }

    let mut out = queue.get_buffer_blocking(len * 8);
    {
        let regions = carve_regions(&mut out.as_slice_mut::<u64>()[..len], &counts);
        ranges
            .par_iter()
            .cloned()
            .zip(regions.into_par_iter())
            .for_each(|(rg, regs)| {
                let mut writer = RegionWriter::new(regs);
                for i in rg {
                    let key = keys[i];
                    let record = ((global_offset + i as u64) << 32) | key as u64;
                    writer.push((key >> shift) as usize, record);
                }
            });
    }

    let sizes: Vec<u32> = totals.iter().map(|&c| c * 8).collect();
    queue.write_buckets(FileId::LinePointMap(r), out, sizes);
    queue.commit();

    Ok(())
}
