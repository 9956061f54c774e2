//! Step 3 — unpack.
//!
//! Reads each reverse-map bucket back, unpacks its records into a dense
//! positional array (`dense[original − bucket_base] = sorted position`),
//! and rewrites the result as one contiguous stream in place of the
//! reverse-map file. That stream is the next iteration's l-table. Consumed
//! bucket files are deleted as they are read; unpopulated positions belong
//! to pruned entries and are never dereferenced downstream.

use rayon::prelude::*;

use crate::fence::Fence;
use crate::ioqueue::{IoQueue, PendingBuf, SeekOrigin};
use crate::layout::{FileId, PlotContext, TableId};
use crate::phase3::{Phase3Error, TableState};
use crate::scatter::{carve_chunks, split_ranges};

/// Issue the read of one reverse-map bucket. Look-ahead loads pass
/// `blocking = false` and defer when the pool is dry.
fn load_bucket(
    queue: &mut IoQueue,
    fence: &Fence,
    lengths: &[u32],
    map_id: FileId,
    bucket: usize,
    blocking: bool,
) -> Option<PendingBuf> {
    let bytes = lengths[bucket] as usize * 8;
    let buf = if blocking {
        queue.get_buffer_blocking(bytes)
    } else {
        queue.try_get_buffer(bytes)?
    };
    let pending = queue.read_file(map_id, bucket as u32, buf, bytes);
    queue.signal_fence(fence, bucket as u64 + 1);
    queue.commit();

    if bucket == 0 {
        // Rewind bucket 0 so the dense output overwrites the stream from
        // the start; later buckets are deleted once their records are read.
        queue.seek_file(map_id, 0, SeekOrigin::Begin);
    } else {
        queue.delete_file(map_id, bucket as u32);
    }
    queue.commit();

    Some(pending)
}

pub(crate) fn run(
    ctx: &PlotContext,
    queue: &mut IoQueue,
    fence: &Fence,
    state: &mut TableState,
    r: TableId,
) -> Result<(), Phase3Error> {
    fence.reset(0);
    let map_id = FileId::LinePointMap(r);
    queue.seek_bucket(map_id, SeekOrigin::Begin);
    queue.commit();

    let num_buckets = ctx.num_buckets();
    let window = ctx.bucket_window();

    let mut pending: Vec<Option<PendingBuf>> = (0..num_buckets).map(|_| None).collect();
    pending[0] = load_bucket(queue, fence, &state.lmap_bucket_counts, map_id, 0, true);

    for bucket in 0..num_buckets {
        // Force-load a deferred bucket before looking ahead; fence ids must
        // be signaled in bucket order.
        let loaded = match pending[bucket].take() {
            Some(p) => p,
            None => load_bucket(queue, fence, &state.lmap_bucket_counts, map_id, bucket, true)
                .expect("blocking load"),
        };
        if bucket + 1 < num_buckets {
            pending[bucket + 1] = load_bucket(
                queue,
                fence,
                &state.lmap_bucket_counts,
                map_id,
                bucket + 1,
                false,
            );
        }

        fence.wait(bucket as u64 + 1);
        queue.check_error()?;
        let src = loaded.wait();

        let record_count = state.lmap_bucket_counts[bucket] as usize;
        let dense_len = ctx.bucket_counts[r.index()][bucket] as usize;
        let base = window * bucket as u64;

        let mut out = queue.get_buffer_blocking(dense_len * 4);
        {
            let records = &src.as_slice::<u64>()[..record_count];
            let dst = &mut out.as_slice_mut::<u32>()[..dense_len];

            let workers = rayon::current_num_threads().max(1);
            let ranges = split_ranges(dense_len, workers);
            let lens: Vec<usize> = ranges.iter().map(|rg| rg.len()).collect();
            let chunks = carve_chunks(dst, &lens);

            // Each worker owns a destination range and claims the records
            // that land in it; original indices are unique, so every dense
            // slot is written at most once.
            ranges
                .par_iter()
                .cloned()
                .zip(chunks.into_par_iter())
                .map(|(rg, chunk)| {
                    for &record in records {
                        let idx = (record & 0xFFFF_FFFF)
                            .checked_sub(base)
                            .filter(|&i| (i as usize) < dense_len)
                            .ok_or_else(|| {
                                Phase3Error::Inconsistency(format!(
                                    "table {} reverse-map record {record:#x} outside bucket \
                                     {bucket} window of {dense_len}",
                                    r.number()
                                ))
                            })? as usize;
                        if rg.contains(&idx) {
                            chunk[idx - rg.start] = (record >> 32) as u32;
                        }
                    }
                    Ok(())
                })
                .collect::<Result<(), Phase3Error>>()?;
        }

        queue.release_buffer(src);
        queue.write_file(map_id, 0, out, dense_len * 4);
        queue.commit();
    }

    Ok(())
}
