//! Step 1 — prune & linepoint.
//!
//! Streams the l-table and r-table buckets with one-bucket read-ahead,
//! drops every r-entry whose original index is unmarked, resolves the
//! survivors' back-pointer pairs against the l-window, encodes each pair as
//! a line point, and scatters `(line point, key)` into the 256 line-point
//! output buckets.
//!
//! The l-window for bucket `b` is the bucket's values plus a carry tail:
//! the first read fetches `count + extra` entries, and before each
//! prefetch the window's last `extra` entries are copied to the head of the
//! back buffer so pairs that straddle the boundary resolve in one
//! contiguous slice. The final bucket's length is recomputed from the total
//! stream length, which is what makes the carry-ahead reads end exactly at
//! EOF.

use rayon::prelude::*;

use crate::bitfield::BitField;
use crate::fence::Fence;
use crate::heap::IoBuf;
use crate::ioqueue::{IoQueue, PendingBuf, SeekOrigin};
use crate::layout::{FileId, Phase3Config, PlotContext, TableId};
use crate::linepoint::{LP_BUCKET_COUNT, lp_bucket, square_to_line_point};
use crate::phase3::{Buffers, Phase3Error, TableState};
use crate::scatter::{RegionWriter, bucket_totals, carve_chunks, carve_regions, split_ranges};

/// One side of the double-buffered r/l input set.
struct LoadedSet {
    lmap: IoBuf,
    left: IoBuf,
    right: IoBuf,
    rmap: IoBuf,
}

struct PendingSet {
    lmap: PendingBuf,
    left: PendingBuf,
    right: PendingBuf,
    rmap: PendingBuf,
}

impl PendingSet {
    fn wait(self) -> LoadedSet {
        LoadedSet {
            lmap: self.lmap.wait(),
            left: self.left.wait(),
            right: self.right.wait(),
            rmap: self.rmap.wait(),
        }
    }
}

fn issue_reads(
    queue: &mut IoQueue,
    lmap_id: FileId,
    r: TableId,
    set: LoadedSet,
    l_offset_bytes: usize,
    l_len: usize,
    r_len: usize,
) -> PendingSet {
    PendingSet {
        lmap: queue.read_file_at(lmap_id, 0, set.lmap, l_offset_bytes, l_len * 4),
        left: queue.read_file(FileId::BackPtrLeft(r), 0, set.left, r_len * 4),
        right: queue.read_file(FileId::BackPtrRight(r), 0, set.right, r_len * 2),
        rmap: queue.read_file(FileId::OriginMap(r), 0, set.rmap, r_len * 4),
    }
}

pub(crate) fn run(
    cfg: &Phase3Config,
    ctx: &PlotContext,
    queue: &mut IoQueue,
    fence: &Fence,
    bufs: &mut Buffers,
    state: &mut TableState,
    r: TableId,
) -> Result<(), Phase3Error> {
    let l = r.prev();
    let li = l.index();
    let ri = r.index();
    let num_buckets = ctx.num_buckets();
    let extra = cfg.extra();
    let total_l = ctx.table_length(l);

    let marked_id = FileId::MarkedEntries(r);
    let lmap_id = if r == TableId::Table2 {
        FileId::X
    } else {
        FileId::LinePointMap(l)
    };

    queue.seek_bucket(marked_id, SeekOrigin::Begin);
    queue.seek_bucket(lmap_id, SeekOrigin::Begin);
    queue.seek_bucket(FileId::BackPtrLeft(r), SeekOrigin::Begin);
    queue.seek_bucket(FileId::BackPtrRight(r), SeekOrigin::Begin);
    queue.seek_bucket(FileId::OriginMap(r), SeekOrigin::Begin);
    queue.commit();

    // First bucket: the whole window (bucket plus carry tail) reads into
    // offset 0 in one go.
    let l_len0 = ctx.bucket_counts[li][0] as usize + extra;
    let r_len0 = ctx.ptr_bucket_counts[ri][0] as usize;
    if (l_len0 as u64) > total_l {
        return Err(Phase3Error::Inconsistency(format!(
            "l-table {} holds {total_l} entries, fewer than one carry window of {l_len0}",
            l.number()
        )));
    }
    let mut l_loaded = l_len0 as u64;

    let marks_bytes = ctx.mark_bitmap_bytes();
    let mut marks_pending = Some(queue.read_file(
        marked_id,
        0,
        bufs.marks.take().expect("marks buffer in place"),
        marks_bytes,
    ));

    let first = LoadedSet {
        lmap: bufs.lmap[0].take().expect("front l buffer in place"),
        left: bufs.left[0].take().expect("front left buffer in place"),
        right: bufs.right[0].take().expect("front right buffer in place"),
        rmap: bufs.rmap[0].take().expect("front map buffer in place"),
    };
    let mut front = Some(issue_reads(queue, lmap_id, r, first, 0, l_len0, r_len0));
    queue.signal_fence(fence, 1);
    queue.commit();

    let mut free = Some(LoadedSet {
        lmap: bufs.lmap[1].take().expect("back l buffer in place"),
        left: bufs.left[1].take().expect("back left buffer in place"),
        right: bufs.right[1].take().expect("back right buffer in place"),
        rmap: bufs.rmap[1].take().expect("back map buffer in place"),
    });

    for bucket in 0..num_buckets {
        let is_last = bucket + 1 == num_buckets;

        fence.wait(bucket as u64 + 1);
        queue.check_error()?;
        let cur = front.take().expect("bucket read in flight").wait();
        if let Some(pending) = marks_pending.take() {
            bufs.marks = Some(pending.wait());
        }

        let count_b = ctx.bucket_counts[li][bucket] as usize;

        if !is_last {
            let next = bucket + 1;
            let next_is_last = next + 1 == num_buckets;

            let l_len = if next_is_last {
                total_l
                    .checked_sub(l_loaded)
                    .ok_or_else(|| {
                        Phase3Error::Inconsistency(format!(
                            "l-table {} bucket counts exceed its stream length {total_l}",
                            l.number()
                        ))
                    })? as usize
            } else {
                ctx.bucket_counts[li][next] as usize
            };
            l_loaded += l_len as u64;
            let r_len = ctx.ptr_bucket_counts[ri][next] as usize;

            // Carry the window tail into the head of the back buffer, then
            // hand the back set to the IO worker.
            let mut back = free.take().expect("free read set");
            back.lmap.as_slice_mut::<u32>()[..extra]
                .copy_from_slice(&cur.lmap.as_slice::<u32>()[count_b..count_b + extra]);

            front = Some(issue_reads(queue, lmap_id, r, back, extra * 4, l_len, r_len));
            queue.signal_fence(fence, next as u64 + 1);
            queue.commit();
        }

        let r_len = ctx.ptr_bucket_counts[ri][bucket] as usize;
        let l_window = if is_last { count_b } else { count_b + extra };

        if is_last {
            // The set freed by the previous bucket was not consumed by a
            // prefetch; park it as the back buffer for the next table.
            let b = free.take().expect("free read set");
            bufs.lmap[1] = Some(b.lmap);
            bufs.left[1] = Some(b.left);
            bufs.right[1] = Some(b.right);
            bufs.rmap[1] = Some(b.rmap);
        }

        let marks_buf = bufs.marks.as_ref().expect("marks loaded");
        let pruned = convert_bucket(
            queue,
            state,
            r,
            &BitField::new(marks_buf.as_slice::<u64>()),
            &cur.lmap.as_slice::<u32>()[..l_window],
            &cur.left.as_slice::<u32>()[..r_len],
            &cur.right.as_slice::<u16>()[..r_len],
            &cur.rmap.as_slice::<u32>()[..r_len],
            bufs.lp_staging.as_slice_mut::<u64>(),
            bufs.pruned_keys.as_slice_mut::<u32>(),
        )?;
        state.pruned_count += pruned;

        free = Some(cur);
    }

    // Park the double buffers for the next table.
    let a = free.take().expect("free read set");
    bufs.lmap[0] = Some(a.lmap);
    bufs.left[0] = Some(a.left);
    bufs.right[0] = Some(a.right);
    bufs.rmap[0] = Some(a.rmap);

    Ok(())
}

/// Prune one r-bucket and scatter its survivors as `(line point, key)`.
///
/// Two-pass compaction: every worker counts its marked entries, takes its
/// prefix offset into the staging buffers, writes packed `(left, right)`
/// pairs plus keys there, and converts the pairs to line points in place.
/// The staged line points are then distributed to the 256 output buckets.
fn convert_bucket(
    queue: &mut IoQueue,
    state: &mut TableState,
    r: TableId,
    marks: &BitField,
    lmap: &[u32],
    left: &[u32],
    right: &[u16],
    rmap: &[u32],
    lp_staging: &mut [u64],
    key_staging: &mut [u32],
) -> Result<u64, Phase3Error> {
    let r_len = rmap.len();
    let workers = rayon::current_num_threads().max(1);
    let ranges = split_ranges(r_len, workers);

    // Pass 1: survivor counts per worker.
    let pruned_counts: Vec<usize> = ranges
        .par_iter()
        .map(|rg| rg.clone().filter(|&i| marks.get(rmap[i] as u64)).count())
        .collect();
    let total: usize = pruned_counts.iter().sum();

    if total > lp_staging.len() {
        return Err(Phase3Error::Inconsistency(format!(
            "{total} surviving entries overflow the staging buffer of {}",
            lp_staging.len()
        )));
    }

    // Pass 2: compact pairs and keys at each worker's prefix offset, then
    // turn the packed pairs into line points in the same slots.
    let l_window = lmap.len();
    {
        let lp_chunks = carve_chunks(&mut lp_staging[..total], &pruned_counts);
        let key_chunks = carve_chunks(&mut key_staging[..total], &pruned_counts);

        ranges
            .par_iter()
            .cloned()
            .zip(lp_chunks.into_par_iter())
            .zip(key_chunks.into_par_iter())
            .map(|((rg, lp_chunk), key_chunk)| {
                let mut n = 0usize;
                for i in rg {
                    let key = rmap[i];
                    if !marks.get(key as u64) {
                        continue;
                    }
                    let lo = left[i] as u64;
                    let hi = lo + right[i] as u64;
                    if hi as usize >= l_window {
                        return Err(Phase3Error::Inconsistency(format!(
                            "table {} pair right index {hi} outside l-window of {l_window}",
                            r.number()
                        )));
                    }
                    lp_chunk[n] = lo | (hi << 32);
                    key_chunk[n] = key;
                    n += 1;
                }
                for slot in lp_chunk[..n].iter_mut() {
                    let x = lmap[(*slot & 0xFFFF_FFFF) as usize] as u64;
                    let y = lmap[(*slot >> 32) as usize] as u64;
                    *slot = square_to_line_point(x, y);
                }
                Ok(())
            })
            .collect::<Result<(), Phase3Error>>()?;
    }

    // Pass 3: local bucket counts over the staged line points.
    let mut offsets = Vec::with_capacity(workers + 1);
    offsets.push(0usize);
    for &c in &pruned_counts {
        offsets.push(offsets.last().unwrap() + c);
    }
    let lp_slices: Vec<&[u64]> = offsets
        .windows(2)
        .map(|w| &lp_staging[w[0]..w[1]])
        .collect();
    let key_slices: Vec<&[u32]> = offsets
        .windows(2)
        .map(|w| &key_staging[w[0]..w[1]])
        .collect();

    let counts: Vec<Vec<u32>> = lp_slices
        .par_iter()
        .map(|chunk| {
            let mut c = vec![0u32; LP_BUCKET_COUNT];
            for &lp in *chunk {
                c[lp_bucket(lp)] += 1;
            }
            c
        })
        .collect();

    // Leader step: bucket totals, output loans, then the scatter.
    let totals = bucket_totals(&counts, LP_BUCKET_COUNT);
    for (acc, &t) in state.lp_bucket_counts.iter_mut().zip(&totals) {
        *acc += t;
    }

    let mut lp_out = queue.get_buffer_blocking(total * 8);
    let mut key_out = queue.get_buffer_blocking(total * 4);
    {
        let lp_regions = carve_regions(&mut lp_out.as_slice_mut::<u64>()[..total], &counts);
        let key_regions = carve_regions(&mut key_out.as_slice_mut::<u32>()[..total], &counts);

        lp_slices
            .par_iter()
            .zip(key_slices.par_iter())
            .zip(lp_regions.into_par_iter().zip(key_regions.into_par_iter()))
            .for_each(|((lp_chunk, key_chunk), (lp_regs, key_regs))| {
                let mut lp_writer = RegionWriter::new(lp_regs);
                let mut key_writer = RegionWriter::new(key_regs);
                for (&lp, &key) in lp_chunk.iter().zip(key_chunk.iter()) {
                    let b = lp_bucket(lp);
                    debug_assert!(b < LP_BUCKET_COUNT);
                    lp_writer.push(b, lp);
                    key_writer.push(b, key);
                }
            });
    }

    let lp_sizes: Vec<u32> = totals.iter().map(|&c| c * 8).collect();
    let key_sizes: Vec<u32> = totals.iter().map(|&c| c * 4).collect();
    queue.write_buckets(FileId::LinePoint(r), lp_out, lp_sizes);
    queue.write_buckets(FileId::LinePointKey(r), key_out, key_sizes);
    queue.commit();

    Ok(total as u64)
}
