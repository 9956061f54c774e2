//! Phase 3 driver: carves the fixed heap, registers the file sets, and
//! runs the three-step compression over each r-table in order.
//!
//! Steps run sequentially; within a step, IO for bucket N+1 overlaps CPU
//! work on bucket N. All per-table state is reset between tables, and only
//! the driver publishes `entry_counts` — between steps, never during them.

use std::path::Path;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use crate::fence::Fence;
use crate::heap::{FixedHeap, IoBuf};
use crate::ioqueue::IoQueue;
use crate::layout::{FileId, Phase3Config, PlotContext, TableId};
use crate::linepoint::LP_BUCKET_COUNT;
use crate::step2::LinePointSink;
use crate::{step1, step2, step3};

/// Errors surfaced by the engine. The pipeline recovers nothing: every
/// error aborts the current table and propagates to the caller, and the
/// phase is re-runnable from the Phase 2 outputs.
#[derive(Debug, Error)]
pub enum Phase3Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("I/O failure on {name} bucket {bucket}: {source}")]
    IoFile {
        name: String,
        bucket: u32,
        source: std::io::Error,
    },
    #[error("I/O queue already failed")]
    IoQueueFailed,
    #[error("fixed heap exhausted: needed {needed} bytes, {available} available")]
    HeapExhausted { needed: usize, available: usize },
    #[error("plot state inconsistency: {0}")]
    Inconsistency(String),
    #[error("invalid manifest: {0}")]
    Manifest(String),
}

/// The fixed-heap regions the steps work in. Double-buffered slots are
/// `Option` so their contents can be handed to the IO worker and reclaimed;
/// between steps every slot is occupied.
pub(crate) struct Buffers {
    pub marks: Option<IoBuf>,
    pub lmap: [Option<IoBuf>; 2],
    pub left: [Option<IoBuf>; 2],
    pub right: [Option<IoBuf>; 2],
    pub rmap: [Option<IoBuf>; 2],
    /// Line-point staging: pruned pair/line-point slots in Step 1, sort
    /// scratch in Step 2.
    pub lp_staging: IoBuf,
    /// Pruned key staging in Step 1, sort scratch in Step 2.
    pub pruned_keys: IoBuf,
}

/// Per-table working state, reset at the start of each r-table.
pub(crate) struct TableState {
    pub pruned_count: u64,
    pub lp_bucket_counts: Vec<u32>,
    pub lmap_bucket_counts: Vec<u32>,
}

impl TableState {
    fn new(num_buckets: usize) -> Self {
        Self {
            pruned_count: 0,
            lp_bucket_counts: vec![0; LP_BUCKET_COUNT],
            lmap_bucket_counts: vec![0; num_buckets],
        }
    }
}

/// The Phase 3 table-compression engine.
pub struct Phase3<'ctx, S: LinePointSink> {
    cfg: Phase3Config,
    ctx: &'ctx mut PlotContext,
    queue: IoQueue,
    fence: Fence,
    bufs: Buffers,
    state: TableState,
    sink: S,
}

impl<'ctx, S: LinePointSink> Phase3<'ctx, S> {
    /// Carve the fixed heap, start the IO worker, and register every file
    /// set the phase touches.
    pub fn new(
        root: &Path,
        ctx: &'ctx mut PlotContext,
        cfg: Phase3Config,
        sink: S,
    ) -> Result<Self, Phase3Error> {
        if let Some(n) = cfg.thread_count() {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build_global()
                .ok();
        }

        let num_buckets = ctx.num_buckets();

        // Largest bucket across all tables and both stream kinds, padded by
        // the carry window.
        let mut max_bucket_len = 0usize;
        for t in 0..crate::layout::TABLE_COUNT {
            for b in 0..num_buckets {
                max_bucket_len = max_bucket_len
                    .max(ctx.bucket_counts[t][b] as usize)
                    .max(ctx.ptr_bucket_counts[t][b] as usize);
            }
        }
        max_bucket_len += cfg.extra();

        let block = cfg.block();
        let marks_bytes = ctx.mark_bitmap_bytes();

        let probe = FixedHeap::new(usize::MAX, block);
        let fixed_bytes = probe.block_align(marks_bytes)
            + 2 * probe.block_align(max_bucket_len * 4)   // l-map double buffer
            + 2 * probe.block_align(max_bucket_len * 4)   // left pointers
            + 2 * probe.block_align(max_bucket_len * 2)   // right offsets
            + 2 * probe.block_align(max_bucket_len * 4)   // r-map
            + probe.block_align(max_bucket_len * 4)       // pruned keys
            + probe.block_align(max_bucket_len * 8); // line-point staging
        let pool_min = 8 * probe.block_align(max_bucket_len * 8);

        let budget = cfg.heap_budget().unwrap_or(fixed_bytes + pool_min);
        if budget < fixed_bytes + pool_min {
            return Err(Phase3Error::HeapExhausted {
                needed: fixed_bytes + pool_min,
                available: budget,
            });
        }

        let mut heap = FixedHeap::new(budget, block);
        let bufs = Buffers {
            marks: Some(heap.alloc(marks_bytes)?),
            lmap: [
                Some(heap.alloc_elems::<u32>(max_bucket_len)?),
                Some(heap.alloc_elems::<u32>(max_bucket_len)?),
            ],
            left: [
                Some(heap.alloc_elems::<u32>(max_bucket_len)?),
                Some(heap.alloc_elems::<u32>(max_bucket_len)?),
            ],
            right: [
                Some(heap.alloc_elems::<u16>(max_bucket_len)?),
                Some(heap.alloc_elems::<u16>(max_bucket_len)?),
            ],
            rmap: [
                Some(heap.alloc_elems::<u32>(max_bucket_len)?),
                Some(heap.alloc_elems::<u32>(max_bucket_len)?),
            ],
            pruned_keys: heap.alloc_elems::<u32>(max_bucket_len)?,
            lp_staging: heap.alloc_elems::<u64>(max_bucket_len)?,
        };

        // Whatever was not carved becomes the loanable IO pool.
        let mut queue = IoQueue::new(root, heap.remaining(), block);

        queue.init_file_set(FileId::X, 1, false);
        for r in TableId::r_tables() {
            queue.init_file_set(FileId::MarkedEntries(r), 1, false);
            queue.init_file_set(FileId::BackPtrLeft(r), 1, false);
            queue.init_file_set(FileId::BackPtrRight(r), 1, false);
            queue.init_file_set(FileId::OriginMap(r), 1, false);
            queue.init_file_set(FileId::LinePoint(r), LP_BUCKET_COUNT as u32, true);
            queue.init_file_set(FileId::LinePointKey(r), LP_BUCKET_COUNT as u32, true);
            queue.init_file_set(FileId::LinePointMap(r), num_buckets as u32, true);
        }
        queue.commit();

        Ok(Self {
            cfg,
            ctx,
            queue,
            fence: Fence::new(),
            bufs,
            state: TableState::new(num_buckets),
            sink,
        })
    }

    /// Compress tables 2..=7.
    pub fn run(&mut self) -> Result<(), Phase3Error> {
        for r in TableId::r_tables() {
            info!(
                "Compressing tables {} and {}...",
                r.prev().number(),
                r.number()
            );
            let timer = Instant::now();
            self.process_table(r)?;
            info!(
                "Finished compression in {:.2} seconds.",
                timer.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// Stop the IO worker and surface any deferred error.
    pub fn finish(self) -> Result<S, Phase3Error> {
        self.queue.shutdown()?;
        Ok(self.sink)
    }

    fn process_table(&mut self, r: TableId) -> Result<(), Phase3Error> {
        let ri = r.index();
        self.state = TableState::new(self.ctx.num_buckets());
        self.fence.reset(0);

        // Prune the pairs and key, convert the pairs to line points, and
        // distribute them to buckets along with the key.
        step1::run(
            &self.cfg,
            self.ctx,
            &mut self.queue,
            &self.fence,
            &mut self.bufs,
            &mut self.state,
            r,
        )?;

        let lp_total: u64 = self.state.lp_bucket_counts.iter().map(|&c| c as u64).sum();
        if lp_total != self.state.pruned_count {
            return Err(Phase3Error::Inconsistency(format!(
                "table {} line-point buckets hold {lp_total} entries, expected {}",
                r.number(),
                self.state.pruned_count
            )));
        }
        debug!(
            "table {}: step 1 pruned to {} entries",
            r.number(),
            self.state.pruned_count
        );

        // Sort each line-point bucket with its key, emit the sorted line
        // points downstream, and write the reverse lookup map.
        step2::run(
            self.ctx,
            &mut self.queue,
            &self.fence,
            &mut self.bufs,
            &mut self.state,
            r,
            &mut self.sink,
        )?;

        let map_total: u64 = self.state.lmap_bucket_counts.iter().map(|&c| c as u64).sum();
        if map_total != self.state.pruned_count {
            return Err(Phase3Error::Inconsistency(format!(
                "table {} reverse-map buckets hold {map_total} entries, expected {}",
                r.number(),
                self.state.pruned_count
            )));
        }

        // Unpack the map to serve as the l-table of the next iteration.
        step3::run(self.ctx, &mut self.queue, &self.fence, &mut self.state, r)?;
        self.queue.check_error()?;

        let old_count = self.ctx.entry_counts[ri];
        let pct = if old_count > 0 {
            self.state.pruned_count as f64 / old_count as f64 * 100.0
        } else {
            0.0
        };
        info!(
            " Table {} now has {} / {} ({:.2}%) entries.",
            r.number(),
            self.state.pruned_count,
            old_count,
            pct
        );
        self.ctx.entry_counts[ri] = self.state.pruned_count;

        Ok(())
    }
}
