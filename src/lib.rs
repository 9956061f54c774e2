//! Phase 3 table compression for a disk-based proof-of-space plotter.
//!
//! For each r-table in 2..=7 (with l-table = r − 1) the engine runs three
//! bucketed, out-of-core steps:
//!
//! 1. **Prune & linepoint** — stream l/r buckets, drop unmarked r-entries,
//!    resolve surviving back-pointer pairs against the l-window, encode
//!    each pair as a line point, scatter `(line point, key)` to 256
//!    buckets.
//! 2. **Sort & reverse-map** — radix-sort each line-point bucket with the
//!    key riding along, hand the sorted bucket downstream, and scatter
//!    `(sorted position, original index)` records to the reverse-map
//!    buckets.
//! 3. **Unpack** — densify each reverse-map bucket into a positional array
//!    and rewrite it as one contiguous stream: the next iteration's
//!    l-table.
//!
//! Memory is a fixed budget carved once up front; disk IO runs on a single
//! background worker with double-buffered read-ahead and fence
//! synchronization. See `DESIGN.md` for the layout of the work directory.

pub mod bitfield;
mod fence;
mod heap;
mod ioqueue;
pub mod layout;
pub mod linepoint;
mod phase3;
mod radix;
mod scatter;
mod step1;
mod step2;
mod step3;

pub use crate::fence::Fence;
pub use crate::ioqueue::{IoQueue, SeekOrigin};
pub use crate::layout::{FileId, Phase3Config, PlotContext, TableId};
pub use crate::phase3::{Phase3, Phase3Error};
pub use crate::step2::{LinePointSink, NullSink};
