//! Static plot layout: table ordinals, the file-id → name registry, the
//! shared plot context (entry and bucket counts), and engine configuration.
//!
//! The manifest (`plot.manifest`) is the hand-off record between the
//! Phase 1/2 collaborators and this engine. All integers are little-endian.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::phase3::Phase3Error;

/// Number of plot tables.
pub const TABLE_COUNT: usize = 7;

/// Extra l-table entries loaded per bucket so pairs that straddle a bucket
/// boundary can be dereferenced within one contiguous window.
pub const DEFAULT_EXTRA_L_ENTRIES: usize = 1024;

pub const MANIFEST_NAME: &str = "plot.manifest";
pub const MANIFEST_MAGIC: u32 = 0x50_33_4D_46; // "P3MF"
pub const MANIFEST_VERSION: u32 = 1;

/// Plot table ordinal, 1..=7. r-tables are 2..=7; each r-table's l-table
/// is the one before it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum TableId {
    Table1 = 1,
    Table2 = 2,
    Table3 = 3,
    Table4 = 4,
    Table5 = 5,
    Table6 = 6,
    Table7 = 7,
}

impl TableId {
    /// 0-based index for count arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// 1-based table number, for file names and logs.
    #[inline]
    pub fn number(self) -> u32 {
        self as u32
    }

    /// The l-table of this r-table.
    pub fn prev(self) -> TableId {
        match self {
            TableId::Table1 => unreachable!("table 1 has no predecessor"),
            TableId::Table2 => TableId::Table1,
            TableId::Table3 => TableId::Table2,
            TableId::Table4 => TableId::Table3,
            TableId::Table5 => TableId::Table4,
            TableId::Table6 => TableId::Table5,
            TableId::Table7 => TableId::Table6,
        }
    }

    /// The r-tables, in processing order.
    pub fn r_tables() -> impl Iterator<Item = TableId> {
        [
            TableId::Table2,
            TableId::Table3,
            TableId::Table4,
            TableId::Table5,
            TableId::Table6,
            TableId::Table7,
        ]
        .into_iter()
    }
}

/// Logical file identity. Every id maps to a bucketed stream on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FileId {
    /// Table 1 x values, the first iteration's l-input.
    X,
    /// Phase 2 survival bitmap for an r-table.
    MarkedEntries(TableId),
    /// Back-pointer left halves (u32 destination indices).
    BackPtrLeft(TableId),
    /// Back-pointer right offsets (u16 deltas).
    BackPtrRight(TableId),
    /// Original-index map for an r-table (sorted position → original index).
    OriginMap(TableId),
    /// Step 1 output: bucketed line points.
    LinePoint(TableId),
    /// Step 1 output: bucketed keys riding the line points.
    LinePointKey(TableId),
    /// Step 2 output: bucketed reverse-map records; rewritten by Step 3
    /// into the dense map consumed as the next iteration's l-input.
    LinePointMap(TableId),
}

impl FileId {
    pub fn name(self) -> String {
        match self {
            FileId::X => "x".into(),
            FileId::MarkedEntries(t) => format!("marked_{}", t.number()),
            FileId::BackPtrLeft(t) => format!("t{}_l", t.number()),
            FileId::BackPtrRight(t) => format!("t{}_r", t.number()),
            FileId::OriginMap(t) => format!("map_{}", t.number()),
            FileId::LinePoint(t) => format!("lp_{}", t.number()),
            FileId::LinePointKey(t) => format!("lp_key_{}", t.number()),
            FileId::LinePointMap(t) => format!("lp_map_{}", t.number()),
        }
    }

    /// On-disk path of one bucket of this stream.
    pub fn bucket_path(self, root: &Path, bucket: u32) -> PathBuf {
        root.join(format!("{}.b{:03}", self.name(), bucket))
    }
}

/// Shared plot state: geometry plus per-table entry and bucket counts.
///
/// `bucket_counts` partitions each table by original-y bucket;
/// `ptr_bucket_counts` partitions each r-table's pair/map streams. Only the
/// driver mutates `entry_counts`, and only between tables.
#[derive(Clone, Debug)]
pub struct PlotContext {
    pub k: u32,
    pub k_extra_bits: u32,
    pub entry_counts: [u64; TABLE_COUNT],
    pub bucket_counts: Vec<Vec<u32>>,
    pub ptr_bucket_counts: Vec<Vec<u32>>,
}

impl PlotContext {
    pub fn new(k: u32, k_extra_bits: u32) -> Self {
        assert!(
            k_extra_bits >= 1 && k_extra_bits < k,
            "k_extra_bits must be in 1..k"
        );
        let num_buckets = 1usize << k_extra_bits;
        Self {
            k,
            k_extra_bits,
            entry_counts: [0; TABLE_COUNT],
            bucket_counts: vec![vec![0; num_buckets]; TABLE_COUNT],
            ptr_bucket_counts: vec![vec![0; num_buckets]; TABLE_COUNT],
        }
    }

    /// Number of original-y buckets (`1 << k_extra_bits`).
    #[inline]
    pub fn num_buckets(&self) -> usize {
        1usize << self.k_extra_bits
    }

    /// Fixed original-index window size of one y-bucket.
    #[inline]
    pub fn bucket_window(&self) -> u64 {
        (1u64 << self.k) / self.num_buckets() as u64
    }

    /// Shift that routes a key (original index) to its y-bucket.
    #[inline]
    pub fn map_bucket_shift(&self) -> u32 {
        self.k - self.k_extra_bits
    }

    /// Total l-table length as recorded by the per-bucket counts. This is
    /// the length of the stream actually on disk, which is what the final
    /// bucket's read length is computed against.
    pub fn table_length(&self, table: TableId) -> u64 {
        self.bucket_counts[table.index()].iter().map(|&c| c as u64).sum()
    }

    /// Size in bytes of an r-table's marked-entries bitmap.
    pub fn mark_bitmap_bytes(&self) -> usize {
        crate::bitfield::BitField::required_words(1u64 << self.k) * 8
    }

    pub fn write_manifest(&self, dir: &Path) -> Result<(), Phase3Error> {
        let path = dir.join(MANIFEST_NAME);
        let mut w = BufWriter::new(File::create(path)?);
        w.write_u32::<LE>(MANIFEST_MAGIC)?;
        w.write_u32::<LE>(MANIFEST_VERSION)?;
        w.write_u16::<LE>(self.k as u16)?;
        w.write_u16::<LE>(self.k_extra_bits as u16)?;
        w.write_u32::<LE>(self.num_buckets() as u32)?;
        for &c in &self.entry_counts {
            w.write_u64::<LE>(c)?;
        }
        for counts in self.bucket_counts.iter().chain(&self.ptr_bucket_counts) {
            for &c in counts {
                w.write_u32::<LE>(c)?;
            }
        }
        w.flush()?;
        Ok(())
    }

    pub fn read_manifest(dir: &Path) -> Result<Self, Phase3Error> {
        let path = dir.join(MANIFEST_NAME);
        let mut r = BufReader::new(File::open(path)?);
        let magic = r.read_u32::<LE>()?;
        if magic != MANIFEST_MAGIC {
            return Err(Phase3Error::Manifest("bad magic".into()));
        }
        let version = r.read_u32::<LE>()?;
        if version != MANIFEST_VERSION {
            return Err(Phase3Error::Manifest(format!(
                "unsupported manifest version {version}"
            )));
        }
        let k = r.read_u16::<LE>()? as u32;
        let k_extra_bits = r.read_u16::<LE>()? as u32;
        let num_buckets = r.read_u32::<LE>()? as usize;
        if k_extra_bits >= k || num_buckets != 1usize << k_extra_bits {
            return Err(Phase3Error::Manifest("inconsistent geometry".into()));
        }
        let mut ctx = PlotContext::new(k, k_extra_bits);
        for c in ctx.entry_counts.iter_mut() {
            *c = r.read_u64::<LE>()?;
        }
        for counts in ctx
            .bucket_counts
            .iter_mut()
            .chain(ctx.ptr_bucket_counts.iter_mut())
        {
            for c in counts.iter_mut() {
                *c = r.read_u32::<LE>()?;
            }
        }
        Ok(ctx)
    }
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Phase3Config {
    extra_l_entries: usize,
    threads: Option<usize>,
    heap_size: Option<usize>,
    block_size: usize,
}

impl Default for Phase3Config {
    fn default() -> Self {
        Self {
            extra_l_entries: DEFAULT_EXTRA_L_ENTRIES,
            threads: None,
            heap_size: None,
            block_size: 4096,
        }
    }
}

impl Phase3Config {
    /// Carry size for cross-bucket pair resolution (default 1024).
    pub fn extra_l_entries(mut self, n: usize) -> Self {
        self.extra_l_entries = n.max(1);
        self
    }

    /// Fix the number of worker threads.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    /// Fixed heap budget in bytes. When unset, the minimum workable budget
    /// is computed from the plot geometry.
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = Some(bytes);
        self
    }

    /// IO block size every carved region is rounded up to.
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes.max(8);
        self
    }

    pub(crate) fn extra(&self) -> usize {
        self.extra_l_entries
    }
    pub(crate) fn thread_count(&self) -> Option<usize> {
        self.threads
    }
    pub(crate) fn heap_budget(&self) -> Option<usize> {
        self.heap_size
    }
    pub(crate) fn block(&self) -> usize {
        self.block_size
    }
}
