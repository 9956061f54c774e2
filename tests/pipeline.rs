//! End-to-end pipeline tests over miniature plots (k = 8), checked against
//! a naive in-memory implementation of the same three steps.

use std::fs;
use std::path::Path;

use plotpress::bitfield::{BitField, BitFieldMut};
use plotpress::linepoint::square_to_line_point;
use plotpress::{
    FileId, LinePointSink, Phase3, Phase3Config, Phase3Error, PlotContext, TableId,
};

const LP_BUCKETS: usize = 256;

/// One r-table of a synthetic plot. `entries` is the pair stream in bucket
/// order: `(left, right_offset, original_index)`.
struct TableSpec {
    bucket_counts: Vec<u32>,
    ptr_bucket_counts: Vec<u32>,
    entries: Vec<(u32, u16, u32)>,
    marked: Vec<u32>,
}

struct PlotSpec {
    k: u32,
    k_extra_bits: u32,
    x_bucket_counts: Vec<u32>,
    x: Vec<u32>,
    tables: Vec<TableSpec>,
}

impl PlotSpec {
    fn num_buckets(&self) -> usize {
        1usize << self.k_extra_bits
    }

    fn window(&self) -> u64 {
        (1u64 << self.k) / self.num_buckets() as u64
    }
}

fn r_table(i: usize) -> TableId {
    TableId::r_tables().nth(i).unwrap()
}

fn write_pods<T: bytemuck::Pod>(path: &Path, vals: &[T]) {
    fs::write(path, bytemuck::cast_slice::<T, u8>(vals)).unwrap();
}

/// Lay the plot spec out on disk the way Phases 1/2 would, and build the
/// matching context.
fn write_plot(dir: &Path, spec: &PlotSpec) -> PlotContext {
    let mut ctx = PlotContext::new(spec.k, spec.k_extra_bits);
    assert_eq!(spec.x_bucket_counts.len(), spec.num_buckets());
    ctx.bucket_counts[0] = spec.x_bucket_counts.clone();
    ctx.entry_counts[0] = spec.x.len() as u64;
    write_pods(&FileId::X.bucket_path(dir, 0), &spec.x);

    let mark_words = BitField::required_words(1u64 << spec.k);

    for (i, t) in spec.tables.iter().enumerate() {
        let r = r_table(i);
        assert_eq!(
            t.bucket_counts.iter().sum::<u32>() as usize,
            t.entries.len(),
            "table {} bucket counts must cover its entries",
            r.number()
        );
        assert_eq!(
            t.ptr_bucket_counts.iter().sum::<u32>() as usize,
            t.entries.len()
        );

        ctx.bucket_counts[r.index()] = t.bucket_counts.clone();
        ctx.ptr_bucket_counts[r.index()] = t.ptr_bucket_counts.clone();
        ctx.entry_counts[r.index()] = t.entries.len() as u64;

        let lefts: Vec<u32> = t.entries.iter().map(|e| e.0).collect();
        let rights: Vec<u16> = t.entries.iter().map(|e| e.1).collect();
        let origs: Vec<u32> = t.entries.iter().map(|e| e.2).collect();
        write_pods(&FileId::BackPtrLeft(r).bucket_path(dir, 0), &lefts);
        write_pods(&FileId::BackPtrRight(r).bucket_path(dir, 0), &rights);
        write_pods(&FileId::OriginMap(r).bucket_path(dir, 0), &origs);

        let mut words = vec![0u64; mark_words];
        {
            let mut marks = BitFieldMut::new(&mut words);
            for &m in &t.marked {
                marks.set(m as u64);
            }
        }
        write_pods(&FileId::MarkedEntries(r).bucket_path(dir, 0), &words);
    }

    ctx
}

struct TableRef {
    pruned: u64,
    /// `(line point, key)` concatenated in lp-bucket order, each bucket
    /// sorted by line point.
    sorted: Vec<(u64, u32)>,
    /// Dense l-stream this table leaves for the next iteration.
    dense: Vec<u32>,
}

fn cumsum(v: &[u32]) -> Vec<u64> {
    let mut out = Vec::with_capacity(v.len() + 1);
    let mut acc = 0u64;
    out.push(0);
    for &c in v {
        acc += c as u64;
        out.push(acc);
    }
    out
}

/// The whole phase, naively, on concatenated in-memory arrays.
fn reference_phase3(spec: &PlotSpec) -> Vec<TableRef> {
    let window = spec.window();
    let mut l_values: Vec<u32> = spec.x.clone();
    let mut l_counts: Vec<u32> = spec.x_bucket_counts.clone();
    let mut out = Vec::new();

    for t in &spec.tables {
        let marked: std::collections::HashSet<u32> = t.marked.iter().copied().collect();
        let l_bases = cumsum(&l_counts);

        let mut survivors: Vec<(u64, u32)> = Vec::new();
        let mut p = 0usize;
        for (b, &count) in t.ptr_bucket_counts.iter().enumerate() {
            for _ in 0..count {
                let (left, off, orig) = t.entries[p];
                p += 1;
                if !marked.contains(&orig) {
                    continue;
                }
                let gl = (l_bases[b] + left as u64) as usize;
                let gr = gl + off as usize;
                let lp = square_to_line_point(l_values[gl] as u64, l_values[gr] as u64);
                survivors.push((lp, orig));
            }
        }

        let mut buckets: Vec<Vec<(u64, u32)>> = (0..LP_BUCKETS).map(|_| Vec::new()).collect();
        for s in &survivors {
            buckets[(s.0 >> 56) as usize].push(*s);
        }

        let r_bases = cumsum(&t.bucket_counts);
        let mut dense = vec![0u32; *r_bases.last().unwrap() as usize];
        let mut sorted = Vec::with_capacity(survivors.len());
        let mut pos = 0u32;
        for bucket in &mut buckets {
            bucket.sort_by_key(|e| e.0);
            for &(lp, orig) in bucket.iter() {
                let c = (orig as u64 / window) as usize;
                let local = orig as u64 - c as u64 * window;
                dense[(r_bases[c] + local) as usize] = pos;
                sorted.push((lp, orig));
                pos += 1;
            }
        }

        out.push(TableRef {
            pruned: survivors.len() as u64,
            sorted,
            dense: dense.clone(),
        });
        l_values = dense;
        l_counts = t.bucket_counts.clone();
    }

    out
}

/// Records every sorted bucket the engine hands downstream.
#[derive(Default)]
struct CollectSink {
    puts: Vec<(u64, Vec<u64>, Vec<u32>)>,
}

impl LinePointSink for CollectSink {
    fn put(
        &mut self,
        line_points: &[u64],
        keys: &[u32],
        global_offset: u64,
    ) -> Result<(), Phase3Error> {
        self.puts.push((global_offset, line_points.to_vec(), keys.to_vec()));
        Ok(())
    }
}

fn run_engine(dir: &Path, spec: &PlotSpec, extra: usize) -> (PlotContext, CollectSink) {
    let mut ctx = write_plot(dir, spec);
    let cfg = Phase3Config::default()
        .extra_l_entries(extra)
        .block_size(64)
        .heap_size(1 << 20);
    let mut phase = Phase3::new(dir, &mut ctx, cfg, CollectSink::default()).unwrap();
    phase.run().unwrap();
    let sink = phase.finish().unwrap();
    (ctx, sink)
}

/// The sink sees 256 puts per table; regroup them.
fn sink_tables(sink: &CollectSink) -> Vec<Vec<(u64, Vec<u64>, Vec<u32>)>> {
    assert_eq!(sink.puts.len(), 6 * LP_BUCKETS);
    sink.puts.chunks(LP_BUCKETS).map(|c| c.to_vec()).collect()
}

fn read_dense(dir: &Path, r: TableId, len: usize) -> Vec<u32> {
    let bytes = fs::read(FileId::LinePointMap(r).bucket_path(dir, 0)).unwrap();
    // The dense rewrite may leave a stale tail beyond the stream length.
    bytemuck::cast_slice::<u8, u32>(&bytes[..len * 4]).to_vec()
}

fn assert_matches_reference(dir: &Path, spec: &PlotSpec, ctx: &PlotContext, sink: &CollectSink) {
    let reference = reference_phase3(spec);
    let tables = sink_tables(sink);

    for (i, (r_ref, puts)) in reference.iter().zip(&tables).enumerate() {
        let r = r_table(i);
        assert_eq!(
            ctx.entry_counts[r.index()],
            r_ref.pruned,
            "table {} pruned count",
            r.number()
        );

        let mut engine_sorted = Vec::new();
        let mut expected_offset = 0u64;
        for (bucket, (offset, lps, keys)) in puts.iter().enumerate() {
            assert_eq!(*offset, expected_offset);
            expected_offset += lps.len() as u64;
            assert!(lps.windows(2).all(|w| w[0] <= w[1]), "bucket not sorted");
            for &lp in lps {
                assert_eq!((lp >> 56) as usize, bucket, "line point in wrong bucket");
            }
            engine_sorted.extend(lps.iter().copied().zip(keys.iter().copied()));
        }
        assert_eq!(
            engine_sorted, r_ref.sorted,
            "table {} sorted (lp, key) stream",
            r.number()
        );

        let dense = read_dense(dir, r, r_ref.dense.len());
        assert_eq!(dense, r_ref.dense, "table {} dense map", r.number());
    }
}

// ---- deterministic pseudo-random plot construction ----

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 11
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n.max(1)
    }

    fn chance(&mut self, permille: u64) -> bool {
        self.below(1000) < permille
    }
}

/// A full 7-table plot with valid geometry: every pair resolves inside its
/// l-window and every original index sits in its y-bucket window.
fn random_plot(seed: u64, mark_permille: u64) -> PlotSpec {
    let k = 8u32;
    let k_extra_bits = 2u32;
    let num_buckets = 4usize;
    let window = 64u64;
    let extra = 4usize;
    let mut rng = Lcg(seed);

    let x_bucket_counts: Vec<u32> = (0..num_buckets)
        .map(|_| 12 + rng.below(6) as u32)
        .collect();
    let x: Vec<u32> = (0..x_bucket_counts.iter().sum::<u32>())
        .map(|_| rng.below(1 << k) as u32)
        .collect();

    let mut tables = Vec::new();
    let mut l_counts = x_bucket_counts.clone();
    for _ in 0..6 {
        let bucket_counts: Vec<u32> = (0..num_buckets)
            .map(|_| 10 + rng.below(6) as u32)
            .collect();
        let total: u32 = bucket_counts.iter().sum();

        // The pair stream reuses the same partitioning, shuffled a little:
        // move one entry from the fullest to the emptiest bucket.
        let mut ptr_bucket_counts = bucket_counts.clone();
        let hi = (0..num_buckets).max_by_key(|&b| ptr_bucket_counts[b]).unwrap();
        let lo = (0..num_buckets).min_by_key(|&b| ptr_bucket_counts[b]).unwrap();
        ptr_bucket_counts[hi] -= 1;
        ptr_bucket_counts[lo] += 1;

        // Original indices: every y-bucket's window prefix, shuffled across
        // the stream.
        let mut origs: Vec<u32> = bucket_counts
            .iter()
            .enumerate()
            .flat_map(|(c, &n)| (0..n).map(move |j| (c as u64 * window + j as u64) as u32))
            .collect();
        for i in (1..origs.len()).rev() {
            origs.swap(i, rng.below(i as u64 + 1) as usize);
        }

        let mut entries = Vec::with_capacity(total as usize);
        let mut p = 0usize;
        for (b, &count) in ptr_bucket_counts.iter().enumerate() {
            let window_len = if b + 1 == num_buckets {
                l_counts[b] as usize
            } else {
                l_counts[b] as usize + extra
            };
            for _ in 0..count {
                let left = rng.below(window_len as u64 - 1) as u32;
                let max_off = (window_len - 1 - left as usize).min(u16::MAX as usize) as u64;
                let off = 1 + rng.below(max_off) as u16;
                entries.push((left, off, origs[p]));
                p += 1;
            }
        }

        let marked: Vec<u32> = origs
            .iter()
            .copied()
            .filter(|_| rng.chance(mark_permille))
            .collect();

        tables.push(TableSpec {
            bucket_counts,
            ptr_bucket_counts,
            entries,
            marked,
        });
        l_counts = tables.last().unwrap().bucket_counts.clone();
    }

    PlotSpec {
        k,
        k_extra_bits,
        x_bucket_counts,
        x,
        tables,
    }
}

// ---- scenarios ----

/// S1: nothing survives. Every output bucket stays empty and the dense
/// l-input for the next iteration still exists on disk.
#[test]
fn s1_all_pruned_produces_empty_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let spec = random_plot(11, 0);
    let (ctx, sink) = run_engine(dir.path(), &spec, 4);

    for r in TableId::r_tables() {
        assert_eq!(ctx.entry_counts[r.index()], 0);
    }
    for (offset, lps, keys) in &sink.puts {
        assert_eq!(*offset, 0);
        assert!(lps.is_empty() && keys.is_empty());
    }
    for r in TableId::r_tables() {
        for bucket in 0..LP_BUCKETS as u32 {
            let lp = fs::metadata(FileId::LinePoint(r).bucket_path(dir.path(), bucket)).unwrap();
            assert_eq!(lp.len(), 0, "lp bucket {bucket} not empty");
        }
        assert!(FileId::LinePointMap(r).bucket_path(dir.path(), 0).exists());
    }
    assert_matches_reference(dir.path(), &spec, &ctx, &sink);
}

/// S2: four marked entries chained over known l-values produce the four
/// expected line points, in ascending order, with their keys attached.
#[test]
fn s2_known_line_points_sort_ascending() {
    let spec = PlotSpec {
        k: 8,
        k_extra_bits: 1,
        x_bucket_counts: vec![5, 3],
        x: vec![10, 20, 30, 40, 50, 60, 70, 80],
        tables: vec![
            TableSpec {
                bucket_counts: vec![2, 2],
                ptr_bucket_counts: vec![4, 0],
                entries: vec![(0, 1, 0), (1, 1, 1), (2, 1, 128), (3, 1, 129)],
                marked: vec![0, 1, 128, 129],
            },
            quiet_table(),
            quiet_table(),
            quiet_table(),
            quiet_table(),
            quiet_table(),
        ],
    };

    let dir = tempfile::tempdir().unwrap();
    let (ctx, sink) = run_engine(dir.path(), &spec, 2);

    assert_eq!(ctx.entry_counts[TableId::Table2.index()], 4);
    let tables = sink_tables(&sink);
    let (_, lps, keys) = &tables[0][0];
    assert_eq!(
        lps,
        &vec![
            square_to_line_point(10, 20),
            square_to_line_point(20, 30),
            square_to_line_point(30, 40),
            square_to_line_point(40, 50),
        ]
    );
    assert!(lps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys, &vec![0, 1, 128, 129]);
    assert_matches_reference(dir.path(), &spec, &ctx, &sink);
}

/// A 4-entry table with nothing marked, valid as both r-table and l-table
/// when every bucket holds 2 entries (k = 8, two buckets, carry = 2).
fn quiet_table() -> TableSpec {
    TableSpec {
        bucket_counts: vec![2, 2],
        ptr_bucket_counts: vec![2, 2],
        entries: vec![(0, 1, 0), (1, 1, 1), (0, 1, 128), (0, 1, 129)],
        marked: vec![],
    }
}

/// S3: a pair whose right index lands in the carry region must resolve
/// exactly as the in-memory reference computed on the concatenated array.
#[test]
fn s3_cross_bucket_pair_uses_carry() {
    let spec = PlotSpec {
        k: 8,
        k_extra_bits: 1,
        x_bucket_counts: vec![6, 4],
        x: vec![5, 10, 15, 20, 25, 30, 35, 40, 45, 50],
        tables: vec![
            TableSpec {
                bucket_counts: vec![2, 2],
                ptr_bucket_counts: vec![3, 1],
                // (4, 2) and (5, 2) dereference x[6] and x[7]: the first
                // two entries of bucket 1, visible only through the carry.
                entries: vec![(0, 3, 0), (4, 2, 1), (5, 2, 128), (1, 2, 129)],
                marked: vec![0, 1, 128, 129],
            },
            quiet_table(),
            quiet_table(),
            quiet_table(),
            quiet_table(),
            quiet_table(),
        ],
    };

    let dir = tempfile::tempdir().unwrap();
    let (ctx, sink) = run_engine(dir.path(), &spec, 2);

    assert_eq!(ctx.entry_counts[TableId::Table2.index()], 4);
    let tables = sink_tables(&sink);
    let lps: &Vec<u64> = &tables[0][0].1;
    assert!(lps.contains(&square_to_line_point(25, 35)));
    assert!(lps.contains(&square_to_line_point(30, 40)));
    assert_matches_reference(dir.path(), &spec, &ctx, &sink);
}

/// S4: duplicate line points keep their keys attached through the sort.
#[test]
fn s4_duplicate_line_points_keep_key_association() {
    let spec = PlotSpec {
        k: 8,
        k_extra_bits: 1,
        x_bucket_counts: vec![5, 3],
        x: vec![10, 20, 30, 40, 50, 60, 70, 80],
        tables: vec![
            TableSpec {
                bucket_counts: vec![2, 2],
                ptr_bucket_counts: vec![4, 0],
                // Two identical pairs -> one duplicated line point.
                entries: vec![(0, 1, 0), (0, 1, 1), (2, 1, 128), (3, 2, 129)],
                marked: vec![0, 1, 128, 129],
            },
            quiet_table(),
            quiet_table(),
            quiet_table(),
            quiet_table(),
            quiet_table(),
        ],
    };

    let dir = tempfile::tempdir().unwrap();
    let (ctx, sink) = run_engine(dir.path(), &spec, 2);

    let tables = sink_tables(&sink);
    let (_, lps, keys) = &tables[0][0];
    let dup = square_to_line_point(10, 20);
    let dup_keys: std::collections::HashSet<u32> = lps
        .iter()
        .zip(keys)
        .filter(|&(&lp, _)| lp == dup)
        .map(|(_, &k)| k)
        .collect();
    assert_eq!(dup_keys, [0u32, 1].into_iter().collect());
    assert_matches_reference(dir.path(), &spec, &ctx, &sink);
}

/// S5 and the conservation properties: iterating r = 2..=7 over a random
/// plot matches the naive reference table for table, including the dense
/// map each iteration feeds the next.
#[test]
fn s5_iterations_match_in_memory_reference() {
    for seed in [1u64, 7, 42] {
        let dir = tempfile::tempdir().unwrap();
        let spec = random_plot(seed, 600);
        let (ctx, sink) = run_engine(dir.path(), &spec, 4);

        // Prune conservation: pruned count == popcount of the bitmap.
        for (i, t) in spec.tables.iter().enumerate() {
            assert_eq!(
                ctx.entry_counts[r_table(i).index()],
                t.marked.len() as u64,
                "seed {seed}"
            );
        }
        assert_matches_reference(dir.path(), &spec, &ctx, &sink);
    }
}

/// Everything marked: nothing is pruned and the whole table flows through.
#[test]
fn full_density_keeps_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let spec = random_plot(23, 1000);
    let (ctx, sink) = run_engine(dir.path(), &spec, 4);

    for (i, t) in spec.tables.iter().enumerate() {
        assert_eq!(
            ctx.entry_counts[r_table(i).index()],
            t.entries.len() as u64
        );
    }
    assert_matches_reference(dir.path(), &spec, &ctx, &sink);
}
