//! LSD radix sort for `u64` line points with a riding `u32` key.
//! 8-bit passes, 8 rounds, stable via counting + prefix sums. Scratch is
//! caller-provided so the sort runs inside the fixed heap.

/// Sort `keys` ascending and permute `vals` accordingly. `scratch_keys` and
/// `scratch_vals` must be at least `keys.len()` long. After the even number
/// of passes the sorted data is back in `keys`/`vals`.
pub fn radix_sort_pairs(
    keys: &mut [u64],
    vals: &mut [u32],
    scratch_keys: &mut [u64],
    scratch_vals: &mut [u32],
) {
    debug_assert_eq!(keys.len(), vals.len());
    let n = keys.len();
    if n <= 1 {
        return;
    }

    let mut src_k = &mut keys[..n];
    let mut src_v = &mut vals[..n];
    let mut dst_k = &mut scratch_keys[..n];
    let mut dst_v = &mut scratch_vals[..n];

    // For each byte [0..7], perform a counting sort pass, ping-ponging
    // between the input arrays and the scratch.
    for pass in 0..8 {
        let shift = pass * 8;
        let mut counts = [0usize; 256];

        for &k in src_k.iter() {
            let byte = ((k >> shift) & 0xFF) as usize;
            counts[byte] += 1;
        }

        // Prefix sums -> positions
        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let tmp = *c;
            *c = sum;
            sum += tmp;
        }

        // Scatter to dst (stable)
        for i in 0..n {
            let k = src_k[i];
            let b = ((k >> shift) & 0xFF) as usize;
            let pos = counts[b];
            dst_k[pos] = k;
            dst_v[pos] = src_v[i];
            counts[b] = pos + 1;
        }

        std::mem::swap(&mut src_k, &mut dst_k);
        std::mem::swap(&mut src_v, &mut dst_v);
    }
}
