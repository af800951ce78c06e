//! Vectorized delimiter search for the key-parser fast path.
//!
//! Finds the ascending, non-overlapping occurrences of a delimiter inside a
//! key. The candidate positions are located by comparing the delimiter's
//! first byte across 16- or 32-byte chunks; each candidate is then verified
//! against the full delimiter. The implementation is picked once per process
//! from CPU features (AVX2 > SSE2 > NEON > scalar) and cached.

use std::sync::OnceLock;

/// Signature shared by every delimiter-finder implementation.
///
/// Fills `positions` with the byte offsets of non-overlapping occurrences of
/// `delim` in `data[start..]`, ascending, stopping at the array's capacity.
/// Returns the number of positions written. `delim` must be non-empty.
pub type FindDelimitersFn = fn(data: &[u8], start: usize, delim: &[u8], positions: &mut [usize]) -> usize;

/// Reference implementation; also the portable fallback.
pub fn find_delimiters_scalar(
    data: &[u8],
    start: usize,
    delim: &[u8],
    positions: &mut [usize],
) -> usize {
    let mut count = 0;
    let mut pos = start;
    while pos + delim.len() <= data.len() && count < positions.len() {
        if data[pos] == delim[0] && data[pos..pos + delim.len()] == *delim {
            positions[count] = pos;
            count += 1;
            pos += delim.len();
        } else {
            pos += 1;
        }
    }
    count
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::x86_64::*;

    /// SSE2 variant: 16 candidate bytes per iteration.
    #[target_feature(enable = "sse2")]
    pub unsafe fn find_delimiters_sse2(
        data: &[u8],
        start: usize,
        delim: &[u8],
        positions: &mut [usize],
    ) -> usize {
        let first = _mm_set1_epi8(delim[0] as i8);
        let mut count = 0;
        let mut i = start;
        let mut min_next_pos = start;

        while i + 16 <= data.len() && count < positions.len() {
            let chunk = _mm_loadu_si128(data.as_ptr().add(i) as *const __m128i);
            let eq = _mm_cmpeq_epi8(chunk, first);
            let mut mask = _mm_movemask_epi8(eq) as u32;

            while mask != 0 && count < positions.len() {
                let bit = mask.trailing_zeros() as usize;
                let pos = i + bit;
                if pos >= min_next_pos
                    && pos + delim.len() <= data.len()
                    && data[pos..pos + delim.len()] == *delim
                {
                    positions[count] = pos;
                    count += 1;
                    min_next_pos = pos + delim.len();
                }
                mask &= mask - 1;
            }
            i += 16;
        }

        super::scalar_tail(data, i.max(min_next_pos), delim, positions, count)
    }

    /// AVX2 variant: 32 candidate bytes per iteration.
    #[target_feature(enable = "avx2")]
    pub unsafe fn find_delimiters_avx2(
        data: &[u8],
        start: usize,
        delim: &[u8],
        positions: &mut [usize],
    ) -> usize {
        let first = _mm256_set1_epi8(delim[0] as i8);
        let mut count = 0;
        let mut i = start;
        let mut min_next_pos = start;

        while i + 32 <= data.len() && count < positions.len() {
            let chunk = _mm256_loadu_si256(data.as_ptr().add(i) as *const __m256i);
            let eq = _mm256_cmpeq_epi8(chunk, first);
            let mut mask = _mm256_movemask_epi8(eq) as u32;

            while mask != 0 && count < positions.len() {
                let bit = mask.trailing_zeros() as usize;
                let pos = i + bit;
                if pos >= min_next_pos
                    && pos + delim.len() <= data.len()
                    && data[pos..pos + delim.len()] == *delim
                {
                    positions[count] = pos;
                    count += 1;
                    min_next_pos = pos + delim.len();
                }
                mask &= mask - 1;
            }
            i += 32;
        }

        super::scalar_tail(data, i.max(min_next_pos), delim, positions, count)
    }
}

#[cfg(target_arch = "aarch64")]
mod arm {
    use std::arch::aarch64::*;

    /// NEON lacks a movemask; pack the 16 byte-lane comparison results into a
    /// 16-bit mask with a pairwise-add chain.
    #[inline]
    unsafe fn neon_movemask_u8(v: uint8x16_t) -> u16 {
        const BIT_MASK: [u8; 16] = [1, 2, 4, 8, 16, 32, 64, 128, 1, 2, 4, 8, 16, 32, 64, 128];
        let bit_mask = vld1q_u8(BIT_MASK.as_ptr());
        let masked = vandq_u8(v, bit_mask);

        let mut lo = vget_low_u8(masked);
        let mut hi = vget_high_u8(masked);
        lo = vpadd_u8(lo, lo);
        lo = vpadd_u8(lo, lo);
        lo = vpadd_u8(lo, lo);
        hi = vpadd_u8(hi, hi);
        hi = vpadd_u8(hi, hi);
        hi = vpadd_u8(hi, hi);

        (vget_lane_u8::<0>(lo) as u16) | ((vget_lane_u8::<0>(hi) as u16) << 8)
    }

    /// NEON variant: 16 candidate bytes per iteration.
    #[target_feature(enable = "neon")]
    pub unsafe fn find_delimiters_neon(
        data: &[u8],
        start: usize,
        delim: &[u8],
        positions: &mut [usize],
    ) -> usize {
        let first = vdupq_n_u8(delim[0]);
        let mut count = 0;
        let mut i = start;
        let mut min_next_pos = start;

        while i + 16 <= data.len() && count < positions.len() {
            let chunk = vld1q_u8(data.as_ptr().add(i));
            let eq = vceqq_u8(chunk, first);
            let mut mask = neon_movemask_u8(eq) as u32;

            while mask != 0 && count < positions.len() {
                let bit = mask.trailing_zeros() as usize;
                let pos = i + bit;
                if pos >= min_next_pos
                    && pos + delim.len() <= data.len()
                    && data[pos..pos + delim.len()] == *delim
                {
                    positions[count] = pos;
                    count += 1;
                    min_next_pos = pos + delim.len();
                }
                mask &= mask - 1;
            }
            i += 16;
        }

        super::scalar_tail(data, i.max(min_next_pos), delim, positions, count)
    }
}

/// Finishes the byte range a vector loop could not cover.
fn scalar_tail(
    data: &[u8],
    from: usize,
    delim: &[u8],
    positions: &mut [usize],
    mut count: usize,
) -> usize {
    let mut pos = from;
    while pos + delim.len() <= data.len() && count < positions.len() {
        if data[pos] == delim[0] && data[pos..pos + delim.len()] == *delim {
            positions[count] = pos;
            count += 1;
            pos += delim.len();
        } else {
            pos += 1;
        }
    }
    count
}

#[cfg(target_arch = "x86_64")]
fn find_delimiters_sse2_dispatch(
    data: &[u8],
    start: usize,
    delim: &[u8],
    positions: &mut [usize],
) -> usize {
    // Feature presence was verified by `select_implementation`.
    unsafe { x86::find_delimiters_sse2(data, start, delim, positions) }
}

#[cfg(target_arch = "x86_64")]
fn find_delimiters_avx2_dispatch(
    data: &[u8],
    start: usize,
    delim: &[u8],
    positions: &mut [usize],
) -> usize {
    unsafe { x86::find_delimiters_avx2(data, start, delim, positions) }
}

#[cfg(target_arch = "aarch64")]
fn find_delimiters_neon_dispatch(
    data: &[u8],
    start: usize,
    delim: &[u8],
    positions: &mut [usize],
) -> usize {
    unsafe { arm::find_delimiters_neon(data, start, delim, positions) }
}

#[allow(unreachable_code)]
fn select_implementation() -> (&'static str, FindDelimitersFn) {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return ("AVX2", find_delimiters_avx2_dispatch);
        }
        if is_x86_feature_detected!("sse2") {
            return ("SSE2", find_delimiters_sse2_dispatch);
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return ("NEON", find_delimiters_neon_dispatch);
    }
    ("scalar", find_delimiters_scalar)
}

fn dispatch() -> &'static (&'static str, FindDelimitersFn) {
    static SELECTED: OnceLock<(&'static str, FindDelimitersFn)> = OnceLock::new();
    SELECTED.get_or_init(select_implementation)
}

/// Best available delimiter finder for this machine, selected once.
pub fn find_delimiters() -> FindDelimitersFn {
    dispatch().1
}

/// Name of the selected implementation, for diagnostics.
pub fn implementation_name() -> &'static str {
    dispatch().0
}

/// Every implementation runnable on this machine, for equivalence testing.
#[cfg(test)]
pub(crate) fn runnable_implementations() -> Vec<(&'static str, FindDelimitersFn)> {
    let mut all: Vec<(&'static str, FindDelimitersFn)> = vec![("scalar", find_delimiters_scalar)];
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("sse2") {
            all.push(("SSE2", find_delimiters_sse2_dispatch));
        }
        if is_x86_feature_detected!("avx2") {
            all.push(("AVX2", find_delimiters_avx2_dispatch));
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        all.push(("NEON", find_delimiters_neon_dispatch));
    }
    all
}
