//! Byte-masked merge of a dirtied page into the master mapping. Bytes where
//! the working copy still equals the twin are never stored, which is what
//! lets concurrently committed writes of other workers survive the merge.

use crate::util::constants::*;
use crate::util::Address;

/// Merge one page: every byte of `local` that differs from `twin` is written
/// to `dest`; every equal byte leaves `dest` untouched.
///
/// # Safety
/// All three addresses must point at readable page-sized buffers and `dest`
/// must be writable. The buffers must not overlap.
pub unsafe fn commit_page_diffs(local: Address, twin: Address, dest: Address) {
    #[cfg(target_arch = "x86_64")]
    commit_page_diffs_sse2(local, twin, dest);
    #[cfg(not(target_arch = "x86_64"))]
    commit_page_diffs_scalar(local, twin, dest);
}

/// Vectorized merge: compare 16-byte lanes byte-wise, invert the equality
/// mask, and masked-store only the differing bytes.
#[cfg(target_arch = "x86_64")]
unsafe fn commit_page_diffs_sse2(local: Address, twin: Address, dest: Address) {
    use std::arch::x86_64::*;

    const LANE: usize = 16;
    let local = local.to_ptr::<__m128i>();
    let twin = twin.to_ptr::<__m128i>();
    let dest = dest.to_mut_ptr::<i8>();
    let allones = _mm_set1_epi8(-1);
    for i in 0..BYTES_IN_PAGE / LANE {
        let local_chunk = _mm_loadu_si128(local.add(i));
        let twin_chunk = _mm_loadu_si128(twin.add(i));
        let eq_chunk = _mm_cmpeq_epi8(local_chunk, twin_chunk);
        let neq_chunk = _mm_xor_si128(allones, eq_chunk);
        _mm_maskmoveu_si128(local_chunk, neq_chunk, dest.add(i * LANE));
    }
}

/// Word-by-word fallback with the same observable effect, modulo the
/// granularity at which unchanged bytes are skipped.
#[cfg_attr(target_arch = "x86_64", allow(dead_code))]
pub(crate) unsafe fn commit_page_diffs_scalar(local: Address, twin: Address, dest: Address) {
    let local = local.to_ptr::<usize>();
    let twin = twin.to_ptr::<usize>();
    let dest = dest.to_mut_ptr::<usize>();
    for i in 0..WORDS_IN_PAGE {
        if *local.add(i) != *twin.add(i) {
            std::ptr::write_volatile(dest.add(i), *local.add(i));
        }
    }
}

/// Merge a single word byte-wise: used by the checked commit path, which
/// walks words itself to update the counters.
///
/// # Safety
/// The three addresses must point at readable word-sized buffers and `dest`
/// must be writable.
pub unsafe fn commit_word(local: Address, twin: Address, dest: Address) {
    let local = local.to_ptr::<u8>();
    let twin = twin.to_ptr::<u8>();
    let dest = dest.to_mut_ptr::<u8>();
    for i in 0..BYTES_IN_WORD {
        if *local.add(i) != *twin.add(i) {
            std::ptr::write_volatile(dest.add(i), *local.add(i));
        }
    }
}
