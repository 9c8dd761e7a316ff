//! SSE and AVX float sum kernels.
//!
//! Lanes add in source order, so results are bit-identical to the scalar kernels.

#[cfg(target_arch = "x86")]
use std::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use super::generic::trivial;

/// # Safety
///
/// Requires SSE. `dst` and every `src` must be valid for `n_samples` f32 values.
#[target_feature(enable = "sse")]
pub(crate) unsafe fn mix_f32_sse(dst: *mut u8, src: &[*const u8], n_samples: usize) {
    if trivial(dst, src, n_samples * 4, true) {
        return;
    }
    let d = dst.cast::<f32>();
    let unrolled = n_samples & !3;
    let mut i = 0;
    while i < unrolled {
        let mut acc = _mm_loadu_ps(src[0].cast::<f32>().add(i));
        for s in &src[1..] {
            acc = _mm_add_ps(acc, _mm_loadu_ps(s.cast::<f32>().add(i)));
        }
        _mm_storeu_ps(d.add(i), acc);
        i += 4;
    }
    tail_f32(d, src, unrolled, n_samples);
}

/// # Safety
///
/// Requires AVX. `dst` and every `src` must be valid for `n_samples` f32 values.
#[target_feature(enable = "avx")]
pub(crate) unsafe fn mix_f32_avx(dst: *mut u8, src: &[*const u8], n_samples: usize) {
    if trivial(dst, src, n_samples * 4, true) {
        return;
    }
    let d = dst.cast::<f32>();
    let unrolled = n_samples & !7;
    let mut i = 0;
    while i < unrolled {
        let mut acc = _mm256_loadu_ps(src[0].cast::<f32>().add(i));
        for s in &src[1..] {
            acc = _mm256_add_ps(acc, _mm256_loadu_ps(s.cast::<f32>().add(i)));
        }
        _mm256_storeu_ps(d.add(i), acc);
        i += 8;
    }
    tail_f32(d, src, unrolled, n_samples);
}

/// # Safety
///
/// Requires SSE2. `dst` and every `src` must be valid for `n_samples` f64 values.
#[target_feature(enable = "sse2")]
pub(crate) unsafe fn mix_f64_sse2(dst: *mut u8, src: &[*const u8], n_samples: usize) {
    if trivial(dst, src, n_samples * 8, true) {
        return;
    }
    let d = dst.cast::<f64>();
    let unrolled = n_samples & !1;
    let mut i = 0;
    while i < unrolled {
        let mut acc = _mm_loadu_pd(src[0].cast::<f64>().add(i));
        for s in &src[1..] {
            acc = _mm_add_pd(acc, _mm_loadu_pd(s.cast::<f64>().add(i)));
        }
        _mm_storeu_pd(d.add(i), acc);
        i += 2;
    }
    tail_f64(d, src, unrolled, n_samples);
}

/// # Safety
///
/// Requires AVX. `dst` and every `src` must be valid for `n_samples` f64 values.
#[target_feature(enable = "avx")]
pub(crate) unsafe fn mix_f64_avx(dst: *mut u8, src: &[*const u8], n_samples: usize) {
    if trivial(dst, src, n_samples * 8, true) {
        return;
    }
    let d = dst.cast::<f64>();
    let unrolled = n_samples & !3;
    let mut i = 0;
    while i < unrolled {
        let mut acc = _mm256_loadu_pd(src[0].cast::<f64>().add(i));
        for s in &src[1..] {
            acc = _mm256_add_pd(acc, _mm256_loadu_pd(s.cast::<f64>().add(i)));
        }
        _mm256_storeu_pd(d.add(i), acc);
        i += 4;
    }
    tail_f64(d, src, unrolled, n_samples);
}

#[inline(always)]
unsafe fn tail_f32(d: *mut f32, src: &[*const u8], from: usize, to: usize) {
    for i in from..to {
        let mut acc = src[0].cast::<f32>().add(i).read_unaligned();
        for s in &src[1..] {
            acc += s.cast::<f32>().add(i).read_unaligned();
        }
        d.add(i).write_unaligned(acc);
    }
}

#[inline(always)]
unsafe fn tail_f64(d: *mut f64, src: &[*const u8], from: usize, to: usize) {
    for i in from..to {
        let mut acc = src[0].cast::<f64>().add(i).read_unaligned();
        for s in &src[1..] {
            acc += s.cast::<f64>().add(i).read_unaligned();
        }
        d.add(i).write_unaligned(acc);
    }
}
