//! Scalar kernels for every encoding.
//!
//! Integer samples are widened to i64, summed, and saturated once to the
//! encoding's range. Unsigned encodings are re-centred around zero on read and
//! re-biased on write. Floats are summed without clamping.

use std::ptr;

pub(crate) trait IntSample {
    const WIDTH: usize;
    const MIN: i64;
    const MAX: i64;
    /// Whether all-zero bytes are silence.
    const HAS_SILENCE: bool;

    /// Reads one sample as a signed value centred on zero.
    unsafe fn read(p: *const u8) -> i64;

    /// Writes a value already clamped to `MIN..=MAX`.
    unsafe fn write(p: *mut u8, v: i64);
}

macro_rules! int_sample {
    ($name:ident, $raw:ty, $min:expr, $max:expr, $bias:expr, $silence:expr) => {
        pub(crate) struct $name;

        impl IntSample for $name {
            const WIDTH: usize = std::mem::size_of::<$raw>();
            const MIN: i64 = $min;
            const MAX: i64 = $max;
            const HAS_SILENCE: bool = $silence;

            #[inline(always)]
            unsafe fn read(p: *const u8) -> i64 {
                ptr::read_unaligned(p.cast::<$raw>()) as i64 - $bias
            }

            #[inline(always)]
            unsafe fn write(p: *mut u8, v: i64) {
                ptr::write_unaligned(p.cast::<$raw>(), (v + $bias) as $raw)
            }
        }
    };
}

int_sample!(S8, i8, i8::MIN as i64, i8::MAX as i64, 0, true);
int_sample!(U8, u8, i8::MIN as i64, i8::MAX as i64, 0x80, false);
int_sample!(S16, i16, i16::MIN as i64, i16::MAX as i64, 0, true);
int_sample!(U16, u16, i16::MIN as i64, i16::MAX as i64, 0x8000, false);
int_sample!(S32, i32, i32::MIN as i64, i32::MAX as i64, 0, true);
int_sample!(U32, u32, i32::MIN as i64, i32::MAX as i64, 0x8000_0000, false);

const S24_MIN: i64 = -(1 << 23);
const S24_MAX: i64 = (1 << 23) - 1;
const U24_BIAS: i64 = 1 << 23;

#[inline(always)]
unsafe fn read_u24(p: *const u8) -> u32 {
    let b = [*p, *p.add(1), *p.add(2)];
    if cfg!(target_endian = "little") {
        u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16
    } else {
        u32::from(b[2]) | u32::from(b[1]) << 8 | u32::from(b[0]) << 16
    }
}

#[inline(always)]
unsafe fn write_u24(p: *mut u8, v: u32) {
    let (lo, mid, hi) = (v as u8, (v >> 8) as u8, (v >> 16) as u8);
    if cfg!(target_endian = "little") {
        *p = lo;
        *p.add(1) = mid;
        *p.add(2) = hi;
    } else {
        *p = hi;
        *p.add(1) = mid;
        *p.add(2) = lo;
    }
}

#[inline(always)]
fn sign_extend_24(v: u32) -> i64 {
    (((v << 8) as i32) >> 8) as i64
}

/// Packed three-byte signed.
pub(crate) struct S24;

impl IntSample for S24 {
    const WIDTH: usize = 3;
    const MIN: i64 = S24_MIN;
    const MAX: i64 = S24_MAX;
    const HAS_SILENCE: bool = true;

    #[inline(always)]
    unsafe fn read(p: *const u8) -> i64 {
        sign_extend_24(read_u24(p))
    }

    #[inline(always)]
    unsafe fn write(p: *mut u8, v: i64) {
        write_u24(p, v as u32 & 0x00ff_ffff)
    }
}

pub(crate) struct U24;

impl IntSample for U24 {
    const WIDTH: usize = 3;
    const MIN: i64 = S24_MIN;
    const MAX: i64 = S24_MAX;
    const HAS_SILENCE: bool = false;

    #[inline(always)]
    unsafe fn read(p: *const u8) -> i64 {
        read_u24(p) as i64 - U24_BIAS
    }

    #[inline(always)]
    unsafe fn write(p: *mut u8, v: i64) {
        write_u24(p, (v + U24_BIAS) as u32)
    }
}

/// 24 significant bits in the low end of an i32.
#[allow(non_camel_case_types)]
pub(crate) struct S24_32;

impl IntSample for S24_32 {
    const WIDTH: usize = 4;
    const MIN: i64 = S24_MIN;
    const MAX: i64 = S24_MAX;
    const HAS_SILENCE: bool = true;

    #[inline(always)]
    unsafe fn read(p: *const u8) -> i64 {
        sign_extend_24(ptr::read_unaligned(p.cast::<u32>()))
    }

    #[inline(always)]
    unsafe fn write(p: *mut u8, v: i64) {
        ptr::write_unaligned(p.cast::<i32>(), v as i32)
    }
}

#[allow(non_camel_case_types)]
pub(crate) struct U24_32;

impl IntSample for U24_32 {
    const WIDTH: usize = 4;
    const MIN: i64 = S24_MIN;
    const MAX: i64 = S24_MAX;
    const HAS_SILENCE: bool = false;

    #[inline(always)]
    unsafe fn read(p: *const u8) -> i64 {
        (ptr::read_unaligned(p.cast::<u32>()) & 0x00ff_ffff) as i64 - U24_BIAS
    }

    #[inline(always)]
    unsafe fn write(p: *mut u8, v: i64) {
        ptr::write_unaligned(p.cast::<u32>(), (v + U24_BIAS) as u32)
    }
}

/// Handles the zero and single source cases. Returns true when nothing is left to do.
#[inline(always)]
pub(crate) unsafe fn trivial(dst: *mut u8, src: &[*const u8], bytes: usize, has_silence: bool) -> bool {
    match src.len() {
        0 => {
            if has_silence {
                ptr::write_bytes(dst, 0, bytes);
            }
            true
        }
        1 => {
            if dst as *const u8 != src[0] {
                ptr::copy(src[0], dst, bytes);
            }
            true
        }
        _ => false,
    }
}

/// # Safety
///
/// `dst` and every `src` must be valid for `n_samples` samples of `S`.
pub(crate) unsafe fn mix_int<S: IntSample>(dst: *mut u8, src: &[*const u8], n_samples: usize) {
    if trivial(dst, src, n_samples * S::WIDTH, S::HAS_SILENCE) {
        return;
    }
    for i in 0..n_samples {
        let off = i * S::WIDTH;
        let mut acc = 0i64;
        for s in src {
            acc += S::read(s.add(off));
        }
        S::write(dst.add(off), acc.clamp(S::MIN, S::MAX));
    }
}

/// # Safety
///
/// `dst` and every `src` must be valid for `n_samples` f32 values.
pub(crate) unsafe fn mix_f32(dst: *mut u8, src: &[*const u8], n_samples: usize) {
    if trivial(dst, src, n_samples * 4, true) {
        return;
    }
    let d = dst.cast::<f32>();
    for i in 0..n_samples {
        let mut acc = ptr::read_unaligned(src[0].cast::<f32>().add(i));
        for s in &src[1..] {
            acc += ptr::read_unaligned(s.cast::<f32>().add(i));
        }
        ptr::write_unaligned(d.add(i), acc);
    }
}

/// # Safety
///
/// `dst` and every `src` must be valid for `n_samples` f64 values.
pub(crate) unsafe fn mix_f64(dst: *mut u8, src: &[*const u8], n_samples: usize) {
    if trivial(dst, src, n_samples * 8, true) {
        return;
    }
    let d = dst.cast::<f64>();
    for i in 0..n_samples {
        let mut acc = ptr::read_unaligned(src[0].cast::<f64>().add(i));
        for s in &src[1..] {
            acc += ptr::read_unaligned(s.cast::<f64>().add(i));
        }
        ptr::write_unaligned(d.add(i), acc);
    }
}
