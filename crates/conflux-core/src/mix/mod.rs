//! Sample mixing kernels.
//!
//! `dst[i] = clamp(src[0][i] + src[1][i] + ...)` over `n_frames * channels`
//! samples. A kernel is picked once per negotiated format from a static table
//! ordered most capable first; the first entry whose CPU requirements are a
//! subset of the detected flags wins.
//!
//! Edge cases shared by every kernel:
//! - no sources: signed and float encodings are zero-filled, unsigned ones are
//!   left untouched (zero bytes are not silence for them),
//! - one source: plain copy, nothing at all when `dst` is that source.

mod generic;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86;

use crate::cpu::CpuFlags;
use crate::error::{Error, Result};
use crate::format::SampleFormat;
use smallvec::SmallVec;

/// Raw kernel: mixes `n_samples` samples of every `src` into `dst`.
///
/// `dst` may equal one of the sources.
pub type MixFn = unsafe fn(dst: *mut u8, src: &[*const u8], n_samples: usize);

struct MixEntry {
    format: SampleFormat,
    /// 0 matches any channel count.
    channels: u32,
    cpu: CpuFlags,
    name: &'static str,
    func: MixFn,
}

macro_rules! entry {
    ($format:ident, $cpu:expr, $name:literal, $func:expr) => {
        MixEntry {
            format: SampleFormat::$format,
            channels: 0,
            cpu: $cpu,
            name: $name,
            func: $func,
        }
    };
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
static ARCH_TABLE: &[MixEntry] = &[
    entry!(F32, CpuFlags::AVX, "mix_f32_avx", x86::mix_f32_avx),
    entry!(F32P, CpuFlags::AVX, "mix_f32_avx", x86::mix_f32_avx),
    entry!(F32, CpuFlags::SSE, "mix_f32_sse", x86::mix_f32_sse),
    entry!(F32P, CpuFlags::SSE, "mix_f32_sse", x86::mix_f32_sse),
    entry!(F64, CpuFlags::AVX, "mix_f64_avx", x86::mix_f64_avx),
    entry!(F64P, CpuFlags::AVX, "mix_f64_avx", x86::mix_f64_avx),
    entry!(F64, CpuFlags::SSE2, "mix_f64_sse2", x86::mix_f64_sse2),
    entry!(F64P, CpuFlags::SSE2, "mix_f64_sse2", x86::mix_f64_sse2),
];

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
static ARCH_TABLE: &[MixEntry] = &[];

static GENERIC_TABLE: &[MixEntry] = &[
    entry!(S8, CpuFlags::empty(), "mix_s8_c", generic::mix_int::<generic::S8>),
    entry!(U8, CpuFlags::empty(), "mix_u8_c", generic::mix_int::<generic::U8>),
    entry!(S16, CpuFlags::empty(), "mix_s16_c", generic::mix_int::<generic::S16>),
    entry!(U16, CpuFlags::empty(), "mix_u16_c", generic::mix_int::<generic::U16>),
    entry!(S24, CpuFlags::empty(), "mix_s24_c", generic::mix_int::<generic::S24>),
    entry!(U24, CpuFlags::empty(), "mix_u24_c", generic::mix_int::<generic::U24>),
    entry!(S32, CpuFlags::empty(), "mix_s32_c", generic::mix_int::<generic::S32>),
    entry!(U32, CpuFlags::empty(), "mix_u32_c", generic::mix_int::<generic::U32>),
    entry!(S24_32, CpuFlags::empty(), "mix_s24_32_c", generic::mix_int::<generic::S24_32>),
    entry!(U24_32, CpuFlags::empty(), "mix_u24_32_c", generic::mix_int::<generic::U24_32>),
    entry!(F32, CpuFlags::empty(), "mix_f32_c", generic::mix_f32),
    entry!(F32P, CpuFlags::empty(), "mix_f32_c", generic::mix_f32),
    entry!(F64, CpuFlags::empty(), "mix_f64_c", generic::mix_f64),
    entry!(F64P, CpuFlags::empty(), "mix_f64_c", generic::mix_f64),
];

/// A kernel bound to a format and channel count.
#[derive(Debug, Clone, Copy)]
pub struct MixOps {
    format: SampleFormat,
    channels: u32,
    cpu: CpuFlags,
    name: &'static str,
    func: MixFn,
}

impl MixOps {
    /// Picks the best kernel for `format` and `channels` available with `cpu`.
    pub fn select(format: SampleFormat, channels: u32, cpu: CpuFlags) -> Result<Self> {
        if channels == 0 {
            return Err(Error::InvalidArgument("mix with zero channels".into()));
        }
        ARCH_TABLE
            .iter()
            .chain(GENERIC_TABLE)
            .find(|e| {
                e.format == format
                    && (e.channels == 0 || e.channels == channels)
                    && cpu.contains(e.cpu)
            })
            .map(|e| MixOps {
                format,
                channels,
                cpu: e.cpu,
                name: e.name,
                func: e.func,
            })
            .ok_or_else(|| {
                Error::NotSupported(format!(
                    "no mix kernel for {:?} x{} with {:?}",
                    format, channels, cpu
                ))
            })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// CPU flags the chosen kernel relies on.
    pub fn cpu_flags(&self) -> CpuFlags {
        self.cpu
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bytes per frame.
    pub fn frame_size(&self) -> usize {
        self.format.width() * self.channels as usize
    }

    /// Mixes `n_frames` frames of `srcs` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes and every source for reads of
    /// `n_frames * frame_size()` bytes. `dst` may alias a source exactly but
    /// must not partially overlap one.
    #[inline]
    pub unsafe fn process(&self, dst: *mut u8, srcs: &[*const u8], n_frames: usize) {
        (self.func)(dst, srcs, n_frames * self.channels as usize)
    }

    /// Safe wrapper over [`MixOps::process`] for byte slices.
    pub fn mix_into(&self, dst: &mut [u8], srcs: &[&[u8]]) -> Result<()> {
        let frame = self.frame_size();
        if dst.len() % frame != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} bytes is not a whole number of {} byte frames",
                dst.len(),
                frame
            )));
        }
        if let Some(short) = srcs.iter().find(|s| s.len() < dst.len()) {
            return Err(Error::InvalidArgument(format!(
                "source of {} bytes is shorter than destination of {}",
                short.len(),
                dst.len()
            )));
        }
        let ptrs: SmallVec<[*const u8; 16]> = srcs.iter().map(|s| s.as_ptr()).collect();
        // SAFETY: lengths checked above; `dst` is an exclusive borrow so it
        // cannot overlap any source.
        unsafe { self.process(dst.as_mut_ptr(), &ptrs, dst.len() / frame) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuFeatures;
    use proptest::prelude::*;

    fn scalar(format: SampleFormat, channels: u32) -> MixOps {
        MixOps::select(format, channels, CpuFlags::empty()).unwrap()
    }

    fn i16_bytes(v: &[i16]) -> Vec<u8> {
        v.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn bytes_i16(b: &[u8]) -> Vec<i16> {
        b.chunks_exact(2).map(|c| i16::from_ne_bytes([c[0], c[1]])).collect()
    }

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn bytes_f32(b: &[u8]) -> Vec<f32> {
        b.chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_every_interleaved_format_has_a_kernel() {
        for f in SampleFormat::INTERLEAVED {
            assert!(MixOps::select(f, 2, CpuFlags::empty()).is_ok(), "{:?}", f);
        }
        assert!(MixOps::select(SampleFormat::F32P, 1, CpuFlags::empty()).is_ok());
    }

    #[test]
    fn test_unknown_format_not_supported() {
        assert!(matches!(
            MixOps::select(SampleFormat::Unknown, 2, CpuFlags::empty()),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            MixOps::select(SampleFormat::S16, 0, CpuFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[test]
    fn test_table_prefers_simd() {
        let ops = MixOps::select(SampleFormat::F32, 2, CpuFlags::SSE | CpuFlags::AVX).unwrap();
        assert_eq!(ops.name(), "mix_f32_avx");
        let ops = MixOps::select(SampleFormat::F32, 2, CpuFlags::SSE).unwrap();
        assert_eq!(ops.name(), "mix_f32_sse");
        assert_eq!(scalar(SampleFormat::F32, 2).name(), "mix_f32_c");
    }

    #[test]
    fn test_s16_sum_and_saturation() {
        let ops = scalar(SampleFormat::S16, 1);
        let a = i16_bytes(&[1000, 20000, -20000, 0]);
        let b = i16_bytes(&[2000, 20000, -20000, -1]);
        let c = i16_bytes(&[-500, 20000, -20000, 1]);
        let mut out = vec![0u8; a.len()];
        ops.mix_into(&mut out, &[&a, &b, &c]).unwrap();
        assert_eq!(bytes_i16(&out), vec![2500, i16::MAX, i16::MIN, 0]);
    }

    #[test]
    fn test_u8_rebias() {
        let ops = scalar(SampleFormat::U8, 1);
        let a = [0x80 + 10, 0x80, 0xff];
        let b = [0x80 + 20, 0x80 - 5, 0xff];
        let mut out = [0u8; 3];
        ops.mix_into(&mut out, &[&a, &b]).unwrap();
        assert_eq!(out, [0x80 + 30, 0x80 - 5, 0xff]);
    }

    #[test]
    fn test_no_sources() {
        let mut out = i16_bytes(&[7, 7]);
        scalar(SampleFormat::S16, 2).mix_into(&mut out, &[]).unwrap();
        assert_eq!(bytes_i16(&out), vec![0, 0]);

        // Unsigned encodings keep whatever was there.
        let mut out = [0x11u8, 0x22];
        scalar(SampleFormat::U8, 2).mix_into(&mut out, &[]).unwrap();
        assert_eq!(out, [0x11, 0x22]);
    }

    #[test]
    fn test_single_source_in_place_is_noop() {
        let ops = scalar(SampleFormat::S16, 1);
        let mut buf = i16_bytes(&[3, -4, 5]);
        let p = buf.as_mut_ptr();
        unsafe { ops.process(p, &[p as *const u8], 3) };
        assert_eq!(bytes_i16(&buf), vec![3, -4, 5]);
    }

    #[test]
    fn test_floats_do_not_clamp() {
        let ops = scalar(SampleFormat::F32, 1);
        let a = f32_bytes(&[0.75, -0.75]);
        let mut out = vec![0u8; a.len()];
        ops.mix_into(&mut out, &[&a, &a]).unwrap();
        assert_eq!(bytes_f32(&out), vec![1.5, -1.5]);
    }

    #[test]
    fn test_mix_into_checks_lengths() {
        let ops = scalar(SampleFormat::S16, 2);
        let mut out = vec![0u8; 6];
        assert!(ops.mix_into(&mut out, &[]).is_err());
        let mut out = vec![0u8; 8];
        let short = vec![0u8; 4];
        assert!(ops.mix_into(&mut out, &[&short]).is_err());
    }

    #[test]
    fn test_simd_matches_scalar() {
        let detected = CpuFeatures::detect().flags();
        for format in [SampleFormat::F32, SampleFormat::F64] {
            let fast = MixOps::select(format, 2, detected).unwrap();
            let slow = scalar(format, 2);
            // 37 frames leaves a tail for every vector width.
            let n = 37 * slow.frame_size();
            let srcs: Vec<Vec<u8>> = (0..4)
                .map(|k| match format {
                    SampleFormat::F32 => f32_bytes(
                        &(0..n / 4).map(|i| ((i * 7 + k * 13) % 29) as f32 * 0.031 - 0.4).collect::<Vec<_>>(),
                    ),
                    _ => (0..n / 8)
                        .flat_map(|i| (((i * 5 + k * 11) % 31) as f64 * 0.017 - 0.25).to_ne_bytes())
                        .collect(),
                })
                .collect();
            let refs: Vec<&[u8]> = srcs.iter().map(Vec::as_slice).collect();
            let mut a = vec![0u8; n];
            let mut b = vec![0u8; n];
            fast.mix_into(&mut a, &refs).unwrap();
            slow.mix_into(&mut b, &refs).unwrap();
            assert_eq!(a, b, "{} vs {}", fast.name(), slow.name());
        }
    }

    /// Integer range of `format` centred on zero, `None` for floats.
    fn int_range(format: SampleFormat) -> Option<(i64, i64)> {
        use SampleFormat::*;
        match format {
            S8 | U8 => Some((i8::MIN as i64, i8::MAX as i64)),
            S16 | U16 => Some((i16::MIN as i64, i16::MAX as i64)),
            S24 | U24 | S24_32 | U24_32 => Some((-(1 << 23), (1 << 23) - 1)),
            S32 | U32 => Some((i32::MIN as i64, i32::MAX as i64)),
            _ => None,
        }
    }

    fn u24_bytes(u: u32) -> [u8; 3] {
        if cfg!(target_endian = "little") {
            [u as u8, (u >> 8) as u8, (u >> 16) as u8]
        } else {
            [(u >> 16) as u8, (u >> 8) as u8, u as u8]
        }
    }

    fn u24_value(b: &[u8]) -> u32 {
        if cfg!(target_endian = "little") {
            b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16
        } else {
            (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32
        }
    }

    fn sign_24(u: u32) -> f64 {
        (((u << 8) as i32) >> 8) as f64
    }

    /// One sample in `format`; integer values are centred on zero.
    fn encode(format: SampleFormat, v: f64) -> Vec<u8> {
        use SampleFormat::*;
        let i = v as i64;
        match format {
            S8 => (i as i8).to_ne_bytes().to_vec(),
            U8 => ((i + 0x80) as u8).to_ne_bytes().to_vec(),
            S16 => (i as i16).to_ne_bytes().to_vec(),
            U16 => ((i + 0x8000) as u16).to_ne_bytes().to_vec(),
            S24 => u24_bytes(i as i32 as u32 & 0x00ff_ffff).to_vec(),
            U24 => u24_bytes((i + (1 << 23)) as u32).to_vec(),
            S32 => (i as i32).to_ne_bytes().to_vec(),
            U32 => ((i + 0x8000_0000) as u32).to_ne_bytes().to_vec(),
            S24_32 => (i as i32).to_ne_bytes().to_vec(),
            U24_32 => ((i + (1 << 23)) as u32).to_ne_bytes().to_vec(),
            F32 | F32P => (v as f32).to_ne_bytes().to_vec(),
            F64 | F64P => v.to_ne_bytes().to_vec(),
            other => panic!("no test codec for {:?}", other),
        }
    }

    fn decode(format: SampleFormat, b: &[u8]) -> f64 {
        use SampleFormat::*;
        let w4 = || [b[0], b[1], b[2], b[3]];
        match format {
            S8 => i8::from_ne_bytes([b[0]]) as f64,
            U8 => b[0] as f64 - 128.0,
            S16 => i16::from_ne_bytes([b[0], b[1]]) as f64,
            U16 => u16::from_ne_bytes([b[0], b[1]]) as f64 - 32768.0,
            S24 => sign_24(u24_value(b)),
            U24 => u24_value(b) as f64 - (1 << 23) as f64,
            S32 => i32::from_ne_bytes(w4()) as f64,
            U32 => u32::from_ne_bytes(w4()) as f64 - 2147483648.0,
            S24_32 => sign_24(u32::from_ne_bytes(w4()) & 0x00ff_ffff),
            U24_32 => (u32::from_ne_bytes(w4()) & 0x00ff_ffff) as f64 - (1 << 23) as f64,
            F32 | F32P => f32::from_ne_bytes(w4()) as f64,
            F64 | F64P => f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            other => panic!("no test codec for {:?}", other),
        }
    }

    /// Mixes per-source sample lists through the generic kernel of `format`.
    fn mix_samples(format: SampleFormat, srcs: &[Vec<f64>]) -> Vec<f64> {
        let ops = scalar(format, 1);
        let width = format.width();
        let bytes: Vec<Vec<u8>> = srcs
            .iter()
            .map(|s| s.iter().flat_map(|&v| encode(format, v)).collect())
            .collect();
        let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();
        let mut out = vec![0u8; srcs[0].len() * width];
        ops.mix_into(&mut out, &refs).unwrap();
        out.chunks_exact(width).map(|c| decode(format, c)).collect()
    }

    #[test]
    fn test_every_generic_format_saturates_at_its_limits() {
        for entry in GENERIC_TABLE {
            let Some((min, max)) = int_range(entry.format) else {
                continue;
            };
            let high = vec![max as f64; 4];
            let low = vec![min as f64; 4];
            let got = mix_samples(entry.format, &[high.clone(), high.clone(), high]);
            assert!(got.iter().all(|&v| v == max as f64), "{} high: {:?}", entry.name, got);
            let got = mix_samples(entry.format, &[low.clone(), low]);
            assert!(got.iter().all(|&v| v == min as f64), "{} low: {:?}", entry.name, got);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn every_format_gives_n_times_v(
            frac in -1.0f64..1.0,
            n in 1usize..8,
            pick in 0usize..GENERIC_TABLE.len(),
        ) {
            let format = GENERIC_TABLE[pick].format;
            let v = match int_range(format) {
                Some((_, max)) => (frac * max as f64 / 8.0).trunc(),
                None => frac,
            };
            let srcs = vec![vec![v; 8]; n];
            for got in mix_samples(format, &srcs) {
                let want = v * n as f64;
                prop_assert!((got - want).abs() <= 1e-5, "{:?}: {} != {}", format, got, want);
            }
        }

        #[test]
        fn every_format_gives_clamped_sum(
            fracs in prop::collection::vec(prop::collection::vec(-1.0f64..1.0, 8), 2..6),
            pick in 0usize..GENERIC_TABLE.len(),
        ) {
            let format = GENERIC_TABLE[pick].format;
            let range = int_range(format);
            let srcs: Vec<Vec<f64>> = fracs
                .iter()
                .map(|s| {
                    s.iter()
                        .map(|&f| match range {
                            Some((min, max)) => (f * max as f64).trunc().max(min as f64),
                            None => f,
                        })
                        .collect()
                })
                .collect();
            let got = mix_samples(format, &srcs);
            for i in 0..8 {
                let sum: f64 = srcs.iter().map(|s| s[i]).sum();
                let want = match range {
                    Some((min, max)) => sum.clamp(min as f64, max as f64),
                    None => sum,
                };
                prop_assert!((got[i] - want).abs() <= 1e-5, "{:?}: {} != {}", format, got[i], want);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn s16_is_saturated_sum(
            srcs in prop::collection::vec(prop::collection::vec(any::<i16>(), 16), 2..6)
        ) {
            let ops = scalar(SampleFormat::S16, 1);
            let bytes: Vec<Vec<u8>> = srcs.iter().map(|s| i16_bytes(s)).collect();
            let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();
            let mut out = vec![0u8; 32];
            ops.mix_into(&mut out, &refs).unwrap();
            let got = bytes_i16(&out);
            for i in 0..16 {
                let sum: i64 = srcs.iter().map(|s| s[i] as i64).sum();
                prop_assert_eq!(got[i] as i64, sum.clamp(i16::MIN as i64, i16::MAX as i64));
            }
        }

        #[test]
        fn constant_inputs_give_n_times_v(v in -1000i32..1000, n in 1usize..8) {
            let ops = scalar(SampleFormat::S32, 2);
            let src: Vec<u8> = std::iter::repeat(v).take(8).flat_map(|s| s.to_ne_bytes()).collect();
            let refs: Vec<&[u8]> = (0..n).map(|_| src.as_slice()).collect();
            let mut out = vec![0u8; src.len()];
            ops.mix_into(&mut out, &refs).unwrap();
            for c in out.chunks_exact(4) {
                prop_assert_eq!(i32::from_ne_bytes([c[0], c[1], c[2], c[3]]), v * n as i32);
            }
        }
    }
}
