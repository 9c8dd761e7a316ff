//! CPU capability detection.
//!
//! Detection runs once when a [`CpuFeatures`] is built and the result is handed
//! to nodes through [`crate::Support`]. Nothing here is process-global.

use std::fmt;
use std::ops::BitOr;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuFlags(u32);

impl CpuFlags {
    pub const SSE: CpuFlags = CpuFlags(1 << 0);
    pub const SSE2: CpuFlags = CpuFlags(1 << 1);
    pub const SSE3: CpuFlags = CpuFlags(1 << 2);
    pub const SSSE3: CpuFlags = CpuFlags(1 << 3);
    pub const SSE41: CpuFlags = CpuFlags(1 << 4);
    pub const SSE42: CpuFlags = CpuFlags(1 << 5);
    pub const AVX: CpuFlags = CpuFlags(1 << 6);
    pub const AVX2: CpuFlags = CpuFlags(1 << 7);
    pub const FMA: CpuFlags = CpuFlags(1 << 8);
    pub const NEON: CpuFlags = CpuFlags(1 << 16);

    pub const fn empty() -> Self {
        CpuFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every flag in `other` is also set in `self`.
    pub const fn contains(self, other: CpuFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CpuFlags {
    type Output = CpuFlags;

    fn bitor(self, rhs: CpuFlags) -> CpuFlags {
        CpuFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for CpuFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuFlags({:#x})", self.0)
    }
}

/// Detected CPU flags and the widest alignment SIMD loads may want.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    flags: CpuFlags,
    max_align: usize,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        Self::with_flags(detect_flags())
    }

    /// Uses `flags` verbatim. A subset of the detected flags forces slower kernels.
    pub fn with_flags(flags: CpuFlags) -> Self {
        let max_align = if flags.contains(CpuFlags::AVX) { 32 } else { 16 };
        Self { flags, max_align }
    }

    pub fn flags(&self) -> CpuFlags {
        self.flags
    }

    pub fn max_align(&self) -> usize {
        self.max_align
    }
}

impl Default for CpuFeatures {
    fn default() -> Self {
        Self::with_flags(CpuFlags::empty())
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_flags() -> CpuFlags {
    let mut flags = CpuFlags::empty();
    let table = [
        (is_x86_feature_detected!("sse"), CpuFlags::SSE),
        (is_x86_feature_detected!("sse2"), CpuFlags::SSE2),
        (is_x86_feature_detected!("sse3"), CpuFlags::SSE3),
        (is_x86_feature_detected!("ssse3"), CpuFlags::SSSE3),
        (is_x86_feature_detected!("sse4.1"), CpuFlags::SSE41),
        (is_x86_feature_detected!("sse4.2"), CpuFlags::SSE42),
        (is_x86_feature_detected!("avx"), CpuFlags::AVX),
        (is_x86_feature_detected!("avx2"), CpuFlags::AVX2),
        (is_x86_feature_detected!("fma"), CpuFlags::FMA),
    ];
    for (present, flag) in table {
        if present {
            flags = flags | flag;
        }
    }
    flags
}

#[cfg(target_arch = "aarch64")]
fn detect_flags() -> CpuFlags {
    CpuFlags::NEON
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_flags() -> CpuFlags {
    CpuFlags::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_subset() {
        let f = CpuFlags::SSE | CpuFlags::SSE2 | CpuFlags::AVX;
        assert!(f.contains(CpuFlags::SSE | CpuFlags::AVX));
        assert!(!f.contains(CpuFlags::AVX2));
        assert!(f.contains(CpuFlags::empty()));
    }

    #[test]
    fn test_max_align() {
        assert_eq!(CpuFeatures::with_flags(CpuFlags::empty()).max_align(), 16);
        assert_eq!(CpuFeatures::with_flags(CpuFlags::AVX).max_align(), 32);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_detect_has_sse2_on_x86_64() {
        assert!(CpuFeatures::detect().flags().contains(CpuFlags::SSE2));
    }
}
