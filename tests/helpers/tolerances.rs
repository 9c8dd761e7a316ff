//! Tolerance constants for mixing tests.
//!
//! Different operations require different precision levels.

/// Floating point rounding errors (for passthrough, sums of two exact values).
/// Use for operations that should be mathematically exact.
pub const FLOAT_EPSILON: f32 = 1e-6;

/// SIMD kernels may reassociate sums of many inputs.
pub const KERNEL_EPSILON: f32 = 1e-5;

/// 16-bit quantization step size.
pub const INT16_EPSILON: f32 = 1.0 / 32768.0;
