//! SIMD-accelerated kernels for vector distance calculations.
//!
//! Uses the `wide` crate for portable 8-lane SIMD across `x86_64` and
//! aarch64. Scalar fallbacks are compiled when the `simd` feature is off.

#[cfg(feature = "simd")]
use wide::f32x8;

#[cfg(feature = "simd")]
#[inline]
fn lanes(slice: &[f32], offset: usize) -> f32x8 {
    f32x8::new([
        slice[offset],
        slice[offset + 1],
        slice[offset + 2],
        slice[offset + 3],
        slice[offset + 4],
        slice[offset + 5],
        slice[offset + 6],
        slice[offset + 7],
    ])
}

/// Squared L2 distance between two equal-length slices.
#[cfg(feature = "simd")]
#[must_use]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same length");

    let chunks = a.len() / 8;
    let mut sum = f32x8::ZERO;
    for i in 0..chunks {
        let diff = lanes(a, i * 8) - lanes(b, i * 8);
        sum += diff * diff;
    }

    let sum_array: [f32; 8] = sum.into();
    let mut total: f32 = sum_array.iter().sum();
    for i in chunks * 8..a.len() {
        let diff = a[i] - b[i];
        total += diff * diff;
    }
    total
}

/// Dot product of two equal-length slices.
#[cfg(feature = "simd")]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same length");

    let chunks = a.len() / 8;
    let mut sum = f32x8::ZERO;
    for i in 0..chunks {
        sum += lanes(a, i * 8) * lanes(b, i * 8);
    }

    let sum_array: [f32; 8] = sum.into();
    let mut total: f32 = sum_array.iter().sum();
    for i in chunks * 8..a.len() {
        total += a[i] * b[i];
    }
    total
}

#[cfg(not(feature = "simd"))]
#[must_use]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[cfg(not(feature = "simd"))]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[must_use]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    l2_squared(a, b).sqrt()
}

/// `1 - cos(a, b)`. Zero vectors are treated as maximally distant.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let norms = (dot(a, a) * dot(b, b)).sqrt();
    if norms <= f32::EPSILON {
        return 1.0;
    }
    1.0 - dot(a, b) / norms
}
