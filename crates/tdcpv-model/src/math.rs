use num_complex::Complex64;
use std::f64::consts::{PI, SQRT_2};
use std::sync::OnceLock;

#[inline]
pub(crate) fn logsumexp(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NEG_INFINITY;
    }
    let mut m = f64::NEG_INFINITY;
    for &x in xs {
        if x > m {
            m = x;
        }
    }
    if !m.is_finite() {
        return m;
    }
    let mut s = 0.0;
    for &x in xs {
        s += (x - m).exp();
    }
    m + s.ln()
}

/// Return `log(exp(a) - exp(b))` for `a > b`, computed stably.
#[inline]
pub(crate) fn log_diff_exp(a: f64, b: f64) -> f64 {
    debug_assert!(a > b);
    a + (-(b - a).exp()).ln_1p()
}

#[inline]
pub(crate) fn standard_normal_logpdf(z: f64) -> f64 {
    // -0.5*ln(2π)
    const LOG_INV_SQRT_2PI: f64 = -0.918_938_533_204_672_7;
    LOG_INV_SQRT_2PI - 0.5 * z * z
}

#[inline]
pub(crate) fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-z / SQRT_2)
}

/// Uniform draw on the open interval `(0, 1)` from a raw 64-bit generator.
#[inline]
pub(crate) fn u01(rng: &mut dyn rand::RngCore) -> f64 {
    let v = rng.next_u64();
    // Add 0.5 to avoid exact 0; denominator is 2^64.
    (v as f64 + 0.5) * (1.0 / 18446744073709551616.0_f64)
}

/// Number of terms in the rational Faddeeva approximation.
const FADDEEVA_TERMS: usize = 36;

struct FaddeevaTable {
    l: f64,
    coeffs: [f64; FADDEEVA_TERMS],
}

fn faddeeva_table() -> &'static FaddeevaTable {
    static TABLE: OnceLock<FaddeevaTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let n = FADDEEVA_TERMS;
        let m = 2 * n;
        let l = (n as f64 / SQRT_2).sqrt();
        let mut coeffs = [0.0; FADDEEVA_TERMS];
        for (j, c) in coeffs.iter_mut().enumerate() {
            let order = (j + 1) as f64;
            let mut acc = 0.0;
            for k in -(m as i64) + 1..m as i64 {
                let theta = k as f64 * PI / m as f64;
                let t = l * (0.5 * theta).tan();
                let f = (-t * t).exp() * (l * l + t * t);
                acc += f * (order * theta).cos();
            }
            *c = acc / (2 * m) as f64;
        }
        FaddeevaTable { l, coeffs }
    })
}

/// Faddeeva function `w(z) = exp(-z²) erfc(-iz)` (Weideman's rational approximation).
///
/// The approximation is used directly in the closed upper half-plane. Below the real axis the
/// reflection `w(z) = 2 exp(-z²) - w(-z)` is applied.
pub fn faddeeva(z: Complex64) -> Complex64 {
    if z.im < 0.0 {
        return 2.0 * (-z * z).exp() - faddeeva_upper(-z);
    }
    faddeeva_upper(z)
}

fn faddeeva_upper(z: Complex64) -> Complex64 {
    let table = faddeeva_table();
    let iz = Complex64::i() * z;
    let denom = table.l - iz;
    let zz = (table.l + iz) / denom;
    let mut p = Complex64::new(0.0, 0.0);
    for &a in table.coeffs.iter().rev() {
        p = p * zz + a;
    }
    2.0 * p / (denom * denom) + (1.0 / PI.sqrt()) / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_faddeeva_on_imaginary_axis_matches_scaled_erfc() {
        for &y in &[0.1, 0.5, 1.0, 2.0, 5.0] {
            let w = faddeeva(Complex64::new(0.0, y));
            let expected = (y * y).exp() * statrs::function::erf::erfc(y);
            assert_relative_eq!(w.re, expected, max_relative = 1e-8);
            assert!(w.im.abs() < 1e-10);
        }
        assert_relative_eq!(faddeeva(Complex64::new(0.0, 1.0)).re, 0.427_583_576_155_807, epsilon = 1e-9);
    }

    #[test]
    fn test_faddeeva_at_origin_and_real_axis() {
        let w0 = faddeeva(Complex64::new(0.0, 0.0));
        assert_relative_eq!(w0.re, 1.0, epsilon = 1e-10);
        // Re w(x) = exp(-x²) on the real axis.
        for &x in &[0.3, 1.0, 2.5] {
            let w = faddeeva(Complex64::new(x, 0.0));
            assert_relative_eq!(w.re, (-x * x).exp(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_faddeeva_reflection_is_continuous_across_real_axis() {
        let above = faddeeva(Complex64::new(0.7, 1e-12));
        let below = faddeeva(Complex64::new(0.7, -1e-12));
        assert_relative_eq!(above.re, below.re, epsilon = 1e-9);
        assert_relative_eq!(above.im, below.im, epsilon = 1e-9);
    }

    #[test]
    fn test_logsumexp_handles_empty_and_large_values() {
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
        assert_relative_eq!(logsumexp(&[1000.0, 1000.0]), 1000.0 + 2f64.ln(), epsilon = 1e-12);
    }
}
