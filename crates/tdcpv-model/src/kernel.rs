//! Resolution-convolved decay-time basis functions.
//!
//! For a complex rate `z` and a Gaussian kernel `G(t; μ, σ)` the convolution
//!
//! ```text
//! h(z, t) = ∫₀^∞ e^{-zτ} G(t - τ; μ, σ) dτ = ½ exp(c² - 2cu) erfc(c - u)
//! u = (t - μ) / (√2 σ),  c = z σ / √2
//! ```
//!
//! is evaluated through the Faddeeva function, `erfc(x) = e^{-x²} w(ix)`. Because
//! `h' = G - z h`, its integral over `[a, b]` is `(ΔΦ - Δh) / z` and the first moment follows
//! the same way.
//!
//! The four basis functions are
//!
//! ```text
//! B_cosh = ½ [h(Γ - ΔΓ/2) + h(Γ + ΔΓ/2)]    B_cos = Re h(Γ - iΔm)
//! B_sinh = ½ [h(Γ - ΔΓ/2) - h(Γ + ΔΓ/2)]    B_sin = Im h(Γ - iΔm)
//! ```

use num_complex::Complex64;
use rand::RngCore;
use std::f64::consts::SQRT_2;

use tdcpv_core::{Error, Result};

use crate::math::{standard_normal_cdf, standard_normal_logpdf, u01};
use crate::math::faddeeva;
use crate::resolution::GaussKernel;

/// `Γ`, `ΔΓ`, `Δm` of one meson.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayConstants {
    pub gamma: f64,
    pub delta_gamma: f64,
    pub delta_m: f64,
}

impl DecayConstants {
    /// Decay width of the longer-lived eigenstate, `Γ - |ΔΓ|/2`.
    #[inline]
    pub fn gamma_light(&self) -> f64 {
        self.gamma - 0.5 * self.delta_gamma.abs()
    }

    /// Decay width of the shorter-lived eigenstate, `Γ + |ΔΓ|/2`.
    #[inline]
    pub fn gamma_heavy(&self) -> f64 {
        self.gamma + 0.5 * self.delta_gamma.abs()
    }

    /// Finite constants with `Γ - |ΔΓ|/2 > 0`.
    pub fn validate(&self, process: &str) -> Result<()> {
        if !(self.gamma.is_finite() && self.delta_gamma.is_finite() && self.delta_m.is_finite()) {
            return Err(Error::Validation(format!("process '{process}': non-finite decay constants {self:?}")));
        }
        if !(self.gamma_light() > 0.0) {
            return Err(Error::Validation(format!(
                "process '{process}': Γ - |ΔΓ|/2 must be > 0 (Γ={}, ΔΓ={})",
                self.gamma, self.delta_gamma
            )));
        }
        Ok(())
    }
}

/// Values (or integrals) of the four basis functions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BasisValues {
    pub cosh: f64,
    pub sinh: f64,
    pub cos: f64,
    pub sin: f64,
}

impl BasisValues {
    /// `Σ c_k B_k` for coefficients in the order (cosh, sinh, cos, sin).
    #[inline]
    pub fn dot(&self, c: &[f64; 4]) -> f64 {
        c[0] * self.cosh + c[1] * self.sinh + c[2] * self.cos + c[3] * self.sin
    }
}

/// Gaussian-convolved causal exponential `h(z, t)`.
///
/// `sigma = 0` gives the unsmeared `e^{-z(t-μ)} θ(t-μ)`.
pub fn conv_exp_gauss(z: Complex64, t: f64, mu: f64, sigma: f64) -> Complex64 {
    let dt = t - mu;
    if sigma <= 0.0 {
        return if dt >= 0.0 { (-z * dt).exp() } else { Complex64::new(0.0, 0.0) };
    }
    let u = dt / (SQRT_2 * sigma);
    let c = z * (sigma / SQRT_2);
    let zeta = Complex64::i() * (c - u);
    let gauss = (-u * u).exp();
    if (c - u).re >= 0.0 {
        0.5 * gauss * faddeeva(zeta)
    } else {
        // erfc(x) = 2 - erfc(-x) keeps the Faddeeva argument in the upper half plane.
        (c * c - 2.0 * c * u).exp() - 0.5 * gauss * faddeeva(-zeta)
    }
}

#[inline]
fn gauss_cdf(t: f64, mu: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        if t >= mu { 1.0 } else { 0.0 }
    } else {
        standard_normal_cdf((t - mu) / sigma)
    }
}

#[inline]
fn gauss_pdf(t: f64, mu: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 { 0.0 } else { standard_normal_logpdf((t - mu) / sigma).exp() / sigma }
}

/// `∫_a^b h(z, t) dt`.
pub fn conv_exp_gauss_integral(z: Complex64, a: f64, b: f64, mu: f64, sigma: f64) -> Complex64 {
    let dphi = gauss_cdf(b, mu, sigma) - gauss_cdf(a, mu, sigma);
    (dphi - conv_exp_gauss(z, b, mu, sigma) + conv_exp_gauss(z, a, mu, sigma)) / z
}

/// `∫_a^b t h(z, t) dt`.
pub fn conv_exp_gauss_moment(z: Complex64, a: f64, b: f64, mu: f64, sigma: f64) -> Complex64 {
    let dphi = gauss_cdf(b, mu, sigma) - gauss_cdf(a, mu, sigma);
    let dg = sigma * sigma * (gauss_pdf(b, mu, sigma) - gauss_pdf(a, mu, sigma));
    let boundary = b * conv_exp_gauss(z, b, mu, sigma) - a * conv_exp_gauss(z, a, mu, sigma);
    let integral = conv_exp_gauss_integral(z, a, b, mu, sigma);
    (mu * dphi - dg - boundary + integral) / z
}

fn combine(
    dc: &DecayConstants,
    kernels: &[GaussKernel],
    f: impl Fn(Complex64, &GaussKernel) -> Complex64,
) -> BasisValues {
    let z_fast = Complex64::new(dc.gamma + 0.5 * dc.delta_gamma, 0.0);
    let z_slow = Complex64::new(dc.gamma - 0.5 * dc.delta_gamma, 0.0);
    let z_osc = Complex64::new(dc.gamma, -dc.delta_m);
    let mut out = BasisValues::default();
    for k in kernels.iter().filter(|k| k.weight != 0.0) {
        let a = f(z_slow, k).re;
        let b = f(z_fast, k).re;
        let o = f(z_osc, k);
        out.cosh += k.weight * 0.5 * (a + b);
        out.sinh += k.weight * 0.5 * (a - b);
        out.cos += k.weight * o.re;
        out.sin += k.weight * o.im;
    }
    out
}

/// Basis functions at time `t`.
pub fn basis_at(dc: &DecayConstants, t: f64, kernels: &[GaussKernel]) -> BasisValues {
    combine(dc, kernels, |z, k| conv_exp_gauss(z, t, k.mu, k.sigma))
}

/// Basis integrals over `[a, b]`.
pub fn basis_integral(dc: &DecayConstants, a: f64, b: f64, kernels: &[GaussKernel]) -> BasisValues {
    combine(dc, kernels, |z, k| conv_exp_gauss_integral(z, a, b, k.mu, k.sigma))
}

/// First moments `∫_a^b t B_k(t) dt`.
pub fn basis_moment(dc: &DecayConstants, a: f64, b: f64, kernels: &[GaussKernel]) -> BasisValues {
    combine(dc, kernels, |z, k| conv_exp_gauss_moment(z, a, b, k.mu, k.sigma))
}

/// Common upper bound of `|B_k(t)|`: `exp(-Γ_L max(0, t - s0))` with
/// `s0 = max_i(μ_i + z_max σ_i² / 2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    rate: f64,
    start: f64,
}

impl Envelope {
    /// Envelope of the basis for `dc` smeared with `kernels`.
    pub fn new(dc: &DecayConstants, kernels: &[GaussKernel]) -> Self {
        let z_max = dc.gamma_heavy();
        let start = kernels
            .iter()
            .filter(|k| k.weight != 0.0)
            .map(|k| k.mu + 0.5 * z_max * k.sigma * k.sigma)
            .fold(f64::NEG_INFINITY, f64::max);
        Self { rate: dc.gamma_light(), start: if start.is_finite() { start } else { 0.0 } }
    }

    #[inline]
    pub fn value(&self, t: f64) -> f64 {
        (-self.rate * (t - self.start).max(0.0)).exp()
    }

    /// Draw `t ∈ [lo, hi]` with density proportional to the envelope.
    pub fn sample(&self, lo: f64, hi: f64, rng: &mut dyn RngCore) -> f64 {
        let s0 = self.start;
        let flat = (s0.min(hi) - lo).max(0.0);
        let a = s0.max(lo);
        let tail = if hi > a {
            (-self.rate * (a - s0)).exp() * -(-self.rate * (hi - a)).exp_m1() / self.rate
        } else {
            0.0
        };
        let u = u01(rng) * (flat + tail);
        if u < flat {
            return lo + u;
        }
        let v = u01(rng);
        let t = a - (v * (-self.rate * (hi - a)).exp_m1()).ln_1p() / self.rate;
        t.clamp(lo, hi)
    }
}
